//! Repack agent (spec §4.5 "Repack agent"): acts on `needs-pack`,
//! `needs-archive`, `needs-delete`, orphan `needs-index`, and
//! `needs-deindex` segments. Never rescans content — any segment still
//! needing a rescan is left for the [`super::check`] agent, and
//! [`RepackAgent::run`] refuses real-mode work while
//! [`crate::lock::do_not_pack_is_set`] (spec §4.5 "Safety").

use std::path::Path;

use crate::archive::Archives;
use crate::config::DatasetConfig;
use crate::error::Result;
use crate::index::{Index, NewRow, TxnMode};
use crate::lock;
use crate::metadata::Format;
use crate::segment;

use super::{Classification, MaintenanceReport, SegmentState};

/// Whether a repack pass actually rewrites segment bytes, or only reports
/// what it would do (spec §6 `--fix`/dry-run CLI surface).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Real,
    Mock,
}

pub struct RepackAgent<'a> {
    root: &'a Path,
    config: &'a DatasetConfig,
    index: &'a Index,
    archives: Option<&'a mut Archives>,
    mode: Mode,
}

impl<'a> RepackAgent<'a> {
    pub fn new(root: &'a Path, config: &'a DatasetConfig, index: &'a Index, mode: Mode) -> Self {
        Self {
            root,
            config,
            index,
            archives: None,
            mode,
        }
    }

    /// Attaches the archive registry this dataset's `needs-archive`
    /// segments should be moved into. Without one, `needs-archive`
    /// segments are reported but left untouched.
    pub fn with_archives(mut self, archives: &'a mut Archives) -> Self {
        self.archives = Some(archives);
        self
    }

    /// Acts on every classification, in order, returning a report (spec §7
    /// "one event per segment per operation type"). In [`Mode::Real`],
    /// refuses to pack or delete while the do-not-pack flag is set (spec
    /// §4.5: a failed `check` leaves data in place until a human
    /// intervenes); `needs-archive`/`needs-deindex` are unaffected by the
    /// flag since they do not rewrite segment bytes in a way a failed
    /// check would have flagged as unsafe.
    pub fn run(&mut self, classifications: &[Classification]) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::new(self.config.name.clone());
        let blocked = self.mode == Mode::Real && lock::do_not_pack_is_set(self.root);

        let mut repacked = 0usize;
        let mut archived = 0usize;
        let mut deleted = 0usize;
        let mut deindexed = 0usize;

        for c in classifications {
            match c.state() {
                SegmentState::NeedsPack => {
                    if blocked {
                        report.warning(&c.relpath, "packing blocked: needs-check-do-not-pack is set");
                        continue;
                    }
                    if self.mode == Mode::Real {
                        self.repack_segment(&c.relpath)?;
                    }
                    report.repacked(&c.relpath);
                    repacked += 1;
                }
                SegmentState::NeedsArchive => {
                    if self.mode == Mode::Real {
                        self.archive_segment(&c.relpath)?;
                    }
                    report.archived(&c.relpath);
                    archived += 1;
                }
                SegmentState::NeedsDelete => {
                    if blocked {
                        report.warning(&c.relpath, "deletion blocked: needs-check-do-not-pack is set");
                        continue;
                    }
                    if self.mode == Mode::Real {
                        self.delete_segment(&c.relpath)?;
                    }
                    report.deleted(&c.relpath);
                    deleted += 1;
                }
                SegmentState::NeedsIndex => {
                    // Repack only removes a needs-index segment when it is
                    // truly empty garbage; a non-empty needs-index segment
                    // is the check agent's job (spec §4.5 "ambiguity", see
                    // DESIGN.md).
                    if self.segment_is_empty(&c.relpath)? {
                        if self.mode == Mode::Real {
                            self.delete_segment(&c.relpath)?;
                        }
                        report.deleted(&c.relpath);
                        deleted += 1;
                    }
                }
                SegmentState::NeedsDeindex | SegmentState::ArchivedNeedsDeindex => {
                    if self.mode == Mode::Real {
                        deindex_segment(self.index, &c.relpath)?;
                        crate::summary::invalidate_live_cache(self.root)?;
                    }
                    report.deindexed(&c.relpath);
                    deindexed += 1;
                }
                _ => {}
            }
        }

        if repacked > 0 {
            report.summary("repacked", repacked);
        }
        if archived > 0 {
            report.summary("archived", archived);
        }
        if deleted > 0 {
            report.summary("deleted", deleted);
        }
        if deindexed > 0 {
            report.summary("deindexed", deindexed);
        }
        Ok(report)
    }

    fn segment_is_empty(&self, relpath: &str) -> Result<bool> {
        let segment = segment::open(self.root, relpath, self.config.segments)?;
        Ok(segment.logical_size()? == 0)
    }

    /// Rewrites a segment's bytes in increasing-offset order, eliminating
    /// gaps and trailing garbage, and updates every claim's offset in one
    /// exclusive transaction (spec §4.5 "Repack of a single segment").
    fn repack_segment(&self, relpath: &str) -> Result<()> {
        let mut rows = self.index.scan_file(relpath)?;
        rows.sort_by_key(|r| r.offset);

        let mut segment = segment::open(self.root, relpath, self.config.segments)?;
        let messages: Vec<Vec<u8>> = rows
            .iter()
            .map(|r| segment.read(r.offset, r.size))
            .collect::<Result<_>>()?;

        let pending = segment.repack(&messages)?;

        let mut txn = self.index.begin_transaction(TxnMode::Exclusive)?;
        let mut new_offset = 0u64;
        for row in &rows {
            self.index.remove(&mut txn, row.id)?;
            let new_row = NewRow {
                fingerprint: row.fingerprint.clone(),
                segment_relpath: row.segment_relpath.clone(),
                offset: new_offset,
                size: row.size,
                reftime: row.reftime,
                notes: row.notes.clone(),
                attributes: row.attributes.clone(),
            };
            self.index.insert(&mut txn, new_row)?;
            new_offset += row.size;
        }
        self.index.commit(txn)?;
        pending.commit()?;
        crate::summary::invalidate_live_cache(self.root)?;
        Ok(())
    }

    /// Moves a segment into the `last` archive and deindexes its live rows
    /// (spec §4.6: "archiving a segment consists of: moving its files
    /// ... then deindexing the live copy"). File-layout segments are
    /// gzip-compressed in place first (spec §4.1 "Compression": "Segments
    /// may be compressed after the last writer commit"), so the sidecar
    /// move below carries `.gz`/`.gz.idx` rather than the plain file.
    fn archive_segment(&mut self, relpath: &str) -> Result<()> {
        let format = format_of(relpath)?;
        let rows = self.index.scan_file(relpath)?;
        if self.config.segments == crate::config::SegmentLayout::File {
            let mut live = segment::open(self.root, relpath, self.config.segments)?;
            if !live.is_compressed() {
                live.compress()?;
            }
        }
        if let Some(archives) = self.archives.as_mut() {
            archives.archive_segment(format, relpath, &rows)?;
        }
        let mut txn = self.index.begin_transaction(TxnMode::Exclusive)?;
        for row in &rows {
            self.index.remove(&mut txn, row.id)?;
        }
        self.index.commit(txn)?;
        segment::remove_segment(self.root, Path::new(relpath), format)?;
        crate::summary::invalidate_live_cache(self.root)?;
        Ok(())
    }

    fn delete_segment(&self, relpath: &str) -> Result<()> {
        let format = format_of(relpath)?;
        deindex_segment(self.index, relpath)?;
        segment::remove_segment(self.root, Path::new(relpath), format)?;
        crate::summary::invalidate_live_cache(self.root)?;
        Ok(())
    }
}

fn format_of(relpath: &str) -> Result<Format> {
    let ext = Path::new(relpath)
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();
    Format::from_extension(&ext)
        .ok_or_else(|| crate::error::ArkError::consistency(format!("unrecognized segment extension: {}", relpath)))
}

/// Removes every indexed row for `relpath` (spec §4.3 "remove" generalized
/// to a whole segment); shared by the repack agent's `needs-deindex`
/// handling and [`super::check::CheckAgent`]'s own.
pub(crate) fn deindex_segment(index: &Index, relpath: &str) -> Result<()> {
    let rows = index.scan_file(relpath)?;
    let mut txn = index.begin_transaction(TxnMode::Exclusive)?;
    for row in &rows {
        index.remove(&mut txn, row.id)?;
    }
    index.commit(txn)?;
    Ok(())
}
