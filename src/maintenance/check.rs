//! Check agent (spec §4.5 "Check agent"): acts on `needs-index`,
//! `needs-rescan`, and `needs-deindex` segments by re-decoding segment
//! bytes through the registered [`ScannerRegistry`] and rebuilding the
//! index rows for that one segment from scratch.

use std::collections::BTreeMap;
use std::path::Path;

use crate::config::DatasetConfig;
use crate::envelope::{encode_value_list, write_envelope, METADATA_SIGNATURE};
use crate::error::Result;
use crate::index::{Index, NewRow, TxnMode};
use crate::lock;
use crate::metadata::{Format, Metadata};
use crate::scanner::ScannerRegistry;
use crate::segment;
use crate::value::Value;
use crate::writer::{extract_attributes, extract_notes};

use super::repack::deindex_segment;
use super::{Classification, MaintenanceReport, SegmentState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Real,
    Mock,
}

pub struct CheckAgent<'a> {
    root: &'a Path,
    config: &'a DatasetConfig,
    index: &'a Index,
    scanners: &'a ScannerRegistry,
    mode: Mode,
}

impl<'a> CheckAgent<'a> {
    pub fn new(
        root: &'a Path,
        config: &'a DatasetConfig,
        index: &'a Index,
        scanners: &'a ScannerRegistry,
        mode: Mode,
    ) -> Self {
        Self {
            root,
            config,
            index,
            scanners,
            mode,
        }
    }

    /// Acts on every classification, in order. On any real-mode error,
    /// sets the do-not-pack flag so a subsequent repack agent run leaves
    /// the affected segments alone until a human investigates (spec §4.5
    /// "Safety": "a failed check sets a flag that blocks repack").
    pub fn run(&self, classifications: &[Classification]) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::new(self.config.name.clone());
        let mut rescanned = 0usize;
        let mut deindexed = 0usize;

        for c in classifications {
            match c.state() {
                SegmentState::NeedsIndex
                | SegmentState::NeedsRescan
                | SegmentState::ArchivedNeedsIndex
                | SegmentState::ArchivedNeedsRescan => {
                    if self.mode == Mode::Real {
                        if let Err(e) = self.rescan_segment(&c.relpath) {
                            lock::set_do_not_pack(self.root)?;
                            report.error(&c.relpath, &e.to_string());
                            continue;
                        }
                    }
                    report.rescanned(&c.relpath);
                    rescanned += 1;
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

        if rescanned > 0 {
            report.summary("rescanned", rescanned);
        }
        if deindexed > 0 {
            report.summary("deindexed", deindexed);
        }
        Ok(report)
    }

    /// Rebuilds every indexed row for one segment from its raw bytes (spec
    /// §4.5 "Rescan of a single segment"): split into constituent
    /// messages, scan each for metadata, and replace the segment's whole
    /// row set in one exclusive transaction. When two messages collide on
    /// fingerprint, the later offset wins (spec §4.5: "later occurrences
    /// in the segment take precedence").
    fn rescan_segment(&self, relpath: &str) -> Result<()> {
        let format = format_of(relpath)?;
        let scanner = self.scanners.get(format);

        let full = segment::open(self.root, relpath, self.config.segments)?;
        let size = full.logical_size()?;
        let bytes = full.read(0, size)?;

        let ranges = scanner.split(&bytes)?;
        let mut by_key: BTreeMap<Vec<u8>, (NewRow, Metadata)> = BTreeMap::new();
        for (offset, len) in ranges {
            let start = offset as usize;
            let end = start + len as usize;
            let msg_bytes = &bytes[start..end];
            scanner.validate(msg_bytes)?;
            let metadata = scanner.scan(msg_bytes)?;
            let fingerprint = metadata.fingerprint(&self.config.unique);
            let attributes = extract_attributes(self.config, &metadata);
            let notes = extract_notes(&metadata);
            let reftime = metadata
                .reftime()
                .ok_or_else(|| crate::error::ArkError::format(relpath, offset, "message carries no reftime"))?;

            let row = NewRow {
                fingerprint: fingerprint.clone(),
                segment_relpath: relpath.to_string(),
                offset,
                size: len,
                reftime,
                notes,
                attributes,
            };
            by_key.insert(fingerprint.canonical_key(), (row, metadata));
        }

        let mut txn = self.index.begin_transaction(TxnMode::Exclusive)?;
        for row in self.index.scan_file(relpath)? {
            self.index.remove(&mut txn, row.id)?;
        }
        for (row, _) in by_key.values() {
            self.index.insert(&mut txn, row.clone())?;
        }
        self.index.commit(txn)?;

        self.rewrite_sidecars(relpath, by_key.values())?;
        crate::summary::invalidate_live_cache(self.root)?;
        Ok(())
    }

    /// Rebuilds a segment's `.metadata` and `.summary` sidecars from
    /// scratch, in offset order (spec §8 P5: "after a fix check, it is
    /// OK", which requires the sidecars a fresh classification pass looks
    /// for to reappear, not just the index rows).
    fn rewrite_sidecars<'b>(
        &self,
        relpath: &str,
        rows: impl Iterator<Item = &'b (NewRow, Metadata)>,
    ) -> Result<()> {
        let mut ordered: Vec<&(NewRow, Metadata)> = rows.collect();
        ordered.sort_by_key(|(row, _)| row.offset);

        let metadata_path = self.root.join(format!("{}.metadata", relpath));
        if let Some(parent) = metadata_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(&metadata_path)?;
        let mut summary = crate::summary::Summary::empty();
        for (row, metadata) in ordered {
            let items: Vec<Value> = metadata.iter().cloned().collect();
            write_envelope(&mut file, METADATA_SIGNATURE, &encode_value_list(&items))?;
            let key: Vec<Value> = row.attributes.iter().cloned().collect();
            summary.add(key, row.size, row.reftime);
        }
        summary.save(&self.root.join(format!("{}.summary", relpath)))
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
