//! Archive layer: aged segments move under `<root>/.archive/<name>/`, each
//! a self-contained secondary store queried transparently beneath the live
//! index (spec §4.6).
//!
//! Three variants are named by spec §4.6: an *online* archive has its own
//! full index (here reusing [`crate::index::Index`] rather than a
//! hand-rolled min/max-only manifest — see DESIGN.md for that call), a
//! *summary-only* archive keeps `<segment>.summary` sidecars but no data,
//! and a *dir-summary offline* archive is a single `<name>.summary` file
//! at the archive root with no directory at all.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::{IndexType, SegmentLayout};
use crate::error::Result;
use crate::index::{Filter, Index, NewRow, Predicate, Row, TxnMode};
use crate::metadata::Format;
use crate::reftime::Reftime;
use crate::segment::{self, SIDECAR_SUFFIXES};
use crate::summary::Summary;
use crate::value::Value;

/// The name of the archive maintenance moves aged segments into by
/// default (spec §4.6 "Archiving").
pub const LAST_ARCHIVE: &str = "last";

enum Variant {
    Online(Index),
    SummaryOnly,
    Offline,
}

/// One named archive under `.archive/<name>/` (or, for the offline
/// variant, just `.archive/<name>.summary`).
pub struct Archive {
    name: String,
    summary: Summary,
    variant: Variant,
}

impl Archive {
    fn dir(root: &Path, name: &str) -> PathBuf {
        root.join(".archive").join(name)
    }

    fn offline_summary_path(root: &Path, name: &str) -> PathBuf {
        root.join(".archive").join(format!("{}.summary", name))
    }

    /// Opens (or lazily creates) the named archive. A directory with an
    /// index file is online; a directory with only `.summary` sidecars
    /// and no index is summary-only; a bare `<name>.summary` sibling file
    /// with no directory is offline.
    fn open(root: &Path, name: &str, index_type: IndexType) -> Result<Self> {
        let dir = Self::dir(root, name);
        let offline_path = Self::offline_summary_path(root, name);

        if !dir.exists() && offline_path.exists() {
            let summary = Summary::load(&offline_path)?;
            return Ok(Self {
                name: name.to_string(),
                summary,
                variant: Variant::Offline,
            });
        }

        let has_index = dir.join("index.sqlite").exists() || dir.join("index.manifest").exists();
        if dir.exists() && !has_index && has_only_summary_sidecars(&dir)? {
            let summary = collect_sidecar_summaries(&dir)?;
            return Ok(Self {
                name: name.to_string(),
                summary,
                variant: Variant::SummaryOnly,
            });
        }

        let index = Index::open(&dir, index_type)?;
        let summary = index.query_summary(&Filter::match_all())?;
        Ok(Self {
            name: name.to_string(),
            summary,
            variant: Variant::Online(index),
        })
    }

    fn index(&self) -> Option<&Index> {
        match &self.variant {
            Variant::Online(index) => Some(index),
            _ => None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn has_only_summary_sidecars(dir: &Path) -> Result<bool> {
    let mut any = false;
    for entry in walkdir::WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".summary") {
                any = true;
            }
        }
    }
    Ok(any)
}

fn collect_sidecar_summaries(dir: &Path) -> Result<Summary> {
    let mut combined = Summary::empty();
    for entry in walkdir::WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".summary") {
                combined.merge_from(&Summary::load(entry.path())?);
            }
        }
    }
    Ok(combined)
}

/// Filters a pre-aggregated [`Summary`] by a [`Filter`]'s reftime bounds
/// and predicates, matching predicate type-codes against each bucket's
/// attribute-tuple key (spec §4.6: summary-only archives are "readable for
/// summary queries").
fn filter_summary(summary: &Summary, filter: &Filter) -> Summary {
    let mut out = Summary::empty();
    for (key, stats) in summary.iter() {
        if let Some(min) = filter.reftime_min {
            if stats.reftime.max() < min {
                continue;
            }
        }
        if let Some(max) = filter.reftime_max {
            if stats.reftime.min() > max {
                continue;
            }
        }
        if !predicates_match(key, &filter.predicates) {
            continue;
        }
        out.add(key.to_vec(), stats.size, stats.reftime);
        // `add` only folds one row's worth of size; correct the count to
        // the bucket's actual tally since a summary bucket already
        // aggregates many messages.
        for _ in 1..stats.count {
            out.add(key.to_vec(), 0, stats.reftime);
        }
    }
    out
}

fn predicates_match(key: &[Value], predicates: &[Predicate]) -> bool {
    predicates
        .iter()
        .all(|p| key.iter().any(|v| v.type_code() == p.code && *v == p.value))
}

/// Aggregate registry over every named archive plus `last`, federating
/// queries beneath the live index (spec §4.6 "An aggregate `Archives`
/// object").
pub struct Archives {
    root: PathBuf,
    layout: SegmentLayout,
    index_type: IndexType,
    archives: BTreeMap<String, Archive>,
}

impl Archives {
    pub fn open_with(root: PathBuf, layout: SegmentLayout, index_type: IndexType) -> Result<Self> {
        let mut archives = BTreeMap::new();
        let archive_root = root.join(".archive");
        if archive_root.exists() {
            for entry in std::fs::read_dir(&archive_root)? {
                let entry = entry?;
                let file_name = entry.file_name();
                let name = file_name.to_string_lossy();
                let name = name.strip_suffix(".summary").unwrap_or(&name).to_string();
                if archives.contains_key(&name) {
                    continue;
                }
                let archive = Archive::open(&root, &name, index_type)?;
                archives.insert(name, archive);
            }
        }
        Ok(Self {
            root,
            layout,
            index_type,
            archives,
        })
    }

    /// Opens the archive layer using the dataset's configured layout and
    /// index backend (the common case; see [`Self::open_with`] for
    /// overriding either).
    pub fn open(root: &Path) -> Result<Self> {
        Self::open_with(root.to_path_buf(), SegmentLayout::File, IndexType::Sqlite)
    }

    /// Queries every online archive whose summary could intersect
    /// `filter`'s reftime bounds, skipping the rest (spec §4.6: "skipping
    /// archives whose reftime extent does not intersect the filter").
    pub fn query(&self, filter: &Filter) -> Result<Vec<Row>> {
        let mut out = Vec::new();
        for archive in self.archives.values() {
            if archive.summary.is_empty() {
                continue;
            }
            if !archive.summary.intersects(filter.reftime_min, filter.reftime_max) {
                continue;
            }
            if let Some(index) = archive.index() {
                out.extend(index.query(filter)?);
            }
        }
        Ok(out)
    }

    /// Resolves bytes for a row previously returned by [`Self::query`].
    /// `row.segment_relpath` already carries the `.archive/<name>/…`
    /// prefix relative to the live root (spec §4.6 "preserving the
    /// relative path below").
    pub fn resolve(&self, row: &Row) -> Result<Vec<u8>> {
        let segment = segment::open(&self.root, &row.segment_relpath, self.layout)?;
        segment.read(row.offset, row.size)
    }

    /// Aggregate summary across every archive: online archives contribute
    /// their live-queried summary, summary-only and offline archives
    /// contribute their cached summary filtered by `filter` (spec §4.6
    /// "for summary queries without a reftime filter it uses a combined
    /// `.summaries/archives.summary` cache").
    pub fn query_summary(&self, filter: &Filter) -> Result<Summary> {
        let use_cache = filter.reftime_min.is_none()
            && filter.reftime_max.is_none()
            && filter.predicates.is_empty();
        let cache_path = self.root.join(".summaries").join("archives.summary");
        if use_cache {
            if let Ok(cached) = Summary::load(&cache_path) {
                if !cached.is_empty() || self.archives.is_empty() {
                    return Ok(cached);
                }
            }
        }

        let mut combined = Summary::empty();
        for archive in self.archives.values() {
            match archive.index() {
                Some(index) => combined.merge_from(&index.query_summary(filter)?),
                None => combined.merge_from(&filter_summary(&archive.summary, filter)),
            }
        }
        if use_cache {
            combined.save(&cache_path)?;
        }
        Ok(combined)
    }

    /// Invalidates the combined `archives.summary` cache (spec §4.5
    /// "Archive moves invalidate the global summary cache").
    pub fn invalidate_cache(&self) -> Result<()> {
        let path = self.root.join(".summaries").join("archives.summary");
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Moves a live segment (and its sidecars) into the `last` archive,
    /// re-indexing its rows under the moved path (spec §4.6 "Archiving").
    /// `rows` must be the segment's current live index rows; the caller is
    /// responsible for deindexing them from the live index afterwards.
    pub fn archive_segment(&mut self, format: Format, relpath: &str, rows: &[Row]) -> Result<()> {
        let archive_dir = self.root.join(".archive").join(LAST_ARCHIVE);
        std::fs::create_dir_all(&archive_dir)?;

        let live_base = segment::segment_path(&self.root, Path::new(relpath), format);
        let archive_base = segment::segment_path(&archive_dir, Path::new(relpath), format);
        if let Some(parent) = archive_base.parent() {
            std::fs::create_dir_all(parent)?;
        }
        for suffix in SIDECAR_SUFFIXES {
            let src = segment::with_suffix(&live_base, suffix);
            if !src.exists() {
                continue;
            }
            let dst = segment::with_suffix(&archive_base, suffix);
            std::fs::rename(&src, &dst)?;
        }

        if !self.archives.contains_key(LAST_ARCHIVE) {
            let archive = Archive::open(&self.root, LAST_ARCHIVE, self.index_type)?;
            self.archives.insert(LAST_ARCHIVE.to_string(), archive);
        }
        let archive = self
            .archives
            .get_mut(LAST_ARCHIVE)
            .expect("just inserted above");
        if archive.index().is_none() {
            *archive = Archive::open(&self.root, LAST_ARCHIVE, self.index_type)?;
        }

        let archive_relpath = format!(".archive/{}/{}", LAST_ARCHIVE, relpath);
        {
            let index = archive.index().expect("ensured online above");
            let mut txn = index.begin_transaction(TxnMode::Exclusive)?;
            for row in rows {
                let new_row = NewRow {
                    fingerprint: row.fingerprint.clone(),
                    segment_relpath: archive_relpath.clone(),
                    offset: row.offset,
                    size: row.size,
                    reftime: row.reftime,
                    notes: row.notes.clone(),
                    attributes: row.attributes.clone(),
                };
                index.replace(&mut txn, new_row)?;
            }
            index.commit(txn)?;
        }

        let summary = archive
            .index()
            .expect("ensured online above")
            .query_summary(&Filter::match_all())?;
        archive.summary = summary;
        self.invalidate_cache()?;
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.archives.keys().map(|s| s.as_str())
    }
}
