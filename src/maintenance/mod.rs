//! Maintenance engine: classification (spec §4.5).
//!
//! Enumerates a tree's segments on disk and in the index, merge-walks the
//! two sorted lists, and folds the result into [`SegmentFlags`] — the
//! composable bitflag model named in `original_source/arki/dataset/
//! maintenance.cc` (`TO_PACK | TO_ARCHIVE | TO_DELETE | ...`). [`classify`]
//! projects each segment's flags onto the closed [`SegmentState`] the spec
//! names, resolving the "both needs-pack and needs-delete" ambiguity as
//! "delete wins" (spec §9 Open Questions) and, as an additional decision
//! recorded in DESIGN.md, "needs-archive wins over needs-pack" (archiving
//! makes packing moot).

pub mod check;
pub mod repack;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use bitflags::bitflags;
use chrono::Utc;

use crate::config::{DatasetConfig, SegmentLayout};
use crate::error::Result;
use crate::index::Index;
use crate::metadata::Format;
use crate::scanner::ScannerRegistry;
use crate::segment::{self, Claim, CheckState};

bitflags! {
    /// Mirrors `original_source/arki/dataset/maintenance.cc`'s flag
    /// combination model; [`SegmentFlags::classify`] projects this onto the
    /// spec's closed [`SegmentState`] enumeration.
    pub struct SegmentFlags: u8 {
        const TO_INDEX   = 0b0000_0001;
        const TO_RESCAN  = 0b0000_0010;
        const TO_PACK    = 0b0000_0100;
        const TO_ARCHIVE = 0b0000_1000;
        const TO_DELETE  = 0b0001_0000;
        const TO_DEINDEX = 0b0010_0000;
        const ARCHIVED   = 0b0100_0000;
    }
}

impl SegmentFlags {
    /// Collapses a flag combination to the single named state an operator
    /// sees (spec §4.5: "Classifies every segment into one of the states
    /// ..."). Precedence: structural mismatches (index vs disk) always win
    /// over content-age transitions; among the latter, delete wins over
    /// archive wins over pack (spec §9 decides delete-over-pack; the
    /// archive-over-pack tie-break is this crate's own extension of that
    /// rule, recorded in DESIGN.md).
    pub fn classify(self) -> SegmentState {
        if self.contains(SegmentFlags::TO_INDEX) {
            return if self.contains(SegmentFlags::ARCHIVED) {
                SegmentState::ArchivedNeedsIndex
            } else {
                SegmentState::NeedsIndex
            };
        }
        if self.contains(SegmentFlags::TO_DEINDEX) {
            return if self.contains(SegmentFlags::ARCHIVED) {
                SegmentState::ArchivedNeedsDeindex
            } else {
                SegmentState::NeedsDeindex
            };
        }
        if self.contains(SegmentFlags::TO_DELETE) {
            return SegmentState::NeedsDelete;
        }
        if self.contains(SegmentFlags::TO_ARCHIVE) {
            return SegmentState::NeedsArchive;
        }
        if self.contains(SegmentFlags::TO_RESCAN) {
            return if self.contains(SegmentFlags::ARCHIVED) {
                SegmentState::ArchivedNeedsRescan
            } else {
                SegmentState::NeedsRescan
            };
        }
        if self.contains(SegmentFlags::TO_PACK) {
            return SegmentState::NeedsPack;
        }
        if self.contains(SegmentFlags::ARCHIVED) {
            SegmentState::ArchivedOk
        } else {
            SegmentState::Ok
        }
    }
}

/// The closed set of display states spec §4.5 names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Ok,
    NeedsPack,
    NeedsIndex,
    NeedsRescan,
    NeedsDelete,
    NeedsArchive,
    NeedsDeindex,
    ArchivedOk,
    ArchivedNeedsIndex,
    ArchivedNeedsRescan,
    ArchivedNeedsDeindex,
}

/// One segment's classification result.
#[derive(Debug, Clone)]
pub struct Classification {
    pub relpath: String,
    pub flags: SegmentFlags,
}

impl Classification {
    pub fn state(&self) -> SegmentState {
        self.flags.classify()
    }
}

/// Structured maintenance reporter (spec §7 "Propagation": "one event per
/// segment per operation type"). Distinct from `log` output: this is a
/// return value callers assert against, with lines stable enough for
/// scripted assertions (spec §7 "User-visible behavior").
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub dataset: String,
    pub lines: Vec<String>,
    errors: usize,
}

impl MaintenanceReport {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            lines: Vec::new(),
            errors: 0,
        }
    }

    fn event(&mut self, verb: &str, relpath: &str) {
        self.lines.push(format!("{}: {} {}", self.dataset, verb, relpath));
    }

    pub fn rescanned(&mut self, relpath: &str) {
        self.event("rescanned", relpath);
    }

    pub fn repacked(&mut self, relpath: &str) {
        self.event("repacked", relpath);
    }

    pub fn archived(&mut self, relpath: &str) {
        self.event("archived", relpath);
    }

    pub fn deleted(&mut self, relpath: &str) {
        self.event("deleted", relpath);
    }

    pub fn deindexed(&mut self, relpath: &str) {
        self.event("deindexed", relpath);
    }

    pub fn warning(&mut self, relpath: &str, detail: &str) {
        self.lines
            .push(format!("{}: warning: {} ({})", self.dataset, relpath, detail));
    }

    pub fn error(&mut self, relpath: &str, detail: &str) {
        self.errors += 1;
        self.lines
            .push(format!("{}: error: {} ({})", self.dataset, relpath, detail));
    }

    /// Appends a trailing tally line, e.g. `"test: 3 files rescanned."`.
    pub fn summary(&mut self, verb_plural: &str, count: usize) {
        self.lines
            .push(format!("{}: {} files {}.", self.dataset, count, verb_plural));
    }

    /// Whether this run found nothing to report (spec §8 P4: "After any
    /// maintenance-reported clean state, a round of maintenance reports no
    /// further actions").
    pub fn is_clean(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }

    fn merge(&mut self, other: MaintenanceReport) {
        self.lines.extend(other.lines);
        self.errors += other.errors;
    }
}

/// Walks `root` collecting the relative paths of top-level segment
/// entries: any file or directory whose extension matches a known
/// [`Format`]. Hidden top-level entries (`.archive`, `.summaries`, `lock`,
/// `needs-check-do-not-pack`) are skipped, and a matched directory (a
/// `dir`-layout segment) is not recursed into, since its contents are
/// per-message files, not further segments.
pub fn find_on_disk(root: &Path) -> Result<Vec<String>> {
    let mut found = Vec::new();
    let mut walker = walkdir::WalkDir::new(root).min_depth(1).into_iter();
    loop {
        let entry = match walker.next() {
            None => break,
            Some(Ok(entry)) => entry,
            Some(Err(_)) => continue,
        };
        let path = entry.path();
        let rel = match path.strip_prefix(root) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        if let Some(first) = rel.components().next() {
            if first.as_os_str().to_string_lossy().starts_with('.') {
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }
        }
        let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
        if let Some(ext) = ext {
            if Format::from_extension(&ext).is_some() {
                found.push(rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/"));
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Shared merge-walk driving both [`classify`] (live tree) and
/// [`classify_archive`] (a named archive's own tree and index). `strip`, if
/// given, is removed as a prefix from each index row's `segment_relpath`
/// before comparing against on-disk paths — the archive layer stores rows
/// with the live-root-relative path including the `.archive/<name>/`
/// prefix (see [`crate::archive`]), while `fs_root` here already points
/// inside that archive directory.
fn classify_tree(
    fs_root: &Path,
    index: &Index,
    layout: SegmentLayout,
    age_rule: Option<(Option<u32>, Option<u32>)>,
    archived: bool,
    strip: Option<&str>,
    scanners: Option<&ScannerRegistry>,
) -> Result<Vec<Classification>> {
    let on_disk: BTreeSet<String> = find_on_disk(fs_root)?.into_iter().collect();

    let mut in_index: BTreeMap<String, Vec<crate::index::Row>> = BTreeMap::new();
    for (relpath, rows) in index.scan_files()? {
        let relpath = match strip {
            Some(prefix) => relpath.strip_prefix(prefix).unwrap_or(&relpath).to_string(),
            None => relpath,
        };
        in_index.entry(relpath).or_default().extend(rows);
    }

    let mut all: BTreeSet<String> = on_disk.clone();
    all.extend(in_index.keys().cloned());

    let mut results = Vec::with_capacity(all.len());
    for relpath in all {
        let mut flags = SegmentFlags::empty();
        if archived {
            flags |= SegmentFlags::ARCHIVED;
        }

        let has_disk = on_disk.contains(&relpath);
        let has_index = in_index.contains_key(&relpath);

        if has_disk && !has_index {
            flags |= SegmentFlags::TO_INDEX;
        } else if has_index && !has_disk {
            flags |= SegmentFlags::TO_DEINDEX;
        } else {
            let rows = &in_index[&relpath];
            let claims: Vec<Claim> = rows
                .iter()
                .map(|r| Claim {
                    offset: r.offset,
                    size: r.size,
                })
                .collect();
            let segment = segment::open(fs_root, &relpath, layout)?;
            let format = Path::new(&relpath)
                .extension()
                .and_then(|e| Format::from_extension(&e.to_string_lossy()));
            let check_state = match (scanners, format) {
                (Some(registry), Some(format)) => {
                    let scanner = registry.get(format);
                    let validator = |bytes: &[u8]| scanner.validate(bytes).is_ok();
                    segment.check(&claims, false, Some(&validator))?
                }
                _ => segment.check(&claims, true, None)?,
            };
            match check_state {
                CheckState::Ok => {}
                CheckState::NeedsPack => flags |= SegmentFlags::TO_PACK,
                CheckState::NeedsRescan => flags |= SegmentFlags::TO_RESCAN,
            }

            // A segment with rows but no `.metadata`/`.summary` sidecar
            // cannot serve query_bytes's inline metadata or query_summary's
            // cache without re-deriving them from the raw bytes, so it is
            // itself a needs-rescan condition (spec §8 P5).
            if !rows.is_empty() {
                let metadata_path = fs_root.join(format!("{}.metadata", relpath));
                let summary_path = fs_root.join(format!("{}.summary", relpath));
                if !metadata_path.exists() || !summary_path.exists() {
                    flags |= SegmentFlags::TO_RESCAN;
                }
            }

            if let Some((archive_age, delete_age)) = age_rule {
                if let Some(latest) = rows.iter().map(|r| r.reftime.max()).max() {
                    let age_days = (Utc::now() - latest).num_days().max(0) as u32;
                    if let Some(delete_age) = delete_age {
                        if age_days > delete_age {
                            flags |= SegmentFlags::TO_DELETE;
                        }
                    }
                    if let Some(archive_age) = archive_age {
                        if age_days > archive_age {
                            flags |= SegmentFlags::TO_ARCHIVE;
                        }
                    }
                }
            }
        }

        results.push(Classification { relpath, flags });
    }
    Ok(results)
}

/// Classifies every live segment under `root` (spec §4.5 "Classification").
/// `scanners`, when given, makes the intersection pass run each format's
/// real validator (spec §6 "`--accurate`") instead of the default quick
/// framing-only check.
pub fn classify(
    root: &Path,
    config: &DatasetConfig,
    index: &Index,
    scanners: Option<&ScannerRegistry>,
) -> Result<Vec<Classification>> {
    classify_tree(
        root,
        index,
        config.segments,
        Some((config.archive_age, config.delete_age)),
        false,
        None,
        scanners,
    )
}

/// Classifies an archive's own tree against its own index (spec §4.6
/// "Archive segments are classified the same way against their own
/// per-archive index"). No age rule applies — an archived segment is not a
/// candidate for a further archive/delete transition here; see DESIGN.md.
pub fn classify_archive(
    archive_dir: &Path,
    layout: SegmentLayout,
    index: &Index,
    row_prefix: &str,
    scanners: Option<&ScannerRegistry>,
) -> Result<Vec<Classification>> {
    classify_tree(archive_dir, index, layout, None, true, Some(row_prefix), scanners)
}
