//! Segment store (spec §4.1).
//!
//! A segment groups the messages of one reftime bucket. Two physical
//! layouts exist — [`file_segment`] (concatenated bytes in one file,
//! optionally gzip-compressed with a `.gz.idx` offset sidecar) and
//! [`dir_segment`] (one file per message, for formats like ODIM/HDF5 that
//! are not safely concatenable). Both implement [`Segment`].

mod dir_segment;
mod file_segment;
mod gzidx;

pub use dir_segment::DirSegment;
pub use file_segment::FileSegment;
pub use gzidx::GzIndex;

use std::path::{Path, PathBuf};

use crate::config::SegmentLayout;
use crate::error::Result;
use crate::metadata::Format;

/// Outcome of [`Segment::check`] (spec §4.1 "check").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Ok,
    NeedsPack,
    NeedsRescan,
}

/// A claimed message location within a segment, as recorded by the index,
/// used to drive `check` and `repack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub offset: u64,
    pub size: u64,
}

/// A pending write returned by `append`/`repack`. Committing makes the
/// write durable and visible; dropping without committing rolls it back
/// (spec §4.1 "Atomicity").
pub trait PendingCommit {
    fn commit(self: Box<Self>) -> Result<()>;
}

/// One physical segment's storage operations (spec §4.1 "Operations").
pub trait Segment: Send {
    /// Appends `data` to the segment's logical byte stream. Returns the
    /// logical offset the message begins at, and a pending-commit token.
    fn append(&mut self, data: &[u8]) -> Result<(u64, Box<dyn PendingCommit + '_>)>;

    /// Reads a logical `[offset, offset+size)` slice.
    fn read(&self, offset: u64, size: u64) -> Result<Vec<u8>>;

    /// Rewrites the segment so it contains exactly `messages`, in order.
    fn repack(&mut self, messages: &[Vec<u8>]) -> Result<Box<dyn PendingCommit + '_>>;

    /// Validates the segment against `claims` (spec §4.1 "check"):
    /// readable bytes for each claim, no gaps between them, and no
    /// trailing bytes past the last claim. `quick` skips the
    /// format-specific validator and only checks framing/gaps.
    fn check(
        &self,
        claims: &[Claim],
        quick: bool,
        validator: Option<&dyn Fn(&[u8]) -> bool>,
    ) -> Result<CheckState>;

    /// Current logical size of the segment (sum of message bytes, not
    /// counting any compression).
    fn logical_size(&self) -> Result<u64>;

    /// Whether this segment handle is backed by a compressed file.
    fn is_compressed(&self) -> bool;

    /// Compresses an already-written, writer-closed segment in place,
    /// producing `<segment>.gz` and `<segment>.gz.idx` (spec §4.1
    /// "Compression").
    fn compress(&mut self) -> Result<()>;
}

/// Opens a handle on the segment at `root.join(relpath)` in the layout the
/// dataset is configured for. Shared by the writer's pooled handles and
/// the reader's short-lived ones (spec §5 "Shared resources").
pub fn open(root: &Path, relpath: &str, layout: SegmentLayout) -> Result<Box<dyn Segment>> {
    let path = root.join(relpath);
    Ok(match layout {
        SegmentLayout::File => Box::new(FileSegment::open(path)?),
        SegmentLayout::Dir => Box::new(DirSegment::open(path)?),
    })
}

/// Physical deletion of a segment and all of its sidecars (spec §4.1
/// "remove").
pub fn remove_segment(root: &Path, relpath: &Path, format: Format) -> Result<u64> {
    let base = segment_path(root, relpath, format);
    let mut freed = 0u64;
    for candidate in sidecar_paths(&base) {
        if let Ok(meta) = std::fs::metadata(&candidate) {
            freed += meta.len();
        }
        if candidate.is_dir() {
            let _ = std::fs::remove_dir_all(&candidate);
        } else {
            let _ = std::fs::remove_file(&candidate);
        }
    }
    Ok(freed)
}

/// The on-disk path of a segment's primary file or directory (not
/// including `.gz`/`.gz.idx`/`.metadata`/`.summary` sidecars).
pub fn segment_path(root: &Path, relpath: &Path, format: Format) -> PathBuf {
    let mut path = root.join(relpath);
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();
    if ext != format.extension() {
        let mut name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".");
        name.push(format.extension());
        path.set_file_name(name);
    }
    path
}

fn sidecar_paths(base: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = SIDECAR_SUFFIXES
        .iter()
        .map(|suffix| with_suffix(base, suffix))
        .collect();
    paths.retain(|p| p.exists());
    paths
}

/// Suffixes appended to a segment's primary path to name its sidecars
/// (spec §3 "Each segment may have sidecar ..."), including the primary
/// path itself (empty suffix). Shared with the archive layer's move of a
/// segment and all of its sidecars into `.archive/<name>/…` (spec §4.6).
pub const SIDECAR_SUFFIXES: &[&str] = &["", ".gz", ".gz.idx", ".metadata", ".summary"];

pub fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut s = base.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}
