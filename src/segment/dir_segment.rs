//! Directory-of-files segment layout (spec §3 "Directory segment", §4.1).
//!
//! Used for formats whose messages are not safely concatenable (HDF5-based
//! ODIM in particular): each message becomes its own file inside the
//! segment directory, named by a zero-padded stable sequence number. The
//! `offset`/`size` pair the rest of the system uses to address a message
//! is, for this layout, `(sequence number, byte length)` rather than a
//! byte range into a single stream.

use std::fs;
use std::path::{Path, PathBuf};

use super::{CheckState, Claim, PendingCommit, Segment};
use crate::error::{ArkError, Result};

fn seq_name(seq: u64) -> String {
    format!("{:010}", seq)
}

fn seq_of(name: &str) -> Option<u64> {
    name.parse().ok()
}

/// A handle on one directory-layout segment.
pub struct DirSegment {
    dir: PathBuf,
}

impl DirSegment {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn entries_sorted(&self) -> Result<Vec<(u64, PathBuf)>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(seq) = seq_of(&name) {
                entries.push((seq, entry.path()));
            }
        }
        entries.sort_by_key(|(seq, _)| *seq);
        Ok(entries)
    }

    fn next_seq(&self) -> Result<u64> {
        Ok(self
            .entries_sorted()?
            .last()
            .map(|(seq, _)| seq + 1)
            .unwrap_or(0))
    }

    fn path_for(&self, seq: u64) -> PathBuf {
        self.dir.join(seq_name(seq))
    }
}

/// Pending append: the message file is written under a temporary name and
/// linked into place on commit, matching spec §4.1's "write to a temporary
/// name then link-in on commit" for the directory layout.
pub struct PendingDirAppend {
    tmp_path: PathBuf,
    final_path: PathBuf,
    committed: bool,
}

impl PendingCommit for PendingDirAppend {
    fn commit(mut self: Box<Self>) -> Result<()> {
        self.committed = true;
        fs::rename(&self.tmp_path, &self.final_path)?;
        Ok(())
    }
}

impl Drop for PendingDirAppend {
    fn drop(&mut self) {
        if !self.committed && self.tmp_path.exists() {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

/// Pending repack: the whole directory's contents are rewritten into a
/// sibling staging directory; commit swaps it in, rollback discards it.
pub struct PendingDirRepack {
    staging: PathBuf,
    final_dir: PathBuf,
    committed: bool,
}

impl PendingCommit for PendingDirRepack {
    fn commit(mut self: Box<Self>) -> Result<()> {
        self.committed = true;
        let backup = with_suffix(&self.final_dir, ".repack.old");
        if self.final_dir.exists() {
            fs::rename(&self.final_dir, &backup)?;
        }
        fs::rename(&self.staging, &self.final_dir)?;
        if backup.exists() {
            fs::remove_dir_all(&backup)?;
        }
        Ok(())
    }
}

impl Drop for PendingDirRepack {
    fn drop(&mut self) {
        if !self.committed && self.staging.exists() {
            let _ = fs::remove_dir_all(&self.staging);
        }
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut s = base.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

impl Segment for DirSegment {
    fn append(&mut self, data: &[u8]) -> Result<(u64, Box<dyn PendingCommit + '_>)> {
        let seq = self.next_seq()?;
        let tmp_path = with_suffix(&self.dir, &format!(".{}.tmp", seq_name(seq)));
        fs::write(&tmp_path, data)?;
        Ok((
            seq,
            Box::new(PendingDirAppend {
                tmp_path,
                final_path: self.path_for(seq),
                committed: false,
            }),
        ))
    }

    fn read(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        let path = self.path_for(offset);
        let bytes = fs::read(&path)
            .map_err(|_| ArkError::consistency(format!("missing message file {:?}", path)))?;
        if bytes.len() as u64 != size {
            return Err(ArkError::consistency(format!(
                "message file {:?} has length {} but index claims {}",
                path,
                bytes.len(),
                size
            )));
        }
        Ok(bytes)
    }

    fn repack(&mut self, messages: &[Vec<u8>]) -> Result<Box<dyn PendingCommit + '_>> {
        let staging = with_suffix(&self.dir, ".repack.staging");
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;
        for (seq, message) in messages.iter().enumerate() {
            fs::write(staging.join(seq_name(seq as u64)), message)?;
        }
        Ok(Box::new(PendingDirRepack {
            staging,
            final_dir: self.dir.clone(),
            committed: false,
        }))
    }

    fn check(
        &self,
        claims: &[Claim],
        quick: bool,
        validator: Option<&dyn Fn(&[u8]) -> bool>,
    ) -> Result<CheckState> {
        let on_disk = self.entries_sorted()?;
        let on_disk_seqs: std::collections::BTreeSet<u64> =
            on_disk.iter().map(|(seq, _)| *seq).collect();

        let mut claimed_seqs = std::collections::BTreeSet::new();
        for claim in claims {
            claimed_seqs.insert(claim.offset);
            if !on_disk_seqs.contains(&claim.offset) {
                return Ok(CheckState::NeedsRescan);
            }
            let actual_len = fs::metadata(self.path_for(claim.offset))?.len();
            if actual_len != claim.size {
                return Ok(CheckState::NeedsRescan);
            }
            if !quick {
                if let Some(validate) = validator {
                    let bytes = self.read(claim.offset, claim.size)?;
                    if !validate(&bytes) {
                        return Ok(CheckState::NeedsRescan);
                    }
                }
            }
        }

        if on_disk_seqs.iter().any(|seq| !claimed_seqs.contains(seq)) {
            return Ok(CheckState::NeedsPack);
        }

        Ok(CheckState::Ok)
    }

    fn logical_size(&self) -> Result<u64> {
        let mut total = 0u64;
        for (_, path) in self.entries_sorted()? {
            total += fs::metadata(path)?.len();
        }
        Ok(total)
    }

    fn is_compressed(&self) -> bool {
        false
    }

    fn compress(&mut self) -> Result<()> {
        Err(ArkError::consistency(
            "directory segments cannot be gzip-compressed",
        ))
    }
}
