//! Concatenated-file segment layout (spec §3 "File segment", §4.1).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::gzidx::{Block, GzIndex, BLOCK_SIZE};
use super::{CheckState, Claim, PendingCommit, Segment};
use crate::error::{ArkError, Result};

/// A handle on one file-layout segment, either plain or gzip-compressed.
pub struct FileSegment {
    path: PathBuf,
    gz_idx: Option<GzIndex>,
}

impl FileSegment {
    /// Opens (creating if absent) the plain, uncompressed segment file at
    /// `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let gz_path = with_suffix(&path, ".gz");
        if gz_path.exists() {
            let idx_path = with_suffix(&path, ".gz.idx");
            let gz_idx = GzIndex::load(&idx_path)?;
            return Ok(Self {
                path: gz_path,
                gz_idx: Some(gz_idx),
            });
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self {
            path,
            gz_idx: None,
        })
    }

    fn file_len(&self) -> Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut s = base.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// Pending append: the write already landed on disk; rollback truncates
/// the file back to its pre-write length (spec §4.1: "write followed by
/// atomic rename-or-truncate on commit/rollback").
pub struct PendingAppend {
    path: PathBuf,
    original_len: u64,
    committed: bool,
}

impl PendingCommit for PendingAppend {
    fn commit(mut self: Box<Self>) -> Result<()> {
        self.committed = true;
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.sync_all()?;
        Ok(())
    }
}

impl Drop for PendingAppend {
    fn drop(&mut self) {
        if !self.committed {
            if let Ok(file) = OpenOptions::new().write(true).open(&self.path) {
                let _ = file.set_len(self.original_len);
            }
        }
    }
}

/// Pending repack: the new contents were written to a sibling temp file;
/// commit renames it over the original, rollback deletes the temp file.
pub struct PendingRepack {
    tmp_path: PathBuf,
    final_path: PathBuf,
    committed: bool,
}

impl PendingCommit for PendingRepack {
    fn commit(mut self: Box<Self>) -> Result<()> {
        self.committed = true;
        std::fs::rename(&self.tmp_path, &self.final_path)?;
        Ok(())
    }
}

impl Drop for PendingRepack {
    fn drop(&mut self) {
        if !self.committed && self.tmp_path.exists() {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

impl Segment for FileSegment {
    fn append(&mut self, data: &[u8]) -> Result<(u64, Box<dyn PendingCommit + '_>)> {
        if self.gz_idx.is_some() {
            return Err(ArkError::consistency(
                "cannot append to a compressed segment; it is read-only to the writer",
            ));
        }
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        let original_len = file.seek(SeekFrom::End(0))?;
        file.write_all(data)?;
        Ok((
            original_len,
            Box::new(PendingAppend {
                path: self.path.clone(),
                original_len,
                committed: false,
            }),
        ))
    }

    fn read(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        if let Some(idx) = &self.gz_idx {
            let blocks = idx.blocks_covering(offset, size)?;
            let mut file = File::open(&self.path)?;
            let mut uncompressed = Vec::new();
            for block in &blocks {
                file.seek(SeekFrom::Start(block.compressed_start))?;
                let member = (&mut file).take(block.compressed_len);
                let mut decoder = GzDecoder::new(member);
                let mut chunk = Vec::with_capacity(block.uncompressed_len as usize);
                decoder.read_to_end(&mut chunk)?;
                uncompressed.extend_from_slice(&chunk);
            }
            let base = blocks[0].uncompressed_start;
            let start = (offset - base) as usize;
            let end = start + size as usize;
            let slice = uncompressed
                .get(start..end)
                .ok_or_else(|| ArkError::consistency("short read from compressed segment"))?;
            return Ok(slice.to_vec());
        }

        let mut file = File::open(&self.path)?;
        let len = file.seek(SeekFrom::End(0))?;
        if offset + size > len {
            return Err(ArkError::consistency(format!(
                "read past end of segment {:?} ({}..{} > {})",
                self.path,
                offset,
                offset + size,
                len
            )));
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; size as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn repack(&mut self, messages: &[Vec<u8>]) -> Result<Box<dyn PendingCommit + '_>> {
        let tmp_path = with_suffix(&self.path, ".repack.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            for m in messages {
                tmp.write_all(m)?;
            }
            tmp.sync_all()?;
        }
        Ok(Box::new(PendingRepack {
            tmp_path,
            final_path: self.path.clone(),
            committed: false,
        }))
    }

    fn check(
        &self,
        claims: &[Claim],
        quick: bool,
        validator: Option<&dyn Fn(&[u8]) -> bool>,
    ) -> Result<CheckState> {
        let total_len = if let Some(idx) = &self.gz_idx {
            idx.total_uncompressed_len()
        } else {
            self.file_len()?
        };

        let mut sorted: Vec<Claim> = claims.to_vec();
        sorted.sort_by_key(|c| c.offset);

        let mut expected_next = 0u64;
        for claim in &sorted {
            if claim.offset != expected_next {
                // gap or overlap: needs-pack can fix either by rewriting
                return Ok(CheckState::NeedsPack);
            }
            if claim.offset + claim.size > total_len {
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
            expected_next = claim.offset + claim.size;
        }

        if expected_next < total_len {
            return Ok(CheckState::NeedsPack);
        }

        Ok(CheckState::Ok)
    }

    fn logical_size(&self) -> Result<u64> {
        if let Some(idx) = &self.gz_idx {
            Ok(idx.total_uncompressed_len())
        } else {
            self.file_len()
        }
    }

    fn is_compressed(&self) -> bool {
        self.gz_idx.is_some()
    }

    fn compress(&mut self) -> Result<()> {
        if self.gz_idx.is_some() {
            return Ok(());
        }
        let raw = std::fs::read(&self.path)?;
        let gz_path = with_suffix(&self.path, ".gz");
        let idx_path = with_suffix(&self.path, ".gz.idx");

        let mut gz_file = File::create(&gz_path)?;
        let mut idx = GzIndex::new();
        let mut compressed_offset = 0u64;

        for chunk in raw.chunks(BLOCK_SIZE as usize) {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(chunk)?;
            let compressed = encoder.finish()?;
            gz_file.write_all(&compressed)?;
            idx.push(Block {
                uncompressed_start: idx.total_uncompressed_len(),
                uncompressed_len: chunk.len() as u64,
                compressed_start: compressed_offset,
                compressed_len: compressed.len() as u64,
            });
            compressed_offset += compressed.len() as u64;
        }
        gz_file.sync_all()?;
        idx.save(&idx_path)?;

        std::fs::remove_file(&self.path)?;
        self.path = gz_path;
        self.gz_idx = Some(idx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("2007/07-08.grib1");
        let mut seg = FileSegment::open(&path).unwrap();

        let (offset, pending) = seg.append(b"hello").unwrap();
        assert_eq!(offset, 0);
        pending.commit().unwrap();

        let (offset2, pending2) = seg.append(b"world").unwrap();
        assert_eq!(offset2, 5);
        pending2.commit().unwrap();

        assert_eq!(seg.read(0, 5).unwrap(), b"hello");
        assert_eq!(seg.read(5, 5).unwrap(), b"world");
    }

    #[test]
    fn dropped_pending_append_rolls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.grib1");
        let mut seg = FileSegment::open(&path).unwrap();
        {
            let (_offset, pending) = seg.append(b"hello").unwrap();
            drop(pending);
        }
        assert_eq!(seg.logical_size().unwrap(), 0);
    }

    #[test]
    fn check_detects_gap_as_needs_pack() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.grib1");
        let mut seg = FileSegment::open(&path).unwrap();
        seg.append(b"hello").unwrap().1.commit().unwrap();
        seg.append(b"world").unwrap().1.commit().unwrap();

        // claim only covers the first message: the rest is a hole
        let state = seg
            .check(&[Claim { offset: 0, size: 5 }], true, None)
            .unwrap();
        assert_eq!(state, CheckState::NeedsPack);
    }

    #[test]
    fn check_detects_missing_bytes_as_needs_rescan() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.grib1");
        let mut seg = FileSegment::open(&path).unwrap();
        seg.append(b"hi").unwrap().1.commit().unwrap();

        let state = seg
            .check(&[Claim { offset: 0, size: 100 }], true, None)
            .unwrap();
        assert_eq!(state, CheckState::NeedsRescan);
    }

    #[test]
    fn check_passes_for_exact_coverage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.grib1");
        let mut seg = FileSegment::open(&path).unwrap();
        seg.append(b"hello").unwrap().1.commit().unwrap();
        seg.append(b"world").unwrap().1.commit().unwrap();

        let state = seg
            .check(
                &[
                    Claim { offset: 0, size: 5 },
                    Claim { offset: 5, size: 5 },
                ],
                true,
                None,
            )
            .unwrap();
        assert_eq!(state, CheckState::Ok);
    }

    #[test]
    fn repack_rewrites_in_new_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.grib1");
        let mut seg = FileSegment::open(&path).unwrap();
        seg.append(b"aaa").unwrap().1.commit().unwrap();
        seg.append(b"bbb").unwrap().1.commit().unwrap();

        let pending = seg
            .repack(&[b"bbb".to_vec(), b"aaa".to_vec()])
            .unwrap();
        pending.commit().unwrap();

        assert_eq!(seg.read(0, 3).unwrap(), b"bbb");
        assert_eq!(seg.read(3, 3).unwrap(), b"aaa");
    }

    #[test]
    fn compress_then_read_round_trips_across_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.grib1");
        let mut seg = FileSegment::open(&path).unwrap();

        let big = vec![b'x'; (BLOCK_SIZE as usize) + 100];
        seg.append(&big).unwrap().1.commit().unwrap();
        seg.append(b"tail").unwrap().1.commit().unwrap();

        seg.compress().unwrap();
        assert!(seg.is_compressed());

        let read_back = seg.read(0, big.len() as u64).unwrap();
        assert_eq!(read_back, big);
        let tail = seg.read(big.len() as u64, 4).unwrap();
        assert_eq!(tail, b"tail");
    }
}
