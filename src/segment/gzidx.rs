//! `.gz.idx` sidecar: maps logical (uncompressed) offsets to compressed
//! byte ranges so a compressed segment can serve random slice reads
//! without decompressing the whole file (spec §4.1 "Compression").
//!
//! The `.gz` file itself is a concatenation of independent gzip members
//! (RFC 1952 multi-member streams), one per block; each member can be
//! decompressed on its own once its compressed byte range is known, which
//! is exactly what the index records.

use std::io::{Read, Write};
use std::path::Path;

use crate::error::{ArkError, Result};

/// Uncompressed bytes per gzip member. Small enough to keep random reads
/// cheap, large enough to keep compression overhead low.
pub const BLOCK_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub uncompressed_start: u64,
    pub uncompressed_len: u64,
    pub compressed_start: u64,
    pub compressed_len: u64,
}

#[derive(Debug, Clone, Default)]
pub struct GzIndex {
    blocks: Vec<Block>,
}

impl GzIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Returns the blocks overlapping the logical `[offset, offset+size)`
    /// range, in order.
    pub fn blocks_covering(&self, offset: u64, size: u64) -> Result<Vec<Block>> {
        let end = offset
            .checked_add(size)
            .ok_or_else(|| ArkError::consistency("offset+size overflow"))?;
        let start_idx = self
            .blocks
            .partition_point(|b| b.uncompressed_start + b.uncompressed_len <= offset);
        let mut out = Vec::new();
        for block in &self.blocks[start_idx..] {
            if block.uncompressed_start >= end {
                break;
            }
            out.push(*block);
        }
        if out.is_empty() {
            return Err(ArkError::consistency(format!(
                "offset {} not covered by any gzip block",
                offset
            )));
        }
        Ok(out)
    }

    pub fn total_uncompressed_len(&self) -> u64 {
        self.blocks
            .last()
            .map(|b| b.uncompressed_start + b.uncompressed_len)
            .unwrap_or(0)
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(b"GZIX")?;
        w.write_all(&1u16.to_be_bytes())?;
        w.write_all(&(self.blocks.len() as u32).to_be_bytes())?;
        for b in &self.blocks {
            w.write_all(&b.uncompressed_start.to_be_bytes())?;
            w.write_all(&b.uncompressed_len.to_be_bytes())?;
            w.write_all(&b.compressed_start.to_be_bytes())?;
            w.write_all(&b.compressed_len.to_be_bytes())?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != b"GZIX" {
            return Err(ArkError::consistency("bad .gz.idx magic"));
        }
        let mut version = [0u8; 2];
        r.read_exact(&mut version)?;
        let mut count_buf = [0u8; 4];
        r.read_exact(&mut count_buf)?;
        let count = u32::from_be_bytes(count_buf);
        let mut blocks = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut buf = [0u8; 8];
            let mut next_u64 = || -> Result<u64> {
                r.read_exact(&mut buf)?;
                Ok(u64::from_be_bytes(buf))
            };
            blocks.push(Block {
                uncompressed_start: next_u64()?,
                uncompressed_len: next_u64()?,
                compressed_start: next_u64()?,
                compressed_len: next_u64()?,
            });
        }
        Ok(Self { blocks })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut file = std::fs::File::open(path)?;
        Self::read_from(&mut file)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut file = std::fs::File::create(path)?;
        self.write_to(&mut file)
    }
}
