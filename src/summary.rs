//! Lossy index summaries and their on-disk cache (spec §3 "Summary", §6
//! "Summary cache files").
//!
//! A summary is a map from an attribute-tuple (the dataset's configured
//! `index` columns, same as [`crate::index::Row::attributes`]) to stats:
//! count, total size, and the enclosing reference-time interval. It shares
//! the `SU`-signature envelope with metadata records (spec §6), and its
//! entries reuse [`crate::envelope::encode_value_list`] for the key and
//! canonical varint fields for the stats.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::envelope::{
    self, decode_value_list, encode_value_list, read_envelope, read_varint, write_envelope,
    write_varint, SUMMARY_SIGNATURE,
};
use crate::error::Result;
use crate::reftime::Reftime;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stats {
    pub count: u64,
    pub size: u64,
    pub reftime: Reftime,
}

/// A lossy aggregate: `(attribute-tuple → stats)` (spec §3 "Summary").
/// Entries are kept in canonical (sorted) key order so two summaries built
/// from the same rows, regardless of scan order, compare equal and encode
/// to the same bytes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summary {
    entries: BTreeMap<Vec<Value>, Stats>,
}

impl Summary {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Folds one row's contribution into this summary's `key` bucket.
    pub fn add(&mut self, key: Vec<Value>, size: u64, reftime: Reftime) {
        self.entries
            .entry(key)
            .and_modify(|s| {
                s.count += 1;
                s.size += size;
                s.reftime = s.reftime.extend(&reftime);
            })
            .or_insert(Stats {
                count: 1,
                size,
                reftime,
            });
    }

    /// Merges another summary's buckets into this one, used to combine a
    /// dataset's per-month caches into `all.summary` or several datasets'
    /// archive summaries into `archives.summary`.
    pub fn merge_from(&mut self, other: &Summary) {
        for (key, stats) in &other.entries {
            self.entries
                .entry(key.clone())
                .and_modify(|s| {
                    s.count += stats.count;
                    s.size += stats.size;
                    s.reftime = s.reftime.extend(&stats.reftime);
                })
                .or_insert(*stats);
        }
    }

    pub fn total_count(&self) -> u64 {
        self.entries.values().map(|s| s.count).sum()
    }

    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|s| s.size).sum()
    }

    pub fn reftime_extent(&self) -> Option<Reftime> {
        Reftime::merge(self.entries.values().map(|s| &s.reftime))
    }

    /// Whether this summary's reftime extent could intersect `filter`'s
    /// bounds, used by the archive layer to skip archives that cannot
    /// possibly contribute to a query (spec §4.6: "skipping archives whose
    /// reftime extent does not intersect the filter").
    pub fn intersects(
        &self,
        min: Option<chrono::DateTime<chrono::Utc>>,
        max: Option<chrono::DateTime<chrono::Utc>>,
    ) -> bool {
        match self.reftime_extent() {
            None => false,
            Some(extent) => {
                if let Some(min) = min {
                    if extent.max() < min {
                        return false;
                    }
                }
                if let Some(max) = max {
                    if extent.min() > max {
                        return false;
                    }
                }
                true
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[Value], &Stats)> {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v))
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_varint(&mut buf, self.entries.len() as u64);
        for (key, stats) in &self.entries {
            envelope::write_bytes(&mut buf, &encode_value_list(key));
            write_varint(&mut buf, stats.count);
            write_varint(&mut buf, stats.size);
            write_varint(&mut buf, stats.reftime.min().timestamp() as u64);
            write_varint(&mut buf, stats.reftime.max().timestamp() as u64);
        }
        buf
    }

    fn decode_payload(buf: &[u8]) -> Result<Self> {
        let mut pos = 0usize;
        let n = read_varint(buf, &mut pos)?;
        let mut entries = BTreeMap::new();
        for _ in 0..n {
            let key = decode_value_list(envelope::read_bytes(buf, &mut pos)?)?;
            let count = read_varint(buf, &mut pos)?;
            let size = read_varint(buf, &mut pos)?;
            let min = read_varint(buf, &mut pos)? as i64;
            let max = read_varint(buf, &mut pos)? as i64;
            entries.insert(
                key,
                Stats {
                    count,
                    size,
                    reftime: Reftime::from_unix_range(min, max),
                },
            );
        }
        Ok(Self { entries })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        write_envelope(w, SUMMARY_SIGNATURE, &self.encode_payload())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        match read_envelope(r, SUMMARY_SIGNATURE)? {
            Some(payload) => Self::decode_payload(&payload),
            None => Ok(Self::empty()),
        }
    }

    /// Loads a summary cache file, treating a missing file as an empty
    /// summary (spec §4.5: maintenance invalidates a bucket by deleting its
    /// file; the next `query_summary` recomputes it).
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::File::open(path) {
            Ok(mut f) => Self::read_from(&mut f),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::empty()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(path)?;
        self.write_to(&mut file)
    }
}

/// Path of the live dataset's combined summary cache (spec §6 "Summary
/// cache files": a dataset's unfiltered summary is itself cached, mirroring
/// the archive layer's `.summaries/archives.summary`).
pub fn live_cache_path(root: &Path) -> PathBuf {
    root.join(".summaries").join("all.summary")
}

/// Drops the live summary cache; called by every operation that mutates a
/// dataset's index rows (acquire, remove, rescan, repack, archive, delete)
/// so the next unfiltered `query_summary` recomputes it.
pub fn invalidate_live_cache(root: &Path) -> Result<()> {
    let path = live_cache_path(root);
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}
