//! Format-specific scanner contract (spec §6 "Segment validator contract").
//!
//! Decoding the real GRIB1/GRIB2/BUFR/ODIM/VM2 binary formats is explicitly
//! out of scope (spec §1 "Explicitly out of scope"); this module defines
//! the trait boundary a real decoder plugs into, plus [`FixtureScanner`], a
//! self-describing scanner used by this crate's own tests and maintenance
//! agents: its "messages" are themselves `MD`-signed envelope records, so
//! rescans are exercised end-to-end without a real per-format parser.

use std::collections::HashMap;

use crate::envelope::{
    decode_value_list, encode_value_list, read_envelope, write_envelope, METADATA_SIGNATURE,
};
use crate::error::{ArkError, Result};
use crate::metadata::{Format, Metadata};
use crate::value::Value;

/// The per-format decoder contract (spec §6). Implementations live outside
/// this crate; `ScannerRegistry` falls back to [`FixtureScanner`] for any
/// format without one registered.
pub trait FormatScanner: Send + Sync {
    /// Raises on bad framing or truncation (spec §6 `validate(buffer)`).
    fn validate(&self, bytes: &[u8]) -> Result<()>;

    /// Extracts one message's metadata from its raw bytes (spec §6 `scan`,
    /// simplified here to a single message per call — the segment-level
    /// `scan(path, emit)` loop lives in [`crate::maintenance`], which knows
    /// how to split a segment into its constituent messages).
    fn scan(&self, bytes: &[u8]) -> Result<Metadata>;

    /// Update sequence number, when the format carries one (spec §6
    /// `update_sequence_number`). `None` means "not applicable"; a format
    /// that supports USN but couldn't extract one from these particular
    /// bytes should still return `None` rather than erroring.
    fn update_sequence_number(&self, bytes: &[u8]) -> Option<i64> {
        let _ = bytes;
        None
    }

    /// Splits a segment's raw bytes into the `(offset, size)` ranges of
    /// its constituent messages, in order (spec §6 `scan(path,
    /// emit-callback)`, driving maintenance's needs-index/needs-rescan
    /// reindexing). The default treats the whole segment as one message —
    /// correct for opaque formats this crate does not decode.
    fn split(&self, bytes: &[u8]) -> Result<Vec<(u64, u64)>> {
        if bytes.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(vec![(0, bytes.len() as u64)])
        }
    }
}

static FIXTURE_SCANNER: FixtureScanner = FixtureScanner;

/// A scanner whose messages are `MD`-signed envelope records carrying a
/// plain item list — the inverse of [`encode_fixture_message`].
pub struct FixtureScanner;

impl FormatScanner for FixtureScanner {
    fn validate(&self, bytes: &[u8]) -> Result<()> {
        self.scan(bytes).map(|_| ())
    }

    fn scan(&self, bytes: &[u8]) -> Result<Metadata> {
        let mut cursor = bytes;
        let payload = read_envelope(&mut cursor, METADATA_SIGNATURE)?
            .ok_or_else(|| ArkError::format("<fixture>", 0, "empty fixture message"))?;
        let items = decode_value_list(&payload)?;
        Ok(Metadata::from_items(items))
    }

    fn update_sequence_number(&self, bytes: &[u8]) -> Option<i64> {
        self.scan(bytes).ok()?.usn()
    }

    /// `MD`-framed fixture messages are self-delimiting, so splitting a
    /// concatenated segment is just replaying envelopes until EOF.
    fn split(&self, bytes: &[u8]) -> Result<Vec<(u64, u64)>> {
        let mut ranges = Vec::new();
        let mut pos = 0usize;
        while pos < bytes.len() {
            let mut cursor = &bytes[pos..];
            let before = cursor.len();
            read_envelope(&mut cursor, METADATA_SIGNATURE)?
                .ok_or_else(|| ArkError::format("<fixture>", pos as u64, "truncated fixture message"))?;
            let consumed = before - cursor.len();
            ranges.push((pos as u64, consumed as u64));
            pos += consumed;
        }
        Ok(ranges)
    }
}

/// Encodes `metadata` as a fixture message body consumable by
/// [`FixtureScanner::scan`] — used by tests to build fixture messages
/// whose bytes carry their own metadata, standing in for a real decoder.
pub fn encode_fixture_message(metadata: &Metadata) -> Vec<u8> {
    let items: Vec<Value> = metadata.iter().cloned().collect();
    let mut buf = Vec::new();
    write_envelope(&mut buf, METADATA_SIGNATURE, &encode_value_list(&items))
        .expect("encoding an envelope into a Vec<u8> cannot fail");
    buf
}

/// Maps a [`Format`] to its registered decoder, defaulting to
/// [`FixtureScanner`] when none is registered.
#[derive(Default)]
pub struct ScannerRegistry {
    scanners: HashMap<Format, Box<dyn FormatScanner>>,
}

impl ScannerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, format: Format, scanner: Box<dyn FormatScanner>) {
        self.scanners.insert(format, scanner);
    }

    pub fn get(&self, format: Format) -> &dyn FormatScanner {
        self.scanners
            .get(&format)
            .map(|b| b.as_ref())
            .unwrap_or(&FIXTURE_SCANNER)
    }
}
