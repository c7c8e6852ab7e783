//! Metadata bags, fingerprints, and messages (spec §3 "Message", "Fingerprint").

use std::cmp::Ordering;

use crate::reftime::Reftime;
use crate::value::{SourceDescriptor, TypeCode, Value};

/// The binary format a message's bytes are encoded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Grib1,
    Grib2,
    Bufr,
    Odim,
    Vm2,
}

impl Format {
    pub fn extension(self) -> &'static str {
        match self {
            Format::Grib1 => "grib1",
            Format::Grib2 => "grib2",
            Format::Bufr => "bufr",
            Format::Odim => "odim",
            Format::Vm2 => "vm2",
        }
    }

    pub const ALL: &'static [Format] = &[
        Format::Grib1,
        Format::Grib2,
        Format::Bufr,
        Format::Odim,
        Format::Vm2,
    ];

    /// Recovers a format from a segment's file extension (spec §3
    /// "Segment"), used by maintenance when a segment's format isn't
    /// otherwise known (e.g. an on-disk file with no index rows yet).
    pub fn from_extension(ext: &str) -> Option<Format> {
        Format::ALL.iter().copied().find(|f| f.extension() == ext)
    }
}

/// An immutable bag of metadata items attached to a message. Items are kept
/// in insertion order; lookups by type-code scan linearly since a message
/// typically carries a handful of items (one per spec §3 type-code, plus
/// any repeated `note` entries).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    items: Vec<Value>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items(items: Vec<Value>) -> Self {
        Self { items }
    }

    /// Attaches an item. Metadata items are immutable once attached;
    /// `set` replaces any existing item sharing this item's type-code,
    /// except for `note`, where items accumulate (spec §3: "Metadata items
    /// are immutable once attached").
    pub fn set(&mut self, item: Value) {
        if item.type_code() != TypeCode::Note {
            self.items.retain(|v| v.type_code() != item.type_code());
        }
        self.items.push(item);
    }

    pub fn get(&self, code: TypeCode) -> Option<&Value> {
        self.items.iter().find(|v| v.type_code() == code)
    }

    pub fn get_all(&self, code: TypeCode) -> impl Iterator<Item = &Value> {
        self.items.iter().filter(move |v| v.type_code() == code)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.items.iter()
    }

    pub fn reftime(&self) -> Option<Reftime> {
        match self.get(TypeCode::Reftime) {
            Some(Value::Reftime(rt)) => Some(*rt),
            _ => None,
        }
    }

    /// Update sequence number, when present (spec §6 `update_sequence_number`,
    /// §4.2 "higher-USN" policy). Carried as a `quantity` item named `usn`
    /// by convention, since USN is not itself one of the closed type-codes.
    pub fn usn(&self) -> Option<i64> {
        self.get_all(TypeCode::Quantity).find_map(|v| {
            if let Value::Quantity { values } = v {
                values
                    .iter()
                    .find_map(|s| s.strip_prefix("usn=").and_then(|n| n.parse().ok()))
            } else {
                None
            }
        })
    }

    /// Builds the fingerprint: the subset of items named by `unique`,
    /// always including reftime (spec §3: "Reference-time is always part
    /// of the fingerprint").
    pub fn fingerprint(&self, unique: &[TypeCode]) -> Fingerprint {
        let mut codes: Vec<TypeCode> = unique.to_vec();
        if !codes.contains(&TypeCode::Reftime) {
            codes.push(TypeCode::Reftime);
        }
        codes.sort();
        codes.dedup();
        let items: Vec<Value> = codes
            .into_iter()
            .filter_map(|c| self.get(c).cloned())
            .collect();
        Fingerprint { items }
    }
}

/// Canonical tuple of metadata items identifying a message within a dataset
/// (spec §3 "Fingerprint", GLOSSARY).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    items: Vec<Value>,
}

impl Fingerprint {
    /// Reconstructs a fingerprint from its exact item list, as stored by
    /// an index backend. Unlike [`Metadata::fingerprint`] this does not
    /// filter by a `unique` key-set — the items already are the complete
    /// fingerprint.
    pub(crate) fn from_items(items: Vec<Value>) -> Self {
        Self { items }
    }

    pub fn reftime(&self) -> Option<Reftime> {
        self.items.iter().find_map(|v| match v {
            Value::Reftime(rt) => Some(*rt),
            _ => None,
        })
    }

    /// The fingerprint with reftime excluded, used as half of the index's
    /// `(reftime, fingerprint-without-reftime)` uniqueness key (spec §3
    /// invariant, §4.2 "insert").
    pub fn without_reftime(&self) -> Vec<Value> {
        self.items
            .iter()
            .filter(|v| v.type_code() != TypeCode::Reftime)
            .cloned()
            .collect()
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    /// Stable byte key, used by index backends as the uniqueness key and
    /// by the dedup table mentioned in the design notes.
    pub fn canonical_key(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for item in &self.items {
            let enc = item.to_canonical_bytes();
            buf.extend_from_slice(&(enc.len() as u32).to_be_bytes());
            buf.extend_from_slice(&enc);
        }
        buf
    }
}

impl PartialOrd for Fingerprint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Fingerprint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.items.cmp(&other.items)
    }
}

/// A message: opaque bytes of a known format plus the metadata extracted
/// from them (spec §3 "Message").
#[derive(Debug, Clone)]
pub struct Message {
    pub format: Format,
    pub data: Vec<u8>,
    pub metadata: Metadata,
}

impl Message {
    pub fn new(format: Format, data: Vec<u8>, metadata: Metadata) -> Self {
        Self {
            format,
            data,
            metadata,
        }
    }

    pub fn source(&self) -> Option<&SourceDescriptor> {
        match self.metadata.get(TypeCode::Source) {
            Some(Value::Source { descriptor, .. }) => Some(descriptor),
            _ => None,
        }
    }

    /// Update sequence number, when the format scanner was able to extract
    /// one (spec §6 `update_sequence_number`, §4.2 "higher-USN" policy).
    pub fn usn(&self) -> Option<i64> {
        self.metadata.usn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Style;
    use chrono::{TimeZone, Utc};

    fn reftime_value(y: i32, m: u32, d: u32) -> Value {
        Value::Reftime(Reftime::Point(Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()))
    }

    #[test]
    fn fingerprint_always_includes_reftime() {
        let mut md = Metadata::new();
        md.set(reftime_value(2007, 7, 8));
        md.set(Value::Origin {
            style: Style::Grib1,
            centre: 200,
            subcentre: 0,
            process: 0,
        });
        let fp = md.fingerprint(&[TypeCode::Origin]);
        assert!(fp.reftime().is_some());
        assert_eq!(fp.items().len(), 2);
    }

    #[test]
    fn without_reftime_drops_only_reftime() {
        let mut md = Metadata::new();
        md.set(reftime_value(2007, 7, 8));
        md.set(Value::Note {
            text: "x".into(),
        });
        let fp = md.fingerprint(&[TypeCode::Note]);
        assert_eq!(fp.without_reftime().len(), 1);
    }

    #[test]
    fn note_items_accumulate() {
        let mut md = Metadata::new();
        md.set(Value::Note { text: "a".into() });
        md.set(Value::Note { text: "b".into() });
        assert_eq!(md.get_all(TypeCode::Note).count(), 2);
    }

    #[test]
    fn set_replaces_non_note_items() {
        let mut md = Metadata::new();
        md.set(reftime_value(2007, 7, 8));
        md.set(reftime_value(2008, 1, 1));
        assert_eq!(md.get_all(TypeCode::Reftime).count(), 1);
    }
}
