//! Metadata value model: type-codes and their typed style variants (spec §3,
//! design note "Polymorphism over metadata item variants").
//!
//! Each [`TypeCode`] names a closed metadata slot (origin, product, level,
//! ...); each slot's concrete value is a [`Value`] variant. Comparison
//! between values of different type-codes sorts by type-code first; within
//! a type-code, by style, then field-by-field, matching the ordering rules
//! of the original `arki::types` hierarchy.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The closed enumeration of metadata slots a message can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TypeCode {
    Origin = 1,
    Product = 2,
    Level = 3,
    Timerange = 4,
    Reftime = 5,
    Area = 6,
    Proddef = 7,
    Run = 8,
    Note = 9,
    Source = 10,
    AssignedDataset = 11,
    Task = 12,
    Quantity = 13,
    Value = 14,
}

impl TypeCode {
    pub const ALL: &'static [TypeCode] = &[
        TypeCode::Origin,
        TypeCode::Product,
        TypeCode::Level,
        TypeCode::Timerange,
        TypeCode::Reftime,
        TypeCode::Area,
        TypeCode::Proddef,
        TypeCode::Run,
        TypeCode::Note,
        TypeCode::Source,
        TypeCode::AssignedDataset,
        TypeCode::Task,
        TypeCode::Quantity,
        TypeCode::Value,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TypeCode::Origin => "origin",
            TypeCode::Product => "product",
            TypeCode::Level => "level",
            TypeCode::Timerange => "timerange",
            TypeCode::Reftime => "reftime",
            TypeCode::Area => "area",
            TypeCode::Proddef => "proddef",
            TypeCode::Run => "run",
            TypeCode::Note => "note",
            TypeCode::Source => "source",
            TypeCode::AssignedDataset => "assigneddataset",
            TypeCode::Task => "task",
            TypeCode::Quantity => "quantity",
            TypeCode::Value => "value",
        }
    }

    pub fn parse(name: &str) -> Option<TypeCode> {
        TypeCode::ALL.iter().copied().find(|t| t.name() == name)
    }
}

impl fmt::Display for TypeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for TypeCode {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for TypeCode {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let name = String::deserialize(d)?;
        TypeCode::parse(&name)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown type-code '{}'", name)))
    }
}

/// Style byte distinguishing the concrete shape of a value within one
/// type-code, e.g. `origin:GRIB1` vs `origin:GRIB2` vs `origin:BUFR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Style {
    Grib1 = 1,
    Grib2 = 2,
    Bufr = 3,
    Odimh5 = 4,
    Generic = 5,
}

/// A single typed metadata value. The outer match on [`TypeCode`] is
/// implicit in which variant of `Value` is used, but we keep the type-code
/// reachable via [`Value::type_code`] since it drives index/fingerprint
/// column selection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Origin {
        style: Style,
        centre: u16,
        subcentre: u16,
        process: u16,
    },
    Product {
        style: Style,
        centre: u16,
        discipline: u8,
        category: u8,
        number: u16,
    },
    Level {
        style: Style,
        ltype: u16,
        l1: i32,
        l2: Option<i32>,
    },
    Timerange {
        style: Style,
        unit: u8,
        p1: u32,
        p2: u32,
    },
    Reftime(crate::reftime::Reftime),
    Area {
        grid_type: String,
        values: Vec<(String, i64)>,
    },
    Proddef {
        values: Vec<(String, i64)>,
    },
    Run {
        style: Style,
        hour: u8,
        minute: u8,
    },
    Note {
        text: String,
    },
    Source {
        format: String,
        descriptor: SourceDescriptor,
    },
    AssignedDataset {
        dataset: String,
        id: i64,
    },
    Task {
        text: String,
    },
    Quantity {
        values: Vec<String>,
    },
    Scalar {
        code: TypeCode,
        bytes: Vec<u8>,
    },
}

/// Where a message's raw bytes physically live (spec §3 "Source").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceDescriptor {
    Blob {
        base_dir: String,
        relpath: String,
        offset: u64,
        size: u64,
    },
    Inline {
        size: u64,
    },
    Url {
        url: String,
    },
}

impl Value {
    pub fn type_code(&self) -> TypeCode {
        match self {
            Value::Origin { .. } => TypeCode::Origin,
            Value::Product { .. } => TypeCode::Product,
            Value::Level { .. } => TypeCode::Level,
            Value::Timerange { .. } => TypeCode::Timerange,
            Value::Reftime(_) => TypeCode::Reftime,
            Value::Area { .. } => TypeCode::Area,
            Value::Proddef { .. } => TypeCode::Proddef,
            Value::Run { .. } => TypeCode::Run,
            Value::Note { .. } => TypeCode::Note,
            Value::Source { .. } => TypeCode::Source,
            Value::AssignedDataset { .. } => TypeCode::AssignedDataset,
            Value::Task { .. } => TypeCode::Task,
            Value::Quantity { .. } => TypeCode::Quantity,
            Value::Scalar { code, .. } => *code,
        }
    }

    fn style(&self) -> Style {
        match self {
            Value::Origin { style, .. }
            | Value::Product { style, .. }
            | Value::Level { style, .. }
            | Value::Timerange { style, .. }
            | Value::Run { style, .. } => *style,
            _ => Style::Generic,
        }
    }

    /// Canonical binary encoding, used both for the persisted envelope and
    /// as the key of the optional deduplication table (design note
    /// "Ownership of cached items").
    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        crate::envelope::encode_value(self)
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        self.type_code()
            .cmp(&other.type_code())
            .then_with(|| self.style().cmp(&other.style()))
            .then_with(|| self.to_canonical_bytes().cmp(&other.to_canonical_bytes()))
    }
}
