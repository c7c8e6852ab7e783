//! Per-dataset configuration surface (spec §6 "Configuration surface").
//!
//! Parsing the bespoke on-disk `.conf` section-file grammar arkimet uses is
//! out of scope (spec §1); `DatasetConfig` instead derives `serde`
//! `Deserialize`/`Serialize` so embedders can feed it from whatever format
//! they like (tests in this crate build it directly, or via
//! `toml::from_str`), matching the teacher's own separation between
//! `config::datastore` (the section-file reader) and the typed config it
//! produces.

use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::reftime::Step;
use crate::value::TypeCode;

/// Dataset names are used as path components under the archive root and as
/// SQL/manifest file-name fragments, so they are restricted to a safe,
/// portable subset.
static DATASET_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetType {
    Local,
    Ondisk2,
    Simple,
    Outbound,
    Discard,
    Error,
    Duplicates,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentLayout {
    File,
    Dir,
}

impl Default for SegmentLayout {
    fn default() -> Self {
        SegmentLayout::File
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplacePolicy {
    Never,
    Always,
    #[serde(rename = "USN")]
    Usn,
}

impl Default for ReplacePolicy {
    fn default() -> Self {
        ReplacePolicy::Never
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
    Plain,
    Sqlite,
}

impl Default for IndexType {
    fn default() -> Self {
        IndexType::Sqlite
    }
}

fn default_smallfiles() -> bool {
    false
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DatasetConfig {
    #[serde(rename = "type")]
    pub kind: DatasetType,
    pub path: PathBuf,
    pub name: String,
    pub step: Step,

    /// Raw matcher-expression text; interpreted by the external matcher
    /// collaborator named in spec §1 (out of scope here).
    #[serde(default)]
    pub filter: Option<String>,

    pub unique: Vec<TypeCode>,
    #[serde(default)]
    pub index: Vec<TypeCode>,

    #[serde(default)]
    pub segments: SegmentLayout,

    #[serde(default = "default_smallfiles")]
    pub smallfiles: bool,

    #[serde(default)]
    pub replace: ReplacePolicy,

    #[serde(default)]
    pub archive_age: Option<u32>,
    #[serde(default)]
    pub delete_age: Option<u32>,

    #[serde(default)]
    pub index_type: IndexType,

    #[serde(default)]
    pub postprocess: Vec<String>,
}

impl DatasetConfig {
    /// Validates the configuration's internal consistency (spec §7
    /// `ConfigError`): delete-age must not be tighter than archive-age, and
    /// `unique` must name at least one type-code.
    pub fn validate(&self) -> Result<(), crate::error::ArkError> {
        if !DATASET_NAME_RE.is_match(&self.name) {
            return Err(crate::error::ArkError::Config(format!(
                "dataset name {:?} must match [A-Za-z0-9_-]+",
                self.name
            )));
        }
        if self.unique.is_empty() {
            return Err(crate::error::ArkError::Config(
                "dataset 'unique' key-set must not be empty".into(),
            ));
        }
        if let (Some(archive_age), Some(delete_age)) = (self.archive_age, self.delete_age) {
            if delete_age < archive_age {
                return Err(crate::error::ArkError::Config(format!(
                    "delete age ({}) must not be smaller than archive age ({})",
                    delete_age, archive_age
                )));
            }
        }
        Ok(())
    }

    /// Target segment relative path (without format extension) for a
    /// message landing in reftime `t` (spec §3 invariant I4).
    pub fn segment_bucket(&self, t: chrono::DateTime<chrono::Utc>) -> String {
        self.step.bucket_path(t)
    }
}
