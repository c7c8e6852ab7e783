//! Error kinds for the archive core (spec §7).

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ArkError>;

/// The error kinds a dataset operation can fail with.
///
/// `Skip` is not really an error in the usual sense: batch operations over
/// several datasets catch it and report-and-continue rather than aborting.
#[derive(Debug, Error)]
pub enum ArkError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("could not parse message at {path:?} offset {offset}: {reason}")]
    Format {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("inconsistent on-disk/index state: {0}")]
    Consistency(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index backend error: {0}")]
    Index(#[from] rusqlite::Error),

    #[error("dataset unavailable, skipping: {0}")]
    Skip(String),
}

impl ArkError {
    pub fn consistency(msg: impl Into<String>) -> Self {
        ArkError::Consistency(msg.into())
    }

    pub fn format(path: impl Into<PathBuf>, offset: u64, reason: impl Into<String>) -> Self {
        ArkError::Format {
            path: path.into(),
            offset,
            reason: reason.into(),
        }
    }

    /// True for errors that a batch maintenance run should report and skip,
    /// rather than treat as fatal to the whole run.
    pub fn is_skip(&self) -> bool {
        matches!(self, ArkError::Skip(_))
    }
}
