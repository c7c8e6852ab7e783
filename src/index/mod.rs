//! Persistent index (spec §4.2).
//!
//! Two backends are contemplated by the spec — an embedded relational
//! store ([`sqlite`]) and an append-only manifest file ([`manifest`]) — and
//! both must expose the same contract. Rather than a `dyn`-safe trait
//! (awkward here because each backend's transaction type borrows its own
//! connection/lock in incompatible ways), the contract is expressed as the
//! [`Index`] enum: callers match once at dataset-open time and every
//! operation afterwards is a plain enum dispatch, the common "pick a
//! backend" pattern for a small, closed set of implementations.

mod manifest;
mod sqlite;

pub use manifest::ManifestIndex;
pub use sqlite::SqliteIndex;

use std::path::Path;

use crate::config::IndexType;
use crate::error::Result;
use crate::metadata::Fingerprint;
use crate::reftime::Reftime;
use crate::summary::Summary;
use crate::value::{TypeCode, Value};

/// One row of the index (spec §3 "Index row").
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: i64,
    pub fingerprint: Fingerprint,
    pub segment_relpath: String,
    pub offset: u64,
    pub size: u64,
    pub reftime: Reftime,
    pub notes: Vec<String>,
    /// The dataset's configured `index` columns, as extracted from the
    /// message at acquire time.
    pub attributes: crate::metadata::Metadata,
}

/// The row data supplied by a writer, before a backend assigns it an id.
#[derive(Debug, Clone)]
pub struct NewRow {
    pub fingerprint: Fingerprint,
    pub segment_relpath: String,
    pub offset: u64,
    pub size: u64,
    pub reftime: Reftime,
    pub notes: Vec<String>,
    pub attributes: crate::metadata::Metadata,
}

/// A single equality predicate on one metadata type-code, the coarse
/// contract spec §4.2 describes ("translates the filter's predicates on
/// indexed attributes into the native query"). The full matcher expression
/// language is an external collaborator (spec §1); this is deliberately
/// smaller.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub code: TypeCode,
    pub value: Value,
}

/// A query filter: optional reftime bounds plus a conjunction of equality
/// predicates.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub reftime_min: Option<chrono::DateTime<chrono::Utc>>,
    pub reftime_max: Option<chrono::DateTime<chrono::Utc>>,
    pub predicates: Vec<Predicate>,
}

impl Filter {
    pub fn match_all() -> Self {
        Self::default()
    }

    pub fn with_reftime_range(
        mut self,
        min: Option<chrono::DateTime<chrono::Utc>>,
        max: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Self {
        self.reftime_min = min;
        self.reftime_max = max;
        self
    }

    pub fn with_predicate(mut self, code: TypeCode, value: Value) -> Self {
        self.predicates.push(Predicate { code, value });
        self
    }

    /// Whether `row` satisfies the reftime bounds and every predicate this
    /// filter can evaluate against the row's fingerprint/attributes.
    /// Predicates on a type-code the row doesn't carry are never
    /// considered satisfied (spec §4.2: "Predicates on unindexed
    /// attributes are returned alongside as a residual; the caller
    /// re-filters" — here there is no separate raw-message re-decode path,
    /// see DESIGN.md).
    pub fn matches(&self, row: &Row) -> bool {
        if let Some(min) = self.reftime_min {
            if row.reftime.max() < min {
                return false;
            }
        }
        if let Some(max) = self.reftime_max {
            if row.reftime.min() > max {
                return false;
            }
        }
        self.predicates.iter().all(|p| self.row_has(row, p))
    }

    fn row_has(&self, row: &Row, p: &Predicate) -> bool {
        row.fingerprint
            .items()
            .iter()
            .chain(row.attributes.iter())
            .any(|v| v.type_code() == p.code && *v == p.value)
    }
}

/// Concurrency mode for [`Index::begin_transaction`] (spec §4.2, §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnMode {
    /// Many concurrent shared transactions are allowed.
    Shared,
    /// Waits for all other transactions (shared or exclusive) to finish.
    Exclusive,
}

/// A backend-agnostic transaction handle. Dropping without calling
/// [`Index::commit`] rolls back (manifest: in-memory state is discarded
/// and the file is left untouched; sqlite: the underlying `Transaction`
/// rolls back on drop).
pub enum Txn<'a> {
    Manifest(manifest::ManifestTxn<'a>),
    Sqlite(sqlite::SqliteTxn<'a>),
}

/// The index backend a dataset is configured to use (spec §6 `index_type`).
pub enum Index {
    Manifest(ManifestIndex),
    Sqlite(SqliteIndex),
}

impl Index {
    pub fn open(root: &Path, kind: IndexType) -> Result<Self> {
        match kind {
            IndexType::Plain => Ok(Index::Manifest(ManifestIndex::open(root)?)),
            IndexType::Sqlite => Ok(Index::Sqlite(SqliteIndex::open(root)?)),
        }
    }

    pub fn begin_transaction(&self, mode: TxnMode) -> Result<Txn<'_>> {
        match self {
            Index::Manifest(m) => Ok(Txn::Manifest(m.begin_transaction(mode)?)),
            Index::Sqlite(s) => Ok(Txn::Sqlite(s.begin_transaction(mode)?)),
        }
    }

    pub fn commit(&self, txn: Txn<'_>) -> Result<()> {
        match (self, txn) {
            (Index::Manifest(m), Txn::Manifest(t)) => m.commit(t),
            (Index::Sqlite(s), Txn::Sqlite(t)) => s.commit(t),
            _ => Err(crate::error::ArkError::consistency(
                "transaction/backend mismatch",
            )),
        }
    }

    pub fn insert(&self, txn: &mut Txn<'_>, row: NewRow) -> Result<i64> {
        match (self, txn) {
            (Index::Manifest(m), Txn::Manifest(t)) => m.insert(t, row),
            (Index::Sqlite(s), Txn::Sqlite(t)) => s.insert(t, row),
            _ => Err(crate::error::ArkError::consistency(
                "transaction/backend mismatch",
            )),
        }
    }

    pub fn replace(&self, txn: &mut Txn<'_>, row: NewRow) -> Result<i64> {
        match (self, txn) {
            (Index::Manifest(m), Txn::Manifest(t)) => m.replace(t, row),
            (Index::Sqlite(s), Txn::Sqlite(t)) => s.replace(t, row),
            _ => Err(crate::error::ArkError::consistency(
                "transaction/backend mismatch",
            )),
        }
    }

    pub fn remove(&self, txn: &mut Txn<'_>, id: i64) -> Result<String> {
        match (self, txn) {
            (Index::Manifest(m), Txn::Manifest(t)) => m.remove(t, id),
            (Index::Sqlite(s), Txn::Sqlite(t)) => s.remove(t, id),
            _ => Err(crate::error::ArkError::consistency(
                "transaction/backend mismatch",
            )),
        }
    }

    pub fn query(&self, filter: &Filter) -> Result<Vec<Row>> {
        match self {
            Index::Manifest(m) => m.query(filter),
            Index::Sqlite(s) => s.query(filter),
        }
    }

    pub fn query_summary(&self, filter: &Filter) -> Result<Summary> {
        let rows = self.query(filter)?;
        let mut summary = Summary::empty();
        for row in rows {
            let key: Vec<Value> = row.attributes.iter().cloned().collect();
            summary.add(key, row.size, row.reftime);
        }
        Ok(summary)
    }

    pub fn scan_files(&self) -> Result<Vec<(String, Vec<Row>)>> {
        match self {
            Index::Manifest(m) => m.scan_files(),
            Index::Sqlite(s) => s.scan_files(),
        }
    }

    pub fn scan_file(&self, relpath: &str) -> Result<Vec<Row>> {
        match self {
            Index::Manifest(m) => m.scan_file(relpath),
            Index::Sqlite(s) => s.scan_file(relpath),
        }
    }

    pub fn get_current(&self, fingerprint: &Fingerprint) -> Result<Option<Row>> {
        match self {
            Index::Manifest(m) => m.get_current(fingerprint),
            Index::Sqlite(s) => s.get_current(fingerprint),
        }
    }

    pub fn vacuum(&self) -> Result<u64> {
        match self {
            Index::Manifest(m) => m.vacuum(),
            Index::Sqlite(s) => s.vacuum(),
        }
    }
}
