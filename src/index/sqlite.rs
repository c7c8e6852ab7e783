//! Embedded relational index backend (spec §4.2, §6 `index_type = sqlite`).
//!
//! One `rows` table per dataset, backed by `rusqlite`'s bundled SQLite. A
//! [`SqliteTxn`] does not wrap `rusqlite::Transaction` directly — that type
//! borrows the `Connection` it was created from, which does not compose
//! with a connection kept behind a `Mutex` and reached through `&self`.
//! Instead the transaction holds the `MutexGuard` itself and drives
//! `BEGIN`/`COMMIT`/`ROLLBACK` as plain statements, rolling back on drop if
//! `commit` was never called.

use std::path::{Path, PathBuf};

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OptionalExtension};

use super::{Filter, NewRow, Row, TxnMode};
use crate::envelope::{decode_value_list, encode_value_list};
use crate::error::{ArkError, Result};
use crate::metadata::{Fingerprint, Metadata};
use crate::reftime::Reftime;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS rows (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    unique_key BLOB NOT NULL UNIQUE,
    fingerprint BLOB NOT NULL,
    segment_relpath TEXT NOT NULL,
    offset INTEGER NOT NULL,
    size INTEGER NOT NULL,
    reftime_min INTEGER NOT NULL,
    reftime_max INTEGER NOT NULL,
    notes TEXT NOT NULL,
    attributes BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS rows_segment ON rows(segment_relpath);
CREATE INDEX IF NOT EXISTS rows_reftime ON rows(reftime_min, reftime_max);
";

pub struct SqliteIndex {
    path: PathBuf,
    conn: Mutex<Connection>,
}

pub struct SqliteTxn<'a> {
    mode: TxnMode,
    conn: MutexGuard<'a, Connection>,
    active: bool,
}

impl Drop for SqliteTxn<'_> {
    fn drop(&mut self) {
        if self.active {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

impl SqliteIndex {
    pub fn open(root: &Path) -> Result<Self> {
        let path = root.join("index.sqlite");
        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn begin_transaction(&self, mode: TxnMode) -> Result<SqliteTxn<'_>> {
        let conn = self.conn.lock();
        let sql = match mode {
            TxnMode::Shared => "BEGIN DEFERRED",
            TxnMode::Exclusive => "BEGIN IMMEDIATE",
        };
        conn.execute_batch(sql)?;
        Ok(SqliteTxn {
            mode,
            conn,
            active: true,
        })
    }

    pub fn commit(&self, mut txn: SqliteTxn<'_>) -> Result<()> {
        txn.conn.execute_batch("COMMIT")?;
        txn.active = false;
        Ok(())
    }

    pub fn insert(&self, txn: &mut SqliteTxn<'_>, row: NewRow) -> Result<i64> {
        self.require_exclusive(txn)?;
        let key = row.fingerprint.canonical_key();
        let exists: Option<i64> = txn
            .conn
            .query_row("SELECT id FROM rows WHERE unique_key = ?1", [&key], |r| {
                r.get(0)
            })
            .optional()?;
        if exists.is_some() {
            return Err(ArkError::Duplicate(format!(
                "fingerprint already indexed in {}",
                row.segment_relpath
            )));
        }
        insert_row(&txn.conn, &key, &row)
    }

    pub fn replace(&self, txn: &mut SqliteTxn<'_>, row: NewRow) -> Result<i64> {
        self.require_exclusive(txn)?;
        let key = row.fingerprint.canonical_key();
        txn.conn
            .execute("DELETE FROM rows WHERE unique_key = ?1", [&key])?;
        insert_row(&txn.conn, &key, &row)
    }

    pub fn remove(&self, txn: &mut SqliteTxn<'_>, id: i64) -> Result<String> {
        self.require_exclusive(txn)?;
        let relpath: String = txn
            .conn
            .query_row(
                "SELECT segment_relpath FROM rows WHERE id = ?1",
                [id],
                |r| r.get(0),
            )
            .optional()?
            .ok_or_else(|| ArkError::consistency(format!("no index row with id {}", id)))?;
        txn.conn.execute("DELETE FROM rows WHERE id = ?1", [id])?;
        Ok(relpath)
    }

    pub fn query(&self, filter: &Filter) -> Result<Vec<Row>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM rows ORDER BY id")?;
        let rows = stmt
            .query_map([], row_from_sqlite)?
            .collect::<rusqlite::Result<Vec<Row>>>()?;
        Ok(rows.into_iter().filter(|r| filter.matches(r)).collect())
    }

    pub fn scan_files(&self) -> Result<Vec<(String, Vec<Row>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM rows ORDER BY segment_relpath, offset")?;
        let rows = stmt
            .query_map([], row_from_sqlite)?
            .collect::<rusqlite::Result<Vec<Row>>>()?;
        let mut grouped: Vec<(String, Vec<Row>)> = Vec::new();
        for row in rows {
            match grouped.last_mut() {
                Some((relpath, group)) if *relpath == row.segment_relpath => group.push(row),
                _ => grouped.push((row.segment_relpath.clone(), vec![row])),
            }
        }
        Ok(grouped)
    }

    pub fn scan_file(&self, relpath: &str) -> Result<Vec<Row>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM rows WHERE segment_relpath = ?1 ORDER BY offset")?;
        let rows = stmt
            .query_map([relpath], row_from_sqlite)?
            .collect::<rusqlite::Result<Vec<Row>>>()?;
        Ok(rows)
    }

    pub fn get_current(&self, fingerprint: &Fingerprint) -> Result<Option<Row>> {
        let conn = self.conn.lock();
        let key = fingerprint.canonical_key();
        conn.query_row("SELECT * FROM rows WHERE unique_key = ?1", [&key], row_from_sqlite)
            .optional()
            .map_err(Into::into)
    }

    pub fn vacuum(&self) -> Result<u64> {
        let before = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        {
            let conn = self.conn.lock();
            conn.execute_batch("VACUUM")?;
        }
        let after = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        Ok(before.saturating_sub(after))
    }

    fn require_exclusive(&self, txn: &SqliteTxn<'_>) -> Result<()> {
        if txn.mode != TxnMode::Exclusive {
            return Err(ArkError::consistency(
                "index mutation requires an exclusive transaction",
            ));
        }
        Ok(())
    }
}

fn insert_row(conn: &Connection, key: &[u8], row: &NewRow) -> Result<i64> {
    let fingerprint_bytes = encode_value_list(row.fingerprint.items());
    let attrs: Vec<crate::value::Value> = row.attributes.iter().cloned().collect();
    let attrs_bytes = encode_value_list(&attrs);
    let notes_json = serde_json::to_string(&row.notes)
        .map_err(|e| ArkError::consistency(format!("failed to encode notes: {}", e)))?;
    conn.execute(
        "INSERT INTO rows (unique_key, fingerprint, segment_relpath, offset, size, \
         reftime_min, reftime_max, notes, attributes) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        rusqlite::params![
            key,
            fingerprint_bytes,
            row.segment_relpath,
            row.offset as i64,
            row.size as i64,
            row.reftime.min().timestamp(),
            row.reftime.max().timestamp(),
            notes_json,
            attrs_bytes,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn row_from_sqlite(r: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    let id: i64 = r.get("id")?;
    let fingerprint_bytes: Vec<u8> = r.get("fingerprint")?;
    let segment_relpath: String = r.get("segment_relpath")?;
    let offset: i64 = r.get("offset")?;
    let size: i64 = r.get("size")?;
    let reftime_min: i64 = r.get("reftime_min")?;
    let reftime_max: i64 = r.get("reftime_max")?;
    let notes_json: String = r.get("notes")?;
    let attrs_bytes: Vec<u8> = r.get("attributes")?;

    let to_sql_err = |e: crate::error::ArkError| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Blob, Box::new(e))
    };
    let fingerprint_items = decode_value_list(&fingerprint_bytes).map_err(to_sql_err)?;
    let attrs = decode_value_list(&attrs_bytes).map_err(to_sql_err)?;
    let notes: Vec<String> = serde_json::from_str(&notes_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Row {
        id,
        fingerprint: Fingerprint::from_items(fingerprint_items),
        segment_relpath,
        offset: offset as u64,
        size: size as u64,
        reftime: Reftime::from_unix_range(reftime_min, reftime_max),
        notes,
        attributes: Metadata::from_items(attrs),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Style, TypeCode, Value};
    use chrono::{TimeZone, Utc};

    fn sample_row(centre: u16) -> NewRow {
        let mut md = Metadata::new();
        md.set(Value::Reftime(Reftime::Point(
            Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
        )));
        md.set(Value::Origin {
            style: Style::Grib1,
            centre,
            subcentre: 0,
            process: 0,
        });
        let fingerprint = md.fingerprint(&[TypeCode::Origin]);
        NewRow {
            fingerprint,
            segment_relpath: "2020/01-01.grib1".into(),
            offset: 0,
            size: 10,
            reftime: Reftime::Point(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()),
            notes: vec!["hello".into()],
            attributes: Metadata::new(),
        }
    }

    #[test]
    fn insert_then_query_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let idx = SqliteIndex::open(dir.path()).unwrap();
        let mut txn = idx.begin_transaction(TxnMode::Exclusive).unwrap();
        idx.insert(&mut txn, sample_row(200)).unwrap();
        idx.commit(txn).unwrap();

        let rows = idx.query(&Filter::match_all()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].notes, vec!["hello".to_string()]);
    }

    #[test]
    fn duplicate_fingerprint_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let idx = SqliteIndex::open(dir.path()).unwrap();
        let mut txn = idx.begin_transaction(TxnMode::Exclusive).unwrap();
        idx.insert(&mut txn, sample_row(200)).unwrap();
        idx.commit(txn).unwrap();

        let mut txn = idx.begin_transaction(TxnMode::Exclusive).unwrap();
        assert!(idx.insert(&mut txn, sample_row(200)).is_err());
    }

    #[test]
    fn shared_transaction_rejects_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let idx = SqliteIndex::open(dir.path()).unwrap();
        let mut txn = idx.begin_transaction(TxnMode::Shared).unwrap();
        assert!(idx.insert(&mut txn, sample_row(200)).is_err());
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let idx = SqliteIndex::open(dir.path()).unwrap();
        {
            let mut txn = idx.begin_transaction(TxnMode::Exclusive).unwrap();
            idx.insert(&mut txn, sample_row(200)).unwrap();
        }
        assert!(idx.query(&Filter::match_all()).unwrap().is_empty());
    }

    #[test]
    fn remove_then_vacuum_shrinks_or_matches() {
        let dir = tempfile::tempdir().unwrap();
        let idx = SqliteIndex::open(dir.path()).unwrap();
        let mut txn = idx.begin_transaction(TxnMode::Exclusive).unwrap();
        let id = idx.insert(&mut txn, sample_row(200)).unwrap();
        idx.commit(txn).unwrap();

        let mut txn = idx.begin_transaction(TxnMode::Exclusive).unwrap();
        idx.remove(&mut txn, id).unwrap();
        idx.commit(txn).unwrap();

        assert!(idx.query(&Filter::match_all()).unwrap().is_empty());
        idx.vacuum().unwrap();
    }

    #[test]
    fn replace_reassigns_a_new_id() {
        let dir = tempfile::tempdir().unwrap();
        let idx = SqliteIndex::open(dir.path()).unwrap();
        let mut txn = idx.begin_transaction(TxnMode::Exclusive).unwrap();
        let first = idx.insert(&mut txn, sample_row(200)).unwrap();
        idx.commit(txn).unwrap();

        let mut txn = idx.begin_transaction(TxnMode::Exclusive).unwrap();
        let second = idx.replace(&mut txn, sample_row(200)).unwrap();
        idx.commit(txn).unwrap();

        assert_ne!(first, second);
        assert_eq!(idx.query(&Filter::match_all()).unwrap().len(), 1);
    }
}
