//! Append-only manifest-file index backend (spec §4.2, §6 `index_type =
//! plain`).
//!
//! Every mutation is appended as one [`envelope`](crate::envelope) record
//! to `<root>/index.manifest`; removal appends a tombstone rather than
//! rewriting history. The whole file is replayed into memory on open, and
//! [`ManifestIndex::vacuum`] is the only operation that physically
//! compacts it (spec §4.2 "vacuum").

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{Filter, NewRow, Row, TxnMode};
use crate::envelope::{
    read_bytes, read_envelope, read_str, read_varint, write_bytes, write_envelope, write_str,
    write_varint, METADATA_SIGNATURE,
};
use crate::error::{ArkError, Result};
use crate::metadata::{Fingerprint, Metadata};
use crate::reftime::Reftime;
use crate::value::Value;

const OP_INSERT: u8 = 1;
const OP_TOMBSTONE: u8 = 2;

struct ManifestState {
    rows: BTreeMap<i64, Row>,
    next_id: i64,
}

pub struct ManifestIndex {
    path: PathBuf,
    state: RwLock<ManifestState>,
}

enum Guard<'a> {
    Read(RwLockReadGuard<'a, ManifestState>),
    Write(RwLockWriteGuard<'a, ManifestState>),
}

enum Op {
    Insert(i64, NewRow),
    Tombstone(i64),
}

pub struct ManifestTxn<'a> {
    mode: TxnMode,
    guard: Guard<'a>,
    ops: Vec<Op>,
}

impl ManifestIndex {
    pub fn open(root: &Path) -> Result<Self> {
        let path = root.join("index.manifest");
        let (rows, next_id) = if path.exists() {
            replay(&path)?
        } else {
            (BTreeMap::new(), 0)
        };
        Ok(Self {
            path,
            state: RwLock::new(ManifestState { rows, next_id }),
        })
    }

    pub fn begin_transaction(&self, mode: TxnMode) -> Result<ManifestTxn<'_>> {
        let guard = match mode {
            TxnMode::Shared => Guard::Read(self.state.read()),
            TxnMode::Exclusive => Guard::Write(self.state.write()),
        };
        Ok(ManifestTxn {
            mode,
            guard,
            ops: Vec::new(),
        })
    }

    pub fn commit(&self, txn: ManifestTxn<'_>) -> Result<()> {
        if txn.ops.is_empty() {
            return Ok(());
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut state = match txn.guard {
            Guard::Write(w) => w,
            Guard::Read(_) => {
                return Err(ArkError::consistency(
                    "cannot commit mutations through a shared transaction",
                ))
            }
        };
        for op in &txn.ops {
            let payload = encode_op(op);
            write_envelope(&mut file, METADATA_SIGNATURE, &payload)?;
        }
        file.sync_all()?;
        for op in txn.ops {
            apply_op(&mut state, op);
        }
        Ok(())
    }

    pub fn insert(&self, txn: &mut ManifestTxn<'_>, row: NewRow) -> Result<i64> {
        self.require_exclusive(txn)?;
        if self.find_by_key(txn, &row.fingerprint).is_some() {
            return Err(ArkError::Duplicate(format!(
                "fingerprint already indexed in {}",
                row.segment_relpath
            )));
        }
        let id = self.peek_next_id(txn);
        txn.ops.push(Op::Insert(id, row));
        Ok(id)
    }

    pub fn replace(&self, txn: &mut ManifestTxn<'_>, row: NewRow) -> Result<i64> {
        self.require_exclusive(txn)?;
        let existing = self.find_by_key(txn, &row.fingerprint);
        let id = match existing {
            Some(old) => {
                txn.ops.push(Op::Tombstone(old));
                self.peek_next_id(txn)
            }
            None => self.peek_next_id(txn),
        };
        txn.ops.push(Op::Insert(id, row));
        Ok(id)
    }

    pub fn remove(&self, txn: &mut ManifestTxn<'_>, id: i64) -> Result<String> {
        self.require_exclusive(txn)?;
        let relpath = match &txn.guard {
            Guard::Write(w) => w
                .rows
                .get(&id)
                .map(|r| r.segment_relpath.clone())
                .ok_or_else(|| ArkError::consistency(format!("no index row with id {}", id)))?,
            Guard::Read(_) => unreachable!(),
        };
        txn.ops.push(Op::Tombstone(id));
        Ok(relpath)
    }

    pub fn query(&self, filter: &Filter) -> Result<Vec<Row>> {
        let state = self.state.read();
        Ok(state
            .rows
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    pub fn scan_files(&self) -> Result<Vec<(String, Vec<Row>)>> {
        let state = self.state.read();
        let mut grouped: BTreeMap<String, Vec<Row>> = BTreeMap::new();
        for row in state.rows.values() {
            grouped
                .entry(row.segment_relpath.clone())
                .or_default()
                .push(row.clone());
        }
        Ok(grouped.into_iter().collect())
    }

    pub fn scan_file(&self, relpath: &str) -> Result<Vec<Row>> {
        let state = self.state.read();
        let mut rows: Vec<Row> = state
            .rows
            .values()
            .filter(|r| r.segment_relpath == relpath)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.offset);
        Ok(rows)
    }

    pub fn get_current(&self, fingerprint: &Fingerprint) -> Result<Option<Row>> {
        let state = self.state.read();
        Ok(state
            .rows
            .values()
            .find(|r| r.fingerprint.canonical_key() == fingerprint.canonical_key())
            .cloned())
    }

    pub fn vacuum(&self) -> Result<u64> {
        let before = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        let state = self.state.write();
        let tmp_path = {
            let mut s = self.path.as_os_str().to_os_string();
            s.push(".vacuum.tmp");
            PathBuf::from(s)
        };
        {
            let mut tmp = File::create(&tmp_path)?;
            for (id, row) in &state.rows {
                let payload = encode_op(&Op::Insert(*id, row_to_new(row)));
                write_envelope(&mut tmp, METADATA_SIGNATURE, &payload)?;
            }
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        let after = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        Ok(before.saturating_sub(after))
    }

    fn require_exclusive(&self, txn: &ManifestTxn<'_>) -> Result<()> {
        if txn.mode != TxnMode::Exclusive {
            return Err(ArkError::consistency(
                "index mutation requires an exclusive transaction",
            ));
        }
        Ok(())
    }

    fn peek_next_id(&self, txn: &ManifestTxn<'_>) -> i64 {
        let base = match &txn.guard {
            Guard::Write(w) => w.next_id,
            Guard::Read(r) => r.next_id,
        };
        base + txn
            .ops
            .iter()
            .filter(|op| matches!(op, Op::Insert(..)))
            .count() as i64
    }

    fn find_by_key(&self, txn: &ManifestTxn<'_>, fingerprint: &Fingerprint) -> Option<i64> {
        let key = fingerprint.canonical_key();
        let rows = match &txn.guard {
            Guard::Write(w) => &w.rows,
            Guard::Read(r) => &r.rows,
        };
        rows.values()
            .find(|r| r.fingerprint.canonical_key() == key)
            .map(|r| r.id)
    }
}

fn row_to_new(row: &Row) -> NewRow {
    NewRow {
        fingerprint: row.fingerprint.clone(),
        segment_relpath: row.segment_relpath.clone(),
        offset: row.offset,
        size: row.size,
        reftime: row.reftime,
        notes: row.notes.clone(),
        attributes: row.attributes.clone(),
    }
}

fn apply_op(state: &mut ManifestState, op: Op) {
    match op {
        Op::Insert(id, new_row) => {
            state.rows.insert(
                id,
                Row {
                    id,
                    fingerprint: new_row.fingerprint,
                    segment_relpath: new_row.segment_relpath,
                    offset: new_row.offset,
                    size: new_row.size,
                    reftime: new_row.reftime,
                    notes: new_row.notes,
                    attributes: new_row.attributes,
                },
            );
            if id >= state.next_id {
                state.next_id = id + 1;
            }
        }
        Op::Tombstone(id) => {
            state.rows.remove(&id);
        }
    }
}

fn encode_op(op: &Op) -> Vec<u8> {
    let mut buf = Vec::new();
    match op {
        Op::Insert(id, row) => {
            buf.push(OP_INSERT);
            write_varint(&mut buf, *id as u64);
            write_varint(&mut buf, row.fingerprint.items().len() as u64);
            for item in row.fingerprint.items() {
                write_bytes(&mut buf, &item.to_canonical_bytes());
            }
            write_str(&mut buf, &row.segment_relpath);
            write_varint(&mut buf, row.offset);
            write_varint(&mut buf, row.size);
            write_varint(&mut buf, row.reftime.min().timestamp() as u64);
            write_varint(&mut buf, row.reftime.max().timestamp() as u64);
            write_varint(&mut buf, row.notes.len() as u64);
            for note in &row.notes {
                write_str(&mut buf, note);
            }
            let attrs: Vec<&Value> = row.attributes.iter().collect();
            write_varint(&mut buf, attrs.len() as u64);
            for v in attrs {
                write_bytes(&mut buf, &v.to_canonical_bytes());
            }
        }
        Op::Tombstone(id) => {
            buf.push(OP_TOMBSTONE);
            write_varint(&mut buf, *id as u64);
        }
    }
    buf
}

fn decode_op(buf: &[u8]) -> Result<Op> {
    let mut pos = 0usize;
    let tag = *buf
        .get(pos)
        .ok_or_else(|| ArkError::consistency("empty manifest record"))?;
    pos += 1;
    let id = read_varint(buf, &mut pos)? as i64;
    if tag == OP_TOMBSTONE {
        return Ok(Op::Tombstone(id));
    }
    if tag != OP_INSERT {
        return Err(ArkError::consistency(format!(
            "unknown manifest op tag {}",
            tag
        )));
    }
    let n_items = read_varint(buf, &mut pos)?;
    let mut items = Vec::with_capacity(n_items as usize);
    for _ in 0..n_items {
        let item_bytes = read_bytes(buf, &mut pos)?;
        items.push(crate::envelope::decode_value(item_bytes)?);
    }
    let fingerprint = Fingerprint::from_items(items);
    let segment_relpath = read_str(buf, &mut pos)?.to_string();
    let offset = read_varint(buf, &mut pos)?;
    let size = read_varint(buf, &mut pos)?;
    let reftime_min = read_varint(buf, &mut pos)? as i64;
    let reftime_max = read_varint(buf, &mut pos)? as i64;
    let n_notes = read_varint(buf, &mut pos)?;
    let mut notes = Vec::with_capacity(n_notes as usize);
    for _ in 0..n_notes {
        notes.push(read_str(buf, &mut pos)?.to_string());
    }
    let n_attrs = read_varint(buf, &mut pos)?;
    let mut attr_values = Vec::with_capacity(n_attrs as usize);
    for _ in 0..n_attrs {
        let bytes = read_bytes(buf, &mut pos)?;
        attr_values.push(crate::envelope::decode_value(bytes)?);
    }
    let reftime = Reftime::from_unix_range(reftime_min, reftime_max);
    Ok(Op::Insert(
        id,
        NewRow {
            fingerprint,
            segment_relpath,
            offset,
            size,
            reftime,
            notes,
            attributes: Metadata::from_items(attr_values),
        },
    ))
}

fn replay(path: &Path) -> Result<(BTreeMap<i64, Row>, i64)> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut state = ManifestState {
        rows: BTreeMap::new(),
        next_id: 0,
    };
    while let Some(payload) = read_envelope(&mut reader, METADATA_SIGNATURE)? {
        let op = decode_op(&payload)?;
        apply_op(&mut state, op);
    }
    Ok((state.rows, state.next_id))
}
