//! Writer: the acquire protocol (spec §4.3).
//!
//! Orchestrates a segment append and an index insert/replace as one
//! pairing: the index transaction commits first, then the segment's
//! pending-commit token; a failure at either step rolls the other back
//! (spec §4.1 "Atomicity"). Segment handles are pooled by relative path
//! for the lifetime of the writer and released by [`Writer::flush`].

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::config::{DatasetConfig, ReplacePolicy, SegmentLayout};
use crate::envelope::{encode_value_list, write_envelope, METADATA_SIGNATURE};
use crate::error::{ArkError, Result};
use crate::index::{Filter, Index, NewRow, TxnMode};
use crate::lock::ProcessLock;
use crate::metadata::{Format, Message, Metadata};
use crate::segment::{DirSegment, FileSegment, Segment};
use crate::value::{TypeCode, Value};

/// Outcome of a successful [`Writer::acquire`] (spec §4.3 step 7: "Attach
/// an `assigneddataset` metadata item").
#[derive(Debug, Clone, PartialEq)]
pub struct AcquireResult {
    pub id: i64,
    pub segment_relpath: String,
    pub offset: u64,
    pub size: u64,
}

fn target_relpath(config: &DatasetConfig, reftime: crate::reftime::Reftime, format: Format) -> String {
    format!("{}.{}", config.segment_bucket(reftime.min()), format.extension())
}

fn open_segment(root: &std::path::Path, relpath: &str, layout: SegmentLayout) -> Result<Box<dyn Segment>> {
    let path = root.join(relpath);
    Ok(match layout {
        SegmentLayout::File => Box::new(FileSegment::open(path)?),
        SegmentLayout::Dir => Box::new(DirSegment::open(path)?),
    })
}

/// Selects the `index`-configured attribute subset of a message's metadata,
/// plus (unconditionally) its USN if present — needed by the `USN` replace
/// policy to compare against a previously-stored row without re-reading the
/// old message's bytes.
pub(crate) fn extract_attributes(config: &DatasetConfig, metadata: &Metadata) -> Metadata {
    let mut out = Metadata::new();
    for code in &config.index {
        if let Some(v) = metadata.get(*code) {
            out.set(v.clone());
        }
    }
    if out.get(TypeCode::Quantity).is_none() {
        if let Some(usn) = metadata.get(TypeCode::Quantity) {
            out.set(usn.clone());
        }
    }
    out
}

pub(crate) fn extract_notes(metadata: &Metadata) -> Vec<String> {
    metadata
        .get_all(TypeCode::Note)
        .filter_map(|v| match v {
            Value::Note { text } => Some(text.clone()),
            _ => None,
        })
        .collect()
}

fn append_metadata_sidecar(root: &std::path::Path, relpath: &str, metadata: &Metadata) -> Result<()> {
    let path = root.join(format!("{}.metadata", relpath));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let items: Vec<Value> = metadata.iter().cloned().collect();
    write_envelope(&mut file, METADATA_SIGNATURE, &encode_value_list(&items))
}

/// Orchestrates acquire/remove/flush for one dataset (spec §4.3).
pub struct Writer {
    root: PathBuf,
    config: DatasetConfig,
    index: Index,
    handles: Mutex<HashMap<String, Box<dyn Segment>>>,
    _lock: ProcessLock,
}

impl Writer {
    pub fn open(root: PathBuf, config: DatasetConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&root)?;
        let lock = ProcessLock::exclusive(&root)?;
        let index = Index::open(&root, config.index_type)?;
        Ok(Self {
            root,
            config,
            index,
            handles: Mutex::new(HashMap::new()),
            _lock: lock,
        })
    }

    /// Runs the acquire protocol (spec §4.3 steps 1-7). On success, attaches
    /// an `assigneddataset(name, id)` item to `message`'s metadata.
    pub fn acquire(&self, message: &mut Message) -> Result<AcquireResult> {
        let reftime = message
            .metadata
            .reftime()
            .ok_or_else(|| ArkError::consistency("message carries no reftime"))?;
        let relpath = target_relpath(&self.config, reftime, message.format);
        let fingerprint = message.metadata.fingerprint(&self.config.unique);
        let attributes = extract_attributes(&self.config, &message.metadata);
        let notes = extract_notes(&message.metadata);

        let new_row = NewRow {
            fingerprint: fingerprint.clone(),
            segment_relpath: relpath.clone(),
            offset: 0,
            size: message.data.len() as u64,
            reftime,
            notes,
            attributes,
        };

        let mut handles = self.handles.lock();
        if !handles.contains_key(&relpath) {
            let segment = open_segment(&self.root, &relpath, self.config.segments)?;
            handles.insert(relpath.clone(), segment);
        }
        let segment = handles.get_mut(&relpath).unwrap();

        let (offset, seg_pending) = segment.append(&message.data)?;
        let mut new_row = new_row;
        new_row.offset = offset;

        let mut txn = self.index.begin_transaction(TxnMode::Exclusive)?;
        let insert_result = self.apply_replace_policy(&mut txn, new_row);
        let id = match insert_result {
            Ok(id) => id,
            Err(e) => {
                drop(txn);
                return Err(e);
            }
        };
        self.index.commit(txn)?;
        seg_pending.commit()?;
        append_metadata_sidecar(&self.root, &relpath, &message.metadata)?;
        crate::summary::invalidate_live_cache(&self.root)?;

        message
            .metadata
            .set(Value::AssignedDataset {
                dataset: self.config.name.clone(),
                id,
            });

        Ok(AcquireResult {
            id,
            segment_relpath: relpath,
            offset,
            size: message.data.len() as u64,
        })
    }

    fn apply_replace_policy(
        &self,
        txn: &mut crate::index::Txn<'_>,
        row: NewRow,
    ) -> Result<i64> {
        match self.config.replace {
            ReplacePolicy::Never => self.index.insert(txn, row),
            ReplacePolicy::Always => self.index.replace(txn, row),
            ReplacePolicy::Usn => {
                let existing = self.index.get_current(&row.fingerprint)?;
                match existing {
                    None => self.index.insert(txn, row),
                    Some(old) => {
                        let old_usn = old.attributes.usn();
                        let new_usn = row.attributes.usn();
                        match (old_usn, new_usn) {
                            (Some(old_usn), Some(new_usn)) if new_usn > old_usn => {
                                self.index.replace(txn, row)
                            }
                            _ => Err(ArkError::Duplicate(
                                "USN not strictly greater than the existing row's".into(),
                            )),
                        }
                    }
                }
            }
        }
    }

    /// Deindexes the row pointed to by `id`; data bytes remain until a
    /// repack (spec §4.3 "remove").
    pub fn remove(&self, id: i64) -> Result<String> {
        let mut txn = self.index.begin_transaction(TxnMode::Exclusive)?;
        let relpath = self.index.remove(&mut txn, id)?;
        self.index.commit(txn)?;
        crate::summary::invalidate_live_cache(&self.root)?;
        Ok(relpath)
    }

    /// Closes all pooled segment handles (spec §4.3 "flush"). Before
    /// releasing each handle, (re)writes its `<segment>.summary` sidecar
    /// from the segment's current index rows, so a plain reopen of the
    /// dataset sees every live segment with both its `.metadata` and
    /// `.summary` sidecars present (spec §3 "Each segment may have sidecar
    /// files"; spec §8 P5 relies on their absence being detectable).
    pub fn flush(&self) -> Result<()> {
        let mut handles = self.handles.lock();
        for relpath in handles.keys().cloned().collect::<Vec<_>>() {
            self.write_summary_sidecar(&relpath)?;
        }
        handles.clear();
        Ok(())
    }

    fn write_summary_sidecar(&self, relpath: &str) -> Result<()> {
        let rows = self.index.scan_file(relpath)?;
        let mut summary = crate::summary::Summary::empty();
        for row in &rows {
            let key: Vec<Value> = row.attributes.iter().cloned().collect();
            summary.add(key, row.size, row.reftime);
        }
        summary.save(&self.root.join(format!("{}.summary", relpath)))
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reftime::{Reftime, Step};
    use crate::value::{Style, TypeCode};
    use chrono::{TimeZone, Utc};

    fn config(dir: &std::path::Path, replace: ReplacePolicy) -> DatasetConfig {
        DatasetConfig {
            kind: crate::config::DatasetType::Ondisk2,
            path: dir.to_path_buf(),
            name: "test".into(),
            step: Step::Daily,
            filter: None,
            unique: vec![TypeCode::Reftime, TypeCode::Origin],
            index: vec![TypeCode::Origin],
            segments: SegmentLayout::File,
            smallfiles: false,
            replace,
            archive_age: None,
            delete_age: None,
            index_type: crate::config::IndexType::Sqlite,
            postprocess: vec![],
        }
    }

    fn message(y: i32, m: u32, d: u32, centre: u16, bytes: &[u8]) -> Message {
        let mut md = Metadata::new();
        md.set(Value::Reftime(Reftime::Point(
            Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap(),
        )));
        md.set(Value::Origin {
            style: Style::Grib1,
            centre,
            subcentre: 0,
            process: 0,
        });
        Message::new(Format::Grib1, bytes.to_vec(), md)
    }

    #[test]
    fn acquire_creates_segment_and_index_row() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::open(dir.path().to_path_buf(), config(dir.path(), ReplacePolicy::Never)).unwrap();
        let mut msg = message(2007, 7, 8, 200, b"hello");
        let result = writer.acquire(&mut msg).unwrap();
        assert_eq!(result.segment_relpath, "2007/07-08.grib1");
        assert!(dir.path().join("2007/07-08.grib1").exists());
        assert!(msg.metadata.get(TypeCode::AssignedDataset).is_some());
    }

    #[test]
    fn duplicate_acquire_is_rejected_under_never_policy() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::open(dir.path().to_path_buf(), config(dir.path(), ReplacePolicy::Never)).unwrap();
        writer.acquire(&mut message(2007, 7, 8, 200, b"one")).unwrap();
        let err = writer.acquire(&mut message(2007, 7, 8, 200, b"two"));
        assert!(err.is_err());
    }

    #[test]
    fn always_policy_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::open(dir.path().to_path_buf(), config(dir.path(), ReplacePolicy::Always)).unwrap();
        writer.acquire(&mut message(2007, 7, 8, 200, b"one")).unwrap();
        let result = writer.acquire(&mut message(2007, 7, 8, 200, b"two")).unwrap();
        assert_eq!(
            writer.index().query(&Filter::match_all()).unwrap().len(),
            1
        );
        assert_eq!(result.size, 3);
    }

    #[test]
    fn usn_policy_requires_strictly_greater() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::open(dir.path().to_path_buf(), config(dir.path(), ReplacePolicy::Usn)).unwrap();

        let mut first = message(2007, 7, 8, 200, b"a");
        first.metadata.set(Value::Quantity {
            values: vec!["usn=5".into()],
        });
        writer.acquire(&mut first).unwrap();

        let mut lower = message(2007, 7, 8, 200, b"b");
        lower.metadata.set(Value::Quantity {
            values: vec!["usn=4".into()],
        });
        assert!(writer.acquire(&mut lower).is_err());

        let mut higher = message(2007, 7, 8, 200, b"c");
        higher.metadata.set(Value::Quantity {
            values: vec!["usn=6".into()],
        });
        assert!(writer.acquire(&mut higher).is_ok());
        assert_eq!(
            writer.index().query(&Filter::match_all()).unwrap().len(),
            1
        );
    }

    #[test]
    fn remove_deindexes_without_deleting_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::open(dir.path().to_path_buf(), config(dir.path(), ReplacePolicy::Never)).unwrap();
        let result = writer.acquire(&mut message(2007, 7, 8, 200, b"hello")).unwrap();
        writer.remove(result.id).unwrap();
        assert!(writer.index().query(&Filter::match_all()).unwrap().is_empty());
        assert!(dir.path().join("2007/07-08.grib1").exists());
    }

    #[test]
    fn acquire_and_remove_invalidate_the_live_summary_cache() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::open(dir.path().to_path_buf(), config(dir.path(), ReplacePolicy::Never)).unwrap();
        let cache_path = crate::summary::live_cache_path(dir.path());
        crate::summary::Summary::empty().save(&cache_path).unwrap();
        assert!(cache_path.exists());

        let result = writer.acquire(&mut message(2007, 7, 8, 200, b"hello")).unwrap();
        assert!(!cache_path.exists());

        crate::summary::Summary::empty().save(&cache_path).unwrap();
        writer.remove(result.id).unwrap();
        assert!(!cache_path.exists());
    }

    #[test]
    fn flush_drops_pooled_handles() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::open(dir.path().to_path_buf(), config(dir.path(), ReplacePolicy::Never)).unwrap();
        writer.acquire(&mut message(2007, 7, 8, 200, b"hello")).unwrap();
        writer.flush().unwrap();
        assert!(writer.handles.lock().is_empty());
    }
}
