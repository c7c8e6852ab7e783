//! Cross-module invariants that must hold regardless of which concrete
//! path produced the current on-disk/index state.

use arkdata::config::{DatasetConfig, DatasetType, IndexType, ReplacePolicy, SegmentLayout};
use arkdata::index::{Filter, Index};
use arkdata::maintenance::check::{CheckAgent, Mode as CheckMode};
use arkdata::maintenance::repack::{Mode as RepackMode, RepackAgent};
use arkdata::maintenance::{self, SegmentState};
use arkdata::reftime::{Reftime, Step};
use arkdata::scanner::{encode_fixture_message, ScannerRegistry};
use arkdata::value::{Style, TypeCode, Value};
use arkdata::{Format, Message, Metadata, Reader, Writer};
use chrono::{DateTime, TimeZone, Utc};

fn test_config(dir: &std::path::Path) -> DatasetConfig {
    DatasetConfig {
        kind: DatasetType::Ondisk2,
        path: dir.to_path_buf(),
        name: "test".into(),
        step: Step::Daily,
        filter: None,
        unique: vec![TypeCode::Reftime, TypeCode::Origin],
        index: vec![TypeCode::Origin],
        segments: SegmentLayout::File,
        smallfiles: false,
        replace: ReplacePolicy::Never,
        archive_age: None,
        delete_age: None,
        index_type: IndexType::Sqlite,
        postprocess: Vec::new(),
    }
}

fn origin(centre: u16) -> Value {
    Value::Origin {
        style: Style::Grib1,
        centre,
        subcentre: 0,
        process: 0,
    }
}

fn raw_message(at: DateTime<Utc>, centre: u16, payload: &[u8]) -> Message {
    let mut md = Metadata::new();
    md.set(Value::Reftime(Reftime::Point(at)));
    md.set(origin(centre));
    Message::new(Format::Grib1, payload.to_vec(), md)
}

fn fixture_message(at: DateTime<Utc>, centre: u16) -> Message {
    let mut md = Metadata::new();
    md.set(Value::Reftime(Reftime::Point(at)));
    md.set(origin(centre));
    let data = encode_fixture_message(&md);
    Message::new(Format::Grib1, data, md)
}

fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

fn all_bytes(reader: &Reader) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    reader
        .query_data(&Filter::match_all(), |resolved| {
            out.push(resolved.data);
            Ok(arkdata::reader::Flow::Continue)
        })
        .unwrap();
    out.sort();
    out
}

/// P1: a duplicate acquire under a non-`Always` replace policy fails, and
/// the index gains no new row.
#[test]
fn p1_duplicate_acquire_is_rejected_and_index_is_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let writer = Writer::open(dir.path().to_path_buf(), config.clone()).unwrap();

    writer.acquire(&mut raw_message(day(2007, 7, 8), 1, b"one")).unwrap();
    let before = writer.index().query(&Filter::match_all()).unwrap().len();

    let err = writer.acquire(&mut raw_message(day(2007, 7, 8), 1, b"two"));
    assert!(err.is_err());

    let after = writer.index().query(&Filter::match_all()).unwrap().len();
    assert_eq!(before, after);
}

/// P2: acquiring a message and then querying it back by its fingerprint
/// returns exactly one byte-identical result.
#[test]
fn p2_acquire_then_query_by_fingerprint_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let writer = Writer::open(dir.path().to_path_buf(), config.clone()).unwrap();
    writer.acquire(&mut raw_message(day(2007, 7, 8), 1, b"hello")).unwrap();
    writer.flush().unwrap();

    let reader = Reader::open(dir.path().to_path_buf(), config).unwrap();
    let filter = Filter::match_all()
        .with_reftime_range(Some(day(2007, 7, 8)), Some(day(2007, 7, 8)))
        .with_predicate(TypeCode::Origin, origin(1));

    let mut matched = Vec::new();
    reader
        .query_data(&filter, |resolved| {
            matched.push(resolved.data);
            Ok(arkdata::reader::Flow::Continue)
        })
        .unwrap();
    assert_eq!(matched, vec![b"hello".to_vec()]);
}

/// P3: after a repack, a match-all query returns the same multiset of
/// message bytes as before, just without the gap.
#[test]
fn p3_repack_preserves_the_live_multiset() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let writer = Writer::open(dir.path().to_path_buf(), config.clone()).unwrap();

    let r1 = writer.acquire(&mut raw_message(day(2007, 1, 1), 1, b"a")).unwrap();
    writer.acquire(&mut raw_message(day(2007, 1, 1), 2, b"b")).unwrap();
    writer.acquire(&mut raw_message(day(2007, 1, 1), 3, b"c")).unwrap();
    writer.remove(r1.id).unwrap();
    writer.flush().unwrap();

    let reader = Reader::open(dir.path().to_path_buf(), config.clone()).unwrap();
    let before = all_bytes(&reader);

    let index = Index::open(dir.path(), config.index_type).unwrap();
    let classifications = maintenance::classify(dir.path(), &config, &index, None).unwrap();
    let mut agent = RepackAgent::new(dir.path(), &config, &index, RepackMode::Real);
    agent.run(&classifications).unwrap();

    let after = all_bytes(&reader);
    assert_eq!(before, after);
    assert_eq!(after, vec![b"b".to_vec(), b"c".to_vec()]);
}

/// P4: once a maintenance round reports clean, running it again
/// immediately (with no intervening writes) reports no further actions.
#[test]
fn p4_clean_maintenance_stays_clean_on_a_second_pass() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let writer = Writer::open(dir.path().to_path_buf(), config.clone()).unwrap();
    writer.acquire(&mut raw_message(day(2007, 7, 8), 1, b"hello")).unwrap();
    writer.flush().unwrap();

    let index = Index::open(dir.path(), config.index_type).unwrap();
    let scanners = ScannerRegistry::new();

    let classifications = maintenance::classify(dir.path(), &config, &index, None).unwrap();
    let mut repack_agent = RepackAgent::new(dir.path(), &config, &index, RepackMode::Real);
    let report = repack_agent.run(&classifications).unwrap();
    let check_agent = CheckAgent::new(dir.path(), &config, &index, &scanners, CheckMode::Real);
    let check_report = check_agent.run(&classifications).unwrap();
    assert!(report.is_clean());
    assert!(check_report.is_clean());

    let classifications = maintenance::classify(dir.path(), &config, &index, None).unwrap();
    let mut repack_agent = RepackAgent::new(dir.path(), &config, &index, RepackMode::Real);
    let report = repack_agent.run(&classifications).unwrap();
    let check_agent = CheckAgent::new(dir.path(), &config, &index, &scanners, CheckMode::Real);
    let check_report = check_agent.run(&classifications).unwrap();
    assert!(report.is_clean());
    assert!(check_report.is_clean());
}

/// P5: removing a segment's sidecars is classified needs-rescan; after a
/// fix check it is OK again and the query multiset is unchanged.
#[test]
fn p5_missing_sidecars_round_trip_through_needs_rescan() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let writer = Writer::open(dir.path().to_path_buf(), config.clone()).unwrap();
    let result = writer.acquire(&mut fixture_message(day(2007, 1, 1), 1)).unwrap();
    writer.flush().unwrap();

    let reader = Reader::open(dir.path().to_path_buf(), config.clone()).unwrap();
    let before = all_bytes(&reader);

    std::fs::remove_file(dir.path().join(format!("{}.metadata", result.segment_relpath))).unwrap();
    std::fs::remove_file(dir.path().join(format!("{}.summary", result.segment_relpath))).unwrap();

    let index = Index::open(dir.path(), config.index_type).unwrap();
    let classifications = maintenance::classify(dir.path(), &config, &index, None).unwrap();
    let c = classifications.iter().find(|c| c.relpath == result.segment_relpath).unwrap();
    assert_eq!(c.state(), SegmentState::NeedsRescan);

    let scanners = ScannerRegistry::new();
    let check_agent = CheckAgent::new(dir.path(), &config, &index, &scanners, CheckMode::Real);
    check_agent.run(&classifications).unwrap();

    let classifications = maintenance::classify(dir.path(), &config, &index, None).unwrap();
    let c = classifications.iter().find(|c| c.relpath == result.segment_relpath).unwrap();
    assert_eq!(c.state(), SegmentState::Ok);

    let after = all_bytes(&reader);
    assert_eq!(before, after);
}

/// P6: deleting a segment's on-disk file while its index rows remain is
/// classified needs-deindex; fixing it removes the orphan rows without
/// disturbing other segments.
#[test]
fn p6_missing_segment_file_round_trips_through_needs_deindex() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let writer = Writer::open(dir.path().to_path_buf(), config.clone()).unwrap();
    let orphaned = writer.acquire(&mut raw_message(day(2007, 1, 1), 1, b"gone")).unwrap();
    writer.acquire(&mut raw_message(day(2007, 1, 2), 2, b"stays")).unwrap();
    writer.flush().unwrap();

    arkdata::segment::remove_segment(
        dir.path(),
        std::path::Path::new(&orphaned.segment_relpath),
        Format::Grib1,
    )
    .unwrap();

    let index = Index::open(dir.path(), config.index_type).unwrap();
    let classifications = maintenance::classify(dir.path(), &config, &index, None).unwrap();
    let c = classifications
        .iter()
        .find(|c| c.relpath == orphaned.segment_relpath)
        .unwrap();
    assert_eq!(c.state(), SegmentState::NeedsDeindex);

    let mut agent = RepackAgent::new(dir.path(), &config, &index, RepackMode::Real);
    agent.run(&classifications).unwrap();

    assert!(index.scan_file(&orphaned.segment_relpath).unwrap().is_empty());

    let reader = Reader::open(dir.path().to_path_buf(), config).unwrap();
    assert_eq!(all_bytes(&reader), vec![b"stays".to_vec()]);
}

/// P7: a compressed segment (`.gz` + `.gz.idx`) supports the same query
/// contract as an uncompressed one.
#[test]
fn p7_compressed_segment_supports_the_same_query_contract() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let writer = Writer::open(dir.path().to_path_buf(), config.clone()).unwrap();
    writer.acquire(&mut raw_message(day(2007, 1, 1), 1, b"payload-a")).unwrap();
    writer
        .acquire(&mut raw_message(day(2007, 1, 1), 2, b"payload-b"))
        .unwrap();
    writer.flush().unwrap();

    let relpath = "2007/01-01.grib1";
    {
        let mut segment = arkdata::segment::open(dir.path(), relpath, config.segments).unwrap();
        segment.compress().unwrap();
    }
    assert!(dir.path().join(format!("{}.gz", relpath)).exists());
    assert!(dir.path().join(format!("{}.gz.idx", relpath)).exists());
    assert!(!dir.path().join(relpath).exists());

    let reader = Reader::open(dir.path().to_path_buf(), config).unwrap();
    assert_eq!(all_bytes(&reader), vec![b"payload-a".to_vec(), b"payload-b".to_vec()]);

    let summary = reader.query_summary(&Filter::match_all()).unwrap();
    assert_eq!(summary.total_count(), 2);
}

/// P8: the USN replace policy accepts only a strictly greater update;
/// equal, lower, or USN-absent attempts are rejected.
#[test]
fn p8_usn_policy_requires_strictly_greater_on_both_sides() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.replace = arkdata::config::ReplacePolicy::Usn;
    let writer = Writer::open(dir.path().to_path_buf(), config.clone()).unwrap();

    let at = day(2007, 1, 1);
    let mut first = raw_message(at, 1, b"v5");
    first.metadata.set(Value::Quantity { values: vec!["usn=5".into()] });
    writer.acquire(&mut first).unwrap();

    let mut equal = raw_message(at, 1, b"v5-again");
    equal.metadata.set(Value::Quantity { values: vec!["usn=5".into()] });
    assert!(writer.acquire(&mut equal).is_err());

    let mut lower = raw_message(at, 1, b"v4");
    lower.metadata.set(Value::Quantity { values: vec!["usn=4".into()] });
    assert!(writer.acquire(&mut lower).is_err());

    let mut no_usn = raw_message(at, 1, b"no-usn");
    assert!(writer.acquire(&mut no_usn).is_err());

    let mut higher = raw_message(at, 1, b"v9");
    higher.metadata.set(Value::Quantity { values: vec!["usn=9".into()] });
    writer.acquire(&mut higher).unwrap();
    writer.flush().unwrap();

    assert_eq!(
        writer.index().query(&Filter::match_all()).unwrap().len(),
        1
    );
    let reader = Reader::open(dir.path().to_path_buf(), config).unwrap();
    assert_eq!(all_bytes(&reader), vec![b"v9".to_vec()]);
}

/// P9: a reader opened while a writer holds its exclusive process lock
/// still returns the data committed so far without error — [`Reader`]
/// never takes the `<root>/lock` advisory lock itself, so it never
/// contends with the writer holding it.
#[test]
fn p9_concurrent_reader_sees_committed_data_without_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let writer = Writer::open(dir.path().to_path_buf(), config.clone()).unwrap();
    writer.acquire(&mut raw_message(day(2007, 1, 1), 1, b"hello")).unwrap();
    writer.flush().unwrap();

    // `writer` is still alive and holding its process lock here.
    let reader = Reader::open(dir.path().to_path_buf(), config).unwrap();
    assert_eq!(all_bytes(&reader), vec![b"hello".to_vec()]);
    drop(writer);
}
