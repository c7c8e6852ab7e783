//! End-to-end scenarios spanning writer, reader, maintenance, and archive
//! in the same tree, the way a single dataset actually gets exercised over
//! its lifetime. Colocated `#[cfg(test)]` modules cover each collaborator
//! in isolation; these cross the module boundaries those can't.

use arkdata::config::{DatasetConfig, DatasetType, IndexType, ReplacePolicy, SegmentLayout};
use arkdata::index::{Filter, Index};
use arkdata::maintenance::check::{CheckAgent, Mode as CheckMode};
use arkdata::maintenance::repack::{Mode as RepackMode, RepackAgent};
use arkdata::maintenance::{self, SegmentState};
use arkdata::reftime::{Reftime, Step};
use arkdata::scanner::{encode_fixture_message, ScannerRegistry};
use arkdata::value::{Style, TypeCode, Value};
use arkdata::{Format, Message, Metadata, Reader, Writer};
use chrono::{DateTime, Duration, TimeZone, Utc};

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

/// A plain raw-bytes message: fine for any scenario that never asks the
/// check agent to rescan, since [`arkdata::scanner::FixtureScanner`] is
/// only ever exercised there.
fn raw_message(at: DateTime<Utc>, centre: u16, payload: &[u8]) -> Message {
    let mut md = Metadata::new();
    md.set(Value::Reftime(Reftime::Point(at)));
    md.set(origin(centre));
    Message::new(Format::Grib1, payload.to_vec(), md)
}

/// A message whose bytes are themselves a self-describing fixture
/// envelope, required wherever the check agent's rescan path decodes a
/// segment's raw bytes back into metadata.
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

/// Scenario 1: ingest three messages across three segments, then query one
/// back by its exact reftime and origin.
#[test]
fn ingest_and_requery_returns_the_exact_message() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let writer = Writer::open(dir.path().to_path_buf(), config.clone()).unwrap();

    writer.acquire(&mut raw_message(day(2007, 7, 7), 200, b"first")).unwrap();
    let target = writer
        .acquire(&mut raw_message(day(2007, 7, 8), 200, b"second"))
        .unwrap();
    writer.acquire(&mut raw_message(day(2007, 10, 9), 200, b"third")).unwrap();
    writer.flush().unwrap();

    assert!(dir.path().join("2007/07-07.grib1").exists());
    assert!(dir.path().join("2007/07-08.grib1").exists());
    assert!(dir.path().join("2007/10-09.grib1").exists());
    assert_eq!(target.segment_relpath, "2007/07-08.grib1");

    let reader = Reader::open(dir.path().to_path_buf(), config).unwrap();
    let filter = Filter::match_all()
        .with_reftime_range(Some(day(2007, 7, 8)), Some(day(2007, 7, 8)))
        .with_predicate(TypeCode::Origin, origin(200));

    let mut seen = Vec::new();
    reader
        .query_data(&filter, |resolved| {
            seen.push(resolved);
            Ok(arkdata::reader::Flow::Continue)
        })
        .unwrap();

    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].data, b"second");
    assert_eq!(seen[0].row.reftime, Reftime::Point(day(2007, 7, 8)));
}

/// Scenario 2: two aged segments move into `.archive/last/` with their
/// `.gz`/`.gz.idx`/`.metadata`/`.summary` sidecars, a third recent segment
/// stays live, and a match-all query still sees all three messages through
/// the reader's transparent archive fallthrough.
#[test]
fn archive_by_age_compresses_and_moves_aged_segments() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.archive_age = Some(100);

    let now = Utc::now();
    let old_a = now - Duration::days(400);
    let old_b = now - Duration::days(500);
    let recent = now - Duration::days(10);

    let writer = Writer::open(dir.path().to_path_buf(), config.clone()).unwrap();
    let r_old_a = writer.acquire(&mut raw_message(old_a, 200, b"old-a")).unwrap();
    let r_old_b = writer.acquire(&mut raw_message(old_b, 201, b"old-b")).unwrap();
    let r_recent = writer.acquire(&mut raw_message(recent, 202, b"recent")).unwrap();
    writer.flush().unwrap();

    let index = Index::open(dir.path(), config.index_type).unwrap();
    let classifications = maintenance::classify(dir.path(), &config, &index, None).unwrap();
    let archived: Vec<_> = classifications
        .iter()
        .filter(|c| c.state() == SegmentState::NeedsArchive)
        .map(|c| c.relpath.clone())
        .collect();
    assert_eq!(archived.len(), 2);
    assert!(archived.contains(&r_old_a.segment_relpath));
    assert!(archived.contains(&r_old_b.segment_relpath));

    let mut archives = arkdata::archive::Archives::open_with(dir.path().to_path_buf(), config.segments, config.index_type).unwrap();
    let mut agent = RepackAgent::new(dir.path(), &config, &index, RepackMode::Real).with_archives(&mut archives);
    let report = agent.run(&classifications).unwrap();
    assert!(report.lines.iter().any(|l| l.contains(&r_old_a.segment_relpath)));
    assert!(report.lines.iter().any(|l| l.contains(&r_old_b.segment_relpath)));
    assert!(report.lines.iter().any(|l| l.contains("2 files archived")));

    for relpath in [&r_old_a.segment_relpath, &r_old_b.segment_relpath] {
        let base = dir.path().join(".archive/last").join(relpath);
        assert!(!dir.path().join(relpath).exists(), "{} still live", relpath);
        let gz = arkdata::segment::with_suffix(&base, ".gz");
        let idx = arkdata::segment::with_suffix(&base, ".gz.idx");
        let meta = arkdata::segment::with_suffix(&base, ".metadata");
        let summary = arkdata::segment::with_suffix(&base, ".summary");
        assert!(gz.exists(), "missing {:?}", gz);
        assert!(idx.exists(), "missing {:?}", idx);
        assert!(meta.exists(), "missing {:?}", meta);
        assert!(summary.exists(), "missing {:?}", summary);
    }
    assert!(dir.path().join(&r_recent.segment_relpath).exists());

    let reader = Reader::open(dir.path().to_path_buf(), config).unwrap();
    let mut count = 0;
    reader
        .query_data(&Filter::match_all(), |_| {
            count += 1;
            Ok(arkdata::reader::Flow::Continue)
        })
        .unwrap();
    assert_eq!(count, 3);
}

/// Scenario 3: deleting one of two messages in a segment leaves a gap;
/// repack eliminates it, and the live summary cache gets rebuilt.
#[test]
fn repack_after_deletion_shrinks_the_segment() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let writer = Writer::open(dir.path().to_path_buf(), config.clone()).unwrap();

    let r1 = writer.acquire(&mut raw_message(day(2007, 1, 1), 1, b"payload-1")).unwrap();
    let r2 = writer.acquire(&mut raw_message(day(2007, 1, 1), 2, b"payload-2")).unwrap();
    let r3 = writer.acquire(&mut raw_message(day(2007, 1, 2), 3, b"payload-3")).unwrap();
    writer.remove(r1.id).unwrap();
    writer.flush().unwrap();

    let index = Index::open(dir.path(), config.index_type).unwrap();
    let classifications = maintenance::classify(dir.path(), &config, &index, None).unwrap();
    let needing_pack = classifications
        .iter()
        .find(|c| c.relpath == r2.segment_relpath)
        .unwrap();
    assert_eq!(needing_pack.state(), SegmentState::NeedsPack);

    let mut agent = RepackAgent::new(dir.path(), &config, &index, RepackMode::Real);
    agent.run(&classifications).unwrap();

    let reader = Reader::open(dir.path().to_path_buf(), config).unwrap();
    let mut count = 0;
    reader
        .query_data(&Filter::match_all(), |_| {
            count += 1;
            Ok(arkdata::reader::Flow::Continue)
        })
        .unwrap();
    assert_eq!(count, 2);

    assert!(dir.path().join(&r3.segment_relpath).exists());

    let summary_cache = dir.path().join(".summaries/all.summary");
    reader.query_summary(&Filter::match_all()).unwrap();
    assert!(summary_cache.exists());
}

/// Scenario 4: removing a segment's `.metadata`/`.summary` sidecars is
/// classified as needs-rescan; the check agent's fix pass recreates them
/// from the raw bytes without changing what a query returns.
#[test]
fn rescan_recreates_missing_sidecars() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let writer = Writer::open(dir.path().to_path_buf(), config.clone()).unwrap();

    let result = writer.acquire(&mut fixture_message(day(2007, 1, 1), 1)).unwrap();
    writer.flush().unwrap();

    let metadata_path = dir.path().join(format!("{}.metadata", result.segment_relpath));
    let summary_path = dir.path().join(format!("{}.summary", result.segment_relpath));
    assert!(metadata_path.exists());
    assert!(summary_path.exists());
    std::fs::remove_file(&metadata_path).unwrap();
    std::fs::remove_file(&summary_path).unwrap();

    let index = Index::open(dir.path(), config.index_type).unwrap();
    let scanners = ScannerRegistry::new();
    let classifications = maintenance::classify(dir.path(), &config, &index, None).unwrap();
    let c = classifications
        .iter()
        .find(|c| c.relpath == result.segment_relpath)
        .unwrap();
    assert_eq!(c.state(), SegmentState::NeedsRescan);

    let check_agent = CheckAgent::new(dir.path(), &config, &index, &scanners, CheckMode::Real);
    check_agent.run(&classifications).unwrap();
    assert!(metadata_path.exists());
    assert!(summary_path.exists());

    let post = maintenance::classify(dir.path(), &config, &index, None).unwrap();
    let c = post.iter().find(|c| c.relpath == result.segment_relpath).unwrap();
    assert_eq!(c.state(), SegmentState::Ok);

    let reader = Reader::open(dir.path().to_path_buf(), config).unwrap();
    let mut count = 0;
    reader
        .query_data(&Filter::match_all(), |_| {
            count += 1;
            Ok(arkdata::reader::Flow::Continue)
        })
        .unwrap();
    assert_eq!(count, 1);
}

/// Scenario 5: a BUFR message at USN 5, an attempted replacement at a
/// lower USN (rejected), and one at a strictly higher USN (accepted) —
/// the surviving row carries the latest variant.
#[test]
fn usn_replace_keeps_only_the_strictly_greater_update() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.replace = ReplacePolicy::Usn;
    let writer = Writer::open(dir.path().to_path_buf(), config.clone()).unwrap();

    let at = day(2007, 3, 1);
    let mut m5 = raw_message(at, 9, b"usn-5");
    m5.metadata.set(Value::Quantity { values: vec!["usn=5".into()] });
    writer.acquire(&mut m5).unwrap();

    let mut m4 = raw_message(at, 9, b"usn-4");
    m4.metadata.set(Value::Quantity { values: vec!["usn=4".into()] });
    assert!(writer.acquire(&mut m4).is_err());

    let mut m6 = raw_message(at, 9, b"usn-6");
    m6.metadata.set(Value::Quantity { values: vec!["usn=6".into()] });
    let r6 = writer.acquire(&mut m6).unwrap();
    writer.flush().unwrap();

    let reader = Reader::open(dir.path().to_path_buf(), config).unwrap();
    let mut seen = Vec::new();
    reader
        .query_data(&Filter::match_all(), |resolved| {
            seen.push(resolved.data);
            Ok(arkdata::reader::Flow::Continue)
        })
        .unwrap();
    assert_eq!(seen, vec![b"usn-6".to_vec()]);
    assert_eq!(r6.segment_relpath, "2007/03-01.grib1");
}

/// Scenario 6: an empty dataset reports zero messages, an empty summary,
/// and a clean maintenance round.
#[test]
fn empty_dataset_is_clean_and_reports_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let _writer = Writer::open(dir.path().to_path_buf(), config.clone()).unwrap();

    let reader = Reader::open(dir.path().to_path_buf(), config.clone()).unwrap();
    let mut count = 0;
    reader
        .query_data(&Filter::match_all(), |_| {
            count += 1;
            Ok(arkdata::reader::Flow::Continue)
        })
        .unwrap();
    assert_eq!(count, 0);

    let summary = reader.query_summary(&Filter::match_all()).unwrap();
    assert!(summary.is_empty());

    let index = Index::open(dir.path(), config.index_type).unwrap();
    let classifications = maintenance::classify(dir.path(), &config, &index, None).unwrap();
    let mut agent = RepackAgent::new(dir.path(), &config, &index, RepackMode::Real);
    let report = agent.run(&classifications).unwrap();
    assert!(report.is_clean());

    let scanners = ScannerRegistry::new();
    let check_agent = CheckAgent::new(dir.path(), &config, &index, &scanners, CheckMode::Real);
    let report = check_agent.run(&classifications).unwrap();
    assert!(report.is_clean());
}
