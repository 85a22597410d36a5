//! DB tests: checksum store and ledger round-trips, durability across reopen, runinfo.

use ingestkit::engine::db_ops::{RunInfoKey, load_run_info, save_run_info};
use ingestkit::engine::{ChecksumStore, ProcessingLedger, open_db, open_db_in_memory};
use ingestkit::{ChecksumKind, FileChecksum};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn row(path: &str, size: u64, checksum: &str) -> FileChecksum {
    FileChecksum {
        path: PathBuf::from(path),
        size,
        mtime_ns: 1_000,
        checksum: checksum.to_string(),
        kind: ChecksumKind::Fast,
        last_checked: 0,
    }
}

#[test]
fn test_checksum_store_get_put_delete() {
    let store = ChecksumStore::open_in_memory().unwrap();
    assert!(store.is_empty().unwrap());
    assert!(store.get(Path::new("/a")).unwrap().is_none());

    store.put(&row("/a", 1, "x")).unwrap();
    store.put(&row("/a", 2, "y")).unwrap();
    let got = store.get(Path::new("/a")).unwrap().unwrap();
    assert_eq!(got.size, 2);
    assert_eq!(got.checksum, "y");
    assert_eq!(store.len().unwrap(), 1);

    assert!(store.delete(Path::new("/a")).unwrap());
    assert!(!store.delete(Path::new("/a")).unwrap());
    assert!(store.is_empty().unwrap());
}

#[test]
fn test_checksum_store_put_many_spans_chunks() {
    let store = ChecksumStore::open_in_memory().unwrap();
    let rows: Vec<FileChecksum> = (0..2_500)
        .map(|i| row(&format!("/data/{i}"), i, "c"))
        .collect();
    store.put_many(&rows).unwrap();
    let all = store.all().unwrap();
    assert_eq!(all.len(), 2_500);
    assert_eq!(all[&PathBuf::from("/data/42")].size, 42);

    let gone: Vec<PathBuf> = (0..10).map(|i| PathBuf::from(format!("/data/{i}"))).collect();
    assert_eq!(store.delete_many(gone.iter()).unwrap(), 10);
    assert_eq!(store.len().unwrap(), 2_490);
}

#[test]
fn test_checksum_store_survives_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let db = tmp.path().join("state").join(".ingestkit");
    {
        let store = ChecksumStore::open(&db).unwrap();
        let mut r = row("/data/a", 5, "abc");
        r.kind = ChecksumKind::Exact;
        store.put(&r).unwrap();
        store.record_full_rescan(1234).unwrap();
    }
    let store = ChecksumStore::open(&db).unwrap();
    let got = store.get(Path::new("/data/a")).unwrap().unwrap();
    assert_eq!(got.kind, ChecksumKind::Exact);
    assert_eq!(store.last_full_rescan().unwrap(), Some(1234));
}

#[test]
fn test_prune_only_removes_missing_files() {
    let tmp = tempfile::tempdir().unwrap();
    let present = tmp.path().join("present.txt");
    std::fs::write(&present, "x").unwrap();
    let store = ChecksumStore::open_in_memory().unwrap();
    store.put(&row(present.to_str().unwrap(), 1, "a")).unwrap();
    store.put(&row("/no/such/file", 1, "b")).unwrap();

    assert_eq!(store.prune_older_than(Duration::ZERO).unwrap(), 1);
    assert!(store.get(&present).unwrap().is_some());
    assert!(store.get(Path::new("/no/such/file")).unwrap().is_none());
}

#[test]
fn test_ledger_should_process_mark_processed_cycle() {
    let tmp = tempfile::tempdir().unwrap();
    let file = tmp.path().join("doc.txt");
    std::fs::write(&file, "hello").unwrap();
    let ledger = ProcessingLedger::open(&tmp.path().join(".ingestkit")).unwrap();

    assert_eq!(ledger.should_process(&file).unwrap(), (true, None));
    ledger
        .mark_processed(&file, "result-1", &json!({"pages": 1}))
        .unwrap();
    assert_eq!(
        ledger.should_process(&file).unwrap(),
        (false, Some("result-1".to_string()))
    );

    // New content is a new (path, checksum) key.
    std::fs::write(&file, "hello, world").unwrap();
    assert_eq!(ledger.should_process(&file).unwrap(), (true, None));
    ledger.mark_processed(&file, "result-2", &json!(null)).unwrap();
    let entries = ledger.entries_for(&file).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].result_id, "result-2");
}

#[test]
fn test_ledger_invalidate_all_forces_reprocessing() {
    let tmp = tempfile::tempdir().unwrap();
    let file = tmp.path().join("doc.txt");
    std::fs::write(&file, "stable").unwrap();
    let db = tmp.path().join(".ingestkit");
    let ledger = ProcessingLedger::open(&db).unwrap();
    ledger.mark_processed(&file, "r", &json!(null)).unwrap();
    assert!(!ledger.should_process(&file).unwrap().0);

    let v = ledger.invalidate_all().unwrap();
    assert_eq!(ledger.should_process(&file).unwrap(), (true, None));
    // History kept, version persisted.
    assert_eq!(ledger.count().unwrap(), 1);
    drop(ledger);
    let reopened = ProcessingLedger::open(&db).unwrap();
    assert_eq!(reopened.pipeline_version(), v);
}

#[test]
fn test_ledger_find_by_content() {
    let ledger = ProcessingLedger::open_in_memory().unwrap();
    ledger
        .record(Path::new("/old/place.txt"), "c0ffee", "r1", &json!({"k": 1}))
        .unwrap();
    let hit = ledger.find_by_content("c0ffee").unwrap().unwrap();
    assert_eq!(hit.path, PathBuf::from("/old/place.txt"));
    assert_eq!(hit.metadata, json!({"k": 1}));
    assert!(ledger.find_by_content("other").unwrap().is_none());
}

#[test]
fn test_stores_share_one_file() {
    let tmp = tempfile::tempdir().unwrap();
    let db = tmp.path().join(".ingestkit");
    let store = ChecksumStore::open(&db).unwrap();
    let ledger = ProcessingLedger::open(&db).unwrap();
    store.put(&row("/x", 1, "a")).unwrap();
    ledger.record(Path::new("/x"), "a", "r", &json!(null)).unwrap();
    assert_eq!(store.len().unwrap(), 1);
    assert_eq!(ledger.count().unwrap(), 1);
}

#[test]
fn test_runinfo_round_trip() {
    let conn = open_db_in_memory().unwrap();
    assert_eq!(
        load_run_info::<i64>(&conn, RunInfoKey::LastFullRescan).unwrap(),
        None
    );
    save_run_info(&conn, RunInfoKey::LastFullRescan, &99_i64).unwrap();
    assert_eq!(
        load_run_info::<i64>(&conn, RunInfoKey::LastFullRescan).unwrap(),
        Some(99)
    );
    let tmp = tempfile::tempdir().unwrap();
    let file_conn = open_db(&tmp.path().join("db")).unwrap();
    save_run_info(&file_conn, RunInfoKey::LogicVersion, &"v2").unwrap();
    assert_eq!(
        load_run_info::<String>(&file_conn, RunInfoKey::LogicVersion)
            .unwrap()
            .as_deref(),
        Some("v2")
    );
}
