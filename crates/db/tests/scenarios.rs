use tempfile::TempDir;
use trivdb::{Error, StoreMode, Tdb, TdbConfig};

fn open(dir: &TempDir, config: &TdbConfig) -> Tdb {
    config.open(dir.path().join("scenario.tdb")).unwrap()
}

fn key(i: u32) -> Vec<u8> {
    format!("key-{i:03}").into_bytes()
}

#[test]
fn test_insert_and_lookup() {
    let dir = TempDir::new().unwrap();
    let mut tdb = open(&dir, &TdbConfig::builder().with_hash_size(131).build());
    assert_eq!(tdb.hash_size(), 131);
    tdb.store(b"a", b"1", StoreMode::Insert).unwrap();
    assert_eq!(tdb.fetch(b"a").unwrap().as_deref(), Some(&b"1"[..]));
    assert!(!tdb.exists(b"b").unwrap());
}

#[test]
fn test_insert_twice_then_replace() {
    let dir = TempDir::new().unwrap();
    let mut tdb = open(&dir, &TdbConfig::default());
    tdb.store(b"a", b"1", StoreMode::Insert).unwrap();
    let err = tdb.store(b"a", b"1", StoreMode::Insert).unwrap_err();
    assert!(matches!(err, Error::Exists));
    tdb.store(b"a", b"new", StoreMode::Replace).unwrap();
    assert_eq!(tdb.fetch(b"a").unwrap().as_deref(), Some(&b"new"[..]));
}

#[test]
fn test_cancelled_transaction_leaves_nothing_behind() {
    let dir = TempDir::new().unwrap();
    let mut tdb = open(&dir, &TdbConfig::default());
    let size = tdb.map_size();
    let on_disk = std::fs::metadata(dir.path().join("scenario.tdb")).unwrap().len();

    tdb.transaction_start().unwrap();
    for i in 0..100 {
        tdb.store(&key(i), b"value", StoreMode::Insert).unwrap();
    }
    tdb.transaction_cancel().unwrap();

    for i in 0..100 {
        assert!(!tdb.exists(&key(i)).unwrap());
    }
    assert_eq!(tdb.map_size(), size);
    let after = std::fs::metadata(dir.path().join("scenario.tdb")).unwrap().len();
    assert_eq!(after, on_disk);
}

#[test]
fn test_committed_transaction_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let mut tdb = open(&dir, &TdbConfig::default());
    tdb.transaction_start().unwrap();
    for i in 0..100 {
        tdb.store(&key(i), &i.to_be_bytes(), StoreMode::Insert).unwrap();
    }
    tdb.transaction_commit().unwrap();
    tdb.close().unwrap();

    let mut tdb = open(&dir, &TdbConfig::default());
    for i in 0..100 {
        assert_eq!(tdb.fetch(&key(i)).unwrap(), Some(i.to_be_bytes().to_vec()));
    }
    assert_eq!(tdb.count().unwrap(), 100);
    tdb.check(None).unwrap();
}

#[test]
fn test_dead_record_budget_triggers_purge() {
    let dir = TempDir::new().unwrap();
    // a single bucket puts every key on the same chain
    let config = TdbConfig::builder()
        .with_hash_size(1)
        .with_max_dead_records(5)
        .build();
    let mut tdb = open(&dir, &config);
    for i in 0..10 {
        tdb.store(&key(i), b"v", StoreMode::Insert).unwrap();
    }

    for i in 0..5 {
        tdb.delete(&key(i)).unwrap();
    }
    assert_eq!(tdb.summary().unwrap().dead_records, 5);

    tdb.delete(&key(5)).unwrap();
    let summary = tdb.summary().unwrap();
    assert_eq!(summary.dead_records, 0);
    assert_eq!(summary.records, 4);
    for i in 0..6 {
        assert!(!tdb.exists(&key(i)).unwrap());
    }
    tdb.check(None).unwrap();
}

#[test]
fn test_delete_missing_key_is_not_found() {
    let dir = TempDir::new().unwrap();
    let mut tdb = open(&dir, &TdbConfig::default());
    let err = tdb.delete(b"ghost").unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(tdb.last_error(), trivdb::ErrorCode::NotFound);
}

#[test]
fn test_values_larger_than_a_page() {
    let dir = TempDir::new().unwrap();
    let mut tdb = open(&dir, &TdbConfig::default());
    let big: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    tdb.store(b"big", &big, StoreMode::Insert).unwrap();
    tdb.append(b"big", b"tail").unwrap();
    let value = tdb.fetch(b"big").unwrap().unwrap();
    assert_eq!(value.len(), big.len() + 4);
    assert!(value.ends_with(b"tail"));
    tdb.check(None).unwrap();
}

#[test]
fn test_seqnum_tracks_mutations_across_handles() {
    let dir = TempDir::new().unwrap();
    let config = TdbConfig::builder()
        .with_flags(trivdb::Flags::SEQNUM)
        .build();
    let mut tdb = open(&dir, &config);
    tdb.store(b"a", b"1", StoreMode::Insert).unwrap();
    tdb.store(b"b", b"2", StoreMode::Insert).unwrap();
    tdb.delete(b"a").unwrap();
    assert_eq!(tdb.seqnum().unwrap(), 3);
    tdb.close().unwrap();

    let mut tdb = open(&dir, &TdbConfig::default());
    assert_eq!(tdb.seqnum().unwrap(), 3);
}
