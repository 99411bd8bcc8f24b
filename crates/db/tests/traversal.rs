use std::collections::BTreeSet;
use std::ops::ControlFlow;
use tempfile::TempDir;
use trivdb::{StoreMode, Tdb, TdbConfig};

fn filled(dir: &TempDir, n: u32) -> Tdb {
    let mut tdb = TdbConfig::builder()
        .with_hash_size(11)
        .build()
        .open(dir.path().join("walk.tdb"))
        .unwrap();
    for i in 0..n {
        tdb.store(format!("k{i}").as_bytes(), &i.to_le_bytes(), StoreMode::Insert)
            .unwrap();
    }
    tdb
}

#[test]
fn test_traverse_can_rewrite_values() {
    let dir = TempDir::new().unwrap();
    let mut tdb = filled(&dir, 50);
    let visited = tdb
        .traverse(|db, key, value| {
            let mut doubled = value.to_vec();
            doubled.extend_from_slice(value);
            db.store(key, &doubled, StoreMode::Replace).unwrap();
            ControlFlow::Continue(())
        })
        .unwrap();
    assert!(visited >= 50);
    for i in 0..50u32 {
        let value = tdb.fetch(format!("k{i}").as_bytes()).unwrap().unwrap();
        assert_eq!(value.len(), 8);
    }
    tdb.check(None).unwrap();
}

#[test]
fn test_delete_during_traverse_frees_space_afterwards() {
    let dir = TempDir::new().unwrap();
    let mut tdb = filled(&dir, 40);
    tdb.traverse(|db, key, _| {
        db.delete(key).unwrap();
        ControlFlow::Continue(())
    })
    .unwrap();
    assert_eq!(tdb.count().unwrap(), 0);
    let summary = tdb.summary().unwrap();
    assert_eq!(summary.records, 0);
    tdb.check(None).unwrap();
}

#[test]
fn test_cursor_walks_every_key_once() {
    let dir = TempDir::new().unwrap();
    let mut tdb = filled(&dir, 30);
    let mut seen = BTreeSet::new();
    let mut key = tdb.first_key().unwrap();
    while let Some(k) = key {
        assert!(seen.insert(k.clone()));
        key = tdb.next_key(&k).unwrap();
    }
    assert_eq!(seen.len(), 30);
}

#[test]
fn test_traverse_inside_transaction_sees_pending_writes() {
    let dir = TempDir::new().unwrap();
    let mut tdb = filled(&dir, 5);
    tdb.transaction_start().unwrap();
    tdb.store(b"pending", b"1", StoreMode::Insert).unwrap();
    tdb.delete(b"k0").unwrap();
    let mut keys = BTreeSet::new();
    tdb.traverse_read(|_, key, _| {
        keys.insert(key.to_vec());
        ControlFlow::Continue(())
    })
    .unwrap();
    assert!(keys.contains(&b"pending"[..]));
    assert!(!keys.contains(&b"k0"[..]));
    assert_eq!(keys.len(), 5);
    tdb.transaction_cancel().unwrap();
    assert_eq!(tdb.count().unwrap(), 5);
}
