//! Basic memtable behavior: apply, get, tombstones, size accounting.

use crate::config::WalSyncMode;
use crate::db::utils::Record;
use crate::memtable::{Memtable, MemtableGetResult};
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn open_memtable(tmp: &TempDir) -> Memtable {
    init_tracing();
    let path = tmp.path().join("000001.wal");
    Memtable::open(path, 1, 0, WalSyncMode::Always).unwrap()
}

fn put(key: &[u8], value: &[u8], seq: u64) -> Record {
    Record::Put {
        key: key.to_vec(),
        value: value.to_vec(),
        seq,
    }
}

fn delete(key: &[u8], seq: u64) -> Record {
    Record::Delete {
        key: key.to_vec(),
        seq,
    }
}

#[test]
fn put_and_get() {
    let tmp = TempDir::new().unwrap();
    let memtable = open_memtable(&tmp);

    memtable.apply(&[put(b"key1", b"value1", 1)]).unwrap();

    assert_eq!(
        memtable.get(b"key1", u64::MAX).unwrap(),
        MemtableGetResult::Put(b"value1".to_vec())
    );
    assert_eq!(
        memtable.get(b"missing", u64::MAX).unwrap(),
        MemtableGetResult::NotFound
    );
}

#[test]
fn overwrite_returns_newest() {
    let tmp = TempDir::new().unwrap();
    let memtable = open_memtable(&tmp);

    memtable.apply(&[put(b"key1", b"old", 1)]).unwrap();
    memtable.apply(&[put(b"key1", b"new", 2)]).unwrap();

    assert_eq!(
        memtable.get(b"key1", u64::MAX).unwrap(),
        MemtableGetResult::Put(b"new".to_vec())
    );
}

#[test]
fn delete_masks_older_put() {
    let tmp = TempDir::new().unwrap();
    let memtable = open_memtable(&tmp);

    memtable.apply(&[put(b"key1", b"value1", 1)]).unwrap();
    memtable.apply(&[delete(b"key1", 2)]).unwrap();

    assert_eq!(
        memtable.get(b"key1", u64::MAX).unwrap(),
        MemtableGetResult::Delete
    );

    // A put after the delete resurrects the key.
    memtable.apply(&[put(b"key1", b"back", 3)]).unwrap();
    assert_eq!(
        memtable.get(b"key1", u64::MAX).unwrap(),
        MemtableGetResult::Put(b"back".to_vec())
    );
}

#[test]
fn empty_value_is_stored() {
    let tmp = TempDir::new().unwrap();
    let memtable = open_memtable(&tmp);

    memtable.apply(&[put(b"key1", b"", 1)]).unwrap();
    assert_eq!(
        memtable.get(b"key1", u64::MAX).unwrap(),
        MemtableGetResult::Put(Vec::new())
    );
}

#[test]
fn size_accumulates_per_version() {
    let tmp = TempDir::new().unwrap();
    let memtable = open_memtable(&tmp);

    assert!(memtable.is_empty());
    assert_eq!(memtable.approximate_size(), 0);

    memtable.apply(&[put(b"key1", b"value1", 1)]).unwrap();
    let after_one = memtable.approximate_size();
    assert!(after_one > 0);

    // Overwriting does not reclaim the older version's bytes.
    memtable.apply(&[put(b"key1", b"value2", 2)]).unwrap();
    assert_eq!(memtable.approximate_size(), after_one * 2);

    assert!(!memtable.is_empty());
    assert_eq!(memtable.max_seq(), 2);
}

#[test]
fn iter_for_flush_emits_newest_per_key_in_order() {
    let tmp = TempDir::new().unwrap();
    let memtable = open_memtable(&tmp);

    memtable
        .apply(&[
            put(b"b", b"b1", 1),
            put(b"a", b"a1", 2),
            put(b"b", b"b2", 3),
            delete(b"c", 4),
        ])
        .unwrap();

    let flushed: Vec<_> = memtable.iter_for_flush().unwrap().collect();
    assert_eq!(flushed.len(), 3);

    assert_eq!(flushed[0].key(), b"a");
    assert_eq!(flushed[0].seq(), 2);

    assert_eq!(flushed[1].key(), b"b");
    assert_eq!(flushed[1].seq(), 3);
    match &flushed[1] {
        Record::Put { value, .. } => assert_eq!(value, b"b2"),
        other => panic!("expected put, got {other:?}"),
    }

    assert_eq!(flushed[2].key(), b"c");
    assert!(flushed[2].is_delete());
}
