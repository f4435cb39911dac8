//! Snapshot semantics: pinned sequences, iterator stability, and
//! isolation from later writes.

use super::helpers::*;
use crate::db::Db;
use tempfile::TempDir;

#[test]
fn snapshot_is_isolated_from_later_writes() {
    let tmp = TempDir::new().unwrap();
    let db = Db::open(tmp.path(), memtable_only_config()).unwrap();

    db.put(b"k", b"v1").unwrap();
    let snap = db.snapshot().unwrap();

    db.put(b"k", b"v2").unwrap();
    db.put(b"new", b"x").unwrap();
    db.delete(b"k").unwrap();

    assert_eq!(db.get_at(&snap, b"k").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(db.get_at(&snap, b"new").unwrap(), None);
    assert_eq!(db.get(b"k").unwrap(), None);

    db.close().unwrap();
}

#[test]
fn snapshot_range_is_repeatable_under_writes() {
    let tmp = TempDir::new().unwrap();
    let db = Db::open(tmp.path(), memtable_only_config()).unwrap();

    for i in 0..50u32 {
        db.put(format!("key{i:02}").into_bytes(), format!("v{i}").into_bytes())
            .unwrap();
    }
    let snap = db.snapshot().unwrap();

    let first: Vec<_> = db.range_at(&snap, b"key00", b"key99").unwrap().collect();

    // Concurrent-ish mutations between the two scans.
    for i in 0..50u32 {
        db.put(format!("key{i:02}").into_bytes(), b"mutated".to_vec())
            .unwrap();
    }
    db.delete(b"key25").unwrap();

    let second: Vec<_> = db.range_at(&snap, b"key00", b"key99").unwrap().collect();

    assert_eq!(first, second);
    assert_eq!(first.len(), 50);

    db.close().unwrap();
}

#[test]
fn snapshot_survives_flush_of_its_memtable() {
    let tmp = TempDir::new().unwrap();
    let db = Db::open(tmp.path(), memtable_only_config()).unwrap();

    db.put(b"pinned", b"before").unwrap();
    let snap = db.snapshot().unwrap();

    // Overwrite, then force everything through flush + compaction.
    db.put(b"pinned", b"after").unwrap();
    db.compact_range(b"\x00", b"\xff\xff").unwrap();

    // The snapshot still resolves to its pinned version: the memtable it
    // captured is kept alive by the snapshot itself.
    assert_eq!(db.get_at(&snap, b"pinned").unwrap(), Some(b"before".to_vec()));
    assert_eq!(db.get(b"pinned").unwrap(), Some(b"after".to_vec()));

    db.close().unwrap();
}

#[test]
fn sequences_increase_across_snapshots() {
    let tmp = TempDir::new().unwrap();
    let db = Db::open(tmp.path(), memtable_only_config()).unwrap();

    let s0 = db.snapshot().unwrap();
    db.put(b"a", b"1").unwrap();
    let s1 = db.snapshot().unwrap();
    db.put(b"b", b"2").unwrap();
    let s2 = db.snapshot().unwrap();

    assert!(s0.sequence() < s1.sequence());
    assert!(s1.sequence() < s2.sequence());

    db.close().unwrap();
}
