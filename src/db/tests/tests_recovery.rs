//! Persistence and recovery: clean reopen, WAL replay after an unclean
//! shutdown, recovery of flushed state, and the no-replay-of-flushed rule.

use super::helpers::*;
use crate::config::{DbConfig, WalSyncMode};
use crate::db::Db;
use tempfile::TempDir;

#[test]
fn clean_close_and_reopen_preserves_mapping() {
    let tmp = TempDir::new().unwrap();

    {
        let db = Db::open(tmp.path(), memtable_only_config()).unwrap();
        for i in 0..100u32 {
            db.put(format!("k{i:03}").into_bytes(), format!("v{i}").into_bytes())
                .unwrap();
        }
        db.delete(b"k050").unwrap();
        db.close().unwrap();
    }

    let db = Db::open(tmp.path(), memtable_only_config()).unwrap();
    for i in 0..100u32 {
        let expected = if i == 50 {
            None
        } else {
            Some(format!("v{i}").into_bytes())
        };
        assert_eq!(db.get(format!("k{i:03}").as_bytes()).unwrap(), expected);
    }
    db.close().unwrap();
}

#[test]
fn drop_without_close_recovers_from_wal() {
    let tmp = TempDir::new().unwrap();

    {
        let db = Db::open(tmp.path(), memtable_only_config()).unwrap();
        db.put(b"survivor", b"yes").unwrap();
        db.delete(b"survivor-2").unwrap();
        // No close(): the handle drops like a process that died after its
        // writes were acknowledged (sync mode is Always).
    }

    let db = Db::open(tmp.path(), memtable_only_config()).unwrap();
    assert_eq!(db.get(b"survivor").unwrap(), Some(b"yes".to_vec()));
    assert_eq!(db.get(b"survivor-2").unwrap(), None);
    db.close().unwrap();
}

#[test]
fn recovery_after_flush_skips_already_durable_records() {
    let tmp = TempDir::new().unwrap();

    {
        let db = Db::open(tmp.path(), memtable_only_config()).unwrap();
        for i in 0..50u32 {
            db.put(format!("flushed{i:02}").into_bytes(), b"disk".to_vec())
                .unwrap();
        }
        // Push to a table; the WAL for that data is deleted, and the
        // manifest records the durability floor.
        db.compact_range(b"\x00", b"\xff\xff").unwrap();

        for i in 0..10u32 {
            db.put(format!("walonly{i:02}").into_bytes(), b"wal".to_vec())
                .unwrap();
        }
        // Unclean shutdown.
    }

    let db = Db::open(tmp.path(), memtable_only_config()).unwrap();

    for i in 0..50u32 {
        assert_eq!(
            db.get(format!("flushed{i:02}").as_bytes()).unwrap(),
            Some(b"disk".to_vec())
        );
    }
    for i in 0..10u32 {
        assert_eq!(
            db.get(format!("walonly{i:02}").as_bytes()).unwrap(),
            Some(b"wal".to_vec())
        );
    }
    db.close().unwrap();
}

#[test]
fn sequences_continue_after_reopen() {
    let tmp = TempDir::new().unwrap();

    {
        let db = Db::open(tmp.path(), memtable_only_config()).unwrap();
        db.put(b"k", b"old").unwrap();
        db.close().unwrap();
    }

    // A write after reopen must supersede the recovered one.
    let db = Db::open(tmp.path(), memtable_only_config()).unwrap();
    db.put(b"k", b"new").unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(b"new".to_vec()));
    db.close().unwrap();

    let db = Db::open(tmp.path(), memtable_only_config()).unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(b"new".to_vec()));
    db.close().unwrap();
}

#[test]
fn repeated_kill_and_reopen_keeps_last_acknowledged_write() {
    let tmp = TempDir::new().unwrap();
    let config = DbConfig {
        wal_sync_mode: WalSyncMode::Always,
        memtable_size: 2048, // keep rotations in play
        ..memtable_only_config()
    };

    for round in 0..20u32 {
        let db = Db::open(tmp.path(), config.clone()).unwrap();
        db.put(b"counter", format!("{round}").into_bytes()).unwrap();
        drop(db); // unclean every time
    }

    let db = Db::open(tmp.path(), config).unwrap();
    assert_eq!(db.get(b"counter").unwrap(), Some(b"19".to_vec()));
    db.close().unwrap();
}

#[test]
fn flushed_tables_survive_reopen_without_wals() {
    let tmp = TempDir::new().unwrap();

    {
        let db = Db::open(tmp.path(), memtable_only_config()).unwrap();
        for i in 0..300u32 {
            db.put(format!("key{i:04}").into_bytes(), vec![0x42; 32])
                .unwrap();
        }
        db.compact_range(b"\x00", b"\xff\xff").unwrap();
        db.close().unwrap();
    }

    // No WAL data remains relevant; everything comes from tables.
    let db = Db::open(tmp.path(), memtable_only_config()).unwrap();
    assert!(total_files(&db) >= 1);
    let count = db.range(b"\x00", b"\xff\xff").unwrap().count();
    assert_eq!(count, 300);
    db.close().unwrap();
}
