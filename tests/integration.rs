//! Integration tests for the public `Db` API.
//!
//! These tests exercise the full storage stack (WAL → memtable → SSTable →
//! leveled compaction) through the public `stratadb::{Db, DbConfig, ...}`
//! surface only. No internal modules are referenced.
//!
//! ## Coverage areas
//! - **Lifecycle**: open, close, idempotent close, reopen
//! - **CRUD**: put, get, delete, overwrite, boundary inputs
//! - **Range**: ordered end-exclusive scans, tombstone filtering
//! - **Flush**: small write buffers produce level-0 tables
//! - **Compaction**: repeated overwrites reclaim space; manual compaction
//!   is idempotent
//! - **Durability**: acknowledged writes survive unclean shutdown with
//!   `WalSyncMode::Always`
//! - **Bloom filters**: absent-key lookups rarely touch data blocks
//! - **Concurrency**: parallel writers and readers

use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use stratadb::{Db, DbConfig, DbError, WalSyncMode, WriteBatch};
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Small write buffer to trigger frequent rotations and flushes.
fn small_buffer_config() -> DbConfig {
    DbConfig {
        memtable_size: 4096,
        level0_size: 64 * 1024,
        target_sst_size: 32 * 1024,
        // Generous stop threshold: these tests fill tiny memtables faster
        // than a loaded CI machine may drain L0.
        l0_slowdown: 12,
        l0_stop: 24,
        ..DbConfig::default()
    }
}

/// Polls `cond` for up to ten seconds.
fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for: {what}");
}

fn total_sst_files(db: &Db) -> usize {
    db.stats().unwrap().levels.iter().map(|l| l.files).sum()
}

fn total_sst_bytes(db: &Db) -> u64 {
    db.stats().unwrap().levels.iter().map(|l| l.bytes).sum()
}

// ================================================================================================
// Basic workflows
// ================================================================================================

/// # Scenario
/// The canonical smoke test: two puts, a hit, a miss, a delete.
#[test]
fn basic_put_get_delete() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), DbConfig::default()).unwrap();

    db.put(b"k1", b"v1").unwrap();
    db.put(b"k2", b"v2").unwrap();

    assert_eq!(db.get(b"k1").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(db.get(b"k3").unwrap(), None);

    db.delete(b"k1").unwrap();
    assert_eq!(db.get(b"k1").unwrap(), None);

    db.close().unwrap();
}

/// # Scenario
/// Insert `key00..key99`; a scan of `[key20, key25)` yields exactly the
/// five pairs inside the half-open interval, in order.
#[test]
fn range_scan_exact_window() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), DbConfig::default()).unwrap();

    for i in 0..100u32 {
        db.put(
            format!("key{i:02}").into_bytes(),
            format!("val{i:02}").into_bytes(),
        )
        .unwrap();
    }

    let got: Vec<_> = db.range(b"key20", b"key25").unwrap().collect();
    let expected: Vec<(Vec<u8>, Vec<u8>)> = (20..25)
        .map(|i| {
            (
                format!("key{i:02}").into_bytes(),
                format!("val{i:02}").into_bytes(),
            )
        })
        .collect();
    assert_eq!(got, expected);

    // A present key with an empty window yields nothing (end-exclusive).
    assert_eq!(db.range(b"key20", b"key20").unwrap().count(), 0);

    db.close().unwrap();
}

// ================================================================================================
// Flush and compaction
// ================================================================================================

/// # Scenario
/// 2000 records of 8-byte keys and values against a 4 KiB memtable: at
/// least one L0 table must appear, and every key stays readable.
#[test]
fn flush_produces_level0_tables() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), small_buffer_config()).unwrap();

    for i in 0..2000u32 {
        db.put(
            format!("{i:08}").into_bytes(),
            format!("{i:08}").into_bytes(),
        )
        .unwrap();
    }

    wait_until("a table on disk", || total_sst_files(&db) >= 1);

    for i in (0..2000u32).step_by(113) {
        let key = format!("{i:08}");
        assert_eq!(
            db.get(key.as_bytes()).unwrap(),
            Some(key.clone().into_bytes()),
            "lost {key}"
        );
    }

    db.close().unwrap();
}

/// # Scenario
/// Overwrite the same 1000 keys ten times with an aggressive compaction
/// trigger. After quiescing, live table bytes must be within 2× the size
/// of one generation of unique records.
#[test]
fn compaction_bounds_space_after_overwrites() {
    let dir = TempDir::new().unwrap();
    let config = DbConfig {
        memtable_size: 16 * 1024,
        l0_compaction_trigger: 2,
        level0_size: 64 * 1024,
        ..DbConfig::default()
    };
    let db = Db::open(dir.path(), config).unwrap();

    let value = vec![0x5A_u8; 100];
    for _generation in 0..10 {
        for i in 0..1000u32 {
            db.put(format!("key{i:04}").into_bytes(), value.clone())
                .unwrap();
        }
    }

    // Quiesce: fold everything into the tree.
    db.compact_range(b"\x00", b"\xff\xff").unwrap();

    let unique_generation_bytes: u64 = 1000 * (7 + 100);
    let live = total_sst_bytes(&db);
    assert!(
        live <= unique_generation_bytes * 2,
        "{live} live bytes exceed 2x one generation ({unique_generation_bytes})"
    );

    for i in (0..1000u32).step_by(101) {
        assert_eq!(
            db.get(format!("key{i:04}").as_bytes()).unwrap(),
            Some(value.clone())
        );
    }

    db.close().unwrap();
}

/// # Scenario
/// `compact_range` any number of times never changes the visible mapping.
#[test]
fn manual_compaction_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), DbConfig::default()).unwrap();

    for i in 0..300u32 {
        db.put(format!("k{i:04}").into_bytes(), format!("v{i}").into_bytes())
            .unwrap();
    }
    db.delete(b"k0100").unwrap();

    let baseline: Vec<_> = db.range(b"\x00", b"\xff\xff").unwrap().collect();
    for _ in 0..3 {
        db.compact_range(b"\x00", b"\xff\xff").unwrap();
        let now: Vec<_> = db.range(b"\x00", b"\xff\xff").unwrap().collect();
        assert_eq!(baseline, now);
    }

    db.close().unwrap();
}

// ================================================================================================
// Durability
// ================================================================================================

/// # Scenario
/// With `WalSyncMode::Always`, every acknowledged write must be present
/// after an unclean shutdown (handle dropped without close), across many
/// kill/reopen rounds.
#[test]
fn acknowledged_writes_survive_unclean_shutdown() {
    let dir = TempDir::new().unwrap();
    let config = DbConfig {
        wal_sync_mode: WalSyncMode::Always,
        ..small_buffer_config()
    };

    let mut expected: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
    for round in 0..25u32 {
        let db = Db::open(dir.path(), config.clone()).unwrap();
        for i in 0..20u32 {
            let key = format!("r{round:02}-k{i:02}").into_bytes();
            let value = format!("value-{round}-{i}").into_bytes();
            db.put(key.clone(), value.clone()).unwrap();
            expected.insert(key, value);
        }
        drop(db); // simulated crash
    }

    let db = Db::open(dir.path(), config).unwrap();
    for (key, value) in &expected {
        assert_eq!(
            db.get(key).unwrap().as_ref(),
            Some(value),
            "lost {}",
            String::from_utf8_lossy(key)
        );
    }
    db.close().unwrap();
}

/// # Scenario
/// A cleanly closed database reopens with the exact same mapping.
#[test]
fn reopen_equals_original_mapping() {
    let dir = TempDir::new().unwrap();

    let before: Vec<(Vec<u8>, Vec<u8>)> = {
        let db = Db::open(dir.path(), small_buffer_config()).unwrap();
        for i in 0..500u32 {
            db.put(format!("key{i:04}").into_bytes(), vec![(i % 251) as u8; 40])
                .unwrap();
        }
        for i in (0..500u32).step_by(7) {
            db.delete(format!("key{i:04}").into_bytes()).unwrap();
        }
        let all = db.range(b"\x00", b"\xff\xff").unwrap().collect();
        db.close().unwrap();
        all
    };

    let db = Db::open(dir.path(), small_buffer_config()).unwrap();
    let after: Vec<(Vec<u8>, Vec<u8>)> = db.range(b"\x00", b"\xff\xff").unwrap().collect();
    assert_eq!(before, after);
    db.close().unwrap();
}

// ================================================================================================
// Bloom effectiveness
// ================================================================================================

/// # Scenario
/// After flushing 10000 keys, lookups of 10000 absent keys should read
/// data blocks at a rate of at most 3% thanks to the bloom filters.
#[test]
fn bloom_filters_short_circuit_absent_keys() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), DbConfig::default()).unwrap();

    for i in 0..10_000u32 {
        db.put(format!("key-{i:05}-p").into_bytes(), b"v".to_vec())
            .unwrap();
    }
    // Everything onto disk; the memtable must not answer for us.
    db.compact_range(b"\x00", b"\xff\xff").unwrap();

    // Absent keys interleaved with the present ones, so lookups reach the
    // table (its key range covers them) and only the bloom can say no.
    let before = db.stats().unwrap();
    for i in 0..10_000u32 {
        assert_eq!(db.get(format!("key-{i:05}-x").as_bytes()).unwrap(), None);
    }
    let after = db.stats().unwrap();

    let block_reads = after.table_point_reads - before.table_point_reads;
    let candidates = block_reads + (after.bloom_negatives - before.bloom_negatives);
    assert!(candidates > 0, "lookups never consulted a table");
    let rate = block_reads as f64 / candidates as f64;
    assert!(
        rate <= 0.03,
        "absent keys read blocks at {rate:.4} (> 3%): {block_reads}/{candidates}"
    );

    db.close().unwrap();
}

// ================================================================================================
// Atomic batches
// ================================================================================================

/// # Scenario
/// A mixed batch lands atomically and in order.
#[test]
fn batch_write_is_atomic_and_ordered() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), DbConfig::default()).unwrap();

    db.put(b"old", b"1").unwrap();

    let mut batch = WriteBatch::new();
    batch
        .put(b"a", b"1")
        .delete(b"old")
        .put(b"a", b"2") // later op in the same batch wins
        .put(b"b", b"3");
    db.batch_write(batch).unwrap();

    assert_eq!(db.get(b"a").unwrap(), Some(b"2".to_vec()));
    assert_eq!(db.get(b"b").unwrap(), Some(b"3".to_vec()));
    assert_eq!(db.get(b"old").unwrap(), None);

    db.close().unwrap();
}

// ================================================================================================
// Boundary behaviors
// ================================================================================================

/// # Scenario
/// The documented input limits: empty keys rejected, maximum-length keys
/// accepted, empty values fine.
#[test]
fn input_boundaries() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), DbConfig::default()).unwrap();

    assert!(matches!(
        db.put(Vec::new(), b"v".to_vec()),
        Err(DbError::InvalidArgument(_))
    ));

    let max_key = vec![b'x'; 64 * 1024];
    db.put(max_key.clone(), Vec::new()).unwrap();
    assert_eq!(db.get(&max_key).unwrap(), Some(Vec::new()));

    db.close().unwrap();
}

// ================================================================================================
// Concurrency
// ================================================================================================

/// # Scenario
/// Eight writer threads on disjoint key spaces, flushing under a small
/// buffer; every acknowledged write must be readable afterwards.
#[test]
fn concurrent_writers_do_not_lose_data() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), small_buffer_config()).unwrap();

    let mut handles = Vec::new();
    for t in 0..8u32 {
        let db = db.clone();
        handles.push(thread::spawn(move || {
            for i in 0..200u32 {
                db.put(
                    format!("t{t}-key{i:04}").into_bytes(),
                    format!("t{t}-val{i:04}").into_bytes(),
                )
                .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    for t in 0..8u32 {
        for i in (0..200u32).step_by(23) {
            assert_eq!(
                db.get(format!("t{t}-key{i:04}").as_bytes()).unwrap(),
                Some(format!("t{t}-val{i:04}").into_bytes())
            );
        }
    }

    db.close().unwrap();
}

/// # Scenario
/// Readers iterate while writers churn; each scan must be internally
/// consistent (sorted, no duplicates).
#[test]
fn concurrent_readers_see_consistent_scans() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), small_buffer_config()).unwrap();

    for i in 0..300u32 {
        db.put(format!("stable{i:04}").into_bytes(), b"v".to_vec())
            .unwrap();
    }

    let writer = {
        let db = db.clone();
        thread::spawn(move || {
            for i in 0..500u32 {
                db.put(format!("churn{i:05}").into_bytes(), vec![0u8; 64])
                    .unwrap();
            }
        })
    };

    for _ in 0..20 {
        let keys: Vec<Vec<u8>> = db
            .range(b"stable", b"stable\xff")
            .unwrap()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys.len(), 300);
        let mut sorted = keys.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(keys, sorted);
    }

    writer.join().unwrap();
    db.close().unwrap();
}
