//! Executor tests: newest-wins merge, tombstone handling, output rolling.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use crate::compaction::{CompactionTask, execute};
use crate::config::DbConfig;
use crate::db::utils::Record;
use crate::db::filename;
use crate::sstable::{Table, TableBuilder, TableGet, TableMeta};
use tempfile::TempDir;

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

fn build(dir: &std::path::Path, file_number: u64, records: &[Record]) -> (TableMeta, Arc<Table>) {
    let path = filename::table_path(dir, file_number);
    let mut builder = TableBuilder::new(&path, file_number, 4096, 10).unwrap();
    for record in records {
        builder.add(record).unwrap();
    }
    let meta = builder.finish().unwrap();
    let table = Arc::new(Table::open(&path).unwrap());
    (meta, table)
}

fn config() -> DbConfig {
    DbConfig::default()
}

fn task(level: u32, inputs: Vec<TableMeta>, next_inputs: Vec<TableMeta>) -> CompactionTask {
    CompactionTask {
        level,
        inputs,
        next_inputs,
    }
}

#[test]
fn newest_version_wins_across_inputs() {
    let tmp = TempDir::new().unwrap();

    // Newer L0 table overwrites keys from an older one.
    let (meta_new, table_new) = build(
        tmp.path(),
        1,
        &[put(b"a", b"new-a", 10), put(b"b", b"new-b", 11)],
    );
    let (meta_old, table_old) = build(
        tmp.path(),
        2,
        &[put(b"a", b"old-a", 1), put(b"c", b"old-c", 2)],
    );

    let next_file = AtomicU64::new(100);
    let outputs = execute(
        &task(0, vec![meta_new, meta_old], vec![]),
        vec![table_new, table_old],
        tmp.path(),
        &next_file,
        &config(),
        &|_| false,
    )
    .unwrap();

    assert_eq!(outputs.len(), 1);
    let out = Table::open(filename::table_path(tmp.path(), outputs[0].file_number)).unwrap();

    assert_eq!(
        out.get(b"a", u64::MAX).unwrap(),
        TableGet::Put {
            value: b"new-a".to_vec(),
            seq: 10,
        }
    );
    assert_eq!(
        out.get(b"b", u64::MAX).unwrap(),
        TableGet::Put {
            value: b"new-b".to_vec(),
            seq: 11,
        }
    );
    assert_eq!(
        out.get(b"c", u64::MAX).unwrap(),
        TableGet::Put {
            value: b"old-c".to_vec(),
            seq: 2,
        }
    );
}

#[test]
fn tombstone_dropped_when_nothing_lives_below() {
    let tmp = TempDir::new().unwrap();

    let (meta_a, table_a) = build(tmp.path(), 1, &[delete(b"dead", 10), put(b"live", b"v", 11)]);
    let (meta_b, table_b) = build(tmp.path(), 2, &[put(b"dead", b"old", 1)]);

    let next_file = AtomicU64::new(100);
    let outputs = execute(
        &task(0, vec![meta_a, meta_b], vec![]),
        vec![table_a, table_b],
        tmp.path(),
        &next_file,
        &config(),
        // Nothing below the output level holds these keys.
        &|_| false,
    )
    .unwrap();

    assert_eq!(outputs.len(), 1);
    let out = Table::open(filename::table_path(tmp.path(), outputs[0].file_number)).unwrap();

    // The tombstone and the version it masked are both gone.
    assert_eq!(out.get(b"dead", u64::MAX).unwrap(), TableGet::NotFound);
    assert!(matches!(
        out.get(b"live", u64::MAX).unwrap(),
        TableGet::Put { .. }
    ));
}

#[test]
fn tombstone_kept_while_key_may_live_below() {
    let tmp = TempDir::new().unwrap();

    let (meta_a, table_a) = build(tmp.path(), 1, &[delete(b"dead", 10)]);

    let next_file = AtomicU64::new(100);
    let outputs = execute(
        &task(0, vec![meta_a], vec![]),
        vec![table_a],
        tmp.path(),
        &next_file,
        &config(),
        // A deeper level may still hold an older version of "dead".
        &|key: &[u8]| key == b"dead",
    )
    .unwrap();

    assert_eq!(outputs.len(), 1);
    let out = Table::open(filename::table_path(tmp.path(), outputs[0].file_number)).unwrap();
    assert_eq!(out.get(b"dead", u64::MAX).unwrap(), TableGet::Delete { seq: 10 });
}

#[test]
fn outputs_roll_at_target_size() {
    let tmp = TempDir::new().unwrap();

    let records: Vec<Record> = (0..500)
        .map(|i| put(format!("key{i:04}").as_bytes(), &[0xAB; 100], i + 1))
        .collect();
    let (meta, table) = build(tmp.path(), 1, &records);

    let next_file = AtomicU64::new(100);
    let small_outputs = DbConfig {
        target_sst_size: 8 * 1024,
        ..DbConfig::default()
    };
    let outputs = execute(
        &task(0, vec![meta], vec![]),
        vec![table],
        tmp.path(),
        &next_file,
        &small_outputs,
        &|_| false,
    )
    .unwrap();

    assert!(outputs.len() > 1, "expected several rolled outputs");

    // Outputs are disjoint and ordered; together they hold every record.
    let mut total = 0usize;
    for pair in outputs.windows(2) {
        assert!(pair[0].largest_key < pair[1].smallest_key);
    }
    for meta in &outputs {
        let table = Table::open(filename::table_path(tmp.path(), meta.file_number)).unwrap();
        total += table.iter(b"", None).unwrap().count();
    }
    assert_eq!(total, 500);
}

#[test]
fn all_tombstones_can_leave_no_output() {
    let tmp = TempDir::new().unwrap();

    let (meta_a, table_a) = build(tmp.path(), 1, &[delete(b"x", 5), delete(b"y", 6)]);

    let next_file = AtomicU64::new(100);
    let outputs = execute(
        &task(0, vec![meta_a], vec![]),
        vec![table_a],
        tmp.path(),
        &next_file,
        &config(),
        &|_| false,
    )
    .unwrap();

    assert!(outputs.is_empty());
}
