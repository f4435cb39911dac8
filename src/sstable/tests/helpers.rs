//! Shared helpers for SSTable unit tests.

use std::path::{Path, PathBuf};

use crate::db::utils::Record;
use crate::sstable::{Table, TableBuilder, TableMeta};

/// Initialize a tracing subscriber controlled by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn put(key: &[u8], value: &[u8], seq: u64) -> Record {
    Record::Put {
        key: key.to_vec(),
        value: value.to_vec(),
        seq,
    }
}

pub fn delete(key: &[u8], seq: u64) -> Record {
    Record::Delete {
        key: key.to_vec(),
        seq,
    }
}

/// Builds a table at `dir/<file_number>.sst` from already-sorted records.
pub fn build_table(
    dir: &Path,
    file_number: u64,
    records: &[Record],
    block_size: usize,
    bits_per_key: u32,
) -> (PathBuf, TableMeta) {
    init_tracing();
    let path = dir.join(format!("{file_number:06}.sst"));
    let mut builder = TableBuilder::new(&path, file_number, block_size, bits_per_key).unwrap();
    for record in records {
        builder.add(record).unwrap();
    }
    let meta = builder.finish().unwrap();
    (path, meta)
}

/// Sorted `keyNNNN → valNNNN` records with consecutive sequence numbers.
pub fn numbered_records(count: usize) -> Vec<Record> {
    (0..count)
        .map(|i| put(
            format!("key{i:04}").as_bytes(),
            format!("val{i:04}").as_bytes(),
            (i + 1) as u64,
        ))
        .collect()
}

/// Opens a built table for reading.
pub fn open_table(path: &Path) -> Table {
    Table::open(path).unwrap()
}
