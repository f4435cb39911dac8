//! # Memtable Module
//!
//! The in-memory write buffer of the storage engine.
//!
//! ## Design Invariants
//!
//! - All writes are WAL-first: a mutation is appended to the memtable's WAL
//!   segment before it becomes visible in memory.
//! - The memtable may hold multiple versions per key; within a key,
//!   versions are ordered by descending sequence number and a read at
//!   snapshot `S` resolves to the largest `seq ≤ S`.
//! - Deletes are tombstone entries, not physical removal.
//! - The approximate size is the cumulative encoded size of every record
//!   accepted, which is what the rotation threshold compares against.
//!
//! ## Rotation and flush
//!
//! The facade rotates a full memtable onto its immutable list and flushes
//! it to a level-0 SSTable in the background. [`Memtable::iter_for_flush`]
//! yields the newest version of every key in ascending key order — exactly
//! the stream the table builder accepts. Flushing never mutates the
//! memtable; the WAL segment is deleted by the facade only after the
//! manifest records the new table.
//!
//! ## Concurrency
//!
//! Mutations are only issued by the facade's single writer on the *active*
//! memtable. Readers may hit any memtable (active or immutable) at any
//! time; the interior `RwLock` keeps the tree consistent, and reads resolve
//! against their snapshot sequence so a half-published batch is never
//! observed.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    cmp::Reverse,
    collections::BTreeMap,
    path::Path,
    sync::RwLock,
};

use crate::config::WalSyncMode;
use crate::db::utils::Record;
use crate::wal::{Wal, WalError};
use thiserror::Error;
use tracing::{error, info, trace};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Memtable`] operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// Underlying WAL failure.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Entry types
// ------------------------------------------------------------------------------------------------

/// A single versioned entry stored in the memtable.
///
/// `value: None` is a tombstone. A key may have multiple entries, one per
/// sequence number; the highest-seq entry at or below the reader's
/// snapshot is authoritative.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MemtableEntry {
    /// The stored value. `None` indicates a deletion (tombstone).
    pub value: Option<Vec<u8>>,

    /// Sequence number of this version.
    pub seq: u64,
}

/// Result of a `get` against a single memtable.
///
/// `Delete` is distinct from `NotFound`: a tombstone is an authoritative
/// answer that masks older versions in deeper layers, while `NotFound`
/// means this memtable has no information and the lookup must continue.
#[derive(Debug, PartialEq, Eq)]
pub enum MemtableGetResult {
    /// Value found for the key.
    Put(Vec<u8>),

    /// Key was deleted at or below the snapshot.
    Delete,

    /// No version of the key at or below the snapshot.
    NotFound,
}

/// Internal shared state of the memtable.
struct MemtableInner {
    /// Point entries grouped by key, then ordered by descending seq.
    tree: BTreeMap<Vec<u8>, BTreeMap<Reverse<u64>, MemtableEntry>>,

    /// Cumulative encoded size of accepted records.
    approximate_size: usize,

    /// Highest sequence number applied or replayed.
    max_seq: u64,
}

// ------------------------------------------------------------------------------------------------
// Memtable Core
// ------------------------------------------------------------------------------------------------

/// The in-memory ordered write buffer, coupled to one WAL segment.
///
/// Shared as `Arc<Memtable>`: the facade's active/immutable lists and every
/// read snapshot hold clones, so a memtable outlives its rotation for as
/// long as any reader needs it.
pub struct Memtable {
    /// Thread-safe container for in-memory data and bookkeeping.
    inner: RwLock<MemtableInner>,

    /// The WAL segment that makes this memtable durable.
    wal: Wal<Record>,
}

impl Memtable {
    /// Opens a memtable backed by the WAL segment at `wal_path`.
    ///
    /// Replays any existing frames to reconstruct in-memory state. Records
    /// with `seq ≤ min_seq` are skipped — they belong to data already
    /// flushed to SSTables (the manifest's `last_sequence` at recovery).
    ///
    /// Replay stops cleanly at the first truncated or corrupt frame; the
    /// valid prefix is kept, matching the crash-recovery contract.
    pub fn open<P: AsRef<Path>>(
        wal_path: P,
        segment_number: u64,
        min_seq: u64,
        sync_mode: WalSyncMode,
    ) -> Result<Self, MemtableError> {
        let wal = Wal::open(&wal_path, segment_number, None, sync_mode)?;

        let mut inner = MemtableInner {
            tree: BTreeMap::new(),
            approximate_size: 0,
            max_seq: 0,
        };

        let mut replayed: u64 = 0;
        let mut skipped: u64 = 0;

        let mut iter = wal.replay_iter();
        let mut good_offset = crate::wal::WalHeader::HEADER_DISK_SIZE as u64;
        loop {
            let record: Record = match iter.next() {
                None => break,
                Some(Ok(record)) => {
                    good_offset = iter.offset();
                    record
                }
                Some(Err(e @ (WalError::Io(_) | WalError::Internal(_)))) => {
                    return Err(e.into());
                }
                Some(Err(e)) => {
                    // Torn or corrupt tail from a crash; keep everything
                    // before it and cut the file there so later appends
                    // stay reachable.
                    tracing::warn!(
                        segment = segment_number,
                        replayed,
                        error = %e,
                        "WAL replay stopped at damaged frame"
                    );
                    wal.truncate_to(good_offset)?;
                    break;
                }
            };

            if record.seq() <= min_seq {
                skipped += 1;
                continue;
            }

            Self::insert_inner(&mut inner, record);
            replayed += 1;
        }

        info!(
            segment = segment_number,
            replayed, skipped, max_seq = inner.max_seq,
            "memtable initialised from WAL"
        );

        Ok(Self {
            inner: RwLock::new(inner),
            wal,
        })
    }

    /// Applies a batch of records: WAL first, then the in-memory tree.
    ///
    /// All frames of the batch are written contiguously and the sync policy
    /// runs once, so the batch is durable (per the configured mode) before
    /// any of it is visible in memory. The caller (the facade's single
    /// writer) is responsible for rotation checks and sequence assignment.
    pub fn apply(&self, records: &[Record]) -> Result<(), MemtableError> {
        if records.is_empty() {
            return Ok(());
        }

        // 1. WAL first (crash safety).
        self.wal.append_all(records)?;

        // 2. In-memory update.
        let mut guard = self.inner.write().map_err(|_| {
            error!("memtable lock poisoned during apply");
            MemtableError::Internal("RwLock poisoned".into())
        })?;

        for record in records {
            trace!(key = %HexKey(record.key()), seq = record.seq(), "memtable insert");
            Self::insert_inner(&mut guard, record.clone());
        }

        Ok(())
    }

    fn insert_inner(inner: &mut MemtableInner, record: Record) {
        inner.approximate_size += encoded_record_size(&record);
        if record.seq() > inner.max_seq {
            inner.max_seq = record.seq();
        }

        let (key, entry) = match record {
            Record::Put { key, value, seq } => (
                key,
                MemtableEntry {
                    value: Some(value),
                    seq,
                },
            ),
            Record::Delete { key, seq } => (key, MemtableEntry { value: None, seq }),
        };

        inner
            .tree
            .entry(key)
            .or_insert_with(BTreeMap::new)
            .insert(Reverse(entry.seq), entry);
    }

    /// Resolves a key against this memtable at the given snapshot.
    ///
    /// Returns the entry with the largest `seq ≤ snapshot_seq`, or
    /// `NotFound` when no such version exists here.
    pub fn get(&self, key: &[u8], snapshot_seq: u64) -> Result<MemtableGetResult, MemtableError> {
        let guard = self.inner.read().map_err(|_| {
            error!("memtable lock poisoned during get");
            MemtableError::Internal("RwLock poisoned".into())
        })?;

        let entry = guard.tree.get(key).and_then(|versions| {
            versions
                .range(Reverse(snapshot_seq)..)
                .next()
                .map(|(_, e)| e)
        });

        match entry {
            None => Ok(MemtableGetResult::NotFound),
            Some(entry) => match &entry.value {
                Some(value) => Ok(MemtableGetResult::Put(value.clone())),
                None => Ok(MemtableGetResult::Delete),
            },
        }
    }

    /// Scans `[start, end)` at the given snapshot.
    ///
    /// Yields one [`Record`] per key — the newest version with
    /// `seq ≤ snapshot_seq` — in ascending key order. Tombstones are
    /// included so that upper layers can mask older data beneath them.
    /// `end = None` means unbounded.
    pub fn scan(
        &self,
        start: &[u8],
        end: Option<&[u8]>,
        snapshot_seq: u64,
    ) -> Result<std::vec::IntoIter<Record>, MemtableError> {
        let guard = self.inner.read().map_err(|_| {
            error!("memtable lock poisoned during scan");
            MemtableError::Internal("RwLock poisoned".into())
        })?;

        let mut records = Vec::new();

        let range: Box<dyn Iterator<Item = (&Vec<u8>, &BTreeMap<Reverse<u64>, MemtableEntry>)> + '_> =
            match end {
                Some(end) => {
                    if start >= end {
                        return Ok(Vec::new().into_iter());
                    }
                    Box::new(guard.tree.range(start.to_vec()..end.to_vec()))
                }
                None => Box::new(guard.tree.range(start.to_vec()..)),
            };

        for (key, versions) in range {
            let Some((_, entry)) = versions.range(Reverse(snapshot_seq)..).next() else {
                continue; // every version is newer than the snapshot
            };

            records.push(match &entry.value {
                Some(value) => Record::Put {
                    key: key.clone(),
                    value: value.clone(),
                    seq: entry.seq,
                },
                None => Record::Delete {
                    key: key.clone(),
                    seq: entry.seq,
                },
            });
        }

        Ok(records.into_iter())
    }

    /// Returns the flush stream: the newest version of every key, in
    /// ascending key order.
    ///
    /// Older duplicate versions are omitted — they are unreachable once
    /// this memtable's contents are the newest data below the active one.
    /// Does not mutate in-memory state; the table builder consumes this.
    pub fn iter_for_flush(&self) -> Result<std::vec::IntoIter<Record>, MemtableError> {
        let guard = self.inner.read().map_err(|_| {
            error!("memtable lock poisoned during iter_for_flush");
            MemtableError::Internal("RwLock poisoned".into())
        })?;

        let mut records = Vec::with_capacity(guard.tree.len());

        for (key, versions) in guard.tree.iter() {
            if let Some((_, entry)) = versions.iter().next() {
                records.push(match &entry.value {
                    Some(value) => Record::Put {
                        key: key.clone(),
                        value: value.clone(),
                        seq: entry.seq,
                    },
                    None => Record::Delete {
                        key: key.clone(),
                        seq: entry.seq,
                    },
                });
            }
        }

        Ok(records.into_iter())
    }

    /// Cumulative encoded size of all accepted records, in bytes.
    pub fn approximate_size(&self) -> usize {
        self.inner
            .read()
            .map(|g| g.approximate_size)
            .unwrap_or(usize::MAX)
    }

    /// Highest sequence number applied or replayed. 0 when empty.
    pub fn max_seq(&self) -> u64 {
        self.inner.read().map(|g| g.max_seq).unwrap_or(0)
    }

    /// Returns `true` when no records have been accepted.
    pub fn is_empty(&self) -> bool {
        self.inner.read().map(|g| g.tree.is_empty()).unwrap_or(true)
    }

    /// The segment number of the backing WAL.
    pub fn segment_number(&self) -> u64 {
        self.wal.segment_number()
    }

    /// Path of the backing WAL segment.
    pub fn wal_path(&self) -> &Path {
        self.wal.path()
    }

    /// Forces an fsync of the backing WAL regardless of sync policy.
    pub fn sync_wal(&self) -> Result<(), MemtableError> {
        self.wal.sync()?;
        Ok(())
    }
}

/// Encoded size of a record as written to the WAL: op tag, two length
/// prefixes, key, value, and sequence number.
fn encoded_record_size(record: &Record) -> usize {
    let value_len = match record {
        Record::Put { value, .. } => value.len(),
        Record::Delete { .. } => 0,
    };
    1 + 4 + record.key().len() + 4 + value_len + 8
}

// ------------------------------------------------------------------------------------------------
// Tracing Helper
// ------------------------------------------------------------------------------------------------

/// Renders a key as bounded-length hex for trace output.
struct HexKey<'a>(&'a [u8]);

impl std::fmt::Display for HexKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.len() <= 32 {
            for byte in self.0 {
                write!(f, "{byte:02x}")?;
            }
        } else {
            for byte in &self.0[..16] {
                write!(f, "{byte:02x}")?;
            }
            write!(f, "...[{} bytes]", self.0.len())?;
        }
        Ok(())
    }
}
