//! # Database Facade
//!
//! The public face of the storage engine. [`Db`] owns every component —
//! memtables, WAL segments, tables, manifest, background compactor — and
//! coordinates them under a small set of locks.
//!
//! ## Write path
//!
//! `put` / `delete` / `batch_write` serialize under one **writer mutex**.
//! The writer assigns contiguous sequence numbers, appends all frames of
//! the batch to the active memtable's WAL (fsynced per the configured
//! sync mode), applies them in memory, and only then publishes the new
//! `visible_seq`. Plain reads snapshot `visible_seq`, so a batch is either
//! fully visible or not at all.
//!
//! When the active memtable crosses `memtable_size` it is rotated onto the
//! immutable list and the background worker flushes it to a level-0 table.
//! Backpressure: rotation waits while too many immutables are pending,
//! writes slow down at `l0_slowdown` L0 files and fail with `Busy` at
//! `l0_stop`.
//!
//! ## Read path
//!
//! Readers never take the writer mutex. A read captures a [`ReadView`] —
//! `{active, immutables, version, seq}` — under the memtable-switch and
//! version mutexes, then resolves with no further locking:
//! active → immutables (newest first) → L0 (by `largest_seq`) → L1..Lmax
//! (bloom filter → index → block). Range queries merge all sources through
//! a k-way heap and a visibility filter.
//!
//! ## Lock order
//!
//! `state < write_mutex < compaction_lock < mem < versions`; no path takes
//! them out of order, and no lock is held across data-block I/O except the
//! writer mutex (by design — the single writer *is* the serialization
//! point).
//!
//! ## Lifecycle
//!
//! `Closed → Opening → Open → Closing → Closed`. Only `Open` accepts
//! operations. `close` stops the compactor at a job boundary, drains
//! in-flight writes, flushes remaining immutables, checkpoints the
//! manifest, and releases the directory lock; it is idempotent.

pub mod filename;
pub mod utils;

mod compactor;
mod encoding_impls;
mod version;

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crossbeam::channel::{Sender, bounded};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::compaction::{self, CompactionError, CompactionTask};
use crate::config::{DbConfig, MAX_KEY_LEN, MAX_VALUE_LEN};
use crate::manifest::{AddedFile, Manifest, ManifestError, RemovedFile, VersionEdit};
use crate::memtable::{Memtable, MemtableError, MemtableGetResult};
use crate::sstable::{TableBuilder, TableError, TableGet, TableIter};
use crate::wal::WalError;

use filename::{CURRENT_FILE, FileKind, LOCK_FILE};
use utils::{MergeIterator, Record};
use version::{LevelTable, TABLE_CACHE_CAPACITY, TableCache, Version};

/// How many rotated memtables may wait for flush before writers block.
const MAX_IMMUTABLES: usize = 2;

/// Per-write pause once L0 reaches `l0_slowdown`.
const SLOWDOWN_PAUSE: Duration = Duration::from_millis(1);

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by database operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DbError {
    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// On-disk state violates the format (CRC mismatch, bad magic,
    /// malformed manifest or table).
    #[error("Corruption: {0}")]
    Corruption(String),

    /// Rejected input: empty key, oversized key or value, bad option.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The database is not in the `Open` state.
    #[error("Database is not open")]
    NotOpen,

    /// Another handle holds the directory lock.
    #[error("Database is already open (LOCK held)")]
    AlreadyOpen,

    /// Write backpressure: L0 is at `l0_stop`, or the flush pipeline is
    /// unavailable.
    #[error("Too many level-0 files; retry later")]
    Busy,

    /// The store is in read-only mode — either opened that way or
    /// degraded after a WAL write failure.
    #[error("Database is read-only")]
    ReadOnly,

    /// WAL subsystem failure.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Memtable subsystem failure.
    #[error("Memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// SSTable subsystem failure.
    #[error("SSTable error: {0}")]
    Table(#[from] TableError),

    /// Manifest subsystem failure.
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Compaction failure.
    #[error("Compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// Internal invariant violation (poisoned lock, impossible state).
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Lifecycle
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbState {
    Open,
    Closing,
    Closed,
}

// ------------------------------------------------------------------------------------------------
// WriteBatch
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// An atomic group of mutations.
///
/// All operations of a batch receive contiguous sequence numbers and
/// become visible together — readers never observe a prefix.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an insert or overwrite.
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Queues a deletion.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::Delete { key: key.into() });
        self
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns `true` when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

// ------------------------------------------------------------------------------------------------
// Statistics
// ------------------------------------------------------------------------------------------------

/// Internal atomic counters; snapshotted by [`Db::stats`].
#[derive(Debug, Default)]
struct Counters {
    gets: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
    batch_writes: AtomicU64,
    bloom_negatives: AtomicU64,
    table_point_reads: AtomicU64,
    memtable_flushes: AtomicU64,
    compactions: AtomicU64,
}

/// Per-level shape of the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelStats {
    /// Number of live table files in the level.
    pub files: usize,

    /// Total bytes of those files.
    pub bytes: u64,
}

/// Counter snapshot returned by [`Db::stats`].
#[derive(Debug, Clone)]
pub struct DbStats {
    /// Point lookups served.
    pub gets: u64,
    /// Single-key puts accepted.
    pub puts: u64,
    /// Single-key deletes accepted.
    pub deletes: u64,
    /// Batches accepted via `batch_write`.
    pub batch_writes: u64,
    /// Table lookups skipped by a bloom-filter negative.
    pub bloom_negatives: u64,
    /// Table lookups that actually read data blocks.
    pub table_point_reads: u64,
    /// Memtables flushed to level 0.
    pub memtable_flushes: u64,
    /// Compactions executed (background and manual).
    pub compactions: u64,
    /// Shape of each level.
    pub levels: Vec<LevelStats>,
    /// Rotated memtables awaiting flush.
    pub immutable_memtables: usize,
    /// Approximate size of the active memtable in bytes.
    pub active_memtable_bytes: usize,
}

// ------------------------------------------------------------------------------------------------
// Shared state
// ------------------------------------------------------------------------------------------------

/// The (active, immutables) pair, guarded by `DbCore::mem`.
struct MemView {
    active: Arc<Memtable>,
    /// Newest-first.
    immutables: Vec<Arc<Memtable>>,
}

/// Version pointer plus manifest, guarded by `DbCore::versions`.
struct VersionState {
    manifest: Manifest,
    current: Arc<Version>,
    /// Round-robin cursors for the compaction picker, one per level.
    compact_ptrs: Vec<Vec<u8>>,
}

/// A consistent snapshot of every read source.
///
/// Cheap to clone (five `Arc`s and a seq); holding one pins its memtables
/// and tables past any rotation, flush, or compaction.
#[derive(Clone)]
struct ReadView {
    active: Arc<Memtable>,
    immutables: Vec<Arc<Memtable>>,
    version: Arc<Version>,
    seq: u64,
}

/// A pinned sequence number with the read sources that serve it.
///
/// Obtained from [`Db::snapshot`]; released by dropping. Snapshots do not
/// survive closing the database.
pub struct Snapshot {
    view: ReadView,
}

impl Snapshot {
    /// The sequence number this snapshot reads at.
    pub fn sequence(&self) -> u64 {
        self.view.seq
    }
}

/// Background-worker plumbing.
struct CompactorHandle {
    wake_tx: Sender<()>,
    shutdown: Arc<AtomicBool>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

/// All shared engine state. `Db` handles are thin `Arc`s onto this.
pub(crate) struct DbCore {
    config: DbConfig,
    dir: PathBuf,

    /// Held for the lifetime of the handle; dropped (unlocking) at close.
    lock_file: Mutex<Option<File>>,

    state: Mutex<DbState>,

    /// Serializes all mutations.
    write_mutex: Mutex<()>,

    /// Serializes flush and compaction jobs.
    compaction_lock: Mutex<()>,

    mem: Mutex<MemView>,
    /// Signalled after each flush so rotation backpressure can retry.
    mem_cv: Condvar,

    versions: Mutex<VersionState>,

    table_cache: TableCache,

    /// Database-wide file-number counter (WAL segments and tables).
    next_file_number: AtomicU64,

    /// Last sequence number assigned to a record.
    last_sequence: AtomicU64,

    /// Last sequence number published to readers.
    visible_seq: AtomicU64,

    /// Set on WAL append failure; all further writes are rejected.
    read_only: AtomicBool,

    counters: Counters,

    compactor: CompactorHandle,
}

// ------------------------------------------------------------------------------------------------
// Db — public handle
// ------------------------------------------------------------------------------------------------

/// An open database handle.
///
/// Cloning is cheap and all clones share one engine; the handle is `Send`
/// and `Sync`, so it can be used from any number of threads.
pub struct Db {
    core: Arc<DbCore>,
}

impl Clone for Db {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl Db {
    /// Opens (or creates) a database rooted at `path`.
    ///
    /// Recovery sequence: validate config → take the directory lock →
    /// replay the manifest named by `CURRENT` → sweep orphan files →
    /// replay WAL segments at or above the manifest's `log_number`
    /// (skipping records already durable in tables) → start the background
    /// compactor.
    pub fn open(path: impl AsRef<Path>, config: DbConfig) -> Result<Db, DbError> {
        config.validate().map_err(DbError::InvalidArgument)?;

        let dir = path.as_ref().to_path_buf();
        if !dir.exists() {
            if !config.create_if_missing {
                return Err(DbError::InvalidArgument(format!(
                    "database {} does not exist and create_if_missing is off",
                    dir.display()
                )));
            }
            fs::create_dir_all(&dir)?;
        } else if config.error_if_exists && dir.join(CURRENT_FILE).exists() {
            return Err(DbError::InvalidArgument(format!(
                "database {} already exists and error_if_exists is on",
                dir.display()
            )));
        }

        // Advisory lock; released by the OS on process death, so a crashed
        // process never wedges its database.
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(dir.join(LOCK_FILE))?;
        match lock_file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => return Err(DbError::AlreadyOpen),
            Err(TryLockError::Error(e)) => return Err(DbError::Io(e)),
        }

        info!(path = %dir.display(), "opening database");

        let manifest = Manifest::open(&dir, config.max_level)?;
        let state = manifest.state()?;

        // One directory sweep: discover WAL segments, spot orphans, and
        // re-base the file-number counter past everything on disk.
        let mut wal_numbers: Vec<u64> = Vec::new();
        let mut table_numbers: Vec<u64> = Vec::new();
        let mut manifest_numbers: Vec<u64> = Vec::new();
        let mut temp_files: Vec<PathBuf> = Vec::new();
        let mut max_file_number: u64 = 0;

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            match filename::parse_file_name(name) {
                FileKind::Wal(n) => {
                    wal_numbers.push(n);
                    max_file_number = max_file_number.max(n);
                }
                FileKind::Table(n) => {
                    table_numbers.push(n);
                    max_file_number = max_file_number.max(n);
                }
                // Manifests draw from the same counter as WALs and
                // tables; a stale one left by a crashed checkpoint must
                // still push the counter forward.
                FileKind::Manifest(n) => {
                    manifest_numbers.push(n);
                    max_file_number = max_file_number.max(n);
                }
                FileKind::Temp => temp_files.push(entry.path()),
                _ => {}
            }
        }

        if !config.read_only {
            for path in temp_files {
                warn!(path = %path.display(), "removing interrupted temp file");
                let _ = fs::remove_file(path);
            }

            // Tables the manifest does not know are debris from a crash
            // between build and commit.
            let live: HashSet<u64> = state.live_files().into_iter().collect();
            for n in &table_numbers {
                if !live.contains(n) {
                    warn!(file_number = n, "removing orphan table file");
                    let _ = fs::remove_file(filename::table_path(&dir, *n));
                }
            }

            // A manifest not named by CURRENT is a checkpoint that died
            // between the flip and the cleanup.
            for n in &manifest_numbers {
                if *n != manifest.manifest_number() {
                    warn!(file_number = n, "removing orphan manifest file");
                    let _ = fs::remove_file(filename::manifest_path(&dir, *n));
                }
            }
        }

        let mut next_file_number = state.next_file_number.max(max_file_number + 1);

        // WAL segments below the manifest's log number are fully flushed.
        wal_numbers.sort_unstable();
        let (obsolete, live_wals): (Vec<u64>, Vec<u64>) = wal_numbers
            .into_iter()
            .partition(|n| *n < state.log_number);
        if !config.read_only {
            for n in obsolete {
                let _ = fs::remove_file(filename::wal_path(&dir, n));
            }
        }

        // Replay live segments oldest → newest; the newest becomes the
        // active memtable, the rest queue for flush.
        let mut recovered: Vec<Arc<Memtable>> = Vec::with_capacity(live_wals.len());
        for n in &live_wals {
            let memtable = Memtable::open(
                filename::wal_path(&dir, *n),
                *n,
                state.last_sequence,
                config.wal_sync_mode,
            )?;
            recovered.push(Arc::new(memtable));
        }

        let active = match recovered.pop() {
            Some(newest) => newest,
            None => {
                let n = next_file_number;
                next_file_number += 1;
                Arc::new(Memtable::open(
                    filename::wal_path(&dir, n),
                    n,
                    0,
                    config.wal_sync_mode,
                )?)
            }
        };
        let immutables: Vec<Arc<Memtable>> = recovered.into_iter().rev().collect();

        let mut last_sequence = state.last_sequence.max(active.max_seq());
        for imm in &immutables {
            last_sequence = last_sequence.max(imm.max_seq());
        }

        let table_cache = TableCache::new(TABLE_CACHE_CAPACITY);
        let current = Version::from_state(&state, &dir, &table_cache)?;

        let (wake_tx, wake_rx) = bounded::<()>(1);
        let has_pending_flush = !immutables.is_empty();

        let core = Arc::new(DbCore {
            config: config.clone(),
            dir,
            lock_file: Mutex::new(Some(lock_file)),
            state: Mutex::new(DbState::Open),
            write_mutex: Mutex::new(()),
            compaction_lock: Mutex::new(()),
            mem: Mutex::new(MemView { active, immutables }),
            mem_cv: Condvar::new(),
            versions: Mutex::new(VersionState {
                manifest,
                current: Arc::new(current),
                compact_ptrs: vec![Vec::new(); config.max_level as usize],
            }),
            table_cache,
            next_file_number: AtomicU64::new(next_file_number),
            last_sequence: AtomicU64::new(last_sequence),
            visible_seq: AtomicU64::new(last_sequence),
            read_only: AtomicBool::new(config.read_only),
            counters: Counters::default(),
            compactor: CompactorHandle {
                wake_tx,
                shutdown: Arc::new(AtomicBool::new(false)),
                thread: Mutex::new(None),
            },
        });

        if !config.read_only {
            // A compact manifest makes the next open cheap.
            let checkpoint_number = core.next_file_number.fetch_add(1, Ordering::SeqCst);
            core.lock_versions()?.manifest.checkpoint(checkpoint_number)?;

            compactor::spawn(&core, wake_rx);
            if has_pending_flush {
                core.wake_compactor();
            }
        }

        info!(
            last_sequence,
            files = core.lock_versions()?.current.num_files(),
            "database open"
        );

        Ok(Db { core })
    }

    /// Looks up a key at the current visible sequence.
    ///
    /// `Ok(None)` means the key is absent or deleted — not an error.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        self.core.check_open()?;
        validate_key(key)?;
        let view = self.core.read_view()?;
        self.core.get_in_view(&view, key)
    }

    /// Looks up a key as of `snapshot`.
    pub fn get_at(&self, snapshot: &Snapshot, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        self.core.check_open()?;
        validate_key(key)?;
        self.core.get_in_view(&snapshot.view, key)
    }

    /// Inserts or overwrites a key.
    pub fn put(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<(), DbError> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.core.write(batch)?;
        self.core.counters.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Deletes a key (writes a tombstone).
    pub fn delete(&self, key: impl Into<Vec<u8>>) -> Result<(), DbError> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.core.write(batch)?;
        self.core.counters.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Applies a batch atomically: all of it becomes visible at once, or
    /// none of it does.
    pub fn batch_write(&self, batch: WriteBatch) -> Result<(), DbError> {
        self.core.write(batch)?;
        self.core
            .counters
            .batch_writes
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Ordered scan of `[start, end)` at the current visible sequence.
    pub fn range(&self, start: &[u8], end: &[u8]) -> Result<DbIterator, DbError> {
        self.core.check_open()?;
        let view = self.core.read_view()?;
        self.core.range_in_view(&view, start, end)
    }

    /// Ordered scan of `[start, end)` as of `snapshot`.
    pub fn range_at(
        &self,
        snapshot: &Snapshot,
        start: &[u8],
        end: &[u8],
    ) -> Result<DbIterator, DbError> {
        self.core.check_open()?;
        self.core.range_in_view(&snapshot.view, start, end)
    }

    /// Pins the current visible sequence for repeatable reads.
    pub fn snapshot(&self) -> Result<Snapshot, DbError> {
        self.core.check_open()?;
        Ok(Snapshot {
            view: self.core.read_view()?,
        })
    }

    /// Compacts every level overlapping `[start, end]`, pushing the data
    /// one level down. Serialized with background compaction; calling it
    /// repeatedly is semantically idempotent.
    pub fn compact_range(&self, start: &[u8], end: &[u8]) -> Result<(), DbError> {
        self.core.check_open()?;
        if self.core.is_read_only() {
            return Err(DbError::ReadOnly);
        }

        // Move memtable contents into L0 first so the range is complete.
        {
            let _writer = self.core.lock_write()?;
            self.core.rotate_now()?;
        }

        let _compaction = self.core.lock_compaction()?;
        while self.core.flush_oldest_immutable()? {}

        for level in 0..self.core.config.max_level.saturating_sub(1) {
            let task = {
                let vs = self.core.lock_versions()?;
                let metas = vs.current.metas();
                compaction::pick_range_compaction(&metas, level as usize, start, end)
            };
            if let Some(task) = task {
                self.core.run_compaction_task(task)?;
            }
        }

        Ok(())
    }

    /// Snapshot of engine counters and tree shape.
    pub fn stats(&self) -> Result<DbStats, DbError> {
        self.core.check_open()?;
        let view = self.core.read_view()?;
        let c = &self.core.counters;

        Ok(DbStats {
            gets: c.gets.load(Ordering::Relaxed),
            puts: c.puts.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
            batch_writes: c.batch_writes.load(Ordering::Relaxed),
            bloom_negatives: c.bloom_negatives.load(Ordering::Relaxed),
            table_point_reads: c.table_point_reads.load(Ordering::Relaxed),
            memtable_flushes: c.memtable_flushes.load(Ordering::Relaxed),
            compactions: c.compactions.load(Ordering::Relaxed),
            levels: view
                .version
                .levels
                .iter()
                .map(|level| LevelStats {
                    files: level.len(),
                    bytes: level.iter().map(|t| t.meta.size).sum(),
                })
                .collect(),
            immutable_memtables: view.immutables.len(),
            active_memtable_bytes: view.active.approximate_size(),
        })
    }

    /// Shuts the database down.
    ///
    /// Stops the compactor at its next job boundary, waits for in-flight
    /// writes, flushes pending immutables, syncs the active WAL,
    /// checkpoints the manifest, and releases the directory lock.
    /// Idempotent — repeated calls are no-ops.
    pub fn close(&self) -> Result<(), DbError> {
        {
            let mut state = self
                .core
                .state
                .lock()
                .map_err(|_| DbError::Internal("state mutex poisoned".into()))?;
            match *state {
                DbState::Closed | DbState::Closing => return Ok(()),
                DbState::Open => *state = DbState::Closing,
            }
        }

        self.core.stop_compactor();

        // Drain in-flight writers; new ones fail the state check.
        let _writer = self.core.lock_write()?;

        if !self.core.config.read_only {
            let _compaction = self.core.lock_compaction()?;
            while self.core.flush_oldest_immutable()? {}
            self.core.lock_mem()?.active.sync_wal()?;
            let checkpoint_number = self.core.next_file_number.fetch_add(1, Ordering::SeqCst);
            self.core.lock_versions()?.manifest.checkpoint(checkpoint_number)?;
            File::open(&self.core.dir)?.sync_all()?;
        }

        // Release the directory lock.
        *self
            .core
            .lock_file
            .lock()
            .map_err(|_| DbError::Internal("lock-file mutex poisoned".into()))? = None;

        *self
            .core
            .state
            .lock()
            .map_err(|_| DbError::Internal("state mutex poisoned".into()))? = DbState::Closed;

        info!(path = %self.core.dir.display(), "database closed");
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// DbCore — engine internals
// ------------------------------------------------------------------------------------------------

impl DbCore {
    fn check_open(&self) -> Result<(), DbError> {
        let state = self
            .state
            .lock()
            .map_err(|_| DbError::Internal("state mutex poisoned".into()))?;
        match *state {
            DbState::Open => Ok(()),
            _ => Err(DbError::NotOpen),
        }
    }

    fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    fn lock_write(&self) -> Result<std::sync::MutexGuard<'_, ()>, DbError> {
        self.write_mutex
            .lock()
            .map_err(|_| DbError::Internal("writer mutex poisoned".into()))
    }

    fn lock_compaction(&self) -> Result<std::sync::MutexGuard<'_, ()>, DbError> {
        self.compaction_lock
            .lock()
            .map_err(|_| DbError::Internal("compaction mutex poisoned".into()))
    }

    fn lock_mem(&self) -> Result<std::sync::MutexGuard<'_, MemView>, DbError> {
        self.mem
            .lock()
            .map_err(|_| DbError::Internal("memtable mutex poisoned".into()))
    }

    fn lock_versions(&self) -> Result<std::sync::MutexGuard<'_, VersionState>, DbError> {
        self.versions
            .lock()
            .map_err(|_| DbError::Internal("version mutex poisoned".into()))
    }

    fn wake_compactor(&self) {
        // A full channel already carries a pending wake-up.
        let _ = self.compactor.wake_tx.try_send(());
    }

    fn stop_compactor(&self) {
        self.compactor.shutdown.store(true, Ordering::SeqCst);
        self.wake_compactor();
        if let Ok(mut slot) = self.compactor.thread.lock() {
            if let Some(handle) = slot.take() {
                let _ = handle.join();
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Write path
    // --------------------------------------------------------------------------------------------

    fn write(&self, batch: WriteBatch) -> Result<(), DbError> {
        self.check_open()?;
        if self.is_read_only() {
            return Err(DbError::ReadOnly);
        }

        let mut incoming = 0usize;
        for op in &batch.ops {
            match op {
                BatchOp::Put { key, value } => {
                    validate_key(key)?;
                    validate_value(value)?;
                    incoming += key.len() + value.len() + 17;
                }
                BatchOp::Delete { key } => {
                    validate_key(key)?;
                    incoming += key.len() + 17;
                }
            }
        }
        if batch.ops.is_empty() {
            return Ok(());
        }

        let _writer = self.lock_write()?;
        // Close may have raced us to the mutex.
        self.check_open()?;

        self.l0_backpressure()?;
        self.ensure_room(incoming)?;

        // Sequence numbers are consumed even if the append fails below —
        // a torn frame on disk must never share a seq with a later write.
        let count = batch.ops.len() as u64;
        let base = self.last_sequence.load(Ordering::SeqCst);
        self.last_sequence.store(base + count, Ordering::SeqCst);

        let records: Vec<Record> = batch
            .ops
            .into_iter()
            .enumerate()
            .map(|(i, op)| {
                let seq = base + 1 + i as u64;
                match op {
                    BatchOp::Put { key, value } => Record::Put { key, value, seq },
                    BatchOp::Delete { key } => Record::Delete { key, seq },
                }
            })
            .collect();

        let active = self.lock_mem()?.active.clone();
        if let Err(e) = active.apply(&records) {
            self.read_only.store(true, Ordering::SeqCst);
            error!(error = %e, "WAL append failed; database degraded to read-only");
            return Err(e.into());
        }

        // Publication point: the whole batch becomes visible at once.
        self.visible_seq.store(base + count, Ordering::SeqCst);
        Ok(())
    }

    /// Applies L0-count backpressure: `Busy` at `l0_stop`, a short pause
    /// at `l0_slowdown`.
    fn l0_backpressure(&self) -> Result<(), DbError> {
        let l0 = self.lock_versions()?.current.l0_count();
        if l0 >= self.config.l0_stop {
            self.wake_compactor();
            return Err(DbError::Busy);
        }
        if l0 >= self.config.l0_slowdown {
            self.wake_compactor();
            std::thread::sleep(SLOWDOWN_PAUSE);
        }
        Ok(())
    }

    /// Rotates the active memtable when `incoming` more bytes would push
    /// it past the threshold. Blocks while the immutable list is full.
    fn ensure_room(&self, incoming: usize) -> Result<(), DbError> {
        let needs_rotation = {
            let mem = self.lock_mem()?;
            !mem.active.is_empty()
                && mem.active.approximate_size() + incoming > self.config.memtable_size
        };
        if !needs_rotation {
            return Ok(());
        }
        self.rotate_locked(true)
    }

    /// Unconditionally rotates a non-empty active memtable
    /// (`compact_range` uses this to pull memtable data into L0).
    fn rotate_now(&self) -> Result<(), DbError> {
        if self.lock_mem()?.active.is_empty() {
            return Ok(());
        }
        self.rotate_locked(false)
    }

    /// Performs the rotation; `wait_for_room` engages immutable-list
    /// backpressure. Caller must hold the writer mutex.
    fn rotate_locked(&self, wait_for_room: bool) -> Result<(), DbError> {
        let mut mem = self.lock_mem()?;

        if wait_for_room {
            while mem.immutables.len() >= MAX_IMMUTABLES {
                if self.compactor.shutdown.load(Ordering::SeqCst) {
                    // No flusher will ever drain the queue.
                    return Err(DbError::Busy);
                }
                self.wake_compactor();
                let (guard, _timeout) = self
                    .mem_cv
                    .wait_timeout(mem, Duration::from_millis(100))
                    .map_err(|_| DbError::Internal("memtable mutex poisoned".into()))?;
                mem = guard;
            }
        }

        // The outgoing segment must be durable before it is superseded.
        mem.active.sync_wal()?;

        let n = self.next_file_number.fetch_add(1, Ordering::SeqCst);
        let fresh = Arc::new(Memtable::open(
            filename::wal_path(&self.dir, n),
            n,
            0,
            self.config.wal_sync_mode,
        )?);

        let old = std::mem::replace(&mut mem.active, fresh);
        mem.immutables.insert(0, old);
        drop(mem);

        self.wake_compactor();
        info!(segment = n, "memtable rotated");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Flush (immutable memtable → L0 table)
    // --------------------------------------------------------------------------------------------

    /// Flushes the oldest immutable memtable to a level-0 table.
    ///
    /// Returns `Ok(false)` when there is nothing to flush. Caller holds
    /// the compaction lock.
    pub(crate) fn flush_oldest_immutable(&self) -> Result<bool, DbError> {
        let Some(imm) = self.lock_mem()?.immutables.last().cloned() else {
            return Ok(false);
        };

        let segment = imm.segment_number();
        let added = if imm.is_empty() {
            // All records were below the recovery floor; only the WAL
            // needs retiring.
            Vec::new()
        } else {
            let file_number = self.next_file_number.fetch_add(1, Ordering::SeqCst);
            let mut builder = TableBuilder::new(
                filename::table_path(&self.dir, file_number),
                file_number,
                self.config.block_size,
                self.config.bloom_filter_bits,
            )?;
            for record in imm.iter_for_flush()? {
                builder.add(&record)?;
            }
            let entries = builder.num_entries();
            let meta = builder.finish()?;
            info!(
                file_number,
                segment,
                entries,
                size = meta.size,
                "memtable flushed to L0"
            );
            vec![AddedFile { level: 0, meta }]
        };

        // One edit makes the table live, records durability progress, and
        // retires the WAL segment — atomically.
        let edit = VersionEdit {
            added,
            removed: Vec::new(),
            next_file_number: self.next_file_number.load(Ordering::SeqCst),
            last_sequence: imm.max_seq(),
            log_number: segment + 1,
        };
        self.commit_edit(&edit)?;

        // The memtable leaves the read path only after its table is live.
        {
            let mut mem = self.lock_mem()?;
            mem.immutables.retain(|m| !Arc::ptr_eq(m, &imm));
            self.mem_cv.notify_all();
        }

        // The WAL is now redundant with the table.
        let wal_path = imm.wal_path().to_path_buf();
        drop(imm);
        if let Err(e) = fs::remove_file(&wal_path) {
            warn!(path = %wal_path.display(), error = %e, "failed to remove flushed WAL");
        }

        self.counters
            .memtable_flushes
            .fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    // --------------------------------------------------------------------------------------------
    // Compaction
    // --------------------------------------------------------------------------------------------

    /// One background step: flush first, else the most urgent compaction.
    ///
    /// Returns `Ok(true)` when work was done.
    pub(crate) fn background_step(&self) -> Result<bool, DbError> {
        let _compaction = self.lock_compaction()?;

        if self.flush_oldest_immutable()? {
            return Ok(true);
        }

        let task = {
            let mut vs = self.lock_versions()?;
            let metas = vs.current.metas();
            compaction::pick_compaction(&metas, &self.config, &mut vs.compact_ptrs)
        };

        match task {
            Some(task) => {
                self.run_compaction_task(task)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Executes one compaction task and commits its result. Caller holds
    /// the compaction lock.
    fn run_compaction_task(&self, task: CompactionTask) -> Result<(), DbError> {
        // Open every input outside any lock; compaction I/O must not
        // block foreground traffic.
        let mut tables = Vec::new();
        for meta in task.all_inputs() {
            tables.push(self.table_cache.get(&self.dir, meta.file_number)?);
        }

        // A tombstone may be dropped only if no deeper level could still
        // hold its key.
        let below: Arc<Version> = self.lock_versions()?.current.clone();
        let output_level = task.output_level();
        let key_live_below = move |key: &[u8]| below.key_may_live_below(output_level, key);

        let outputs = compaction::execute(
            &task,
            tables,
            &self.dir,
            &self.next_file_number,
            &self.config,
            &key_live_below,
        )?;

        let edit = VersionEdit {
            added: outputs
                .iter()
                .map(|meta| AddedFile {
                    level: output_level,
                    meta: meta.clone(),
                })
                .collect(),
            removed: task
                .inputs
                .iter()
                .map(|m| RemovedFile {
                    level: task.level,
                    file_number: m.file_number,
                })
                .chain(task.next_inputs.iter().map(|m| RemovedFile {
                    level: output_level,
                    file_number: m.file_number,
                }))
                .collect(),
            next_file_number: self.next_file_number.load(Ordering::SeqCst),
            last_sequence: 0,
            log_number: 0,
        };
        self.commit_edit(&edit)?;

        // Inputs are no longer referenced by the new version; readers that
        // still hold the old version keep the files alive via their mmaps
        // until those views drop.
        for meta in task.all_inputs() {
            self.table_cache.evict(meta.file_number);
            let path = filename::table_path(&self.dir, meta.file_number);
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove compacted table");
            }
        }

        self.counters.compactions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Logs an edit and installs the resulting version.
    fn commit_edit(&self, edit: &VersionEdit) -> Result<(), DbError> {
        let mut vs = self.lock_versions()?;
        vs.manifest.log_and_apply(edit)?;

        let state = vs.manifest.state()?;
        vs.current = Arc::new(Version::from_state(&state, &self.dir, &self.table_cache)?);

        if vs.manifest.wants_checkpoint() {
            let checkpoint_number = self.next_file_number.fetch_add(1, Ordering::SeqCst);
            vs.manifest.checkpoint(checkpoint_number)?;
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Read path
    // --------------------------------------------------------------------------------------------

    /// Captures a consistent read view.
    ///
    /// Memtables are captured *before* the version pointer: a flush that
    /// lands between the two locks can only make data show up twice
    /// (memtable and fresh L0 table — deduplicated by seq), never vanish.
    fn read_view(&self) -> Result<ReadView, DbError> {
        let (active, immutables) = {
            let mem = self.lock_mem()?;
            (mem.active.clone(), mem.immutables.clone())
        };
        let version = self.lock_versions()?.current.clone();
        let seq = self.visible_seq.load(Ordering::SeqCst);
        Ok(ReadView {
            active,
            immutables,
            version,
            seq,
        })
    }

    /// Resolves a point lookup against a read view.
    fn get_in_view(&self, view: &ReadView, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        self.counters.gets.fetch_add(1, Ordering::Relaxed);

        // 1. Active memtable.
        match view.active.get(key, view.seq)? {
            MemtableGetResult::Put(value) => return Ok(Some(value)),
            MemtableGetResult::Delete => return Ok(None),
            MemtableGetResult::NotFound => {}
        }

        // 2. Immutable memtables, newest first.
        for imm in &view.immutables {
            match imm.get(key, view.seq)? {
                MemtableGetResult::Put(value) => return Ok(Some(value)),
                MemtableGetResult::Delete => return Ok(None),
                MemtableGetResult::NotFound => {}
            }
        }

        // 3. L0 — files overlap, so the newest qualifying version across
        //    all of them wins. The list is ordered by largest_seq
        //    descending, allowing early exit.
        let mut best: Option<TableGet> = None;
        let mut best_seq = 0u64;
        for entry in &view.version.levels[0] {
            if best.is_some() && entry.meta.largest_seq <= best_seq {
                break;
            }
            if !entry.meta.contains(key) {
                continue;
            }
            match self.table_get(entry, key, view.seq)? {
                TableGet::NotFound => {}
                result => {
                    let seq = match &result {
                        TableGet::Put { seq, .. } | TableGet::Delete { seq } => *seq,
                        TableGet::NotFound => 0,
                    };
                    if seq > best_seq {
                        best_seq = seq;
                        best = Some(result);
                    }
                }
            }
        }
        match best {
            Some(TableGet::Put { value, .. }) => return Ok(Some(value)),
            Some(TableGet::Delete { .. }) => return Ok(None),
            _ => {}
        }

        // 4. L1..Lmax — levels are disjoint, so at most one file per level
        //    can hold the key, and shallower levels hold strictly newer
        //    data: the first authoritative answer is final.
        for level in view.version.levels.iter().skip(1) {
            let idx = level.partition_point(|t| t.meta.largest_key.as_slice() < key);
            let Some(entry) = level.get(idx) else { continue };
            if !entry.meta.contains(key) {
                continue;
            }
            match self.table_get(entry, key, view.seq)? {
                TableGet::Put { value, .. } => return Ok(Some(value)),
                TableGet::Delete { .. } => return Ok(None),
                TableGet::NotFound => {}
            }
        }

        Ok(None)
    }

    /// Bloom-gated single-table lookup, with counter upkeep.
    fn table_get(
        &self,
        entry: &LevelTable,
        key: &[u8],
        snapshot_seq: u64,
    ) -> Result<TableGet, DbError> {
        if !entry.table.may_contain(key) {
            self.counters.bloom_negatives.fetch_add(1, Ordering::Relaxed);
            return Ok(TableGet::NotFound);
        }
        self.counters
            .table_point_reads
            .fetch_add(1, Ordering::Relaxed);
        Ok(entry.table.get(key, snapshot_seq)?)
    }

    /// Builds the merged, visibility-filtered range iterator.
    fn range_in_view(
        &self,
        view: &ReadView,
        start: &[u8],
        end: &[u8],
    ) -> Result<DbIterator, DbError> {
        let mut sources: Vec<Box<dyn Iterator<Item = Record>>> = Vec::new();

        if start < end {
            sources.push(Box::new(view.active.scan(start, Some(end), view.seq)?));
            for imm in &view.immutables {
                sources.push(Box::new(imm.scan(start, Some(end), view.seq)?));
            }
            for level in &view.version.levels {
                for entry in level {
                    if entry.meta.largest_key.as_slice() < start
                        || entry.meta.smallest_key.as_slice() >= end
                    {
                        continue;
                    }
                    let iter = TableIter::new(Arc::clone(&entry.table), start, Some(end))?;
                    sources.push(Box::new(iter));
                }
            }
        }

        Ok(DbIterator {
            inner: VisibilityFilter::new(MergeIterator::new(sources), view.seq),
        })
    }
}

impl Drop for DbCore {
    fn drop(&mut self) {
        // Last handle gone: make sure the worker thread is not left
        // running against a dead Weak.
        self.compactor.shutdown.store(true, Ordering::SeqCst);
        let _ = self.compactor.wake_tx.try_send(());
        if let Ok(mut slot) = self.compactor.thread.lock() {
            if let Some(handle) = slot.take() {
                // The worker itself may hold the final strong reference
                // (it upgrades per step); joining our own thread would
                // deadlock, and the worker exits on its own anyway once
                // the Weak no longer upgrades.
                if handle.thread().id() != std::thread::current().id() {
                    let _ = handle.join();
                }
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Validation helpers
// ------------------------------------------------------------------------------------------------

fn validate_key(key: &[u8]) -> Result<(), DbError> {
    if key.is_empty() {
        return Err(DbError::InvalidArgument("empty key".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(DbError::InvalidArgument(format!(
            "key length {} exceeds maximum {MAX_KEY_LEN}",
            key.len()
        )));
    }
    Ok(())
}

fn validate_value(value: &[u8]) -> Result<(), DbError> {
    if value.len() > MAX_VALUE_LEN {
        return Err(DbError::InvalidArgument(format!(
            "value length {} exceeds maximum {MAX_VALUE_LEN}",
            value.len()
        )));
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// DbIterator + VisibilityFilter
// ------------------------------------------------------------------------------------------------

/// Ordered iterator over live `(key, value)` pairs in a half-open range.
///
/// Snapshot-consistent: the sources were pinned when the iterator was
/// created, so concurrent writes, rotations, flushes, and compactions
/// neither add nor remove items from the stream.
pub struct DbIterator {
    inner: VisibilityFilter<MergeIterator<'static>>,
}

impl Iterator for DbIterator {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

/// Filters a `(key ASC, seq DESC)` record stream down to the visible
/// `(key, value)` pairs at one snapshot.
///
/// Records newer than the snapshot are skipped outright; for each
/// remaining key the first record wins (it has the highest seq), and a
/// winning tombstone suppresses the key entirely.
struct VisibilityFilter<I>
where
    I: Iterator<Item = Record>,
{
    input: I,
    snapshot_seq: u64,
    current_key: Option<Vec<u8>>,
}

impl<I> VisibilityFilter<I>
where
    I: Iterator<Item = Record>,
{
    fn new(input: I, snapshot_seq: u64) -> Self {
        Self {
            input,
            snapshot_seq,
            current_key: None,
        }
    }
}

impl<I> Iterator for VisibilityFilter<I>
where
    I: Iterator<Item = Record>,
{
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        for record in self.input.by_ref() {
            if record.seq() > self.snapshot_seq {
                continue;
            }
            if self.current_key.as_deref() == Some(record.key()) {
                continue; // older version of a key already decided
            }
            self.current_key = Some(record.key().to_vec());

            match record {
                Record::Delete { .. } => continue, // key is masked
                Record::Put { key, value, .. } => return Some((key, value)),
            }
        }
        None
    }
}
