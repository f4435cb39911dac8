//! # Configuration Module
//!
//! All tunables consumed by the storage engine, gathered into [`DbConfig`].
//! Every field has a production-safe default; [`DbConfig::validate`] rejects
//! inconsistent combinations before the database touches the filesystem.

#[cfg(test)]
mod tests;

use std::fmt;

// ------------------------------------------------------------------------------------------------
// Hard limits
// ------------------------------------------------------------------------------------------------

/// Maximum accepted key length (64 KiB). Longer keys are rejected with
/// `InvalidArgument`. The empty key is reserved and always rejected.
pub const MAX_KEY_LEN: usize = 64 * 1024;

/// Maximum accepted value length (64 MiB). Values may be empty.
pub const MAX_VALUE_LEN: usize = 64 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// WAL sync policy
// ------------------------------------------------------------------------------------------------

/// When the write-ahead log fsyncs appended frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalSyncMode {
    /// Fsync after every write operation (each `put`/`delete`/batch).
    ///
    /// Strongest durability: an acknowledged write survives any crash.
    Always,

    /// Leave syncing to memtable rotation, flush, and close.
    ///
    /// Group commit: throughput-oriented, a crash may lose the tail of
    /// acknowledged writes.
    Batch,

    /// Fsync when at least this many milliseconds have passed since the
    /// last sync.
    IntervalMs(u64),
}

impl fmt::Display for WalSyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => write!(f, "always"),
            Self::Batch => write!(f, "batch"),
            Self::IntervalMs(ms) => write!(f, "interval_ms({ms})"),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// DbConfig
// ------------------------------------------------------------------------------------------------

/// Configuration for a database instance. Passed to `Db::open`.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Max active memtable size (bytes) before it is rotated to the
    /// immutable list and scheduled for flush.
    pub memtable_size: usize,

    /// Bloom filter bits per key for newly written SSTables.
    /// `0` disables bloom filters entirely.
    pub bloom_filter_bits: u32,

    /// Number of levels in the tree (L0..L(max_level-1)).
    pub max_level: u32,

    /// Byte budget of level 1; deeper levels grow by `size_ratio`.
    pub level0_size: u64,

    /// Growth factor between consecutive level byte budgets.
    pub size_ratio: u64,

    /// Number of L0 files that triggers an L0→L1 compaction.
    pub l0_compaction_trigger: usize,

    /// Number of L0 files at which each write is briefly slowed down.
    pub l0_slowdown: usize,

    /// Number of L0 files at which writes fail with `Busy` until
    /// compaction catches up.
    pub l0_stop: usize,

    /// Target size of one SSTable data block (bytes).
    pub block_size: usize,

    /// Cap on compaction output file size (bytes). Outputs roll to a new
    /// file at this size, always at a user-key boundary.
    pub target_sst_size: u64,

    /// WAL fsync policy.
    pub wal_sync_mode: WalSyncMode,

    /// Open the database for reading only; all mutations are rejected.
    pub read_only: bool,

    /// Create the database directory if it does not exist.
    pub create_if_missing: bool,

    /// Fail `open` when the database already exists.
    pub error_if_exists: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            memtable_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            max_level: 7,
            level0_size: 4 * 1024 * 1024,
            size_ratio: 10,
            l0_compaction_trigger: 4,
            l0_slowdown: 8,
            l0_stop: 12,
            block_size: 4 * 1024,
            target_sst_size: 2 * 1024 * 1024,
            wal_sync_mode: WalSyncMode::Always,
            read_only: false,
            create_if_missing: true,
            error_if_exists: false,
        }
    }
}

impl DbConfig {
    /// Checks internal consistency of the configuration.
    ///
    /// Returns a human-readable description of the first violated
    /// constraint, or `Ok(())` when the configuration is usable.
    pub fn validate(&self) -> Result<(), String> {
        if self.memtable_size == 0 {
            return Err("memtable_size must be non-zero".into());
        }
        if self.block_size == 0 {
            return Err("block_size must be non-zero".into());
        }
        if self.target_sst_size == 0 {
            return Err("target_sst_size must be non-zero".into());
        }
        if self.max_level < 2 {
            return Err("max_level must be at least 2".into());
        }
        if self.level0_size == 0 {
            return Err("level0_size must be non-zero".into());
        }
        if self.size_ratio < 2 {
            return Err("size_ratio must be at least 2".into());
        }
        if self.l0_compaction_trigger == 0 {
            return Err("l0_compaction_trigger must be non-zero".into());
        }
        if self.l0_slowdown < self.l0_compaction_trigger {
            return Err("l0_slowdown must be >= l0_compaction_trigger".into());
        }
        if self.l0_stop < self.l0_slowdown {
            return Err("l0_stop must be >= l0_slowdown".into());
        }
        if let WalSyncMode::IntervalMs(0) = self.wal_sync_mode {
            return Err("wal_sync_mode interval must be non-zero".into());
        }
        if self.read_only && self.error_if_exists {
            return Err("read_only and error_if_exists are mutually exclusive".into());
        }
        Ok(())
    }

    /// Byte budget of level `level` (1-based; L0 is count-triggered).
    ///
    /// `target_bytes(L) = level0_size * size_ratio^(L-1)`, saturating.
    pub fn target_level_bytes(&self, level: u32) -> u64 {
        debug_assert!(level >= 1);
        let mut target = self.level0_size;
        for _ in 1..level {
            target = target.saturating_mul(self.size_ratio);
        }
        target
    }
}
