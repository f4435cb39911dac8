//! In-memory version: the live table set with opened handles.
//!
//! A [`Version`] is an immutable snapshot of the tree shape — per-level
//! lists of table metadata paired with their opened [`Table`] handles.
//! The facade swaps `Arc<Version>` pointers under the version mutex;
//! readers that captured the previous pointer keep using it untouched, so
//! installing a new version never blocks reads (and deleted files stay
//! readable for those readers until their `Arc`s drop).
//!
//! [`TableCache`] bounds the number of open table handles with a simple
//! LRU. Eviction only drops the cache's own `Arc`; any version or scan
//! still holding the table keeps it alive.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::{trace, warn};

use crate::db::filename;
use crate::manifest::ManifestState;
use crate::sstable::{Table, TableError, TableMeta};

/// Default bound on cached open table handles.
pub(crate) const TABLE_CACHE_CAPACITY: usize = 256;

// ------------------------------------------------------------------------------------------------
// Version
// ------------------------------------------------------------------------------------------------

/// One live table with its opened handle.
#[derive(Clone)]
pub(crate) struct LevelTable {
    pub(crate) meta: TableMeta,
    pub(crate) table: Arc<Table>,
}

/// Immutable snapshot of the live table set.
pub(crate) struct Version {
    /// Tables per level. L0 is ordered newest-first (by `largest_seq`
    /// descending); levels ≥ 1 are sorted by smallest key and disjoint.
    pub(crate) levels: Vec<Vec<LevelTable>>,
}

impl Version {
    /// Builds a version from the manifest state, opening tables through
    /// the cache.
    pub(crate) fn from_state(
        state: &ManifestState,
        dir: &Path,
        cache: &TableCache,
    ) -> Result<Self, TableError> {
        let mut levels = Vec::with_capacity(state.levels.len());

        for (level_idx, metas) in state.levels.iter().enumerate() {
            let mut level = Vec::with_capacity(metas.len());
            for meta in metas {
                let table = cache.get(dir, meta.file_number)?;
                level.push(LevelTable {
                    meta: meta.clone(),
                    table,
                });
            }
            if level_idx == 0 {
                // Newest data first, so point lookups can stop at the
                // first authoritative answer.
                level.sort_by(|a, b| b.meta.largest_seq.cmp(&a.meta.largest_seq));
            }
            levels.push(level);
        }

        Ok(Self { levels })
    }

    /// Per-level metadata copies, as the compaction picker consumes them.
    pub(crate) fn metas(&self) -> Vec<Vec<TableMeta>> {
        self.levels
            .iter()
            .map(|level| level.iter().map(|t| t.meta.clone()).collect())
            .collect()
    }

    /// Number of L0 files (the write-backpressure signal).
    pub(crate) fn l0_count(&self) -> usize {
        self.levels.first().map(Vec::len).unwrap_or(0)
    }

    /// Total number of live files.
    pub(crate) fn num_files(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Returns `true` when some level deeper than `below_level` might hold
    /// a version of `key` — the test that decides whether a tombstone must
    /// be carried down by compaction.
    pub(crate) fn key_may_live_below(&self, below_level: u32, key: &[u8]) -> bool {
        self.levels
            .iter()
            .skip(below_level as usize + 1)
            .any(|level| level.iter().any(|t| t.meta.contains(key)))
    }
}

// ------------------------------------------------------------------------------------------------
// TableCache
// ------------------------------------------------------------------------------------------------

struct CacheInner {
    map: HashMap<u64, Arc<Table>>,
    /// LRU order: least-recently-used at the front.
    order: VecDeque<u64>,
}

/// Bounded LRU of opened table handles, keyed by file number.
pub(crate) struct TableCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

impl TableCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Returns the handle for `file_number`, opening the file on a miss.
    pub(crate) fn get(&self, dir: &Path, file_number: u64) -> Result<Arc<Table>, TableError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| TableError::Internal("table cache mutex poisoned".into()))?;

        if let Some(table) = inner.map.get(&file_number).cloned() {
            // Bump to most-recently-used.
            inner.order.retain(|n| *n != file_number);
            inner.order.push_back(file_number);
            return Ok(table);
        }

        let path = filename::table_path(dir, file_number);
        let table = Arc::new(Table::open(&path)?);
        trace!(file_number, "table cache miss");

        inner.map.insert(file_number, Arc::clone(&table));
        inner.order.push_back(file_number);

        while inner.map.len() > self.capacity {
            match inner.order.pop_front() {
                Some(evicted) => {
                    inner.map.remove(&evicted);
                    trace!(file_number = evicted, "table cache eviction");
                }
                None => {
                    warn!("table cache order queue out of sync with map");
                    break;
                }
            }
        }

        Ok(table)
    }

    /// Drops the cache's handle for a deleted file.
    pub(crate) fn evict(&self, file_number: u64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.map.remove(&file_number);
            inner.order.retain(|n| *n != file_number);
        }
    }
}
