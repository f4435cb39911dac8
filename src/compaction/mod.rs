//! # Compaction Module
//!
//! Leveled compaction: keeps read amplification bounded by continuously
//! merging overlapping tables downward through the level hierarchy.
//!
//! ## Selection policy
//!
//! Every level gets a score:
//!
//! - **L0** — `file_count / l0_compaction_trigger`. L0 files overlap each
//!   other, so the trigger is a count, not a byte budget.
//! - **L ≥ 1** — `total_bytes(L) / target_bytes(L)` with
//!   `target_bytes(L) = level0_size · size_ratio^(L−1)`.
//!
//! The level with the highest score ≥ 1.0 is compacted. An L0 compaction
//! takes every L0 file plus all overlapping L1 files. A deeper compaction
//! takes one file — chosen round-robin by smallest key via a per-level
//! compact pointer — plus all overlapping files in L+1.
//!
//! ## Execution
//!
//! The selected inputs are merged with a k-way
//! [`MergeIterator`](crate::db::utils::MergeIterator) in
//! `(key ASC, seq DESC)` order. For each user key only the newest version
//! survives. A tombstone is dropped iff no level deeper than the output
//! level could still hold an older version of its key — otherwise the
//! tombstone must be carried down to keep masking it. Output files roll at
//! `target_sst_size`, always between two distinct user keys. The caller
//! commits the result as a single manifest edit removing all inputs and
//! adding all outputs.

#[cfg(test)]
mod tests;

pub mod leveled;

pub use leveled::execute;

use crate::config::DbConfig;
use crate::manifest::ManifestError;
use crate::sstable::{TableError, TableMeta};
use thiserror::Error;
use tracing::debug;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by compaction picking or execution.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// SSTable read or write failure.
    #[error("SSTable error: {0}")]
    Table(#[from] TableError),

    /// Manifest failure while committing the result.
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ------------------------------------------------------------------------------------------------
// Task description
// ------------------------------------------------------------------------------------------------

/// One unit of compaction work: files from `level` merged with their
/// overlaps in `level + 1`.
#[derive(Debug, Clone)]
pub struct CompactionTask {
    /// Source level.
    pub level: u32,

    /// Input files from the source level.
    pub inputs: Vec<TableMeta>,

    /// Overlapping input files from `level + 1`.
    pub next_inputs: Vec<TableMeta>,
}

impl CompactionTask {
    /// The level output files are written to.
    pub fn output_level(&self) -> u32 {
        self.level + 1
    }

    /// All input files, source level first.
    pub fn all_inputs(&self) -> impl Iterator<Item = &TableMeta> {
        self.inputs.iter().chain(self.next_inputs.iter())
    }

    /// Total input bytes.
    pub fn input_bytes(&self) -> u64 {
        self.all_inputs().map(|m| m.size).sum()
    }
}

// ------------------------------------------------------------------------------------------------
// Selection
// ------------------------------------------------------------------------------------------------

/// Score of one level; ≥ 1.0 means the level wants compaction.
fn level_score(levels: &[Vec<TableMeta>], level: usize, config: &DbConfig) -> f64 {
    if level == 0 {
        levels[0].len() as f64 / config.l0_compaction_trigger as f64
    } else {
        let total: u64 = levels[level].iter().map(|m| m.size).sum();
        total as f64 / config.target_level_bytes(level as u32) as f64
    }
}

/// Picks the most urgent compaction, or `None` when every level is within
/// budget.
///
/// `compact_ptrs` carries one cursor key per level; successive picks at
/// the same level rotate through its files so no key range starves.
pub fn pick_compaction(
    levels: &[Vec<TableMeta>],
    config: &DbConfig,
    compact_ptrs: &mut [Vec<u8>],
) -> Option<CompactionTask> {
    // The deepest level has nowhere to push data, so it never compacts.
    let candidates = levels.len().saturating_sub(1);

    let mut best_level: Option<usize> = None;
    let mut best_score = 1.0_f64;

    for level in 0..candidates {
        if levels[level].is_empty() {
            continue;
        }
        let score = level_score(levels, level, config);
        if score >= best_score {
            best_score = score;
            best_level = Some(level);
        }
    }

    let level = best_level?;
    let task = if level == 0 {
        pick_l0(levels)
    } else {
        pick_leveled(levels, level, compact_ptrs)
    };

    if let Some(task) = &task {
        debug!(
            level,
            score = best_score,
            inputs = task.inputs.len(),
            next_inputs = task.next_inputs.len(),
            "compaction picked"
        );
    }
    task
}

/// L0 → L1: all L0 files plus every overlapping L1 file.
fn pick_l0(levels: &[Vec<TableMeta>]) -> Option<CompactionTask> {
    let inputs = levels[0].clone();
    if inputs.is_empty() {
        return None;
    }

    let (start, end) = key_range(&inputs);
    let next_inputs = overlapping_files(&levels[1], &start, &end);

    Some(CompactionTask {
        level: 0,
        inputs,
        next_inputs,
    })
}

/// L → L+1: one file chosen round-robin, plus its overlaps in L+1.
fn pick_leveled(
    levels: &[Vec<TableMeta>],
    level: usize,
    compact_ptrs: &mut [Vec<u8>],
) -> Option<CompactionTask> {
    let files = &levels[level];
    let ptr = &compact_ptrs[level];

    // First file beyond the pointer; wrap to the start when exhausted.
    let seed = files
        .iter()
        .find(|m| ptr.is_empty() || m.smallest_key.as_slice() > ptr.as_slice())
        .or_else(|| files.first())?
        .clone();

    compact_ptrs[level] = seed.largest_key.clone();

    let next_inputs = overlapping_files(&levels[level + 1], &seed.smallest_key, &seed.largest_key);

    Some(CompactionTask {
        level: level as u32,
        inputs: vec![seed],
        next_inputs,
    })
}

/// Picks a manual compaction of `[start, end]` at `level`, or `None` when
/// nothing there overlaps the range.
pub fn pick_range_compaction(
    levels: &[Vec<TableMeta>],
    level: usize,
    start: &[u8],
    end: &[u8],
) -> Option<CompactionTask> {
    if level + 1 >= levels.len() {
        return None;
    }

    // L0 files overlap each other, so the selection must close over every
    // file sharing keys with the chosen ones — leaving one out could sink
    // a newer version below an older one.
    let inputs = if level == 0 {
        overlapping_l0_closure(&levels[0], start, end)
    } else {
        overlapping_files(&levels[level], start, end)
    };
    if inputs.is_empty() {
        return None;
    }

    // The inputs' true range can exceed the requested one; overlaps in the
    // next level are computed from the real bounds.
    let (lo, hi) = key_range(&inputs);
    let next_inputs = overlapping_files(&levels[level + 1], &lo, &hi);

    Some(CompactionTask {
        level: level as u32,
        inputs,
        next_inputs,
    })
}

/// Smallest and largest user keys across `files`.
fn key_range(files: &[TableMeta]) -> (Vec<u8>, Vec<u8>) {
    let mut start = files[0].smallest_key.clone();
    let mut end = files[0].largest_key.clone();
    for meta in &files[1..] {
        if meta.smallest_key < start {
            start = meta.smallest_key.clone();
        }
        if meta.largest_key > end {
            end = meta.largest_key.clone();
        }
    }
    (start, end)
}

/// Files in `level_files` whose key range intersects `[start, end]`.
fn overlapping_files(level_files: &[TableMeta], start: &[u8], end: &[u8]) -> Vec<TableMeta> {
    level_files
        .iter()
        .filter(|m| m.overlaps(start, end))
        .cloned()
        .collect()
}

/// Transitive closure of L0 files overlapping `[start, end]`: the range
/// grows to cover each selected file until the selection is stable.
fn overlapping_l0_closure(l0: &[TableMeta], start: &[u8], end: &[u8]) -> Vec<TableMeta> {
    let mut lo = start.to_vec();
    let mut hi = end.to_vec();
    let mut selected = overlapping_files(l0, &lo, &hi);

    loop {
        if selected.is_empty() {
            return selected;
        }
        let (range_lo, range_hi) = key_range(&selected);
        let grew = range_lo < lo || range_hi > hi;
        if !grew {
            return selected;
        }
        if range_lo < lo {
            lo = range_lo;
        }
        if range_hi > hi {
            hi = range_hi;
        }
        selected = overlapping_files(l0, &lo, &hi);
    }
}
