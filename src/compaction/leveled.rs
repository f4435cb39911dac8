//! Compaction executor — merges the selected inputs into fresh output
//! tables for the next level.
//!
//! The executor is deliberately free of engine state: it reads immutable
//! input tables, writes new files, and returns their metadata. Committing
//! the result (one manifest edit, file deletion, version swap) is the
//! facade's job, which is what lets compaction run concurrently with
//! foreground traffic.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info};

use crate::config::DbConfig;
use crate::db::filename;
use crate::db::utils::{MergeIterator, Record};
use crate::sstable::{Table, TableBuilder, TableIter, TableMeta};

use super::{CompactionError, CompactionTask};

/// Merges the task's input tables and writes output tables into
/// `task.output_level()`.
///
/// # Parameters
///
/// - `tables` — an opened handle for every input file, in the same order
///   as [`CompactionTask::all_inputs`].
/// - `next_file` — the database-wide file-number counter; each output
///   file draws from it.
/// - `key_live_below` — returns `true` when a level deeper than the
///   output level might still hold a version of the key. Tombstones are
///   dropped only when this returns `false` — dropping them any earlier
///   would resurrect older versions below.
///
/// # Output rolling
///
/// A new output file starts once the current one reaches
/// `target_sst_size`, and only between two distinct user keys, so every
/// version of one key stays in one file.
pub fn execute(
    task: &CompactionTask,
    tables: Vec<Arc<Table>>,
    dir: &Path,
    next_file: &AtomicU64,
    config: &DbConfig,
    key_live_below: &dyn Fn(&[u8]) -> bool,
) -> Result<Vec<TableMeta>, CompactionError> {
    let mut iters: Vec<Box<dyn Iterator<Item = Record>>> = Vec::with_capacity(tables.len());
    for table in tables {
        iters.push(Box::new(TableIter::new(table, b"", None)?));
    }
    let merged = MergeIterator::new(iters);

    let mut outputs: Vec<TableMeta> = Vec::new();
    let mut builder: Option<TableBuilder> = None;
    let mut current_key: Option<Vec<u8>> = None;
    let mut dropped_versions: u64 = 0;
    let mut dropped_tombstones: u64 = 0;

    for record in merged {
        // The merge is (key ASC, seq DESC): the first record of each user
        // key is its newest version, everything after is obsolete.
        if current_key.as_deref() == Some(record.key()) {
            dropped_versions += 1;
            continue;
        }
        current_key = Some(record.key().to_vec());

        if record.is_delete() && !key_live_below(record.key()) {
            // Nothing below the output level can resurrect this key.
            dropped_tombstones += 1;
            continue;
        }

        // Roll the output at the size cap, never inside a user key.
        if let Some(b) = &builder {
            let at_key_boundary = b.last_user_key() != Some(record.key());
            if b.estimated_size() >= config.target_sst_size && at_key_boundary {
                let finished = builder.take();
                if let Some(finished) = finished {
                    outputs.push(finished.finish()?);
                }
            }
        }

        if builder.is_none() {
            let file_number = next_file.fetch_add(1, Ordering::SeqCst);
            builder = Some(TableBuilder::new(
                filename::table_path(dir, file_number),
                file_number,
                config.block_size,
                config.bloom_filter_bits,
            )?);
        }

        if let Some(b) = builder.as_mut() {
            b.add(&record)?;
        }
    }

    if let Some(b) = builder {
        if b.num_entries() > 0 {
            outputs.push(b.finish()?);
        }
    }

    info!(
        level = task.level,
        output_level = task.output_level(),
        inputs = task.inputs.len() + task.next_inputs.len(),
        input_bytes = task.input_bytes(),
        outputs = outputs.len(),
        dropped_versions,
        dropped_tombstones,
        "compaction executed"
    );
    debug!(
        output_files = ?outputs.iter().map(|m| m.file_number).collect::<Vec<_>>(),
        "compaction outputs"
    );

    Ok(outputs)
}
