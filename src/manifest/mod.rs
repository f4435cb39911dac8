//! # Manifest Module
//!
//! The manifest is the durable metadata authority of the LSM tree. It
//! records, per level, which table files are live, plus three monotonic
//! counters: the next file number, the last assigned sequence number, and
//! the lowest WAL segment number still holding unflushed data.
//!
//! ## Durability model
//!
//! State is persisted as a log of [`VersionEdit`] records in a
//! `MANIFEST-<n>` file (framed and CRC-checked by the generic
//! [`Wal`](crate::wal::Wal)). The small `CURRENT` file names the active
//! manifest. At open, the manifest named by `CURRENT` is replayed edit by
//! edit to reconstruct the live-file set.
//!
//! Each edit is atomic: one frame either fully applies at replay or —
//! if the process died mid-write — is discarded with the torn tail. A
//! compaction therefore removes its inputs and adds its outputs in one
//! indivisible step.
//!
//! ## Checkpoints
//!
//! Replay cost grows with the edit count, so the manifest is periodically
//! rewritten: a fresh `MANIFEST-<n>` — `n` drawn from the same
//! database-wide file-number counter that numbers WAL segments and
//! tables — receives one cumulative edit describing the entire state,
//! `CURRENT` is flipped via tmp-file + atomic rename + directory fsync,
//! and the old manifest file is removed. Checkpoints run at open, at
//! close, and after [`CHECKPOINT_EVERY`] edits.
//!
//! ## Invariants enforced on apply
//!
//! - No file number appears in two levels at once.
//! - Within any level ≥ 1, files are disjoint and sorted by smallest key.
//! - `next_file_number` stays above every live file number, including the
//!   active manifest's own.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use crate::config::WalSyncMode;
use crate::db::filename::{self, CURRENT_FILE};
use crate::encoding::{self, EncodingError};
use crate::sstable::TableMeta;
use crate::wal::{Wal, WalError};
use thiserror::Error;
use tracing::{info, warn};

/// Number of edits after which the caller should checkpoint.
pub const CHECKPOINT_EVERY: u64 = 512;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by manifest operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying WAL failure.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The manifest or an edit violates a structural invariant.
    #[error("Corruption: {0}")]
    Corruption(String),

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Version edits
// ------------------------------------------------------------------------------------------------

/// A table added to a level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedFile {
    /// Destination level.
    pub level: u32,

    /// Metadata of the new file.
    pub meta: TableMeta,
}

/// A table removed from a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovedFile {
    /// Level the file currently lives in.
    pub level: u32,

    /// File number of the removed table.
    pub file_number: u64,
}

/// One atomic mutation of the live-file set.
///
/// Counter fields use `0` to mean "no change"; on apply they behave as
/// monotonic maxima, which also makes replay idempotent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionEdit {
    /// Files added, with their destination levels.
    pub added: Vec<AddedFile>,

    /// Files removed, with their source levels.
    pub removed: Vec<RemovedFile>,

    /// New lower bound for the file-number counter.
    pub next_file_number: u64,

    /// Largest sequence number made durable by this edit.
    pub last_sequence: u64,

    /// Lowest WAL segment number still holding unflushed data; segments
    /// below this are obsolete.
    pub log_number: u64,
}

// ------------------------------------------------------------------------------------------------
// Encoding implementations
// ------------------------------------------------------------------------------------------------

impl encoding::Encode for TableMeta {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::Encode::encode_to(&self.file_number, buf)?;
        encoding::Encode::encode_to(&self.size, buf)?;
        encoding::Encode::encode_to(&self.smallest_key, buf)?;
        encoding::Encode::encode_to(&self.largest_key, buf)?;
        encoding::Encode::encode_to(&self.smallest_seq, buf)?;
        encoding::Encode::encode_to(&self.largest_seq, buf)?;
        Ok(())
    }
}

impl encoding::Decode for TableMeta {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (file_number, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (size, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (smallest_key, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (largest_key, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (smallest_seq, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (largest_seq, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                file_number,
                size,
                smallest_key,
                largest_key,
                smallest_seq,
                largest_seq,
            },
            offset,
        ))
    }
}

impl encoding::Encode for AddedFile {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::Encode::encode_to(&self.level, buf)?;
        encoding::Encode::encode_to(&self.meta, buf)?;
        Ok(())
    }
}

impl encoding::Decode for AddedFile {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (level, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (meta, n) = TableMeta::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { level, meta }, offset))
    }
}

impl encoding::Encode for RemovedFile {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::Encode::encode_to(&self.level, buf)?;
        encoding::Encode::encode_to(&self.file_number, buf)?;
        Ok(())
    }
}

impl encoding::Decode for RemovedFile {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (level, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (file_number, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { level, file_number }, offset))
    }
}

impl encoding::Encode for VersionEdit {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::encode_vec(&self.added, buf)?;
        encoding::encode_vec(&self.removed, buf)?;
        encoding::Encode::encode_to(&self.next_file_number, buf)?;
        encoding::Encode::encode_to(&self.last_sequence, buf)?;
        encoding::Encode::encode_to(&self.log_number, buf)?;
        Ok(())
    }
}

impl encoding::Decode for VersionEdit {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (added, n) = encoding::decode_vec::<AddedFile>(&buf[offset..])?;
        offset += n;
        let (removed, n) = encoding::decode_vec::<RemovedFile>(&buf[offset..])?;
        offset += n;
        let (next_file_number, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (last_sequence, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (log_number, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                added,
                removed,
                next_file_number,
                last_sequence,
                log_number,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Manifest state
// ------------------------------------------------------------------------------------------------

/// In-memory image of the durable metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestState {
    /// Live tables per level. Index 0 is L0 (newest file last); levels ≥ 1
    /// are sorted by smallest key and pairwise disjoint.
    pub levels: Vec<Vec<TableMeta>>,

    /// Next file number to allocate.
    pub next_file_number: u64,

    /// Largest sequence number known durable in any table.
    pub last_sequence: u64,

    /// Lowest WAL segment number still holding unflushed data.
    pub log_number: u64,
}

impl ManifestState {
    fn new(max_level: u32) -> Self {
        Self {
            levels: vec![Vec::new(); max_level as usize],
            next_file_number: 1,
            last_sequence: 0,
            log_number: 0,
        }
    }

    /// Total number of live table files.
    pub fn num_files(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// File numbers of every live table.
    pub fn live_files(&self) -> Vec<u64> {
        self.levels
            .iter()
            .flat_map(|level| level.iter().map(|m| m.file_number))
            .collect()
    }
}

/// Applies one edit to a state image, enforcing the structural invariants.
///
/// Shared by replay (reconstructing state from the log) and by live
/// `log_and_apply` calls, so both paths are bit-identical.
pub fn apply_edit(state: &mut ManifestState, edit: &VersionEdit) -> Result<(), ManifestError> {
    for removed in &edit.removed {
        let level = state.levels.get_mut(removed.level as usize).ok_or_else(|| {
            ManifestError::Corruption(format!("edit removes from level {} out of range", removed.level))
        })?;
        level.retain(|meta| meta.file_number != removed.file_number);
    }

    for added in &edit.added {
        let level_idx = added.level as usize;
        if level_idx >= state.levels.len() {
            return Err(ManifestError::Corruption(format!(
                "edit adds to level {} out of range",
                added.level
            )));
        }

        // No file may live in two levels at once.
        for (idx, level) in state.levels.iter().enumerate() {
            if level.iter().any(|m| m.file_number == added.meta.file_number) {
                return Err(ManifestError::Corruption(format!(
                    "file {} already live in level {idx}",
                    added.meta.file_number
                )));
            }
        }

        if added.meta.file_number >= state.next_file_number {
            state.next_file_number = added.meta.file_number + 1;
        }

        let level = &mut state.levels[level_idx];
        if added.level == 0 {
            level.push(added.meta.clone());
        } else {
            let at = level.partition_point(|m| m.smallest_key < added.meta.smallest_key);
            level.insert(at, added.meta.clone());
        }
    }

    // Monotonic counters.
    if edit.next_file_number > state.next_file_number {
        state.next_file_number = edit.next_file_number;
    }
    if edit.last_sequence > state.last_sequence {
        state.last_sequence = edit.last_sequence;
    }
    if edit.log_number > state.log_number {
        state.log_number = edit.log_number;
    }

    // Levels ≥ 1 must stay disjoint and sorted after every edit.
    for (idx, level) in state.levels.iter().enumerate().skip(1) {
        for pair in level.windows(2) {
            if pair[0].largest_key >= pair[1].smallest_key {
                return Err(ManifestError::Corruption(format!(
                    "level {idx}: files {} and {} overlap",
                    pair[0].file_number, pair[1].file_number
                )));
            }
        }
    }

    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Manifest core
// ------------------------------------------------------------------------------------------------

/// Durable metadata manager: the `MANIFEST-<n>` edit log plus `CURRENT`.
///
/// Mutations take `&self` (the state lives behind a mutex and the WAL is
/// internally synchronized); only [`Manifest::checkpoint`] requires
/// `&mut self`, because it swaps the underlying log file and must not race
/// with concurrent appends.
#[derive(Debug)]
pub struct Manifest {
    /// Database root directory.
    dir: PathBuf,

    /// Number of the manifest file currently receiving edits.
    manifest_number: u64,

    /// The edit log.
    wal: Wal<VersionEdit>,

    /// Reconstructed state image.
    state: Mutex<ManifestState>,

    /// Edits appended since the last checkpoint.
    edits_since_checkpoint: Mutex<u64>,
}

impl Manifest {
    /// Opens the manifest for a database rooted at `dir`.
    ///
    /// Follows `CURRENT` to the active manifest and replays it; on a fresh
    /// directory, creates `MANIFEST-000001` and `CURRENT`.
    pub fn open(dir: impl AsRef<Path>, max_level: u32) -> Result<Self, ManifestError> {
        let dir = dir.as_ref().to_path_buf();
        let current_path = dir.join(CURRENT_FILE);

        let manifest_number = if current_path.exists() {
            read_current(&current_path)?
        } else {
            let number = 1;
            // Order matters: the manifest must exist before CURRENT names it.
            let _ = Wal::<VersionEdit>::open(
                filename::manifest_path(&dir, number),
                number,
                None,
                WalSyncMode::Always,
            )?;
            write_current(&dir, number)?;
            info!(manifest = number, "fresh manifest created");
            number
        };

        let wal = Wal::<VersionEdit>::open(
            filename::manifest_path(&dir, manifest_number),
            manifest_number,
            None,
            WalSyncMode::Always,
        )?;

        // Replay edits; a torn tail ends replay, everything before it
        // holds, and the tail is cut so later appends stay reachable.
        let mut state = ManifestState::new(max_level);
        let mut replayed: u64 = 0;
        let mut iter = wal.replay_iter();
        let mut good_offset = crate::wal::WalHeader::HEADER_DISK_SIZE as u64;
        loop {
            match iter.next() {
                None => break,
                Some(Ok(edit)) => {
                    apply_edit(&mut state, &edit)?;
                    good_offset = iter.offset();
                    replayed += 1;
                }
                Some(Err(e @ (WalError::Io(_) | WalError::Internal(_)))) => {
                    return Err(ManifestError::Wal(e));
                }
                Some(Err(e)) => {
                    warn!(error = %e, replayed, "manifest replay stopped at damaged frame");
                    wal.truncate_to(good_offset)?;
                    break;
                }
            }
        }

        // The active manifest's own number is an allocation from the
        // shared counter; recovery must never hand it out again.
        if state.next_file_number <= manifest_number {
            state.next_file_number = manifest_number + 1;
        }

        info!(
            manifest = manifest_number,
            replayed,
            files = state.num_files(),
            last_sequence = state.last_sequence,
            "manifest opened"
        );

        Ok(Self {
            dir,
            manifest_number,
            wal,
            state: Mutex::new(state),
            edits_since_checkpoint: Mutex::new(replayed),
        })
    }

    /// Returns a clone of the current state image.
    pub fn state(&self) -> Result<ManifestState, ManifestError> {
        Ok(self.lock_state()?.clone())
    }

    /// Appends an edit to the log and applies it to the state image.
    ///
    /// The edit is validated against a scratch copy first, so a rejected
    /// edit leaves both the log and the state untouched.
    pub fn log_and_apply(&self, edit: &VersionEdit) -> Result<(), ManifestError> {
        let mut state = self.lock_state()?;

        let mut next = state.clone();
        apply_edit(&mut next, edit)?;

        self.wal.append(edit)?;
        *state = next;

        let mut count = self
            .edits_since_checkpoint
            .lock()
            .map_err(|_| ManifestError::Internal("Mutex poisoned".into()))?;
        *count += 1;

        Ok(())
    }

    /// Returns `true` when enough edits have accumulated that the caller
    /// should checkpoint.
    pub fn wants_checkpoint(&self) -> bool {
        self.edits_since_checkpoint
            .lock()
            .map(|count| *count >= CHECKPOINT_EVERY)
            .unwrap_or(false)
    }

    /// Rewrites the manifest as a single cumulative edit in a fresh
    /// `MANIFEST-<next_number>`, flips `CURRENT`, and removes the old
    /// file.
    ///
    /// `next_number` must come from the database-wide file-number counter
    /// (the same one that numbers WAL segments and tables), so that a
    /// file number identifies one file regardless of its kind. The
    /// cumulative edit persists the allocation: replay restores a
    /// `next_file_number` above it.
    pub fn checkpoint(&mut self, next_number: u64) -> Result<(), ManifestError> {
        if next_number <= self.manifest_number {
            return Err(ManifestError::Internal(format!(
                "checkpoint number {next_number} does not advance past manifest {}",
                self.manifest_number
            )));
        }

        let state = {
            let mut guard = self.lock_state()?;
            // The allocation is part of durable state, exactly as if an
            // edit had carried it.
            if next_number + 1 > guard.next_file_number {
                guard.next_file_number = next_number + 1;
            }
            guard.clone()
        };

        let next_path = filename::manifest_path(&self.dir, next_number);

        let cumulative = VersionEdit {
            added: state
                .levels
                .iter()
                .enumerate()
                .flat_map(|(level, metas)| {
                    metas.iter().map(move |meta| AddedFile {
                        level: level as u32,
                        meta: meta.clone(),
                    })
                })
                .collect(),
            removed: Vec::new(),
            next_file_number: state.next_file_number,
            last_sequence: state.last_sequence,
            log_number: state.log_number,
        };

        let next_wal =
            Wal::<VersionEdit>::open(&next_path, next_number, None, WalSyncMode::Always)?;
        next_wal.append(&cumulative)?;
        next_wal.sync()?;

        // Publish: CURRENT now names the new manifest.
        write_current(&self.dir, next_number)?;

        let old_path = filename::manifest_path(&self.dir, self.manifest_number);
        if let Err(e) = fs::remove_file(&old_path) {
            warn!(path = %old_path.display(), error = %e, "failed to remove old manifest");
        }

        info!(
            old = self.manifest_number,
            new = next_number,
            files = state.num_files(),
            "manifest checkpoint"
        );

        self.wal = next_wal;
        self.manifest_number = next_number;
        *self
            .edits_since_checkpoint
            .lock()
            .map_err(|_| ManifestError::Internal("Mutex poisoned".into()))? = 0;

        Ok(())
    }

    /// Largest sequence number known durable in any table.
    pub fn last_sequence(&self) -> Result<u64, ManifestError> {
        Ok(self.lock_state()?.last_sequence)
    }

    /// File number of the manifest currently receiving edits.
    pub fn manifest_number(&self) -> u64 {
        self.manifest_number
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, ManifestState>, ManifestError> {
        self.state
            .lock()
            .map_err(|_| ManifestError::Internal("Mutex poisoned".into()))
    }
}

// ------------------------------------------------------------------------------------------------
// CURRENT file helpers
// ------------------------------------------------------------------------------------------------

/// Reads the manifest number named by `CURRENT`.
fn read_current(path: &Path) -> Result<u64, ManifestError> {
    let mut contents = String::new();
    File::open(path)?.read_to_string(&mut contents)?;

    let name = contents.trim();
    match filename::parse_file_name(name) {
        filename::FileKind::Manifest(n) => Ok(n),
        _ => Err(ManifestError::Corruption(format!(
            "CURRENT names invalid manifest {name:?}"
        ))),
    }
}

/// Atomically rewrites `CURRENT` to name manifest `number`.
fn write_current(dir: &Path, number: u64) -> Result<(), ManifestError> {
    let tmp_path = dir.join(format!("{CURRENT_FILE}.tmp"));
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(filename::manifest_name(number).as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, dir.join(CURRENT_FILE))?;
    File::open(dir)?.sync_all()?;
    Ok(())
}
