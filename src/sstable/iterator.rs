//! SSTable iterators — block-level decode and multi-block scan.
//!
//! Two iterator types:
//!
//! - [`BlockIterator`] — decodes a single data block, reconstructing
//!   prefix-compressed keys and supporting restart-array seeks.
//! - [`TableIter`] — walks consecutive data blocks, yielding a stream of
//!   [`Record`]s over a key range in `(key ASC, seq DESC)` order.
//!
//! # Block records
//!
//! ```text
//! [shared: uvarint][key_delta_len: uvarint][value_len: uvarint]
//! [seq: u64 LE][op: u8][key_delta][value]
//! ```
//!
//! `shared` is the length of the prefix shared with the previous record's
//! key. Every [`RESTART_INTERVAL`](super::RESTART_INTERVAL)-th record is a
//! restart with `shared = 0`; the block trailer lists restart offsets so a
//! seek binary-searches restarts and then scans at most one interval.
//!
//! # Error behavior
//!
//! The checked entry points ([`BlockIterator::next_entry`],
//! [`TableIter::next_checked`]) propagate [`TableError::Corruption`] for
//! malformed bytes, which is what the point-lookup path reports to the
//! caller. The plain `Iterator` impls — used by long scans and compaction —
//! log the failure and end the stream, mirroring how a truncated WAL tail
//! ends replay.

use std::ops::Deref;

use crate::db::utils::Record;
use crate::encoding::get_uvarint;

use super::{BLOCK_OP_DELETE, BLOCK_OP_PUT, Table, TableError};

// ------------------------------------------------------------------------------------------------
// Block Entry
// ------------------------------------------------------------------------------------------------

/// A fully decoded entry from a data block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEntry {
    /// The user key (prefix decompression already applied).
    pub key: Vec<u8>,

    /// The value bytes. Empty for tombstones.
    pub value: Vec<u8>,

    /// Whether this entry is a point tombstone.
    pub is_delete: bool,

    /// Sequence number of this version.
    pub seq: u64,
}

// ------------------------------------------------------------------------------------------------
// Block Iterator
// ------------------------------------------------------------------------------------------------

/// Iterator over the entries of a single data block.
///
/// Owns a copy of the block bytes (one block is ~4 KiB), so it has no
/// borrow relationship with the mmap and can live inside owning scans.
pub struct BlockIterator {
    /// Raw block bytes, including the restart trailer.
    data: Vec<u8>,

    /// Byte offset where entries end and the restart array begins.
    entries_end: usize,

    /// Restart offsets parsed from the trailer.
    restarts: Vec<usize>,

    /// Cursor into `data`, pointing at the next record header.
    cursor: usize,

    /// Previous record's full key — the prefix base for the next record.
    last_key: Vec<u8>,
}

impl BlockIterator {
    /// Parses the restart trailer and positions the cursor at the first
    /// entry.
    pub fn new(data: Vec<u8>) -> Result<Self, TableError> {
        if data.len() < 4 {
            return Err(TableError::Corruption(
                "data block too small for restart count".into(),
            ));
        }

        let n_restarts =
            u32::from_le_bytes(data[data.len() - 4..].try_into().unwrap_or_default()) as usize;
        let trailer = n_restarts
            .checked_mul(4)
            .and_then(|r| r.checked_add(4))
            .ok_or_else(|| TableError::Corruption("restart count overflow".into()))?;
        if trailer > data.len() {
            return Err(TableError::Corruption(format!(
                "restart array ({n_restarts} entries) larger than block"
            )));
        }

        let entries_end = data.len() - trailer;
        let mut restarts = Vec::with_capacity(n_restarts);
        for i in 0..n_restarts {
            let at = entries_end + i * 4;
            let off =
                u32::from_le_bytes(data[at..at + 4].try_into().unwrap_or_default()) as usize;
            if off >= entries_end && !(off == 0 && entries_end == 0) {
                return Err(TableError::Corruption(format!(
                    "restart offset {off} outside entry area ({entries_end} bytes)"
                )));
            }
            restarts.push(off);
        }

        Ok(Self {
            data,
            entries_end,
            restarts,
            cursor: 0,
            last_key: Vec::new(),
        })
    }

    /// Decodes the next entry, advancing the cursor.
    ///
    /// Returns `Ok(None)` at the end of the block and
    /// `Err(TableError::Corruption)` for malformed bytes.
    pub fn next_entry(&mut self) -> Result<Option<BlockEntry>, TableError> {
        if self.cursor >= self.entries_end {
            return Ok(None);
        }

        let (shared, delta_len, value_len, seq, op, body_at) = self.decode_header(self.cursor)?;

        let body_end = body_at + delta_len + value_len;
        if shared > self.last_key.len() {
            return Err(TableError::Corruption(format!(
                "shared prefix {shared} exceeds previous key length {}",
                self.last_key.len()
            )));
        }

        let mut key = Vec::with_capacity(shared + delta_len);
        key.extend_from_slice(&self.last_key[..shared]);
        key.extend_from_slice(&self.data[body_at..body_at + delta_len]);
        let value = self.data[body_at + delta_len..body_end].to_vec();

        let is_delete = match op {
            BLOCK_OP_PUT => false,
            BLOCK_OP_DELETE => {
                if value_len != 0 {
                    return Err(TableError::Corruption(
                        "tombstone record carries a value".into(),
                    ));
                }
                true
            }
            other => {
                return Err(TableError::Corruption(format!(
                    "unknown record op 0x{other:02X}"
                )));
            }
        };

        self.cursor = body_end;
        self.last_key = key.clone();

        Ok(Some(BlockEntry {
            key,
            value,
            is_delete,
            seq,
        }))
    }

    /// Positions the iterator so the next entry is the first with
    /// `key ≥ target`.
    ///
    /// Binary-searches the restart array, then scans at most one restart
    /// interval linearly.
    pub fn seek(&mut self, target: &[u8]) -> Result<(), TableError> {
        // Largest restart whose key is <= target; default to the first.
        let mut lo = 0usize;
        let mut hi = self.restarts.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.restart_key(mid)?.as_slice() <= target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let restart_idx = lo.saturating_sub(1);

        self.cursor = self.restarts.get(restart_idx).copied().unwrap_or(0);
        self.last_key.clear();

        loop {
            let saved_cursor = self.cursor;
            let saved_key = self.last_key.clone();

            match self.next_entry()? {
                None => return Ok(()),
                Some(entry) => {
                    if entry.key.as_slice() >= target {
                        // Rewind so the matching entry is yielded next.
                        self.cursor = saved_cursor;
                        self.last_key = saved_key;
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Decodes the full key at restart `idx` without touching iterator
    /// state.
    fn restart_key(&self, idx: usize) -> Result<Vec<u8>, TableError> {
        let at = self.restarts[idx];
        let (shared, delta_len, _value_len, _seq, _op, body_at) = self.decode_header(at)?;
        if shared != 0 {
            return Err(TableError::Corruption(
                "restart record has nonzero shared prefix".into(),
            ));
        }
        Ok(self.data[body_at..body_at + delta_len].to_vec())
    }

    /// Decodes one record header starting at `at`.
    ///
    /// Returns `(shared, delta_len, value_len, seq, op, body_offset)` with
    /// all bounds already validated against the entry area.
    #[allow(clippy::type_complexity)]
    fn decode_header(
        &self,
        at: usize,
    ) -> Result<(usize, usize, usize, u64, u8, usize), TableError> {
        let entries = &self.data[..self.entries_end];
        let mut cursor = at;

        let (shared, n) = get_uvarint(&entries[cursor..])
            .map_err(|e| TableError::Corruption(format!("bad record varint: {e}")))?;
        cursor += n;
        let (delta_len, n) = get_uvarint(&entries[cursor..])
            .map_err(|e| TableError::Corruption(format!("bad record varint: {e}")))?;
        cursor += n;
        let (value_len, n) = get_uvarint(&entries[cursor..])
            .map_err(|e| TableError::Corruption(format!("bad record varint: {e}")))?;
        cursor += n;

        if entries.len() - cursor < 9 {
            return Err(TableError::Corruption(
                "record header truncated before seq/op".into(),
            ));
        }
        let seq = u64::from_le_bytes(entries[cursor..cursor + 8].try_into().unwrap_or_default());
        let op = entries[cursor + 8];
        cursor += 9;

        let shared = usize::try_from(shared)
            .map_err(|_| TableError::Corruption("shared prefix length overflow".into()))?;
        let delta_len = usize::try_from(delta_len)
            .map_err(|_| TableError::Corruption("key delta length overflow".into()))?;
        let value_len = usize::try_from(value_len)
            .map_err(|_| TableError::Corruption("value length overflow".into()))?;

        let body_end = cursor
            .checked_add(delta_len)
            .and_then(|x| x.checked_add(value_len))
            .ok_or_else(|| TableError::Corruption("record body overflow".into()))?;
        if body_end > entries.len() {
            return Err(TableError::Corruption(
                "record body extends past entry area".into(),
            ));
        }

        Ok((shared, delta_len, value_len, seq, op, cursor))
    }
}

impl Iterator for BlockIterator {
    type Item = BlockEntry;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entry() {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "block decode failed mid-iteration");
                self.cursor = self.entries_end;
                None
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Table Iterator
// ------------------------------------------------------------------------------------------------

/// Forward scan over the records of one table within `[start, end)`.
///
/// Generic over `Deref<Target = Table>` so callers can hand it either a
/// borrowed `&Table` (point lookups) or an owned `Arc<Table>` (range scans
/// that must outlive the read view they came from).
pub struct TableIter<S: Deref<Target = Table>> {
    /// The table being scanned.
    table: S,

    /// Index of the block currently being read.
    block_idx: usize,

    /// Iterator over the current block, `None` before load / after end.
    block: Option<BlockIterator>,

    /// Exclusive upper bound of the scan; `None` = unbounded.
    end: Option<Vec<u8>>,

    /// Set once the scan is exhausted or has failed.
    done: bool,
}

impl<S: Deref<Target = Table>> TableIter<S> {
    /// Creates a scan positioned at the first record with `key ≥ start`.
    pub fn new(table: S, start: &[u8], end: Option<&[u8]>) -> Result<Self, TableError> {
        let empty_range = match end {
            Some(end) => start >= end,
            None => false,
        };

        if table.index.is_empty() || empty_range {
            return Ok(Self {
                table,
                block_idx: 0,
                block: None,
                end: end.map(|e| e.to_vec()),
                done: true,
            });
        }

        let block_idx = table.find_block(start);
        let mut block = BlockIterator::new(table.block_bytes(block_idx)?)?;
        block.seek(start)?;

        Ok(Self {
            table,
            block_idx,
            block: Some(block),
            end: end.map(|e| e.to_vec()),
            done: false,
        })
    }

    /// Returns the next record, propagating corruption errors.
    pub fn next_checked(&mut self) -> Result<Option<Record>, TableError> {
        loop {
            if self.done {
                return Ok(None);
            }

            let Some(block) = self.block.as_mut() else {
                self.done = true;
                return Ok(None);
            };

            if let Some(entry) = block.next_entry()? {
                if let Some(end) = &self.end {
                    if entry.key.as_slice() >= end.as_slice() {
                        self.done = true;
                        return Ok(None);
                    }
                }

                let record = if entry.is_delete {
                    Record::Delete {
                        key: entry.key,
                        seq: entry.seq,
                    }
                } else {
                    Record::Put {
                        key: entry.key,
                        value: entry.value,
                        seq: entry.seq,
                    }
                };
                return Ok(Some(record));
            }

            // Current block exhausted — move to the next one.
            self.block_idx += 1;
            if self.block_idx >= self.table.index.len() {
                self.done = true;
                return Ok(None);
            }
            self.block = Some(BlockIterator::new(self.table.block_bytes(self.block_idx)?)?);
        }
    }
}

impl<S: Deref<Target = Table>> Iterator for TableIter<S> {
    type Item = Record;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_checked() {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(error = %e, "table scan stopped by corruption");
                self.done = true;
                None
            }
        }
    }
}
