//! # Sorted String Table (SSTable) Module
//!
//! Immutable, sorted, on-disk key-value files — the persistent layer of the
//! LSM tree. Each table is written once by [`TableBuilder`], then only ever
//! read, so readers are lock-free and tables can be shared freely behind
//! `Arc`.
//!
//! # On-disk layout
//!
//! ```text
//! [data_block_0][data_block_1]…[data_block_k]
//! [bloom_block?]
//! [index_block]
//! [footer (fixed, 40 bytes)]
//! ```
//!
//! - **Data block** — prefix-compressed records with restart points:
//!   `[record_0]…[record_n][restart_off: u32…][n_restarts: u32]`. Each
//!   record is `{shared: uvarint, key_delta_len: uvarint, value_len:
//!   uvarint, seq: u64, op: u8, key_delta, value}`. Records are sorted by
//!   `(user_key ASC, seq DESC)`; multiple versions of one key may coexist.
//! - **Bloom block** — serialized [`BloomFilter`](bloom::BloomFilter);
//!   absent when bloom filters are disabled.
//! - **Index block** — `Vec<IndexEntry>` mapping the first key of each data
//!   block to its `(offset, length)`.
//! - **Footer** — `{index_off: u64, index_len: u32, filter_off: u64,
//!   filter_len: u32, footer_crc: u32, reserved: u32, magic: u64}`. The CRC
//!   covers the first 24 bytes; the magic is `0xDB4D15C0FFEE5000`.
//!
//! # Reading
//!
//! [`Table::open`] memory-maps the file, validates the footer, and loads
//! the index and bloom blocks. Point lookups binary-search the index and
//! scan at most a handful of 4 KiB blocks; range scans walk blocks
//! sequentially via [`TableIter`](iterator::TableIter).
//!
//! # Integrity
//!
//! The footer carries a CRC32 and magic number; block decoding validates
//! every length and varint against the block bounds. Any violation
//! surfaces as [`TableError::Corruption`] — the engine never silently
//! repairs or deletes a damaged table.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod bloom;
pub mod builder;
pub mod iterator;

#[cfg(test)]
mod tests;

pub use builder::TableBuilder;
pub use iterator::{BlockIterator, TableIter};

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{fs::File, io, path::Path};

use crate::encoding::{self, EncodingError};
use bloom::BloomFilter;
use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;
use tracing::debug;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Footer magic number; the last eight bytes of every table file.
pub(crate) const TABLE_MAGIC: u64 = 0xDB4D_15C0_FFEE_5000;

/// Fixed footer size in bytes.
pub(crate) const FOOTER_SIZE: usize = 40;

/// A full key (shared = 0) is stored every this many records within a
/// data block; seeks binary-search the restart array then scan linearly.
pub(crate) const RESTART_INTERVAL: usize = 16;

/// Record op tags inside data blocks.
pub(crate) const BLOCK_OP_PUT: u8 = 0;
pub(crate) const BLOCK_OP_DELETE: u8 = 1;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by SSTable operations (read, write, build).
#[derive(Debug, Error)]
pub enum TableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The file violates the on-disk format: bad magic, failed CRC,
    /// out-of-bounds block handle, malformed record.
    #[error("Corruption: {0}")]
    Corruption(String),

    /// Internal invariant violation (unsorted builder input, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Table metadata
// ------------------------------------------------------------------------------------------------

/// Descriptive metadata for one table file, produced by the builder and
/// recorded in the manifest.
///
/// `smallest_key ≤ largest_key` always holds, and every record in the file
/// falls inside that range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
    /// Unique file number (`<n>.sst`), from the database-wide counter.
    pub file_number: u64,

    /// On-disk file size in bytes.
    pub size: u64,

    /// Smallest user key in the file.
    pub smallest_key: Vec<u8>,

    /// Largest user key in the file.
    pub largest_key: Vec<u8>,

    /// Smallest sequence number in the file.
    pub smallest_seq: u64,

    /// Largest sequence number in the file.
    pub largest_seq: u64,
}

impl TableMeta {
    /// Returns `true` when this table's key range overlaps `[start, end]`
    /// (both bounds inclusive — callers pass user-key bounds).
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        self.smallest_key.as_slice() <= end && self.largest_key.as_slice() >= start
    }

    /// Returns `true` when `key` falls inside this table's key range.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.smallest_key.as_slice() <= key && key <= self.largest_key.as_slice()
    }
}

// ------------------------------------------------------------------------------------------------
// On-disk structures
// ------------------------------------------------------------------------------------------------

/// Index entry pointing to one data block.
#[derive(Debug, Clone)]
pub(crate) struct IndexEntry {
    /// First user key stored in the block.
    pub(crate) first_key: Vec<u8>,

    /// Byte offset of the block within the file.
    pub(crate) offset: u64,

    /// Byte length of the block.
    pub(crate) len: u32,
}

impl encoding::Encode for IndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::Encode::encode_to(&self.first_key, buf)?;
        encoding::Encode::encode_to(&self.offset, buf)?;
        encoding::Encode::encode_to(&self.len, buf)?;
        Ok(())
    }
}

impl encoding::Decode for IndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (first_key, n) = <Vec<u8>>::decode_from(&buf[off..])?;
        off += n;
        let (offset, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (len, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                first_key,
                offset,
                len,
            },
            off,
        ))
    }
}

/// Fixed-size footer at the end of every table file.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Footer {
    pub(crate) index_off: u64,
    pub(crate) index_len: u32,
    pub(crate) filter_off: u64,
    pub(crate) filter_len: u32,
}

impl Footer {
    /// Encodes the footer into its fixed 40-byte layout.
    pub(crate) fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[0..8].copy_from_slice(&self.index_off.to_le_bytes());
        buf[8..12].copy_from_slice(&self.index_len.to_le_bytes());
        buf[12..20].copy_from_slice(&self.filter_off.to_le_bytes());
        buf[20..24].copy_from_slice(&self.filter_len.to_le_bytes());

        let mut hasher = Crc32::new();
        hasher.update(&buf[0..24]);
        let crc = hasher.finalize();
        buf[24..28].copy_from_slice(&crc.to_le_bytes());
        // buf[28..32] reserved, zero.
        buf[32..40].copy_from_slice(&TABLE_MAGIC.to_le_bytes());
        buf
    }

    /// Decodes and validates a footer from its 40 raw bytes.
    pub(crate) fn decode(buf: &[u8]) -> Result<Self, TableError> {
        if buf.len() != FOOTER_SIZE {
            return Err(TableError::Corruption(format!(
                "footer is {} bytes, expected {FOOTER_SIZE}",
                buf.len()
            )));
        }

        let magic = u64::from_le_bytes(buf[32..40].try_into().unwrap_or_default());
        if magic != TABLE_MAGIC {
            return Err(TableError::Corruption(format!(
                "bad footer magic 0x{magic:016X}"
            )));
        }

        let stored_crc = u32::from_le_bytes(buf[24..28].try_into().unwrap_or_default());
        let mut hasher = Crc32::new();
        hasher.update(&buf[0..24]);
        if hasher.finalize() != stored_crc {
            return Err(TableError::Corruption("footer checksum mismatch".into()));
        }

        Ok(Self {
            index_off: u64::from_le_bytes(buf[0..8].try_into().unwrap_or_default()),
            index_len: u32::from_le_bytes(buf[8..12].try_into().unwrap_or_default()),
            filter_off: u64::from_le_bytes(buf[12..20].try_into().unwrap_or_default()),
            filter_len: u32::from_le_bytes(buf[20..24].try_into().unwrap_or_default()),
        })
    }
}

// ------------------------------------------------------------------------------------------------
// TableGet
// ------------------------------------------------------------------------------------------------

/// Result of a single-table point lookup.
///
/// `Delete` is an authoritative answer (the key is masked by a tombstone);
/// `NotFound` means this table has no version of the key at or below the
/// snapshot and the lookup must continue to older data.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum TableGet {
    /// A value stored in this table.
    Put {
        /// Stored value.
        value: Vec<u8>,
        /// Sequence number of this version.
        seq: u64,
    },

    /// A point tombstone for this key.
    Delete {
        /// Sequence number of the tombstone.
        seq: u64,
    },

    /// This table has no information about the key.
    NotFound,
}

// ------------------------------------------------------------------------------------------------
// Table — immutable reader
// ------------------------------------------------------------------------------------------------

/// A memory-mapped, immutable sorted table.
///
/// # Safety
///
/// Uses `unsafe { Mmap::map(...) }`, which is sound here because table
/// files are never modified after the atomic rename that publishes them,
/// the mapping is read-only, and every block access is bounds-checked.
#[derive(Debug)]
pub struct Table {
    /// Memory-mapped file contents.
    mmap: Mmap,

    /// Decoded index block.
    pub(crate) index: Vec<IndexEntry>,

    /// Decoded bloom filter, if the table carries one.
    bloom: Option<BloomFilter>,
}

impl Table {
    /// Opens a table file, validating the footer and loading the index and
    /// bloom blocks.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TableError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        let file_len = mmap.len();
        if file_len < FOOTER_SIZE {
            return Err(TableError::Corruption(format!(
                "file too small for footer ({file_len} bytes)"
            )));
        }

        let footer = Footer::decode(&mmap[file_len - FOOTER_SIZE..])?;

        let index_bytes = slice_checked(&mmap, footer.index_off, footer.index_len as u64)?;
        let (index, _) = encoding::decode_vec::<IndexEntry>(index_bytes)?;

        let bloom = if footer.filter_len > 0 {
            let filter_bytes = slice_checked(&mmap, footer.filter_off, footer.filter_len as u64)?;
            Some(BloomFilter::decode(filter_bytes)?)
        } else {
            None
        };

        debug!(
            path = %path.display(),
            blocks = index.len(),
            has_bloom = bloom.is_some(),
            size = file_len,
            "table opened"
        );

        Ok(Self { mmap, index, bloom })
    }

    /// On-disk file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Checks whether `key` *might* exist in this table according to the
    /// bloom filter.
    ///
    /// Returns `true` when the bloom says "maybe" or the table carries no
    /// filter; `false` only on a definitive negative.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        match &self.bloom {
            Some(bloom) => bloom.may_contain(key),
            None => true,
        }
    }

    /// Looks up the newest version of `key` with `seq ≤ snapshot_seq`.
    ///
    /// The caller is expected to consult [`Table::may_contain`] first; this
    /// method always reads data blocks. Records for one key may span a
    /// block boundary, so the scan continues across blocks while the key
    /// matches.
    pub fn get(&self, key: &[u8], snapshot_seq: u64) -> Result<TableGet, TableError> {
        let mut iter = iterator::TableIter::new(self, key, None)?;

        loop {
            match iter.next_checked()? {
                None => return Ok(TableGet::NotFound),
                Some(record) => {
                    if record.key() != key {
                        return Ok(TableGet::NotFound);
                    }
                    // Versions of one key arrive seq-descending; the first
                    // one at or below the snapshot is the answer.
                    if record.seq() <= snapshot_seq {
                        return Ok(match record {
                            crate::db::utils::Record::Put { value, seq, .. } => {
                                TableGet::Put { value, seq }
                            }
                            crate::db::utils::Record::Delete { seq, .. } => TableGet::Delete { seq },
                        });
                    }
                }
            }
        }
    }

    /// Returns a forward scan over `[start, end)`; `end = None` is
    /// unbounded. Yields raw multi-version records in
    /// `(key ASC, seq DESC)` order — visibility resolution is the upper
    /// layers' job.
    pub fn iter(&self, start: &[u8], end: Option<&[u8]>) -> Result<iterator::TableIter<&Table>, TableError> {
        iterator::TableIter::new(self, start, end)
    }

    /// Copies the raw bytes of data block `idx` out of the mmap.
    pub(crate) fn block_bytes(&self, idx: usize) -> Result<Vec<u8>, TableError> {
        let entry = self
            .index
            .get(idx)
            .ok_or_else(|| TableError::Internal(format!("block index {idx} out of range")))?;
        Ok(slice_checked(&self.mmap, entry.offset, entry.len as u64)?.to_vec())
    }

    /// Index of the data block that may contain `key`: the last block whose
    /// first key is ≤ `key` (or block 0 when `key` precedes everything).
    pub(crate) fn find_block(&self, key: &[u8]) -> usize {
        let idx = self
            .index
            .partition_point(|entry| entry.first_key.as_slice() <= key);
        idx.saturating_sub(1)
    }
}

/// Bounds-checked slice of the mmap.
fn slice_checked(mmap: &Mmap, offset: u64, len: u64) -> Result<&[u8], TableError> {
    let start = usize::try_from(offset)
        .map_err(|_| TableError::Corruption("block offset exceeds addressable range".into()))?;
    let len = usize::try_from(len)
        .map_err(|_| TableError::Corruption("block length exceeds addressable range".into()))?;

    let end = start
        .checked_add(len)
        .ok_or_else(|| TableError::Corruption("block bounds overflow".into()))?;
    if end > mmap.len() {
        return Err(TableError::Corruption(format!(
            "block [{start}, {end}) outside file of {} bytes",
            mmap.len()
        )));
    }
    Ok(&mmap[start..end])
}
