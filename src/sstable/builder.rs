//! SSTable writer — builds a complete table file from a sorted record
//! stream.
//!
//! [`TableBuilder`] accepts records in strict `(user_key ASC, seq DESC)`
//! order, packs them into prefix-compressed data blocks, and finishes the
//! file with the bloom block, index block, and footer.
//!
//! # Input requirements
//!
//! - Records must arrive sorted by `(key ASC, seq DESC)`. Duplicate keys
//!   with distinct sequence numbers are allowed — tables may store several
//!   versions of one logical key.
//! - At least one record must be added; empty tables are rejected.
//!
//! # Atomicity
//!
//! 1. Everything is written to `<path>.tmp`.
//! 2. The file is flushed and fsync'd.
//! 3. `<path>.tmp` is renamed over the final path and the directory is
//!    fsync'd.
//!
//! A crash can therefore never publish a partially-written table.

use std::{
    fs::{File, OpenOptions, rename},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::db::utils::Record;
use crate::encoding::{self, put_uvarint};

use super::{
    BLOCK_OP_DELETE, BLOCK_OP_PUT, FOOTER_SIZE, Footer, IndexEntry, RESTART_INTERVAL, TableError,
    TableMeta, bloom::BloomFilter,
};

// ------------------------------------------------------------------------------------------------
// BuildStats — metadata accumulated during construction
// ------------------------------------------------------------------------------------------------

/// Key/sequence bounds gathered while records stream past, turned into the
/// [`TableMeta`] that the manifest records.
struct BuildStats {
    num_entries: u64,
    smallest_seq: u64,
    largest_seq: u64,
    smallest_key: Option<Vec<u8>>,
    largest_key: Option<Vec<u8>>,
}

impl BuildStats {
    fn new() -> Self {
        Self {
            num_entries: 0,
            smallest_seq: u64::MAX,
            largest_seq: 0,
            smallest_key: None,
            largest_key: None,
        }
    }

    fn track(&mut self, key: &[u8], seq: u64) {
        self.num_entries += 1;
        self.smallest_seq = self.smallest_seq.min(seq);
        self.largest_seq = self.largest_seq.max(seq);
        // Records are sorted, so first = smallest key, latest = largest.
        if self.smallest_key.is_none() {
            self.smallest_key = Some(key.to_vec());
        }
        self.largest_key = Some(key.to_vec());
    }
}

// ------------------------------------------------------------------------------------------------
// TableBuilder
// ------------------------------------------------------------------------------------------------

/// Streaming builder for one table file.
///
/// ```rust,ignore
/// let mut builder = TableBuilder::new(&path, file_number, block_size, bits_per_key)?;
/// for record in sorted_records {
///     builder.add(&record)?;
/// }
/// let meta = builder.finish()?;
/// ```
pub struct TableBuilder {
    tmp_path: PathBuf,
    final_path: PathBuf,
    writer: BufWriter<File>,

    /// Bytes written to the file so far (data blocks only, until finish).
    offset: u64,

    /// The data block currently being filled.
    block_buf: Vec<u8>,

    /// Restart offsets within the current block.
    restarts: Vec<u32>,

    /// Records in the current block since the last restart decision.
    block_counter: usize,

    /// Prefix base: the previous key written into the current block.
    prev_block_key: Vec<u8>,

    /// First key of the current block, for its index entry.
    block_first_key: Option<Vec<u8>>,

    /// Completed block index entries.
    index: Vec<IndexEntry>,

    /// Hashes of every added key; the bloom filter is built at finish once
    /// the exact key count is known.
    key_hashes: Vec<(u32, u32)>,

    /// Last `(key, seq)` accepted, for input-order enforcement.
    last_key: Option<Vec<u8>>,
    last_seq: u64,

    stats: BuildStats,

    file_number: u64,
    block_size: usize,
    bits_per_key: u32,
}

impl TableBuilder {
    /// Creates a builder writing to `<path>.tmp` until finished.
    pub fn new(
        path: impl AsRef<Path>,
        file_number: u64,
        block_size: usize,
        bits_per_key: u32,
    ) -> Result<Self, TableError> {
        let final_path = path.as_ref().to_path_buf();
        let tmp_path = {
            let mut os = final_path.clone().into_os_string();
            os.push(".tmp");
            PathBuf::from(os)
        };

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        Ok(Self {
            tmp_path,
            final_path,
            writer: BufWriter::new(file),
            offset: 0,
            block_buf: Vec::with_capacity(block_size + 512),
            restarts: Vec::new(),
            block_counter: 0,
            prev_block_key: Vec::new(),
            block_first_key: None,
            index: Vec::new(),
            key_hashes: Vec::new(),
            last_key: None,
            last_seq: 0,
            stats: BuildStats::new(),
            file_number,
            block_size,
            bits_per_key,
        })
    }

    /// Appends one record.
    ///
    /// Records must arrive in `(key ASC, seq DESC)` order; violations are
    /// rejected with [`TableError::Internal`] since they indicate a bug in
    /// the flush or compaction pipeline rather than on-disk damage.
    pub fn add(&mut self, record: &Record) -> Result<(), TableError> {
        let key = record.key();
        let seq = record.seq();

        if let Some(last) = &self.last_key {
            let in_order = key > last.as_slice() || (key == last.as_slice() && seq < self.last_seq);
            if !in_order {
                return Err(TableError::Internal(format!(
                    "records out of order: ({}, seq {seq}) after ({}, seq {})",
                    DisplayKey(key),
                    DisplayKey(last),
                    self.last_seq
                )));
            }
        }
        self.last_key = Some(key.to_vec());
        self.last_seq = seq;

        if self.block_first_key.is_none() {
            self.block_first_key = Some(key.to_vec());
        }

        // Restart every RESTART_INTERVAL records; restarts store the full key.
        let shared = if self.block_counter % RESTART_INTERVAL == 0 {
            self.restarts.push(self.block_buf.len() as u32);
            0
        } else {
            common_prefix_len(&self.prev_block_key, key)
        };
        self.block_counter += 1;

        let (op, value): (u8, &[u8]) = match record {
            Record::Put { value, .. } => (BLOCK_OP_PUT, value.as_slice()),
            Record::Delete { .. } => (BLOCK_OP_DELETE, &[]),
        };

        put_uvarint(&mut self.block_buf, shared as u64);
        put_uvarint(&mut self.block_buf, (key.len() - shared) as u64);
        put_uvarint(&mut self.block_buf, value.len() as u64);
        self.block_buf.extend_from_slice(&seq.to_le_bytes());
        self.block_buf.push(op);
        self.block_buf.extend_from_slice(&key[shared..]);
        self.block_buf.extend_from_slice(value);

        self.prev_block_key.clear();
        self.prev_block_key.extend_from_slice(key);

        self.key_hashes.push(BloomFilter::key_hash(key));
        self.stats.track(key, seq);

        if self.block_buf.len() >= self.block_size {
            self.flush_block()?;
        }

        Ok(())
    }

    /// Last user key accepted so far.
    ///
    /// Compaction uses this to avoid rolling an output file between two
    /// versions of the same user key.
    pub fn last_user_key(&self) -> Option<&[u8]> {
        self.last_key.as_deref()
    }

    /// Bytes this table would occupy if finished now (footer excluded).
    pub fn estimated_size(&self) -> u64 {
        self.offset + self.block_buf.len() as u64
    }

    /// Number of records accepted so far.
    pub fn num_entries(&self) -> u64 {
        self.stats.num_entries
    }

    /// Writes the buffered data block and records its index entry.
    fn flush_block(&mut self) -> Result<(), TableError> {
        if self.block_buf.is_empty() {
            return Ok(());
        }

        for restart in &self.restarts {
            self.block_buf.extend_from_slice(&restart.to_le_bytes());
        }
        self.block_buf
            .extend_from_slice(&(self.restarts.len() as u32).to_le_bytes());

        self.writer.write_all(&self.block_buf)?;

        let first_key = self.block_first_key.take().ok_or_else(|| {
            TableError::Internal("non-empty block without a first key".into())
        })?;
        self.index.push(IndexEntry {
            first_key,
            offset: self.offset,
            len: self.block_buf.len() as u32,
        });
        self.offset += self.block_buf.len() as u64;

        self.block_buf.clear();
        self.restarts.clear();
        self.block_counter = 0;
        self.prev_block_key.clear();

        Ok(())
    }

    /// Finalizes the table: bloom block, index block, footer, fsync, and
    /// atomic rename into place. Returns the metadata for the manifest.
    pub fn finish(mut self) -> Result<TableMeta, TableError> {
        if self.stats.num_entries == 0 {
            return Err(TableError::Internal(
                "cannot build a table from zero records".into(),
            ));
        }

        self.flush_block()?;

        // Bloom block (optional).
        let filter_off = self.offset;
        let filter_len = if self.bits_per_key > 0 {
            let mut bloom = BloomFilter::new(self.key_hashes.len(), self.bits_per_key);
            for hash in &self.key_hashes {
                bloom.insert_hash(*hash);
            }
            let mut bytes = Vec::with_capacity(bloom.encoded_len());
            bloom.encode_to(&mut bytes);
            self.writer.write_all(&bytes)?;
            self.offset += bytes.len() as u64;
            bytes.len() as u32
        } else {
            0
        };

        // Index block.
        let index_off = self.offset;
        let mut index_bytes = Vec::new();
        encoding::encode_vec(&self.index, &mut index_bytes)?;
        self.writer.write_all(&index_bytes)?;
        self.offset += index_bytes.len() as u64;

        // Footer.
        let footer = Footer {
            index_off,
            index_len: index_bytes.len() as u32,
            filter_off,
            filter_len,
        };
        self.writer.write_all(&footer.encode())?;
        self.offset += FOOTER_SIZE as u64;

        // Durability: flush the buffer, sync the file, publish via rename,
        // sync the directory.
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        rename(&self.tmp_path, &self.final_path)?;
        sync_parent_dir(&self.final_path)?;

        let meta = TableMeta {
            file_number: self.file_number,
            size: self.offset,
            smallest_key: self.stats.smallest_key.unwrap_or_default(),
            largest_key: self.stats.largest_key.unwrap_or_default(),
            smallest_seq: self.stats.smallest_seq,
            largest_seq: self.stats.largest_seq,
        };

        debug!(
            file_number = meta.file_number,
            entries = self.stats.num_entries,
            blocks = self.index.len(),
            size = meta.size,
            "table built"
        );

        Ok(meta)
    }
}

/// Length of the longest common prefix of `a` and `b`.
fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Fsyncs the directory containing `path`, making a rename durable.
fn sync_parent_dir(path: &Path) -> Result<(), TableError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Renders a key as bounded-length hex for error messages.
struct DisplayKey<'a>(&'a [u8]);

impl std::fmt::Display for DisplayKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0.iter().take(24) {
            write!(f, "{byte:02x}")?;
        }
        if self.0.len() > 24 {
            write!(f, "…")?;
        }
        Ok(())
    }
}
