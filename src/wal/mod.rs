//! # Write-Ahead Log Module
//!
//! A durable, append-only, generic record log. Each database component that
//! needs crash recovery writes through a [`Wal`]: the active memtable logs
//! mutations, the manifest logs version edits. Any record type implementing
//! [`WalData`] can be persisted.
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER_BYTES][HEADER_CRC32_LE]
//! [REC_LEN_LE][REC_CRC32_LE][REC_BYTES]
//! [REC_LEN_LE][REC_CRC32_LE][REC_BYTES]
//! ...
//! ```
//!
//! - **Header** — a [`WalHeader`] followed by a 4-byte CRC32 checksum.
//! - **Frame** — a 4-byte little-endian length, a 4-byte CRC32 computed
//!   over the payload, then the payload itself ([`crate::encoding`] format).
//!
//! # Sync policy
//!
//! Appends honour a [`WalSyncMode`]:
//!
//! - `Always` — `fsync` after every append call.
//! - `Batch` — no per-append sync; callers sync at rotation/flush/close.
//! - `IntervalMs(n)` — sync when at least `n` ms passed since the last one.
//!
//! [`Wal::append_all`] writes a whole batch of frames and applies the policy
//! once, which is how the database makes multi-record batches atomic: the
//! frames are contiguous, and visibility is only published after the call
//! returns.
//!
//! # Replay
//!
//! [`Wal::replay_iter`] streams records back in append order, verifying each
//! CRC. Replay ends cleanly at the first truncated or corrupt frame — the
//! tail of a crashed write is discarded, everything before it is kept.
//!
//! # Concurrency
//!
//! The file handle is shared behind `Arc<Mutex<_>>`; appenders and replay
//! iterators may coexist. [`WalIter`] tracks its own logical offset and
//! seeks before each read, so a concurrent appender cannot skew it.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Instant,
};

use crate::config::WalSyncMode;
use crate::encoding::{self, EncodingError};
use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

const U32_SIZE: usize = std::mem::size_of::<u32>();

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Data integrity failure — checksum did not match.
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// Record exceeds the configured maximum size.
    #[error("Record size exceeds limit ({0} bytes)")]
    RecordTooLarge(usize),

    /// Unexpected end-of-file during read.
    #[error("Unexpected end of file")]
    UnexpectedEof,

    /// WAL header failed integrity validation.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Internal consistency or locking error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Header
// ------------------------------------------------------------------------------------------------

/// Metadata written at the start of every WAL segment.
///
/// Validates the segment's identity and constraints; followed on disk by a
/// CRC32 of the encoded header.
#[derive(Debug)]
pub struct WalHeader {
    /// Magic constant identifying WAL segments (`b"SWAL"`).
    magic: [u8; 4],

    /// WAL format version.
    version: u32,

    /// Maximum record size (in bytes).
    max_record_size: u32,

    /// Segment number, drawn from the database-wide file-number counter.
    segment_number: u64,
}

impl WalHeader {
    /// Expected 4-byte magic constant.
    pub const MAGIC: [u8; 4] = *b"SWAL";

    /// Current supported version number.
    pub const VERSION: u32 = 1;

    /// Default maximum record size (68 MiB — a max-length key plus a
    /// max-length value plus framing headroom).
    pub const DEFAULT_MAX_RECORD_SIZE: u32 = 68 * 1024 * 1024;

    /// Encoded size of the header in bytes (without the trailing CRC).
    ///
    /// Layout: `magic(4) + version(4) + max_record_size(4) + segment(8)` = 20.
    pub const ENCODED_SIZE: usize = 4 + 4 + 4 + 8;

    /// Total on-disk size of the header *including* its trailing CRC32.
    pub const HEADER_DISK_SIZE: usize = Self::ENCODED_SIZE + U32_SIZE;

    fn new(max_record_size: u32, segment_number: u64) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            max_record_size,
            segment_number,
        }
    }
}

impl encoding::Encode for WalHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::Encode::encode_to(&self.magic, buf)?;
        encoding::Encode::encode_to(&self.version, buf)?;
        encoding::Encode::encode_to(&self.max_record_size, buf)?;
        encoding::Encode::encode_to(&self.segment_number, buf)?;
        Ok(())
    }
}

impl encoding::Decode for WalHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (magic, n) = <[u8; 4]>::decode_from(&buf[offset..])?;
        offset += n;
        let (version, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (max_record_size, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (segment_number, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                magic,
                version,
                max_record_size,
                segment_number,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Traits
// ------------------------------------------------------------------------------------------------

/// Trait for record types that can be written to and read from a WAL.
///
/// A marker requiring [`crate::encoding`] serialization plus the usual
/// thread-safety bounds.
pub trait WalData: encoding::Encode + encoding::Decode + std::fmt::Debug + Send + Sync {}
impl<T> WalData for T where T: encoding::Encode + encoding::Decode + std::fmt::Debug + Send + Sync {}

// ------------------------------------------------------------------------------------------------
// WAL Core
// ------------------------------------------------------------------------------------------------

/// File handle plus the sync bookkeeping that travels with it under the
/// same mutex.
#[derive(Debug)]
struct WalFile {
    file: File,
    last_sync: Instant,
}

/// A generic, thread-safe write-ahead log for durable record storage.
///
/// See the [module-level documentation](self) for format, sync policy, and
/// replay semantics.
///
/// # Type Parameters
///
/// * `T` — Any record type implementing [`WalData`].
#[derive(Debug)]
pub struct Wal<T: WalData> {
    /// Thread-safe file handle for WAL operations.
    inner: Arc<Mutex<WalFile>>,

    /// Path to the WAL file on disk.
    path: PathBuf,

    /// Persistent header with metadata and integrity info.
    header: WalHeader,

    /// Fsync policy applied by `append` / `append_all`.
    sync_mode: WalSyncMode,

    /// Marker field associating this WAL with the record type `T`.
    _phantom: std::marker::PhantomData<T>,
}

impl<T: WalData> Wal<T> {
    /// Open or create a WAL segment at the given path.
    ///
    /// # Parameters
    /// - `path`: Segment file path.
    /// - `segment_number`: Expected segment number; on a fresh file it is
    ///   written into the header, on an existing file it must match.
    /// - `max_record_size`: Optional custom maximum record size.
    /// - `sync_mode`: Fsync policy for appends.
    pub fn open<P: AsRef<Path>>(
        path: P,
        segment_number: u64,
        max_record_size: Option<u32>,
        sync_mode: WalSyncMode,
    ) -> Result<Self, WalError> {
        let path_ref = path.as_ref();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path_ref)?;

        // Fresh segment → write a new header. Existing → validate it.
        let header = if file.metadata()?.len() == 0 {
            let header = WalHeader::new(
                max_record_size.unwrap_or(WalHeader::DEFAULT_MAX_RECORD_SIZE),
                segment_number,
            );

            write_header(&mut file, &header)?;
            file.sync_all()?;

            info!(path = %path_ref.display(), segment = segment_number, "WAL created with new header");

            header
        } else {
            file.seek(SeekFrom::Start(0))?;

            let header = read_and_validate_header(&mut file)?;

            if header.segment_number != segment_number {
                return Err(WalError::InvalidHeader(format!(
                    "segment number mismatch (header {}, expected {})",
                    header.segment_number, segment_number
                )));
            }

            debug!(
                path = %path_ref.display(),
                max_record_size = header.max_record_size,
                segment = header.segment_number,
                "WAL header validated"
            );

            header
        };

        Ok(Self {
            inner: Arc::new(Mutex::new(WalFile {
                file,
                last_sync: Instant::now(),
            })),
            path: path_ref.to_path_buf(),
            header,
            sync_mode,
            _phantom: std::marker::PhantomData,
        })
    }

    /// Appends a single record and applies the sync policy.
    pub fn append(&self, record: &T) -> Result<(), WalError> {
        self.append_all(std::slice::from_ref(record))
    }

    /// Appends a batch of records as contiguous frames, then applies the
    /// sync policy once.
    ///
    /// Each frame is `[u32 len LE][u32 crc32 LE][payload]` with the CRC
    /// computed over the payload. The frames of one call are written under
    /// a single lock acquisition, so no other append can interleave.
    pub fn append_all(&self, records: &[T]) -> Result<(), WalError> {
        let mut buf = Vec::new();
        for record in records {
            let record_bytes = encoding::encode_to_vec(record)?;
            let record_len = u32::try_from(record_bytes.len())
                .map_err(|_| WalError::RecordTooLarge(record_bytes.len()))?;

            if record_len > self.header.max_record_size {
                return Err(WalError::RecordTooLarge(record_len as usize));
            }

            let checksum = compute_crc(&[&record_bytes]);
            buf.extend_from_slice(&record_len.to_le_bytes());
            buf.extend_from_slice(&checksum.to_le_bytes());
            buf.extend_from_slice(&record_bytes);

            trace!(
                len = record_len,
                crc = format_args!("{checksum:08x}"),
                "WAL frame staged"
            );
        }

        let mut guard = self
            .inner
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;

        guard.file.write_all(&buf)?;
        self.maybe_sync(&mut guard)?;

        Ok(())
    }

    /// Applies the configured sync policy after an append.
    fn maybe_sync(&self, guard: &mut WalFile) -> Result<(), WalError> {
        match self.sync_mode {
            WalSyncMode::Always => {
                guard.file.sync_all()?;
                guard.last_sync = Instant::now();
            }
            WalSyncMode::Batch => {}
            WalSyncMode::IntervalMs(interval) => {
                if guard.last_sync.elapsed().as_millis() as u64 >= interval {
                    guard.file.sync_all()?;
                    guard.last_sync = Instant::now();
                }
            }
        }
        Ok(())
    }

    /// Forces an fsync regardless of the sync policy.
    ///
    /// Used at memtable rotation, flush completion, and close.
    pub fn sync(&self) -> Result<(), WalError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;
        guard.file.sync_all()?;
        guard.last_sync = Instant::now();
        Ok(())
    }

    /// Returns an iterator that replays all valid records from the WAL.
    ///
    /// The iterator reads sequentially, verifies each CRC, and decodes
    /// frames into `T`. It ends at the first truncated or corrupt frame.
    pub fn replay_iter(&self) -> WalIter<T> {
        debug!(path = %self.path.display(), "WAL replay started");

        WalIter {
            inner: Arc::clone(&self.inner),
            offset: WalHeader::HEADER_DISK_SIZE as u64,
            max_record_size: self.header.max_record_size as usize,
            _phantom: std::marker::PhantomData,
        }
    }

    /// Truncates the file to `offset` bytes.
    ///
    /// Recovery calls this with the end of the last good frame after a
    /// replay stopped early: the torn tail must be physically removed,
    /// otherwise later appends would land behind unreachable garbage and
    /// be lost to the next replay.
    pub fn truncate_to(&self, offset: u64) -> Result<(), WalError> {
        let offset = offset.max(WalHeader::HEADER_DISK_SIZE as u64);

        let mut guard = self
            .inner
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;

        let len = guard.file.metadata()?.len();
        if offset < len {
            warn!(
                path = %self.path.display(),
                from = len,
                to = offset,
                "truncating WAL tail"
            );
            guard.file.set_len(offset)?;
            guard.file.sync_all()?;
            guard.last_sync = Instant::now();
        }
        Ok(())
    }

    /// Get the path of the underlying WAL file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the WAL segment number.
    pub fn segment_number(&self) -> u64 {
        self.header.segment_number
    }

    /// Returns the current on-disk file size in bytes.
    pub fn file_size(&self) -> Result<u64, WalError> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;
        Ok(guard.file.metadata()?.len())
    }
}

impl<T: WalData> Drop for Wal<T> {
    fn drop(&mut self) {
        match self.inner.lock() {
            Ok(guard) => {
                if let Err(e) = guard.file.sync_all() {
                    error!(path = %self.path.display(), error = %e, "WAL sync failed on drop");
                }
            }
            Err(poisoned) => {
                let guard = poisoned.into_inner();
                if let Err(e) = guard.file.sync_all() {
                    error!(path = %self.path.display(), error = %e, "WAL sync failed on drop (poisoned lock)");
                } else {
                    warn!(path = %self.path.display(), "WAL recovered and synced after poisoned lock");
                }
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// WalIter
// ------------------------------------------------------------------------------------------------

/// Streaming WAL replay iterator.
///
/// Reads frames sequentially and yields decoded `T` values. It holds an
/// `Arc` on the file handle, so it can outlive the [`Wal`] that created it;
/// the file stays open until all iterators (and the WAL itself) drop.
///
/// A `None` item means clean end of replay: either true EOF or the first
/// truncated/corrupt frame (which terminates replay per the crash-recovery
/// contract — everything before it has already been yielded).
pub struct WalIter<T: WalData> {
    /// Shared file handle protected by a mutex.
    inner: Arc<Mutex<WalFile>>,

    /// Current byte offset within the WAL file.
    offset: u64,

    /// Maximum allowed record size.
    max_record_size: usize,

    /// Marker field associating this iterator with the record type `T`.
    _phantom: std::marker::PhantomData<T>,
}

impl<T: WalData> WalIter<T> {
    /// Current byte offset — after a successful `next`, the end of the
    /// frame just returned.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl<T: WalData> std::fmt::Debug for WalIter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalIter")
            .field("offset", &self.offset)
            .field("max_record_size", &self.max_record_size)
            .finish_non_exhaustive()
    }
}

impl<T: WalData> Iterator for WalIter<T> {
    type Item = Result<T, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        // Lock only for the read of one frame to reduce contention.
        let mut guard = match self.inner.lock() {
            Ok(g) => g,
            Err(_) => return Some(Err(WalError::Internal("Mutex poisoned".into()))),
        };

        // Seek to our logical offset for deterministic reads.
        if let Err(e) = guard.file.seek(SeekFrom::Start(self.offset)) {
            return Some(Err(WalError::Io(e)));
        }

        // Frame prefix: length then checksum.
        let mut len_bytes = [0u8; U32_SIZE];
        match guard.file.read_exact(&mut len_bytes) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                trace!(offset = self.offset, "WAL replay reached end of file");
                return None;
            }
            Err(e) => return Some(Err(WalError::Io(e))),
        }

        let record_len = u32::from_le_bytes(len_bytes) as usize;
        if record_len > self.max_record_size {
            return Some(Err(WalError::RecordTooLarge(record_len)));
        }

        let mut checksum_bytes = [0u8; U32_SIZE];
        if let Err(e) = guard.file.read_exact(&mut checksum_bytes) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                warn!(offset = self.offset, "WAL truncated frame (partial checksum)");
                return Some(Err(WalError::UnexpectedEof));
            }
            return Some(Err(WalError::Io(e)));
        }
        let stored_checksum = u32::from_le_bytes(checksum_bytes);

        trace!(offset = self.offset, len = record_len, "WAL reading frame");

        let mut record_bytes = vec![0u8; record_len];
        if let Err(e) = guard.file.read_exact(&mut record_bytes) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                warn!(
                    offset = self.offset,
                    len = record_len,
                    "WAL truncated frame (partial payload)"
                );
                return Some(Err(WalError::UnexpectedEof));
            }
            return Some(Err(WalError::Io(e)));
        }

        // Update offset for the next iteration from the file cursor.
        if let Ok(pos) = guard.file.stream_position() {
            self.offset = pos;
        }

        if let Err(e) = verify_crc(&[&record_bytes], stored_checksum) {
            warn!(
                offset = self.offset,
                len = record_len,
                "WAL frame checksum mismatch"
            );
            return Some(Err(e));
        }

        match encoding::decode_from_slice::<T>(&record_bytes) {
            Ok((record, _)) => Some(Ok(record)),
            Err(e) => Some(Err(WalError::Encoding(e))),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Header I/O helpers
// ------------------------------------------------------------------------------------------------

/// Writes a [`WalHeader`] followed by its CRC32 checksum.
fn write_header<W: Write>(writer: &mut W, header: &WalHeader) -> Result<(), WalError> {
    let header_bytes = encoding::encode_to_vec(header)?;
    let checksum = compute_crc(&[&header_bytes]);

    writer.write_all(&header_bytes)?;
    writer.write_all(&checksum.to_le_bytes())?;
    Ok(())
}

/// Reads and validates a [`WalHeader`] from the current file position.
///
/// Checks CRC, magic, and version. Does **not** validate the segment
/// number — the expected value depends on context, so the caller does that.
fn read_and_validate_header<R: Read>(reader: &mut R) -> Result<WalHeader, WalError> {
    let mut header_bytes = vec![0u8; WalHeader::ENCODED_SIZE];
    reader.read_exact(&mut header_bytes)?;

    let mut checksum_bytes = [0u8; U32_SIZE];
    reader.read_exact(&mut checksum_bytes)?;
    let stored_checksum = u32::from_le_bytes(checksum_bytes);

    verify_crc(&[&header_bytes], stored_checksum)
        .map_err(|_| WalError::InvalidHeader("header checksum mismatch".into()))?;

    let (header, _) = encoding::decode_from_slice::<WalHeader>(&header_bytes)?;

    if header.magic != WalHeader::MAGIC {
        return Err(WalError::InvalidHeader("bad magic".into()));
    }
    if header.version != WalHeader::VERSION {
        return Err(WalError::InvalidHeader(format!(
            "unsupported version {}",
            header.version
        )));
    }

    Ok(header)
}

// ------------------------------------------------------------------------------------------------
// CRC helpers
// ------------------------------------------------------------------------------------------------

/// Computes a CRC32 checksum over one or more byte slices.
fn compute_crc(parts: &[&[u8]]) -> u32 {
    let mut hasher = Crc32::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

/// Verifies that the CRC32 over the given byte slices matches `expected`.
fn verify_crc(parts: &[&[u8]], expected: u32) -> Result<(), WalError> {
    let computed = compute_crc(parts);
    if computed != expected {
        return Err(WalError::ChecksumMismatch);
    }
    Ok(())
}
