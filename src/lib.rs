//! # stratadb
//!
//! An embedded, single-process, ordered key-value store built on a
//! **leveled Log-Structured Merge tree**. Keys and values are opaque byte
//! strings; writes are crash-safe through a write-ahead log, and
//! background compaction keeps read amplification bounded.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                          Db                                │
//! │  ┌────────────┐  ┌──────────────┐  ┌────────────────────┐  │
//! │  │  Active    │  │  Immutable   │  │  SSTables          │  │
//! │  │  Memtable  │  │  Memtables   │  │  L0 (overlapping)  │  │
//! │  │  + WAL     │  │  + WALs      │  │  L1…Lmax (sorted)  │  │
//! │  └─────┬──────┘  └──────┬───────┘  └─────────┬──────────┘  │
//! │        │  rotate        │  flush             │ leveled     │
//! │        └──────────►     └─────────►          │ compaction  │
//! │                                              ▼             │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │     Manifest (CURRENT → MANIFEST-n edit log)         │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`db`] | The facade — open, read, write, scan, snapshot, compact, close |
//! | [`memtable`] | In-memory write buffer with per-key version chains |
//! | [`wal`] | Generic, CRC-protected write-ahead log |
//! | [`sstable`] | Immutable sorted tables: prefix-compressed blocks, bloom filters |
//! | [`manifest`] | Durable live-file authority: version edits, `CURRENT`, checkpoints |
//! | [`compaction`] | Leveled compaction picker and merge executor |
//! | [`config`] | Tunables and limits |
//! | [`encoding`] | Deterministic wire format shared by all on-disk structures |
//!
//! ## Guarantees
//!
//! - **Durability** — every mutation hits the WAL before it is
//!   acknowledged; with [`WalSyncMode::Always`] an acknowledged write
//!   survives any crash.
//! - **Read-your-writes** — a `get` after a completed `put` on the same
//!   handle sees that value or a newer one.
//! - **Atomic batches** — a [`WriteBatch`] becomes visible all at once.
//! - **Snapshot-consistent scans** — iterators and [`Snapshot`]s pin a
//!   sequence number and a set of sources; concurrent writes, flushes,
//!   and compactions never change what they yield.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stratadb::{Db, DbConfig};
//!
//! let db = Db::open("/tmp/my_db", DbConfig::default()).unwrap();
//!
//! db.put(b"hello".to_vec(), b"world".to_vec()).unwrap();
//! assert_eq!(db.get(b"hello").unwrap(), Some(b"world".to_vec()));
//!
//! db.delete(b"hello".to_vec()).unwrap();
//! assert_eq!(db.get(b"hello").unwrap(), None);
//!
//! for (key, value) in db.range(b"a", b"z").unwrap() {
//!     println!("{key:?} = {value:?}");
//! }
//!
//! db.close().unwrap();
//! ```

pub mod compaction;
pub mod config;
pub mod db;
pub mod encoding;
pub mod manifest;
pub mod memtable;
pub mod sstable;
pub mod wal;

pub use config::{DbConfig, WalSyncMode};
pub use db::{Db, DbError, DbIterator, DbStats, LevelStats, Snapshot, WriteBatch};
