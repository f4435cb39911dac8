//! Database directory layout.
//!
//! Everything lives flat under the database root:
//!
//! - `CURRENT` — text file naming the active manifest.
//! - `MANIFEST-<n>` — version-edit log.
//! - `<n>.wal` — write-ahead log segments.
//! - `<n>.sst` — SSTable files.
//! - `LOCK` — advisory file lock against concurrent opens.
//!
//! `<n>` values come from one database-wide monotonic counter, so a file
//! number identifies a file regardless of its kind.

use std::path::{Path, PathBuf};

/// Name of the pointer file holding the active manifest's name.
pub const CURRENT_FILE: &str = "CURRENT";

/// Name of the advisory lock file.
pub const LOCK_FILE: &str = "LOCK";

/// Path of WAL segment `n`.
pub fn wal_path(dir: &Path, n: u64) -> PathBuf {
    dir.join(format!("{n:06}.wal"))
}

/// Path of table file `n`.
pub fn table_path(dir: &Path, n: u64) -> PathBuf {
    dir.join(format!("{n:06}.sst"))
}

/// Path of manifest `n`.
pub fn manifest_path(dir: &Path, n: u64) -> PathBuf {
    dir.join(manifest_name(n))
}

/// File name of manifest `n`.
pub fn manifest_name(n: u64) -> String {
    format!("MANIFEST-{n:06}")
}

/// Kinds of files that may appear in a database directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Wal(u64),
    Table(u64),
    Manifest(u64),
    Current,
    Lock,
    /// Leftover `.tmp` from an interrupted atomic write.
    Temp,
    Unknown,
}

/// Classifies a directory entry by name.
pub fn parse_file_name(name: &str) -> FileKind {
    if name == CURRENT_FILE {
        return FileKind::Current;
    }
    if name == LOCK_FILE {
        return FileKind::Lock;
    }
    if name.ends_with(".tmp") {
        return FileKind::Temp;
    }
    if let Some(n) = name
        .strip_prefix("MANIFEST-")
        .and_then(|s| s.parse::<u64>().ok())
    {
        return FileKind::Manifest(n);
    }
    if let Some(n) = name
        .strip_suffix(".wal")
        .and_then(|s| s.parse::<u64>().ok())
    {
        return FileKind::Wal(n);
    }
    if let Some(n) = name
        .strip_suffix(".sst")
        .and_then(|s| s.parse::<u64>().ok())
    {
        return FileKind::Table(n);
    }
    FileKind::Unknown
}
