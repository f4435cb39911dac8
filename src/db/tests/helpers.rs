//! Shared helpers for facade-level tests.

use std::time::{Duration, Instant};

use crate::config::DbConfig;
use crate::db::Db;

/// Initialize a tracing subscriber controlled by `RUST_LOG`.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config large enough that nothing is flushed unless a test forces it.
pub fn memtable_only_config() -> DbConfig {
    init_tracing();
    DbConfig {
        memtable_size: 64 * 1024 * 1024,
        ..DbConfig::default()
    }
}

/// Small write buffer that triggers rotation and background flushes
/// quickly.
pub fn small_buffer_config() -> DbConfig {
    init_tracing();
    DbConfig {
        memtable_size: 4096,
        level0_size: 64 * 1024,
        target_sst_size: 16 * 1024,
        // Generous stop threshold: tests hammer tiny memtables faster
        // than a loaded CI machine may drain L0.
        l0_slowdown: 12,
        l0_stop: 24,
        ..DbConfig::default()
    }
}

/// Polls `cond` for up to five seconds, panicking on timeout.
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for: {what}");
}

/// Total live table files across all levels.
pub fn total_files(db: &Db) -> usize {
    db.stats().unwrap().levels.iter().map(|l| l.files).sum()
}

/// Total live table bytes across all levels.
pub fn total_bytes(db: &Db) -> u64 {
    db.stats().unwrap().levels.iter().map(|l| l.bytes).sum()
}
