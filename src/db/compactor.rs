//! Background compaction worker.
//!
//! One thread per open database. It owns only a `Weak` back-reference to
//! the engine core — the core owns the thread, never the other way round —
//! plus a shutdown flag and a wake-up channel. The thread parks on the
//! channel, wakes when the facade signals (rotation, backpressure, open
//! with pending flushes), and runs [`DbCore::background_step`] until there
//! is nothing left to do.
//!
//! ## Failure handling
//!
//! A failed step is retried with exponential backoff (100 ms doubling to
//! ~6.4 s). The engine stays writable throughout; if the backlog grows
//! past `l0_stop`, foreground writes feel it as `Busy` backpressure rather
//! than as compaction errors.
//!
//! ## Shutdown
//!
//! The flag is checked between jobs, so shutdown interrupts the worker at
//! a job boundary — never mid-file. `close` (and the core's `Drop`) set
//! the flag, send one wake-up, and join.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info};

use super::DbCore;

/// Initial retry delay after a failed background step.
const BACKOFF_INITIAL: Duration = Duration::from_millis(100);

/// Retry delay ceiling.
const BACKOFF_MAX: Duration = Duration::from_millis(6_400);

/// Idle park time between wake-up checks.
const IDLE_PARK: Duration = Duration::from_secs(1);

/// Spawns the worker thread for `core` and records its join handle.
pub(crate) fn spawn(core: &Arc<DbCore>, wake_rx: Receiver<()>) {
    let weak = Arc::downgrade(core);
    let shutdown = Arc::clone(&core.compactor.shutdown);

    let handle = std::thread::Builder::new()
        .name("stratadb-compactor".into())
        .spawn(move || {
            debug!("compaction worker started");
            let mut backoff = BACKOFF_INITIAL;

            loop {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }

                // Upgrade per iteration only: holding a strong reference
                // while parked would keep a dropped database alive.
                let Some(core) = weak.upgrade() else { break };

                let step = core.background_step();
                drop(core);

                match step {
                    Ok(true) => {
                        backoff = BACKOFF_INITIAL;
                        continue; // drain the backlog before parking
                    }
                    Ok(false) => {
                        backoff = BACKOFF_INITIAL;
                        match wake_rx.recv_timeout(IDLE_PARK) {
                            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }
                    Err(e) => {
                        error!(error = %e, retry_in_ms = backoff.as_millis() as u64,
                               "background compaction step failed");
                        match wake_rx.recv_timeout(backoff) {
                            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                        backoff = (backoff * 2).min(BACKOFF_MAX);
                    }
                }
            }

            info!("compaction worker stopped");
        });

    match handle {
        Ok(handle) => {
            if let Ok(mut slot) = core.compactor.thread.lock() {
                *slot = Some(handle);
            }
        }
        Err(e) => {
            // The engine still works without the worker; flushes and
            // compactions then only happen through compact_range/close.
            error!(error = %e, "failed to spawn compaction worker");
        }
    }
}
