//! Statistics tracking for worker-pool stages.
//!
//! This module provides thread-safe statistics shared by a stage's master and all of its slaves,
//! allowing monitoring of routing, processing, and completion states.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Thread-safe statistics tracker for the various steps of stage processing.
/// All counters use relaxed atomic operations.
#[derive(Debug, Default)]
pub struct StageStats {
    /// Number of deliveries handed to worker queues.
    pub dispatched: AtomicU64,

    /// Number of deliveries rejected because a worker queue was full or closed.
    pub dropped: AtomicU64,

    /// Number of items discarded because the stage had not started (or had stopped).
    pub discarded: AtomicU64,

    /// Number of items that completed processing successfully.
    pub processed: AtomicU64,

    /// Number of items whose processing returned an error.
    pub failed: AtomicU64,

    /// Number of items currently being processed.
    pub actively_processing: AtomicU64,
}

impl StageStats {
    /// Creates a new instance with all counters initialized to zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current number of dispatched deliveries.
    pub fn get_dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Returns the current number of dropped deliveries.
    pub fn get_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn get_discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Returns the current number of processed items.
    pub fn get_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn get_failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Returns the current number of items actively being processed.
    pub fn get_actively_processing(&self) -> u64 {
        self.actively_processing.load(Ordering::Relaxed)
    }

    /// Copies the current values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dispatched: self.get_dispatched(),
            dropped: self.get_dropped(),
            discarded: self.get_discarded(),
            processed: self.get_processed(),
            failed: self.get_failed(),
        }
    }
}

/// Point-in-time copy of a [`StageStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub dispatched: u64,
    pub dropped: u64,
    pub discarded: u64,
    pub processed: u64,
    pub failed: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dispatched: {}, dropped: {}, discarded: {}, processed: {}, failed: {}",
            self.dispatched, self.dropped, self.discarded, self.processed, self.failed
        )
    }
}
