//! Per-core performance counters feeding the load estimator.
//!
//! Each core accounts its elapsed cycles into two buckets: *idle* (scanning
//! for runnable threads) and *loaded* (running user code). Loaded intervals
//! are additionally weighted by the number of occupied slots at the time, so
//! a core with a deep runnable backlog reports a load factor above 1.0 even
//! though it can only execute one thread at a time. The estimator consumes
//! deltas of the aggregate across collection intervals.

use crate::util::CachePadded;
use core::sync::atomic::{AtomicU64, Ordering::*};

/// One core's counters. Written only by the owning core's scheduler (with
/// relaxed ordering; the estimator tolerates slightly stale sums).
#[derive(Debug)]
pub(crate) struct CoreStats(CachePadded<Counters>);

#[derive(Debug, Default)]
struct Counters {
    idle_cycles: AtomicU64,
    total_cycles: AtomicU64,
    weighted_loaded_cycles: AtomicU64,
    created: AtomicU64,
    finished: AtomicU64,
}

/// An aggregate snapshot across all cores, timestamped with the cycle
/// counter (monotonic).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub(crate) struct StatsSnapshot {
    pub(crate) idle_cycles: u64,
    pub(crate) total_cycles: u64,
    pub(crate) weighted_loaded_cycles: u64,
    pub(crate) live_threads: u64,
    pub(crate) collected_at: u64,
}

// === impl CoreStats ===

impl CoreStats {
    pub(crate) const fn new() -> Self {
        Self(CachePadded::new(Counters {
            idle_cycles: AtomicU64::new(0),
            total_cycles: AtomicU64::new(0),
            weighted_loaded_cycles: AtomicU64::new(0),
            created: AtomicU64::new(0),
            finished: AtomicU64::new(0),
        }))
    }

    /// Accounts `cycles` spent scanning for work.
    #[inline]
    pub(crate) fn record_idle(&self, cycles: u64) {
        self.0.idle_cycles.fetch_add(cycles, Relaxed);
        self.0.total_cycles.fetch_add(cycles, Relaxed);
    }

    /// Accounts `cycles` spent running user code while `occupants` slots
    /// held live threads.
    #[inline]
    pub(crate) fn record_loaded(&self, cycles: u64, occupants: usize) {
        self.0.total_cycles.fetch_add(cycles, Relaxed);
        self.0
            .weighted_loaded_cycles
            .fetch_add(cycles.saturating_mul(occupants as u64), Relaxed);
    }

    #[inline]
    pub(crate) fn note_created(&self) {
        self.0.created.fetch_add(1, Relaxed);
    }

    #[inline]
    pub(crate) fn note_finished(&self) {
        self.0.finished.fetch_add(1, Relaxed);
    }

    /// Adds this core's counters into `snapshot`.
    pub(crate) fn accumulate_into(&self, snapshot: &mut StatsSnapshot) {
        snapshot.idle_cycles += self.0.idle_cycles.load(Relaxed);
        snapshot.total_cycles += self.0.total_cycles.load(Relaxed);
        snapshot.weighted_loaded_cycles += self.0.weighted_loaded_cycles.load(Relaxed);
        let created = self.0.created.load(Relaxed);
        let finished = self.0.finished.load(Relaxed);
        snapshot.live_threads += created.saturating_sub(finished);
    }
}
