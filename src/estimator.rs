//! The core load estimator.
//!
//! Periodically consumes aggregate per-core statistics and recommends
//! whether the pool of scheduling cores should shrink, hold, or grow. The
//! grow side watches the *average load factor* (loaded cycles weighted by
//! runnable backlog, relative to total cycles); the shrink side compares
//! current utilization against the utilization recorded when the pool last
//! grew to its current size, minus a hysteresis band, so the pool only
//! retracts once load falls noticeably below the level that justified the
//! last expansion.

use crate::config::Config;
use crate::stats::StatsSnapshot;

/// A scaling recommendation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Estimate {
    /// Retire one core.
    Shrink,
    /// Keep the current core count.
    Hold,
    /// Activate one more core.
    Grow,
}

#[derive(Debug)]
pub(crate) struct LoadEstimator {
    /// The previous sample; `None` until the first call primes the baseline.
    previous: Option<StatsSnapshot>,

    /// `thresholds[n]` is the utilization observed when the pool grew from
    /// `n` to `n + 1` cores. Unset entries are zero, which makes shrinking
    /// below the initial core count impossible until a growth records a real
    /// value.
    thresholds: Box<[f64]>,

    /// Utilization computed by the most recent sample, recorded into
    /// `thresholds` when the pool grows.
    last_utilization: f64,

    load_factor_threshold: f64,
    idle_core_fraction_hysteresis: f64,
    slot_occupancy_threshold: f64,
}

// === impl LoadEstimator ===

impl LoadEstimator {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            previous: None,
            thresholds: vec![0.0; config.max_cores()].into_boxed_slice(),
            last_utilization: 0.0,
            load_factor_threshold: config.load_factor_threshold,
            idle_core_fraction_hysteresis: config.idle_core_fraction_hysteresis,
            slot_occupancy_threshold: config.slot_occupancy_threshold,
        }
    }

    /// Records that the pool grew from `previous_active` cores, pinning the
    /// utilization level that justified the expansion.
    pub(crate) fn record_scale_up(&mut self, previous_active: usize) {
        if let Some(slot) = self.thresholds.get_mut(previous_active) {
            // With no sample yet, assume the expansion was justified at full
            // utilization of the cores that existed before it.
            *slot = if self.previous.is_some() {
                self.last_utilization
            } else {
                previous_active as f64
            };
        }
    }

    /// Consumes a statistics sample and recommends a scaling action for a
    /// pool of `active` cores.
    ///
    /// The first call only primes the baseline and always holds.
    pub(crate) fn estimate(
        &mut self,
        current: StatsSnapshot,
        active: usize,
        slots_per_core: usize,
    ) -> Estimate {
        let Some(previous) = self.previous.replace(current) else {
            return Estimate::Hold;
        };

        let idle_cycles = current.idle_cycles.wrapping_sub(previous.idle_cycles);
        let total_cycles = current.total_cycles.wrapping_sub(previous.total_cycles);
        let measurement_cycles = current.collected_at.wrapping_sub(previous.collected_at);
        if total_cycles == 0 || measurement_cycles == 0 {
            return Estimate::Hold;
        }
        let utilized_cycles = total_cycles.saturating_sub(idle_cycles);
        let total_utilized_cores = utilized_cycles as f64 / measurement_cycles as f64;
        self.last_utilization = total_utilized_cores;

        let weighted_loaded_cycles = current
            .weighted_loaded_cycles
            .wrapping_sub(previous.weighted_loaded_cycles);
        let average_load_factor = weighted_loaded_cycles as f64 / total_cycles as f64;
        if active < self.thresholds.len() && average_load_factor > self.load_factor_threshold {
            self.thresholds[active] = total_utilized_cores;
            return Estimate::Grow;
        }

        if active <= 1 {
            return Estimate::Hold;
        }

        // Ramping down with a nearly full slot table would immediately
        // bounce back; require low occupancy as well as low utilization.
        let average_slots_used =
            current.live_threads as f64 / active as f64 / slots_per_core as f64;
        let shrink_below = self.thresholds[active - 1] - self.idle_core_fraction_hysteresis;
        if total_utilized_cores < shrink_below && average_slots_used < self.slot_occupancy_threshold
        {
            return Estimate::Shrink;
        }

        Estimate::Hold
    }
}
