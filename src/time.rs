//! The cycle clock: a process-wide mapping between the CPU's cycle counter
//! and wall-clock durations.
//!
//! All scheduling state in this crate is expressed in absolute cycle-counter
//! values, so the only conversions ever needed are `Duration` → cycles (when
//! a thread goes to sleep) and cycles → nanoseconds (when the load estimator
//! timestamps a statistics sample). The counter frequency is determined once,
//! on first use: AArch64 reports it directly in `cntfrq_el0`, while on x86-64
//! the timestamp counter is calibrated against [`std::time::Instant`] over a
//! short measurement window.

use crate::arch;
use std::sync::OnceLock;
use std::time::Duration;

/// Length of the x86-64 calibration window. Long enough that `Instant`'s
/// resolution contributes well under a percent of error.
#[cfg(target_arch = "x86_64")]
const CALIBRATION_WINDOW: Duration = Duration::from_millis(10);

static CLOCK: OnceLock<Clock> = OnceLock::new();

#[derive(Debug, Copy, Clone)]
struct Clock {
    cycles_per_sec: u64,
}

/// Reads the current cycle count.
#[inline(always)]
pub(crate) fn now() -> u64 {
    arch::cycles()
}

/// Converts a duration into a cycle count, rounding up so that sleeping for
/// the result never undershoots the requested duration.
pub(crate) fn cycles_from_duration(duration: Duration) -> u64 {
    let cps = clock().cycles_per_sec as u128;
    let nanos = duration.as_nanos();
    let cycles = (nanos * cps).div_ceil(1_000_000_000);
    cycles.try_into().unwrap_or(u64::MAX)
}

/// Converts a cycle count into nanoseconds.
pub(crate) fn nanos_from_cycles(cycles: u64) -> u64 {
    let cps = clock().cycles_per_sec as u128;
    let nanos = (cycles as u128 * 1_000_000_000) / cps;
    nanos.try_into().unwrap_or(u64::MAX)
}

/// Forces clock calibration now rather than on first conversion, so the
/// measurement window is paid during initialization.
pub(crate) fn calibrate() {
    let _ = clock();
}

fn clock() -> &'static Clock {
    CLOCK.get_or_init(|| {
        let clock = Clock {
            cycles_per_sec: measure_frequency(),
        };
        tracing::debug!(cycles_per_sec = clock.cycles_per_sec, "calibrated cycle clock");
        clock
    })
}

#[cfg(target_arch = "aarch64")]
fn measure_frequency() -> u64 {
    arch::counter_frequency()
}

#[cfg(target_arch = "x86_64")]
fn measure_frequency() -> u64 {
    use raw_cpuid::CpuId;
    use std::time::Instant;

    // A non-invariant TSC can drift across power states; scheduling still
    // works, but long sleeps may be inaccurate.
    let invariant = CpuId::new()
        .get_advanced_power_mgmt_info()
        .map(|info| info.has_invariant_tsc())
        .unwrap_or(false);
    if !invariant {
        tracing::warn!("timestamp counter is not invariant; sleep accuracy may degrade");
    }

    let t0 = Instant::now();
    let c0 = arch::cycles();
    std::thread::sleep(CALIBRATION_WINDOW);
    let elapsed = t0.elapsed();
    let cycles = arch::cycles() - c0;

    (cycles as u128 * 1_000_000_000 / elapsed.as_nanos())
        .try_into()
        .expect("cycle counter frequency should fit in 64 bits")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_within_tolerance() {
        let dur = Duration::from_millis(25);
        let cycles = cycles_from_duration(dur);
        let nanos = nanos_from_cycles(cycles);
        let expect = dur.as_nanos() as u64;
        // Rounding in either direction is at most one cycle plus integer
        // truncation; allow a microsecond of slack.
        assert!(nanos >= expect - 1_000 && nanos <= expect + 1_000);
    }

    #[test]
    fn conversion_rounds_up() {
        // Sleeping for the converted cycle count must never undershoot.
        let one_ns = cycles_from_duration(Duration::from_nanos(1));
        assert!(one_ns >= 1);
    }

    #[test]
    fn counter_is_monotonic() {
        let a = now();
        let b = now();
        assert!(b >= a);
    }
}
