#![cfg_attr(not(test), allow(unused_macros))]

/// Emits a `tracing` debug event for the wrapped expression in test builds;
/// compiles to the bare expression otherwise.
#[cfg(not(test))]
macro_rules! test_dbg {
    ($e:expr) => {
        $e
    };
}

#[cfg(test)]
macro_rules! test_dbg {
    ($e:expr) => {
        match $e {
            e => {
                tracing::debug!(
                    location = %core::panic::Location::caller(),
                    "{} = {:?}",
                    stringify!($e),
                    &e
                );
                e
            }
        }
    };
}

#[cfg(not(test))]
macro_rules! test_trace {
    ($($args:tt)+) => {};
}

#[cfg(test)]
macro_rules! test_trace {
    ($($args:tt)+) => {
        tracing::trace!($($args)+);
    };
}

use core::ops::Deref;

/// Doubling spin-wait for optimistic updates that lose a race: a failed CAS
/// on a core's occupancy word, or a guard spinlock held by another core.
/// Retrying immediately just hammers the contended cache line, so each
/// retry pauses twice as long as the one before, up to a cap.
#[derive(Debug)]
pub(crate) struct Backoff {
    shift: u32,
}

/// Pads its contents out to a full cache line (128 bytes covers both
/// supported targets). Keeps the heavily written per-core words, the public
/// priority mask and the statistics counters, from sharing a line with
/// their neighbors in `Core`.
#[repr(align(128))]
#[derive(Debug)]
pub(crate) struct CachePadded<T>(T);

// === impl Backoff ===

impl Backoff {
    /// Longest pause: `2^MAX_SHIFT` spin hints.
    const MAX_SHIFT: u32 = 8;

    pub(crate) const fn new() -> Self {
        Self { shift: 0 }
    }

    /// Pauses before the caller's next retry, doubling the pause each call
    /// until it reaches the cap.
    #[inline]
    pub(crate) fn spin(&mut self) {
        #[cfg(not(loom))]
        for _ in 0..1u32 << self.shift {
            core::hint::spin_loop();
        }

        // Loom's bounded model explores interleavings instead of burning
        // real time.
        #[cfg(loom)]
        loom::thread::yield_now();

        if self.shift < Self::MAX_SHIFT {
            self.shift += 1;
        }
    }
}

// === impl CachePadded ===

impl<T> CachePadded<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self(value)
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.0
    }
}

#[cfg(test)]
pub(crate) mod test {
    /// Initialize tracing with a default filter directive.
    ///
    /// Returns a guard that must be held for the duration of the test to
    /// ensure tracing messages are actually output.
    #[must_use]
    pub(crate) fn trace_init() -> tracing::subscriber::DefaultGuard {
        use tracing_subscriber::filter::{EnvFilter, LevelFilter};
        let env = std::env::var("RUST_LOG").unwrap_or_default();
        let builder = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into());
        let filter = if env.is_empty() {
            builder.parse("arachne=debug").unwrap()
        } else {
            builder.parse_lossy(env)
        };
        let collector = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .without_time()
            .finish();
        tracing::subscriber::set_default(collector)
    }
}
