use core::fmt;

/// Errors returned by the runtime's fallible operations.
///
/// Only conditions the caller can reasonably react to are surfaced here.
/// Spurious wakeups, duplicate [`signal`](crate::signal)s, and
/// [`join`](crate::join)ing an already-exited thread are *not* errors; they
/// are masked by generation numbers or idempotent state transitions. Stack
/// overflow and allocation failure during initialization are fatal and abort
/// the process instead.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Every slot on the target core (or on all cores, for automatic
    /// placement) already holds a live thread.
    ///
    /// The caller may retry on another core or apply back-pressure; no
    /// partial state is left behind.
    SlotsFull,

    /// The requested core index is not an active scheduling core.
    InvalidCore {
        /// The core index that was requested.
        core: usize,
    },

    /// The runtime has not been initialized, or has already been torn down
    /// by [`wait_for_termination`](crate::wait_for_termination).
    Uninitialized,

    /// The provided [`Config`](crate::Config) is unusable.
    InvalidConfig(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SlotsFull => f.write_str("all thread slots are occupied"),
            Self::InvalidCore { core } => {
                write!(f, "core {core} is not an active scheduling core")
            }
            Self::Uninitialized => f.write_str("the runtime is not initialized"),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for Error {}
