//! A user-level M:N threading runtime for low-latency server workloads.
//!
//! `arachne` multiplexes many lightweight user threads onto a configurable
//! pool of kernel threads, each pinned to a physical core. Thread creation,
//! yield, and cross-core wakeup are designed to cost well under a
//! microsecond: creation is one CAS on the target core's slot-occupancy word
//! plus one store; wakeup is one CAS on the target's wakeup word.
//!
//! Scheduling is *cooperative*: a user thread runs until it blocks (via
//! [`yield_now`], [`sleep`], [`dispatch`], [`join`], or the [`sync`]
//! primitives) or returns. There is no preemption, blocking system calls are
//! not hidden (a blocked user thread blocks its core), and each core
//! schedules only its own fixed table of thread slots — there is no work
//! stealing. In exchange, every scheduling operation touches only a handful
//! of cache lines.
//!
//! The pool of scheduling cores is elastic: under sustained load the runtime
//! activates more cores, up to a configured maximum, and retires them again
//! once load falls off.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! static COUNTER: AtomicUsize = AtomicUsize::new(0);
//!
//! fn main() -> Result<(), arachne::Error> {
//!     arachne::init(arachne::Config::new().num_cores(2))?;
//!
//!     let id = arachne::spawn(|| {
//!         COUNTER.fetch_add(1, Ordering::Relaxed);
//!         arachne::yield_now();
//!         COUNTER.fetch_add(1, Ordering::Relaxed);
//!     })?;
//!
//!     // `join` blocks, so the waiting thread must itself be known to the
//!     // runtime; a plain `main` thread opts in with `test_init`.
//!     arachne::test_init();
//!     arachne::join(id);
//!     assert_eq!(COUNTER.load(Ordering::Relaxed), 2);
//!
//!     arachne::shut_down();
//!     arachne::wait_for_termination();
//!     Ok(())
//! }
//! ```

#[macro_use]
mod util;
pub(crate) mod loom;

mod arch;
mod config;
mod context;
mod error;
mod estimator;
mod occupancy;
mod runtime;
mod scheduler;
mod stats;
pub(crate) mod time;

pub mod sync;

pub use self::config::{Config, DEFAULT_STACK_SIZE};
pub use self::context::ThreadId;
pub use self::error::Error;
pub use self::occupancy::MAX_SLOTS_PER_CORE;
pub use self::runtime::{
    active_cores, init, join, set_error_stream, shut_down, signal, spawn, spawn_on, test_destroy,
    test_init, wait_for_termination,
};
pub use self::scheduler::{current, dispatch, sleep, yield_now};
