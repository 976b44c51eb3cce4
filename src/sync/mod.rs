//! Synchronization primitives for user threads.
//!
//! The primitives here come in two flavors. [`spin::Mutex`] is a plain
//! spinlock used internally to guard tiny critical sections (waiter queues,
//! the join path). [`SleepLock`] and [`ConditionVariable`] are the
//! user-facing primitives: instead of spinning, their waiters cede the core
//! back to the scheduler and are resumed by a [`signal`](crate::signal) when
//! the lock or condition becomes available.

pub mod spin;

mod condvar;
mod mutex;

pub use self::condvar::{ConditionVariable, LockGuard};
pub use self::mutex::{SleepLock, SleepLockGuard};
