//! A condition variable whose waiters cede the core instead of spinning.

use crate::context::ThreadId;
use crate::sync::spin;
use std::collections::VecDeque;

/// A condition variable for user threads.
///
/// `wait` parks the calling thread in the scheduler until some thread
/// [`notify_one`]s or [`notify_all`]s the variable. As with every blocking
/// primitive in this runtime, a wakeup is an *event*, not a promise that the
/// awaited condition holds: callers must re-check their predicate in a loop.
///
/// The caller must hold the lock associated with the condition when
/// notifying, or a wakeup between the predicate change and the notify can be
/// missed.
///
/// # Examples
///
/// ```no_run
/// use arachne::sync::{ConditionVariable, SleepLock};
///
/// static LOCK: SleepLock<bool> = SleepLock::new(false);
/// static READY: ConditionVariable = ConditionVariable::new();
///
/// let mut ready = LOCK.lock();
/// while !*ready {
///     ready = READY.wait(ready);
/// }
/// ```
///
/// [`notify_one`]: Self::notify_one
/// [`notify_all`]: Self::notify_all
pub struct ConditionVariable {
    waiters: spin::Mutex<VecDeque<ThreadId>>,
}

/// A lock guard that a [`ConditionVariable`] can release before parking and
/// reacquire afterwards.
///
/// Implemented by the guards of this crate's lock types; not implementable
/// outside the crate.
pub trait LockGuard<'a>: Sized + sealed::Sealed {
    #[doc(hidden)]
    type Lock: ?Sized;

    #[doc(hidden)]
    fn release(self) -> &'a Self::Lock;

    #[doc(hidden)]
    fn reacquire(lock: &'a Self::Lock) -> Self;
}

mod sealed {
    pub trait Sealed {}
}

// === impl ConditionVariable ===

impl ConditionVariable {
    /// Returns a new `ConditionVariable` with no waiters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            waiters: spin::Mutex::new(VecDeque::new()),
        }
    }

    /// Releases `guard`, parks the calling thread until notified (or
    /// spuriously woken), then reacquires the lock and returns its guard.
    pub fn wait<'a, G: LockGuard<'a> + 'a>(&self, guard: G) -> G {
        self.waiters.lock().push_back(crate::current());
        let lock = guard.release();
        // A notify landing between the queue push and this dispatch is not
        // lost: the signal persists in the wakeup word until consumed.
        crate::dispatch();
        G::reacquire(lock)
    }

    /// Wakes the oldest waiter, if any.
    pub fn notify_one(&self) {
        let waiter = self.waiters.lock().pop_front();
        if let Some(waiter) = waiter {
            crate::signal(waiter);
        }
    }

    /// Wakes every current waiter.
    pub fn notify_all(&self) {
        let waiters = std::mem::take(&mut *self.waiters.lock());
        for waiter in waiters {
            crate::signal(waiter);
        }
    }
}

impl Default for ConditionVariable {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for ConditionVariable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConditionVariable").finish_non_exhaustive()
    }
}

// === LockGuard impls ===

impl<T> sealed::Sealed for spin::MutexGuard<'_, T> {}

impl<'a, T> LockGuard<'a> for spin::MutexGuard<'a, T> {
    type Lock = spin::Mutex<T>;

    fn release(self) -> &'a spin::Mutex<T> {
        spin::MutexGuard::release(self)
    }

    fn reacquire(lock: &'a spin::Mutex<T>) -> Self {
        lock.lock()
    }
}

impl<T> sealed::Sealed for super::SleepLockGuard<'_, T> {}

impl<'a, T> LockGuard<'a> for super::SleepLockGuard<'a, T> {
    type Lock = super::SleepLock<T>;

    fn release(self) -> &'a super::SleepLock<T> {
        super::SleepLockGuard::release(self)
    }

    fn reacquire(lock: &'a super::SleepLock<T>) -> Self {
        lock.lock()
    }
}
