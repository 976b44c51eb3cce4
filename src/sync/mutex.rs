//! A mutual exclusion lock whose waiters cede the core instead of spinning.

use crate::context::ThreadId;
use crate::sync::spin;
use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use std::collections::VecDeque;

/// A mutex for user threads.
///
/// When the lock is contended, waiters enqueue themselves and re-enter the
/// scheduler rather than spinning, so the core stays available for other
/// user threads. Unlocking hands ownership directly to the oldest waiter and
/// [`signal`](crate::signal)s it, giving first-in, first-out acquisition
/// order.
///
/// The data is reachable only through the RAII [`SleepLockGuard`] returned
/// by [`lock`](Self::lock) and [`try_lock`](Self::try_lock).
pub struct SleepLock<T> {
    state: spin::Mutex<LockState>,
    data: UnsafeCell<T>,
}

#[derive(Debug)]
struct LockState {
    /// The thread currently holding the lock.
    owner: Option<ThreadId>,
    /// Threads waiting to acquire, oldest first.
    waiters: VecDeque<ThreadId>,
}

/// RAII guard for a [`SleepLock`]; the lock is released on drop.
#[must_use = "if unused, the SleepLock will immediately unlock"]
pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
}

// Safety: the lock protocol guarantees at most one live guard, and the guard
// is the only path to the data.
unsafe impl<T: Send> Send for SleepLock<T> {}
unsafe impl<T: Send> Sync for SleepLock<T> {}

// === impl SleepLock ===

impl<T> SleepLock<T> {
    /// Returns a new `SleepLock` protecting `data`, unlocked.
    #[must_use]
    pub const fn new(data: T) -> Self {
        Self {
            state: spin::Mutex::new(LockState {
                owner: None,
                waiters: VecDeque::new(),
            }),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock, parking the calling thread while another thread
    /// holds it.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread already holds this lock.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let me = crate::current();
        let mut queued = false;
        loop {
            {
                let mut state = self.state.lock();
                match state.owner {
                    None => {
                        state.owner = Some(me);
                        return SleepLockGuard { lock: self };
                    }
                    // Ownership was handed to us by an unlock.
                    Some(owner) if owner == me && queued => {
                        return SleepLockGuard { lock: self };
                    }
                    Some(owner) if owner == me => {
                        panic!("deadlock: thread {me:?} already holds this SleepLock");
                    }
                    Some(_) if !queued => {
                        state.waiters.push_back(me);
                        queued = true;
                    }
                    Some(_) => {}
                }
            }
            // Wakeups are events, not promises: loop and re-check ownership.
            crate::dispatch();
        }
    }

    /// Acquires the lock only if it is free right now.
    pub fn try_lock(&self) -> Option<SleepLockGuard<'_, T>> {
        let mut state = self.state.lock();
        if state.owner.is_none() {
            state.owner = Some(crate::current());
            Some(SleepLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Returns a mutable reference to the data without locking.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Consumes the lock, returning the data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    fn unlock(&self) {
        let mut state = self.state.lock();
        match state.waiters.pop_front() {
            Some(next) => {
                // Hand ownership straight to the oldest waiter; its lock
                // loop observes itself as owner after waking.
                state.owner = Some(next);
                drop(state);
                crate::signal(next);
            }
            None => state.owner = None,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for SleepLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SleepLock")
            .field("owner", &state.owner)
            .field("waiters", &state.waiters.len())
            .finish_non_exhaustive()
    }
}

// === impl SleepLockGuard ===

impl<'a, T> SleepLockGuard<'a, T> {
    /// Releases the lock, returning it so the caller can reacquire later.
    pub(crate) fn release(self) -> &'a SleepLock<T> {
        let lock = self.lock;
        drop(self);
        lock
    }
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: holding the guard means owning the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: holding the guard means owning the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

impl<T: fmt::Debug> fmt::Debug for SleepLockGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}
