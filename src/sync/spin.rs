//! Spinning-based synchronization for short critical sections.
//!
//! Unlike [`SleepLock`](super::SleepLock), waiters here spin with
//! exponential backoff rather than ceding the core, so this lock must only
//! guard sections that cannot block: pushing to a waiter queue, transferring
//! lock ownership, notifying the join condition variable. It is exposed
//! because a plain spinlock is occasionally the right tool in application
//! code too.

use crate::util::Backoff;
use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering::*};

/// A spinlock-based mutual exclusion lock.
pub struct Mutex<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

/// RAII guard; the lock is released on drop.
#[must_use = "if unused, the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

// Safety: the lock provides the required mutual exclusion.
unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

// === impl Mutex ===

impl<T> Mutex<T> {
    /// Returns a new `Mutex` protecting `data`, unlocked.
    #[must_use]
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock, spinning until it is available.
    #[cfg_attr(test, track_caller)]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let mut boff = Backoff::new();
        while self
            .locked
            .compare_exchange(false, true, Acquire, Acquire)
            .is_err()
        {
            while self.locked.load(Relaxed) {
                boff.spin();
            }
        }
        MutexGuard { mutex: self }
    }

    /// Acquires the lock only if it is free right now.
    #[cfg_attr(test, track_caller)]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Acquire, Acquire)
            .is_ok()
            .then(|| MutexGuard { mutex: self })
    }
}

impl<T: fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("Mutex").field("data", &*guard).finish(),
            None => f.debug_struct("Mutex").field("data", &"<locked>").finish(),
        }
    }
}

// === impl MutexGuard ===

impl<'a, T> MutexGuard<'a, T> {
    /// Releases the lock, returning the mutex so the caller can reacquire
    /// it later.
    pub(crate) fn release(self) -> &'a Mutex<T> {
        let mutex = self.mutex;
        drop(self);
        mutex
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: holding the guard means holding the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: holding the guard means holding the lock.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.locked.store(false, Release);
    }
}

impl<T: fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn try_lock_excludes() {
        let mutex = Mutex::new(());
        let guard = mutex.try_lock();
        assert!(guard.is_some());
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn counts_across_threads() {
        let mutex = Arc::new(Mutex::new(0usize));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let mutex = mutex.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *mutex.lock() += 1;
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(*mutex.lock(), 4000);
    }
}
