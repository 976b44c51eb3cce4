//! Wakeup primitives: signal/dispatch, sleep timing, and the sleep-based
//! synchronization types.

mod util;

use arachne::sync::{ConditionVariable, SleepLock};
use arachne::{Config, ThreadId};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::*};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

#[test]
fn ping_pong_on_one_core() {
    util::with_runtime(Config::new().num_cores(1).max_num_cores(1), || {
        const ROUNDS: usize = 10_000;

        let a_id: Arc<OnceLock<ThreadId>> = Arc::new(OnceLock::new());
        let b_id: Arc<OnceLock<ThreadId>> = Arc::new(OnceLock::new());
        let rounds = Arc::new(AtomicUsize::new(0));

        let a = arachne::spawn_on(0, {
            let b_id = b_id.clone();
            move || {
                let b = loop {
                    if let Some(&b) = b_id.get() {
                        break b;
                    }
                    arachne::yield_now();
                };
                for _ in 0..ROUNDS {
                    arachne::signal(b);
                    arachne::dispatch();
                }
            }
        })
        .unwrap();
        a_id.set(a).unwrap();

        let b = arachne::spawn_on(0, {
            let a_id = a_id.clone();
            let rounds = rounds.clone();
            move || {
                let a = *a_id.get().expect("a was spawned first");
                for _ in 0..ROUNDS {
                    arachne::dispatch();
                    rounds.fetch_add(1, SeqCst);
                    arachne::signal(a);
                }
            }
        })
        .unwrap();
        b_id.set(b).unwrap();

        arachne::join(a);
        arachne::join(b);
        assert_eq!(rounds.load(SeqCst), ROUNDS);
    });
}

#[test]
fn sleepers_wake_in_deadline_order() {
    util::with_runtime(Config::new().num_cores(1).max_num_cores(1), || {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut ids = Vec::new();
        for (tag, millis) in [(0usize, 60u64), (1, 20), (2, 40)] {
            let order = order.clone();
            ids.push(
                arachne::spawn_on(0, move || {
                    arachne::sleep(Duration::from_millis(millis));
                    order.lock().unwrap().push(tag);
                })
                .unwrap(),
            );
        }
        for id in ids {
            arachne::join(id);
        }
        assert_eq!(*order.lock().unwrap(), [1, 2, 0]);
    });
}

#[test]
fn sleep_never_returns_early() {
    util::with_runtime(Config::new().num_cores(1).max_num_cores(1), || {
        // The calling thread itself sleeps on its detached core.
        let requested = Duration::from_millis(20);
        let started = Instant::now();
        arachne::sleep(requested);
        // Allow a sliver for clock-calibration error between the cycle
        // counter and Instant.
        assert!(started.elapsed() >= requested.mul_f64(0.9));
    });
}

#[test]
fn cross_core_signal_resumes_a_blocked_thread() {
    util::with_runtime(Config::new().num_cores(2).max_num_cores(2), || {
        let a_id: Arc<OnceLock<ThreadId>> = Arc::new(OnceLock::new());
        let resumed = Arc::new(AtomicBool::new(false));

        let a = arachne::spawn_on(0, {
            let resumed = resumed.clone();
            move || {
                arachne::dispatch();
                resumed.store(true, SeqCst);
            }
        })
        .unwrap();
        a_id.set(a).unwrap();

        let signaler = arachne::spawn_on(1, move || {
            arachne::signal(a);
        })
        .unwrap();

        assert!(
            util::wait_until(Duration::from_secs(2), || resumed.load(SeqCst)),
            "the blocked thread should resume after a cross-core signal"
        );
        arachne::join(signaler);
        arachne::join(a);
    });
}

#[test]
fn sleep_lock_provides_mutual_exclusion() {
    util::with_runtime(Config::new().num_cores(2).max_num_cores(2), || {
        const THREADS: usize = 8;
        const INCREMENTS: usize = 500;

        let counter = Arc::new(SleepLock::new(0usize));
        let mut ids = Vec::new();
        for _ in 0..THREADS {
            let counter = counter.clone();
            ids.push(
                arachne::spawn(move || {
                    for _ in 0..INCREMENTS {
                        let mut guard = counter.lock();
                        let value = *guard;
                        arachne::yield_now();
                        *guard = value + 1;
                    }
                })
                .unwrap(),
            );
        }
        for id in ids {
            arachne::join(id);
        }
        assert_eq!(*counter.lock(), THREADS * INCREMENTS);
    });
}

#[test]
fn sleep_lock_try_lock_excludes() {
    util::with_runtime(Config::new().num_cores(1).max_num_cores(1), || {
        let lock = SleepLock::new(());
        let guard = lock.try_lock();
        assert!(guard.is_some());
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    });
}

#[test]
fn condvar_wakes_waiters() {
    util::with_runtime(Config::new().num_cores(1).max_num_cores(1), || {
        const WAITERS: usize = 4;

        struct Shared {
            state: SleepLock<bool>,
            ready: ConditionVariable,
            woken: AtomicUsize,
        }
        let shared = Arc::new(Shared {
            state: SleepLock::new(false),
            ready: ConditionVariable::new(),
            woken: AtomicUsize::new(0),
        });

        let mut ids = Vec::new();
        for _ in 0..WAITERS {
            let shared = shared.clone();
            ids.push(
                arachne::spawn_on(0, move || {
                    let mut go = shared.state.lock();
                    while !*go {
                        go = shared.ready.wait(go);
                    }
                    drop(go);
                    shared.woken.fetch_add(1, SeqCst);
                })
                .unwrap(),
            );
        }

        {
            let mut go = shared.state.lock();
            *go = true;
            shared.ready.notify_all();
        }

        for id in ids {
            arachne::join(id);
        }
        assert_eq!(shared.woken.load(SeqCst), WAITERS);
    });
}
