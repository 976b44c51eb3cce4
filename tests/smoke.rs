//! Creation, joining, slot recycling, and lifecycle.

mod util;

use arachne::{Config, Error};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::*};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn create_yield_join_round_trip() {
    util::with_runtime(Config::new().num_cores(2).max_num_cores(2), || {
        const THREADS: usize = 40;
        const YIELDS: usize = 16;

        let completed = Arc::new(AtomicUsize::new(0));
        let mut ids = Vec::new();
        for _ in 0..THREADS {
            let completed = completed.clone();
            let id = arachne::spawn(move || {
                for _ in 0..YIELDS {
                    arachne::yield_now();
                }
                completed.fetch_add(1, SeqCst);
            })
            .expect("spawn should find a free slot");
            ids.push(id);
        }

        for id in ids {
            arachne::join(id);
        }
        assert_eq!(completed.load(SeqCst), THREADS);
    });
}

#[test]
fn join_after_exit_returns_immediately() {
    util::with_runtime(Config::new().num_cores(1).max_num_cores(1), || {
        let counter = Arc::new(AtomicUsize::new(0));
        let id = arachne::spawn_on(0, {
            let counter = counter.clone();
            move || {
                counter.fetch_add(1, SeqCst);
            }
        })
        .unwrap();

        assert!(
            util::wait_until(Duration::from_secs(5), || counter.load(SeqCst) == 1),
            "the thread should have run"
        );
        std::thread::sleep(Duration::from_millis(5));

        let started = std::time::Instant::now();
        arachne::join(id);
        assert!(started.elapsed() < Duration::from_secs(1));

        // The handle is stale now: signaling through it must not disturb
        // anything, and a second join must not block.
        arachne::signal(id);
        arachne::join(id);
    });
}

#[test]
fn slot_exhaustion_and_recovery() {
    util::with_runtime(Config::new().num_cores(1).max_num_cores(1), || {
        let release = Arc::new(AtomicBool::new(false));
        let slots = arachne::MAX_SLOTS_PER_CORE;

        let mut ids = Vec::new();
        for _ in 0..slots {
            let release = release.clone();
            let id = arachne::spawn_on(0, move || {
                while !release.load(Acquire) {
                    arachne::yield_now();
                }
            })
            .expect("the table should have room");
            ids.push(id);
        }

        // One more than the table holds.
        assert_eq!(
            arachne::spawn_on(0, || {}).unwrap_err(),
            Error::SlotsFull,
        );

        release.store(true, Release);
        for id in ids {
            arachne::join(id);
        }

        // Slots were recycled; a retried creation succeeds.
        let id = arachne::spawn_on(0, || {}).expect("a recycled slot should be free");
        arachne::join(id);
    });
}

#[test]
fn spawn_error_cases() {
    util::with_runtime(Config::new().num_cores(1).max_num_cores(1), || {
        assert_eq!(
            arachne::spawn_on(7, || {}).unwrap_err(),
            Error::InvalidCore { core: 7 },
        );
    });
}

#[test]
fn uninitialized_runtime_is_an_error() {
    let _guard = util::runtime_lock();
    assert_eq!(arachne::spawn(|| {}).unwrap_err(), Error::Uninitialized);
    assert_eq!(arachne::active_cores(), 0);
    // Lifecycle calls are safe no-ops without a runtime.
    arachne::shut_down();
    arachne::wait_for_termination();
}

#[test]
fn shutdown_from_a_user_thread_and_reinitialize() {
    let _guard = util::runtime_lock();
    util::trace_init();

    for round in 0..2 {
        arachne::init(Config::new().num_cores(1).max_num_cores(1)).unwrap();
        arachne::test_init();

        let ran = Arc::new(AtomicUsize::new(0));
        let id = arachne::spawn_on(0, {
            let ran = ran.clone();
            move || {
                ran.fetch_add(1, SeqCst);
                arachne::shut_down();
            }
        })
        .unwrap();
        arachne::join(id);

        arachne::wait_for_termination();
        arachne::test_destroy();
        assert_eq!(ran.load(SeqCst), 1, "round {round}");
        assert_eq!(arachne::active_cores(), 0, "round {round}");
    }
}

#[test]
fn panicking_thread_is_reclaimed() {
    util::with_runtime(Config::new().num_cores(1).max_num_cores(1), || {
        let id = arachne::spawn_on(0, || panic!("user thread panic")).unwrap();
        arachne::join(id);

        // The slot came back; the scheduler survived.
        let after = Arc::new(AtomicUsize::new(0));
        let id = arachne::spawn_on(0, {
            let after = after.clone();
            move || {
                after.fetch_add(1, SeqCst);
            }
        })
        .unwrap();
        arachne::join(id);
        assert_eq!(after.load(SeqCst), 1);
    });
}
