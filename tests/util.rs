//! Shared helpers for integration tests.
//!
//! The runtime is process-global, so tests that initialize it must not
//! overlap; everything here funnels through one lock.
#![allow(dead_code)]

use std::sync::{Mutex, MutexGuard, PoisonError};

static RUNTIME_LOCK: Mutex<()> = Mutex::new(());

/// Serializes tests that own the process-global runtime.
pub fn runtime_lock() -> MutexGuard<'static, ()> {
    RUNTIME_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn trace_init() {
    use tracing_subscriber::filter::LevelFilter;
    let collector = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::INFO)
        .with_test_writer()
        .without_time();
    let _ = tracing::subscriber::set_global_default(collector.finish());
}

/// Runs `test` against a freshly initialized runtime, with the calling
/// thread prepared via `test_init`, and tears everything down afterwards
/// (also on panic, so later tests get a clean slate).
pub fn with_runtime(config: arachne::Config, test: impl FnOnce()) {
    let _guard = runtime_lock();
    trace_init();

    struct Teardown;
    impl Drop for Teardown {
        fn drop(&mut self) {
            arachne::shut_down();
            arachne::wait_for_termination();
            arachne::test_destroy();
        }
    }

    arachne::init(config).expect("runtime initialization failed");
    arachne::test_init();
    let _teardown = Teardown;
    test();
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: std::time::Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    condition()
}
