//! Core-pool elasticity: growth under pressure, retirement when idle.

mod util;

use arachne::Config;
use std::sync::atomic::{AtomicBool, Ordering::*};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn grows_under_load_and_shrinks_when_idle() {
    let config = Config::new()
        .num_cores(1)
        .max_num_cores(2)
        .estimation_interval(Duration::from_millis(10))
        .grow_cooldown(Duration::from_millis(10))
        .drain_window(Duration::from_secs(2));

    util::with_runtime(config, || {
        assert_eq!(arachne::active_cores(), 1);

        // A runnable backlog on core 0: dispatchers keep finding work
        // immediately, which is the growth trigger.
        let stop = Arc::new(AtomicBool::new(false));
        let mut ids = Vec::new();
        for _ in 0..4 {
            let stop = stop.clone();
            ids.push(
                arachne::spawn_on(0, move || {
                    while !stop.load(Acquire) {
                        arachne::yield_now();
                    }
                })
                .unwrap(),
            );
        }

        assert!(
            util::wait_until(Duration::from_secs(10), || arachne::active_cores() == 2),
            "a saturated core should grow the pool to its maximum"
        );

        // Drain the workload; with utilization back near zero and the slot
        // tables empty, the estimator retires the extra core.
        stop.store(true, Release);
        for id in ids {
            arachne::join(id);
        }
        assert!(
            util::wait_until(Duration::from_secs(10), || arachne::active_cores() == 1),
            "an idle pool should shrink back down"
        );
    });
}
