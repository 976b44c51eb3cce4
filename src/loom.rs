//! Compiles the occupancy word's atomics against [`loom`]'s simulated
//! versions when the crate is built with `--cfg loom`, so the lock-free
//! slot-reservation protocol can be model-checked. Nothing else in the
//! crate is loom-modeled; every other module uses the real `core`/`std`
//! types directly.
//!
//! [`loom`]: https://crates.io/crates/loom
#[allow(unused_imports)]
pub(crate) use self::inner::*;

#[cfg(loom)]
mod inner {
    #![allow(dead_code, unused_imports)]

    pub(crate) use loom::{model, sync, thread};
}

#[cfg(not(loom))]
mod inner {
    #![allow(dead_code, unused_imports)]

    pub(crate) mod sync {
        pub(crate) use core::sync::atomic;
        pub(crate) use std::sync::Arc;
    }

    #[cfg(test)]
    pub(crate) use std::thread;

    #[cfg(test)]
    pub(crate) fn model(f: impl FnOnce()) {
        f()
    }
}
