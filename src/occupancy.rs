//! The per-core slot occupancy word.
//!
//! Each core describes which of its thread slots hold live threads with a
//! single atomic 64-bit word: a 56-bit occupancy bitmap co-packed with an
//! 8-bit population count. Packing the count alongside the bitmap keeps a
//! popcount off the thread-creation hot path, and updating both fields with
//! one CAS makes `popcount(bitmap) == count` hold at every instant.
//!
//! This word is the authoritative cross-core coordination point: creators on
//! any core race to reserve a slot through it, and the owning core's
//! scheduler clears bits through it when threads exit.

use crate::loom::sync::atomic::{
    AtomicU64,
    Ordering::{self, *},
};
use crate::util::Backoff;
use core::fmt;
use mycelium_bitfield::Pack64;

/// The maximum number of thread slots per core: the bitmap's width, leaving
/// eight bits of headroom in the word for the population count.
pub const MAX_SLOTS_PER_CORE: usize = 56;

const OCCUPIED: Pack64 = Pack64::least_significant(MAX_SLOTS_PER_CORE as u32);
const COUNT: Pack64 = OCCUPIED.next(8);

/// The atomic occupancy word. All updates go through a single CAS so the
/// bitmap and count can never be observed out of sync.
pub(crate) struct OccupancyMask(AtomicU64);

/// A point-in-time snapshot of an [`OccupancyMask`].
#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) struct Occupancy(u64);

/// Returned by [`OccupancyMask::reserve_lowest_zero`] when every slot up to
/// the limit already holds a live thread.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Full;

// === impl Occupancy ===

impl Occupancy {
    /// The occupied-slot bitmap.
    #[inline]
    pub(crate) fn bitmap(self) -> u64 {
        OCCUPIED.unpack_bits(self.0)
    }

    /// The number of occupied slots.
    #[inline]
    pub(crate) fn count(self) -> usize {
        COUNT.unpack_bits(self.0) as usize
    }

    /// Returns `true` if slot `bit` holds a live thread.
    #[inline]
    pub(crate) fn is_set(self, bit: usize) -> bool {
        self.bitmap() & (1 << bit) != 0
    }

    fn with_reserved(self, bit: usize) -> Self {
        Self(
            Pack64::pack_in(0)
                .pack_truncating(self.bitmap() | (1 << bit), &OCCUPIED)
                .pack_truncating(self.count() as u64 + 1, &COUNT)
                .bits(),
        )
    }

    fn with_cleared(self, bit: usize) -> Self {
        debug_assert!(self.is_set(bit), "cleared an unoccupied slot bit {bit}");
        Self(
            Pack64::pack_in(0)
                .pack_truncating(self.bitmap() & !(1 << bit), &OCCUPIED)
                .pack_truncating(self.count() as u64 - 1, &COUNT)
                .bits(),
        )
    }
}

impl fmt::Debug for Occupancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Occupancy")
            .field("bitmap", &format_args!("{:#058b}", self.bitmap()))
            .field("count", &self.count())
            .finish()
    }
}

// === impl OccupancyMask ===

impl OccupancyMask {
    // Loom's atomics have no const constructors, so the simulated build
    // gives up `const` here.
    #[cfg(not(loom))]
    pub(crate) const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[cfg(loom)]
    pub(crate) fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub(crate) fn load(&self, order: Ordering) -> Occupancy {
        Occupancy(self.0.load(order))
    }

    /// Reserves the lowest unoccupied slot below `limit`, returning its
    /// index.
    ///
    /// Lowest-index-first keeps the scheduler's round-robin scan clustered
    /// at the bottom of the slot table. Creators on different cores
    /// serialize through this one word; contention is resolved by retrying
    /// with backoff.
    pub(crate) fn reserve_lowest_zero(&self, limit: usize) -> Result<usize, Full> {
        debug_assert!(limit <= MAX_SLOTS_PER_CORE);
        let mut boff = Backoff::new();
        let mut current = self.load(Relaxed);
        loop {
            if current.count() >= limit {
                return Err(Full);
            }
            let bit = (!current.bitmap()).trailing_zeros() as usize;
            debug_assert!(bit < limit);
            match test_dbg!(self.0.compare_exchange_weak(
                current.0,
                current.with_reserved(bit).0,
                AcqRel,
                Acquire,
            )) {
                Ok(_) => return Ok(bit),
                Err(actual) => {
                    current = Occupancy(actual);
                    boff.spin();
                }
            }
        }
    }

    /// Clears slot `bit`, decrementing the count.
    ///
    /// Called only by the owning core's scheduler, after the exiting
    /// thread's wakeup word has already been reset, so an in-flight
    /// creation can never have its reservation clobbered.
    pub(crate) fn clear(&self, bit: usize) {
        let mut boff = Backoff::new();
        let mut current = self.load(Relaxed);
        loop {
            match test_dbg!(self.0.compare_exchange_weak(
                current.0,
                current.with_cleared(bit).0,
                AcqRel,
                Acquire,
            )) {
                Ok(_) => return,
                Err(actual) => {
                    current = Occupancy(actual);
                    boff.spin();
                }
            }
        }
    }
}

impl fmt::Debug for OccupancyMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Relaxed).fmt(f)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn packing_specs_valid() {
        Pack64::assert_all_valid(&[("OCCUPIED", OCCUPIED), ("COUNT", COUNT)]);
    }

    #[test]
    fn reserves_lowest_first() {
        let _trace = crate::util::test::trace_init();
        let mask = OccupancyMask::new();
        assert_eq!(mask.reserve_lowest_zero(MAX_SLOTS_PER_CORE), Ok(0));
        assert_eq!(mask.reserve_lowest_zero(MAX_SLOTS_PER_CORE), Ok(1));
        mask.clear(0);
        assert_eq!(mask.reserve_lowest_zero(MAX_SLOTS_PER_CORE), Ok(0));
        assert_eq!(mask.reserve_lowest_zero(MAX_SLOTS_PER_CORE), Ok(2));
    }

    #[test]
    fn full_at_limit() {
        let mask = OccupancyMask::new();
        for i in 0..4 {
            assert_eq!(mask.reserve_lowest_zero(4), Ok(i));
        }
        assert_eq!(mask.reserve_lowest_zero(4), Err(Full));
        mask.clear(2);
        assert_eq!(mask.reserve_lowest_zero(4), Ok(2));
    }

    #[test]
    fn full_at_max_width() {
        let mask = OccupancyMask::new();
        for i in 0..MAX_SLOTS_PER_CORE {
            assert_eq!(mask.reserve_lowest_zero(MAX_SLOTS_PER_CORE), Ok(i));
        }
        assert_eq!(mask.reserve_lowest_zero(MAX_SLOTS_PER_CORE), Err(Full));
        let occupancy = mask.load(Relaxed);
        assert_eq!(occupancy.count(), MAX_SLOTS_PER_CORE);
        assert_eq!(occupancy.bitmap(), (1 << MAX_SLOTS_PER_CORE) - 1);
    }

    proptest! {
        /// Any interleaving of reservations and clears keeps the packed
        /// count equal to the bitmap's popcount.
        #[test]
        fn count_matches_popcount(ops in prop::collection::vec(any::<bool>(), 1..256)) {
            let mask = OccupancyMask::new();
            let mut live = Vec::new();
            for reserve in ops {
                if reserve {
                    if let Ok(bit) = mask.reserve_lowest_zero(MAX_SLOTS_PER_CORE) {
                        live.push(bit);
                    }
                } else if let Some(bit) = live.pop() {
                    mask.clear(bit);
                }
                let occupancy = mask.load(Relaxed);
                prop_assert_eq!(occupancy.bitmap().count_ones() as usize, occupancy.count());
                prop_assert_eq!(occupancy.count(), live.len());
            }
        }
    }
}

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use crate::loom::{self, sync::Arc, thread};

    #[test]
    fn concurrent_reservations_get_distinct_slots() {
        loom::model(|| {
            let mask = Arc::new(OccupancyMask::new());
            let t1 = thread::spawn({
                let mask = mask.clone();
                move || mask.reserve_lowest_zero(2).unwrap()
            });
            let a = mask.reserve_lowest_zero(2).unwrap();
            let b = t1.join().unwrap();
            assert_ne!(a, b);
            let occupancy = mask.load(Relaxed);
            assert_eq!(occupancy.count(), 2);
            assert_eq!(occupancy.bitmap().count_ones(), 2);
        });
    }

    #[test]
    fn reserve_races_clear() {
        loom::model(|| {
            let mask = Arc::new(OccupancyMask::new());
            let held = mask.reserve_lowest_zero(2).unwrap();
            let t1 = thread::spawn({
                let mask = mask.clone();
                move || mask.clear(held)
            });
            let reserved = mask.reserve_lowest_zero(2).unwrap();
            t1.join().unwrap();
            assert_ne!(reserved, held);
            let occupancy = mask.load(Relaxed);
            assert_eq!(occupancy.bitmap().count_ones() as usize, occupancy.count());
            assert_eq!(occupancy.count(), 1);
        });
    }
}
