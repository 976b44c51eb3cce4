//! The per-core cooperative scheduler.
//!
//! Each scheduling core runs one kernel thread whose job is to multiplex the
//! core's slot table of user contexts. The scheduler is entered only from a
//! user stack: calling [`dispatch`] *is* the act of blocking the current
//! thread, and it returns only when the calling context's slot is selected
//! to run again.
//!
//! Dispatch order is round-robin over the slot table, preempted by a
//! priority channel: a signaler may set a bit in the target core's public
//! priority mask to move that slot to the head of the next dispatch. The
//! public mask is drained into a core-local private mask at dispatch entry
//! (copy-then-clear, so elevations arriving mid-dispatch stay pending), and
//! elevations are consumed on use.

use crate::arch;
use crate::context::{ThreadContext, ThreadId, BLOCKED, UNOCCUPIED};
use crate::occupancy::OccupancyMask;
use crate::runtime::Runtime;
use crate::stats::CoreStats;
use crate::time;
use crate::util::CachePadded;
use core::cell::{Cell, UnsafeCell};
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering::*};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

/// A dispatcher that finds runnable work within this many scan iterations is
/// under enough pressure to ask for another core.
const CORE_INCREASE_THRESHOLD: u32 = 3;

/// One scheduling core: the slot table plus everything other cores may touch
/// (occupancy, wakeup words, the public priority mask, statistics).
pub(crate) struct Core {
    pub(crate) id: usize,
    pub(crate) slots: Box<[ThreadContext]>,
    pub(crate) occupancy: OccupancyMask,
    pub(crate) stats: CoreStats,

    /// Set by signalers on any core to elevate a local slot; drained by this
    /// core's dispatcher. A hint only, so all accesses are relaxed.
    public_priority: CachePadded<AtomicU64>,

    /// Set while this core is being retired; creators skip a draining core
    /// so its slot table can empty out.
    pub(crate) draining: AtomicBool,

    sched: SchedState,
}

/// Scheduler-private, core-local state. Only the kernel thread currently
/// driving this core touches these fields, but they live in the shared
/// `Core` so that suspended contexts survive the core being retired and
/// later re-activated by a different kernel thread.
struct SchedState {
    /// Index of the context currently executing on this core.
    loaded: Cell<usize>,

    /// Where the next round-robin scan resumes.
    next_candidate: Cell<usize>,

    /// Elevations drained from the public mask, consumed one bit at a time.
    private_priority: Cell<u64>,

    /// The kernel thread's own stack pointer, saved while user contexts run;
    /// the dispatcher switches back to it on shutdown or retirement.
    kernel_sp: UnsafeCell<arch::StackPointer>,

    /// Cycle timestamp of the last statistics flush.
    last_flush: Cell<u64>,
}

// Safety: `sched` is confined to the single kernel thread driving this core
// (exactly one at any time); everything else is atomic or internally
// synchronized.
unsafe impl Sync for Core {}
unsafe impl Send for Core {}

/// The calling thread's scheduling identity: which core it drives, and the
/// runtime that core belongs to (null for detached test-harness cores).
#[derive(Copy, Clone)]
pub(crate) struct CoreNav {
    pub(crate) runtime: *const Runtime,
    pub(crate) core: *const Core,
}

std::thread_local! {
    static CURRENT: Cell<Option<CoreNav>> = const { Cell::new(None) };
}

pub(crate) fn install(nav: CoreNav) {
    CURRENT.with(|current| current.set(Some(nav)));
}

pub(crate) fn uninstall() {
    CURRENT.with(|current| current.set(None));
}

pub(crate) fn nav() -> Option<CoreNav> {
    CURRENT.with(Cell::get)
}

#[track_caller]
fn nav_expect() -> CoreNav {
    nav().expect(
        "this operation requires a thread managed by the runtime \
         (or a thread prepared with arachne::test_init)",
    )
}

// === impl Core ===

impl Core {
    pub(crate) fn new(id: usize, slot_count: usize, stack_size: usize) -> Self {
        let slots = (0..slot_count)
            .map(|index| ThreadContext::new(id, index, stack_size, trampoline))
            .collect();
        tracing::debug!(core = id, slots = slot_count, "initialized slot table");
        Self {
            id,
            slots,
            occupancy: OccupancyMask::new(),
            stats: CoreStats::new(),
            public_priority: CachePadded::new(AtomicU64::new(0)),
            draining: AtomicBool::new(false),
            sched: SchedState {
                loaded: Cell::new(0),
                next_candidate: Cell::new(0),
                private_priority: Cell::new(0),
                kernel_sp: UnsafeCell::new(core::ptr::null_mut()),
                last_flush: Cell::new(time::now()),
            },
        }
    }

    /// ORs `bit` into the public priority mask. Callable from any core.
    #[inline]
    pub(crate) fn elevate(&self, bit: usize) {
        self.public_priority.fetch_or(1 << bit, Relaxed);
    }

    /// Accounts the cycles since the previous flush as either loaded (user
    /// code ran) or idle (the dispatcher was scanning).
    fn flush_stats(&self, now: u64, loaded_occupied: bool, occupants: usize) {
        let prev = self.sched.last_flush.replace(now);
        let elapsed = now.wrapping_sub(prev);
        if loaded_occupied {
            self.stats.record_loaded(elapsed, occupants);
        } else {
            self.stats.record_idle(elapsed);
        }
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("id", &self.id)
            .field("occupancy", &self.occupancy)
            .field("draining", &self.draining.load(Relaxed))
            .finish_non_exhaustive()
    }
}

/// Runs a core's scheduler until shutdown or retirement.
///
/// Called on the kernel thread's own stack; switches into slot 0's context
/// and returns when a dispatcher switches back on shutdown or retirement.
pub(crate) fn enter(core: &Core) {
    let sched = &core.sched;
    sched.loaded.set(0);
    sched.next_candidate.set(0);
    sched.private_priority.set(0);
    sched.last_flush.set(time::now());
    // Slot 0 may hold a stale suspension from a previous activation of this
    // core; start its scheduler loop from the top either way.
    //
    // Safety: every slot is empty here (retirement requires an empty table),
    // so no live thread state is discarded.
    unsafe {
        core.slots[0].reseed(trampoline);
        arch::swap_context(sched.kernel_sp.get(), core.slots[0].sp_cell());
    }
}

/// Cedes the core until the calling context's slot is next selected to run.
///
/// This is the runtime's one blocking primitive: every other blocking
/// operation is a mutation of a wakeup word followed by `dispatch`. The
/// return of `dispatch` is an *event*, not a promise that any awaited
/// condition now holds — anyone with this thread's [`ThreadId`] may
/// [`signal`](crate::signal) it. Callers re-check their condition and
/// dispatch again if it does not hold.
///
/// # Panics
///
/// Panics if the calling thread is not managed by the runtime and has not
/// been prepared with [`test_init`](crate::test_init).
pub fn dispatch() {
    let nav = nav_expect();
    // Safety: the navigation pointers are valid for as long as this thread
    // can run user code: the runtime is kept alive by the kernel threads it
    // joins on teardown, and a detached core by its registry entry.
    let core = unsafe { &*nav.core };
    let runtime = (!nav.runtime.is_null()).then(|| unsafe { &*nav.runtime });

    let sched = &core.sched;
    let loaded = sched.loaded.get();

    // A trampled canary means a user thread overflowed its stack and
    // corrupted the slot table; there is nothing sane left to schedule.
    if !core.slots[loaded].stack().canary_intact() {
        canary_failure(core, loaded);
    }

    let mut now = time::now();
    let occupancy = core.occupancy.load(Acquire);
    core.flush_stats(now, occupancy.is_set(loaded), occupancy.count());

    // Priority channel: drain public elevations, then try them lowest-first.
    // An elevated slot that is unoccupied or not yet due falls through to
    // the round-robin scan; its elevation is consumed regardless.
    if sched.private_priority.get() == 0 {
        sched
            .private_priority
            .set(core.public_priority.swap(0, Relaxed));
    }
    loop {
        let mask = sched.private_priority.get();
        if mask == 0 {
            break;
        }
        let bit = mask.trailing_zeros() as usize;
        sched.private_priority.set(mask & (mask - 1));
        if bit < core.slots.len()
            && core.occupancy.load(Acquire).is_set(bit)
            && core.slots[bit].wakeup.load(Acquire) == 0
        {
            return switch_to(core, runtime, bit, 0);
        }
    }

    // Round-robin scan for the first slot due to run. Each wrap takes a
    // fresh occupancy snapshot and clock sample (so a thread sleeping until
    // "now" fires on the next pass) and polls for termination.
    let slot_count = core.slots.len();
    let mut occupancy = core.occupancy.load(Acquire);
    let mut index = sched.next_candidate.get();
    let mut iterations = 0u32;
    let winner = loop {
        if occupancy.is_set(index) && core.slots[index].wakeup.load(Acquire) <= now {
            break index;
        }
        iterations += 1;
        index += 1;
        if index == slot_count {
            index = 0;
            if let Some(runtime) = runtime {
                if runtime.is_shutdown() {
                    exit_scheduler(core);
                }
                if core.draining.load(Acquire) && core.occupancy.load(Acquire).count() == 0 {
                    exit_scheduler(core);
                }
            } else {
                // Detached test-harness cores have no sibling threads to
                // starve, but spinning a whole CPU while a test waits helps
                // no one.
                std::thread::yield_now();
            }
            now = time::now();
            core.flush_stats(now, false, 0);
            occupancy = core.occupancy.load(Acquire);
            core::hint::spin_loop();
        }
    };

    switch_to(core, runtime, winner, iterations)
}

/// Hands the core to slot `winner`.
fn switch_to(core: &Core, runtime: Option<&Runtime>, winner: usize, iterations: u32) {
    let sched = &core.sched;
    sched.next_candidate.set((winner + 1) % core.slots.len());

    // Work found almost immediately means this core has a runnable backlog;
    // ask for another core (bounded and rate-limited by the runtime).
    if iterations < CORE_INCREASE_THRESHOLD {
        if let Some(runtime) = runtime {
            runtime.note_pressure();
        }
    }

    let loaded = sched.loaded.get();
    if winner == loaded {
        // The current thread was reselected; consume its wakeup.
        core.slots[winner].wakeup.store(BLOCKED, Release);
        core.flush_stats(time::now(), false, 0);
        return;
    }

    sched.loaded.set(winner);
    let save = core.slots[loaded].sp_cell();
    let target = core.slots[winner].sp_cell();
    // Safety: `winner` is a seeded or suspended context of this core, and
    // only this kernel thread switches this core's contexts. No owned values
    // are held across the switch, so a context abandoned at shutdown leaks
    // nothing.
    unsafe { arch::swap_context(save, target) };

    // Switched back in: some dispatcher on this core selected our slot.
    // BLOCKED must be stored *after* the switch: a signal arriving between
    // dispatch entry and the switch wins by CASing 0 in, and the switch
    // itself is the serialization point that makes this store safe.
    let resumed = sched.loaded.get();
    core.slots[resumed].wakeup.store(BLOCKED, Release);
    core.flush_stats(time::now(), false, 0);
}

/// Leaves the scheduler loop, returning control to the kernel thread's own
/// stack. The current context is abandoned in place; if the core is later
/// re-activated, [`enter`] reseeds slot 0 and every other slot resumes
/// normally when its next occupant is created.
fn exit_scheduler(core: &Core) -> ! {
    let sched = &core.sched;
    core.flush_stats(time::now(), false, 0);
    tracing::debug!(core = core.id, "scheduler loop exiting");
    let save = core.slots[sched.loaded.get()].sp_cell();
    // Safety: the kernel stack pointer was saved by `enter` on this same
    // kernel thread.
    unsafe { arch::swap_context(save, sched.kernel_sp.get()) };
    unreachable!("a retired scheduler context was switched back in");
}

/// Entry point of every user context; lives at the bottom of each seeded
/// stack.
extern "C" fn trampoline() -> ! {
    loop {
        dispatch();
        if run_current() {
            reclaim_current();
        }
    }
}

/// Runs the loaded slot's pending invocation, if any. Returns `false` for a
/// spurious wakeup of an empty context.
fn run_current() -> bool {
    let nav = nav_expect();
    // Safety: as in `dispatch`.
    let core = unsafe { &*nav.core };
    let context = &core.slots[core.sched.loaded.get()];

    // Safety: this slot is loaded on the owning core.
    let Some(invocation) = (unsafe { context.take_invocation() }) else {
        return false;
    };
    test_trace!(core = core.id, slot = context.id_in_core, "running thread");
    // Unwinding out of this frame would cross the seeded assembly frame at
    // the stack's base, which is undefined behavior.
    if catch_unwind(AssertUnwindSafe(invocation)).is_err() {
        tracing::error!(
            core = core.id,
            slot = context.id_in_core,
            "user thread panicked; treating it as exited"
        );
    }
    true
}

/// Reclaims the loaded slot after its occupant returned.
fn reclaim_current() {
    let nav = nav_expect();
    // Safety: as in `dispatch`.
    let core = unsafe { &*nav.core };
    let sched = &core.sched;
    let index = sched.loaded.get();
    let context = &core.slots[index];

    core.flush_stats(
        time::now(),
        true,
        core.occupancy.load(Acquire).count(),
    );

    // Cancel any self-scheduled wakeup before anything else; a signal that
    // raced past the generation check can no longer CAS this slot runnable
    // (its single-shot compare now fails against UNOCCUPIED).
    context.wakeup.store(UNOCCUPIED, Release);
    context.generation.fetch_add(1, Release);

    {
        let _guard = context.join_lock.lock();
        context.join_cv.notify_all();
    }

    // Clearing occupancy comes after everything above so that an in-flight
    // creation targeting another slot can never observe this slot half
    // reclaimed, and a creation that already reserved this slot is
    // impossible until the bit drops.
    core.occupancy.clear(index);

    // A recycled slot starts at normal priority.
    sched
        .private_priority
        .set(sched.private_priority.get() & !(1 << index));
    core.public_priority.fetch_and(!(1 << index), Relaxed);

    core.stats.note_finished();
    test_trace!(core = core.id, slot = index, "slot reclaimed");
}

/// Cedes the core to the next runnable thread, leaving the calling thread
/// immediately runnable again.
///
/// Fast path: a thread that is its core's only occupant keeps running
/// without entering the dispatcher at all.
///
/// # Panics
///
/// Panics if the calling thread is not managed by the runtime and has not
/// been prepared with [`test_init`](crate::test_init).
pub fn yield_now() {
    let nav = nav_expect();
    // Safety: as in `dispatch`.
    let core = unsafe { &*nav.core };
    if core.occupancy.load(Acquire).count() == 1 {
        return;
    }
    core.slots[core.sched.loaded.get()]
        .wakeup
        .store(0, Release);
    dispatch();
}

/// Blocks the calling thread for at least `duration`.
///
/// The wake time is a lower bound: the thread becomes runnable once the
/// core's cycle counter reaches it, but cooperative scheduling may delay the
/// actual resumption arbitrarily.
///
/// # Panics
///
/// Panics if the calling thread is not managed by the runtime and has not
/// been prepared with [`test_init`](crate::test_init).
pub fn sleep(duration: Duration) {
    let nav = nav_expect();
    // Safety: as in `dispatch`.
    let core = unsafe { &*nav.core };
    let wake = time::now()
        .saturating_add(time::cycles_from_duration(duration))
        .min(BLOCKED - 1);
    core.slots[core.sched.loaded.get()]
        .wakeup
        .store(wake, Release);
    dispatch();
}

/// Returns the calling thread's [`ThreadId`].
///
/// # Panics
///
/// Panics if the calling thread is not managed by the runtime and has not
/// been prepared with [`test_init`](crate::test_init).
pub fn current() -> ThreadId {
    let nav = nav_expect();
    // Safety: as in `dispatch`.
    let core = unsafe { &*nav.core };
    core.slots[core.sched.loaded.get()].id()
}

fn canary_failure(core: &Core, slot: usize) -> ! {
    crate::runtime::write_error(format_args!(
        "arachne: stack canary destroyed on core {} slot {slot}; a user \
         thread overflowed its stack. aborting.\n",
        core.id,
    ));
    tracing::error!(core = core.id, slot, "stack canary destroyed; aborting");
    std::process::abort();
}
