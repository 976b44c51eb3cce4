//! Per-slot thread state: the stack, the wakeup word, and slot identity.

use crate::arch::{self, StackPointer};
use crate::sync::{spin, ConditionVariable};
use core::cell::UnsafeCell;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering::*};
use std::alloc::{self, Layout};

/// Wakeup-word sentinel: the slot holds no live thread.
pub(crate) const UNOCCUPIED: u64 = u64::MAX;

/// Wakeup-word sentinel: the thread exists but has no scheduled wakeup.
pub(crate) const BLOCKED: u64 = u64::MAX - 1;

/// Sentinel stored in the first eight bytes of every user stack. Stacks grow
/// downward, so an overflow tramples this word first; the scheduler verifies
/// it before every dispatch.
pub(crate) const STACK_CANARY: u64 = 0xDEAD_BEEF_BAAD_F00D;

/// Identity offset for detached (test-harness) cores; see
/// [`runtime::test_init`](crate::test_init).
pub(crate) const DETACHED_CORE_BASE: usize = 1 << 32;

/// A handle to a user thread: the thread's slot plus the slot generation at
/// the time the handle was created.
///
/// Slots are recycled, so a `ThreadId` may outlive the thread it named. The
/// generation number makes this safe: once the thread exits,
/// [`signal`](crate::signal) and [`join`](crate::join) through a stale
/// handle become no-ops rather than acting on the slot's next occupant.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ThreadId {
    pub(crate) core: usize,
    pub(crate) index: usize,
    pub(crate) generation: u64,
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ThreadId({}/{} gen {})",
            self.core, self.index, self.generation
        )
    }
}

/// An exclusively owned, canary-guarded user stack.
pub(crate) struct Stack {
    base: NonNull<u8>,
    layout: Layout,
}

// === impl Stack ===

impl Stack {
    /// Allocates a stack of `size` bytes and plants the canary.
    ///
    /// Aborts the process on allocation failure: the scheduler cannot
    /// operate partially initialized.
    pub(crate) fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, 16).expect("stack layout must be valid");
        let Some(base) = NonNull::new(unsafe { alloc::alloc(layout) }) else {
            crate::runtime::write_error(format_args!(
                "failed to allocate a {size}-byte thread stack\n"
            ));
            alloc::handle_alloc_error(layout);
        };
        // Safety: the buffer starts with at least 8 allocated bytes.
        unsafe { base.as_ptr().cast::<u64>().write_volatile(STACK_CANARY) };
        Self { base, layout }
    }

    #[inline]
    pub(crate) fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.layout.size()
    }

    /// Returns `true` if the canary word is intact.
    #[inline]
    pub(crate) fn canary_intact(&self) -> bool {
        // Volatile: the surrounding bytes are mutated through raw pointers
        // while user code runs on this stack.
        unsafe { self.base.as_ptr().cast::<u64>().read_volatile() == STACK_CANARY }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

// Safety: the buffer is exclusively owned by its `ThreadContext`, and a
// context's stack only ever executes on the core that owns the slot.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

/// The callable a new thread was created with, type-erased behind a single
/// "run" capability.
pub(crate) type Invocation = Box<dyn FnOnce() + Send + 'static>;

/// One slot's thread state.
///
/// Ownership moves with the thread lifecycle: the creator owns the slot from
/// a successful occupancy reservation until the wakeup word is published;
/// the owning core's scheduler owns it from then until the slot is
/// reclaimed. Only `wakeup` and `generation` are ever touched from other
/// cores.
pub(crate) struct ThreadContext {
    /// The slot's stack; the canary lives in its first eight bytes.
    stack: Stack,

    /// Saved stack pointer while the context is suspended. Mutated only by
    /// the owning core's scheduler, through [`Self::sp_cell`].
    sp: UnsafeCell<StackPointer>,

    /// The scheduling state word: [`UNOCCUPIED`], [`BLOCKED`], or the
    /// absolute cycle count at which the thread becomes runnable (yield is
    /// encoded as 0).
    pub(crate) wakeup: AtomicU64,

    /// Incremented each time the slot is reclaimed; pairs with the slot
    /// index to form a [`ThreadId`] that detects slot reuse.
    pub(crate) generation: AtomicU64,

    /// Guards the join condition variable.
    pub(crate) join_lock: spin::Mutex<()>,

    /// Notified by the scheduler's slot-reclaim path when the occupant
    /// exits.
    pub(crate) join_cv: ConditionVariable,

    /// The pending callable, if any. Written by the creator before the
    /// wakeup word is published; taken by the owning core.
    invocation: UnsafeCell<Option<Invocation>>,

    pub(crate) core_id: usize,
    pub(crate) id_in_core: usize,
}

// Safety: `sp` and `invocation` are confined to the owning core, except for
// the creator's one-shot initialization before occupancy is published; the
// remaining shared fields are atomics or internally synchronized.
unsafe impl Sync for ThreadContext {}
unsafe impl Send for ThreadContext {}

// === impl ThreadContext ===

impl ThreadContext {
    /// Allocates the slot's stack and seeds it to enter `entry` on its first
    /// switch-in.
    pub(crate) fn new(
        core_id: usize,
        id_in_core: usize,
        stack_size: usize,
        entry: extern "C" fn() -> !,
    ) -> Self {
        let stack = Stack::new(stack_size);
        // Safety: the freshly allocated buffer is exclusively ours.
        let sp = unsafe { arch::seed_stack(stack.base(), stack.size(), entry) };
        Self {
            stack,
            sp: UnsafeCell::new(sp),
            wakeup: AtomicU64::new(UNOCCUPIED),
            generation: AtomicU64::new(0),
            join_lock: spin::Mutex::new(()),
            join_cv: ConditionVariable::new(),
            invocation: UnsafeCell::new(None),
            core_id,
            id_in_core,
        }
    }

    #[inline]
    pub(crate) fn stack(&self) -> &Stack {
        &self.stack
    }

    /// Discards any suspended state and reseeds the stack to enter `entry`
    /// on the next switch-in.
    ///
    /// # Safety
    ///
    /// May only be called by the core driving this slot's table, on an
    /// unoccupied slot.
    pub(crate) unsafe fn reseed(&self, entry: extern "C" fn() -> !) {
        debug_assert_eq!(self.wakeup.load(Relaxed), UNOCCUPIED);
        *self.sp.get() = arch::seed_stack(self.stack.base(), self.stack.size(), entry);
    }

    /// The saved-stack-pointer cell, passed to the context switch.
    ///
    /// Only the owning core may write through the returned pointer
    /// (exactly one core owns a loaded context at any instant).
    #[inline]
    pub(crate) fn sp_cell(&self) -> *mut StackPointer {
        self.sp.get()
    }

    /// Stores the callable for a newly created thread.
    ///
    /// # Safety
    ///
    /// Caller must hold the creation window for this slot: occupancy
    /// reserved, wakeup not yet published.
    pub(crate) unsafe fn set_invocation(&self, invocation: Invocation) {
        debug_assert_eq!(self.wakeup.load(Relaxed), UNOCCUPIED);
        *self.invocation.get() = Some(invocation);
    }

    /// Takes the pending callable, if any.
    ///
    /// # Safety
    ///
    /// May only be called by the core that owns this slot's table, on the
    /// loaded context.
    pub(crate) unsafe fn take_invocation(&self) -> Option<Invocation> {
        (*self.invocation.get()).take()
    }

    /// The current [`ThreadId`] of this slot's occupant.
    #[inline]
    pub(crate) fn id(&self) -> ThreadId {
        ThreadId {
            core: self.core_id,
            index: self.id_in_core,
            generation: self.generation.load(Acquire),
        }
    }
}

impl fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadContext")
            .field("core_id", &self.core_id)
            .field("id_in_core", &self.id_in_core)
            .field("wakeup", &self.wakeup.load(Relaxed))
            .field("generation", &self.generation.load(Relaxed))
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    extern "C" fn never_entered() -> ! {
        unreachable!("seeded entry should not run in these tests")
    }

    #[test]
    fn canary_is_planted_and_checked() {
        let stack = Stack::new(8192);
        assert!(stack.canary_intact());
        unsafe { stack.base().cast::<u64>().write_volatile(0) };
        assert!(!stack.canary_intact());
    }

    #[test]
    fn seeded_sp_is_inside_the_stack() {
        let ctx = ThreadContext::new(0, 3, 8192, never_entered);
        let sp = unsafe { *ctx.sp_cell() } as usize;
        let base = ctx.stack().base() as usize;
        assert!(sp > base + STACK_CANARY.to_ne_bytes().len());
        assert!(sp < base + ctx.stack().size());
        // Room for the seeded frame and the landing pad above it.
        assert!(base + ctx.stack().size() - sp >= arch::SAVED_FRAME);
    }

    #[test]
    fn fresh_slot_is_unoccupied() {
        let ctx = ThreadContext::new(1, 0, 8192, never_entered);
        assert_eq!(ctx.wakeup.load(Relaxed), UNOCCUPIED);
        assert_eq!(ctx.id().generation, 0);
    }
}
