//! The process-wide runtime: lifecycle, thread creation, cross-core wakeups,
//! and core elasticity.
//!
//! The runtime has a two-phase lifecycle: [`init`] creates the per-core slot
//! tables and spawns one pinned kernel thread per scheduling core (plus the
//! load monitor); [`wait_for_termination`] joins them all and frees every
//! per-core structure, leaving the library reinitializable.
//!
//! Elasticity: any dispatcher that keeps finding runnable work immediately
//! asks for another core (rate-limited), and a background monitor feeds
//! aggregate statistics to the [load estimator](crate::estimator), growing
//! the pool under sustained load and retiring the highest-index core once
//! load falls well below the level that justified the last expansion. A
//! retiring core is *drained* — creators skip it — and only exits once its
//! slot table is empty; draining is abandoned if the core does not empty
//! within the configured window.

use crate::config::Config;
use crate::context::{Invocation, ThreadContext, ThreadId, BLOCKED, DETACHED_CORE_BASE, UNOCCUPIED};
use crate::error::Error;
use crate::estimator::{Estimate, LoadEstimator};
use crate::scheduler::{self, Core, CoreNav};
use crate::stats::StatsSnapshot;
use crate::time;
use core::cell::RefCell;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering::*};
use std::io::Write;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};
use std::time::Instant;

/// Sentinel for "no core is draining".
const NO_DRAIN: usize = usize::MAX;

/// Stack size for the faux context installed by [`test_init`]; it is never
/// switched into, so it only needs to exist.
const TEST_CORE_STACK: usize = 16 * 1024;

static RUNTIME: RwLock<Option<Arc<Runtime>>> = RwLock::new(None);

/// Detached single-slot cores created by [`test_init`], indexed by
/// `ThreadId::core - DETACHED_CORE_BASE`.
static DETACHED: RwLock<Vec<Option<Arc<Core>>>> = RwLock::new(Vec::new());

static ERROR_STREAM: Mutex<Option<Box<dyn Write + Send>>> = Mutex::new(None);

std::thread_local! {
    static TEST_CORE: RefCell<Option<Arc<Core>>> = const { RefCell::new(None) };
}

pub(crate) struct Runtime {
    config: Config,

    /// One cell per potential core, up to the configured maximum. A cell is
    /// initialized when its core index first activates and stays allocated
    /// for the lifetime of the runtime; contexts are recycled, not freed.
    cores: Box<[OnceLock<Core>]>,

    /// The authoritative count of active cores; cores `0..num_cores` are
    /// initialized and have (or are about to have) a kernel thread.
    num_cores: AtomicUsize,

    /// The intended core count; increases before a new kernel thread is
    /// spawned, so concurrent growth requests are bounded by the maximum.
    num_cores_precursor: AtomicUsize,

    shutdown: AtomicBool,

    /// Index of the core currently draining for retirement, or [`NO_DRAIN`].
    draining_core: AtomicUsize,

    /// Round-robin cursor for automatic spawn placement.
    next_spawn_core: AtomicUsize,

    /// Cycle timestamp of the last pressure-triggered growth.
    last_grow: AtomicU64,
    grow_cooldown_cycles: u64,

    /// Serializes every mutation of the active-core set.
    core_change: Mutex<CoreChange>,

    estimator: Mutex<LoadEstimator>,
    monitor_thread: OnceLock<std::thread::Thread>,
    me: Weak<Runtime>,
}

struct CoreChange {
    kernel_threads: Vec<std::thread::JoinHandle<()>>,
    monitor: Option<std::thread::JoinHandle<()>>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("num_cores", &self.num_cores.load(Relaxed))
            .field("max_cores", &self.config.max_cores())
            .field("shutdown", &self.shutdown.load(Relaxed))
            .finish_non_exhaustive()
    }
}

// === impl Runtime ===

impl Runtime {
    fn new(config: Config) -> Arc<Self> {
        let max_cores = config.max_cores();
        let grow_cooldown_cycles = time::cycles_from_duration(config.grow_cooldown);
        Arc::new_cyclic(|me| Self {
            cores: (0..max_cores).map(|_| OnceLock::new()).collect(),
            num_cores: AtomicUsize::new(config.num_cores),
            num_cores_precursor: AtomicUsize::new(config.num_cores),
            shutdown: AtomicBool::new(false),
            draining_core: AtomicUsize::new(NO_DRAIN),
            next_spawn_core: AtomicUsize::new(0),
            last_grow: AtomicU64::new(0),
            grow_cooldown_cycles,
            core_change: Mutex::new(CoreChange {
                kernel_threads: Vec::new(),
                monitor: None,
            }),
            estimator: Mutex::new(LoadEstimator::new(&config)),
            monitor_thread: OnceLock::new(),
            me: me.clone(),
            config,
        })
    }

    fn start(self: &Arc<Self>) {
        // Initial slot tables are allocated up front; failure here is fatal
        // and aborts before any kernel thread exists.
        for id in 0..self.config.num_cores {
            self.activate(id);
        }
        let mut change = self.core_change.lock().unwrap();
        for id in 0..self.config.num_cores {
            change.kernel_threads.push(Self::spawn_kernel_thread(self, id));
        }
        let monitor = std::thread::Builder::new()
            .name("arachne-load-monitor".into())
            .spawn({
                let runtime = self.clone();
                move || monitor_main(runtime)
            })
            .unwrap_or_else(|error| fatal_spawn_error(&error));
        self.monitor_thread
            .set(monitor.thread().clone())
            .expect("the monitor is started exactly once");
        change.monitor = Some(monitor);
    }

    fn activate(&self, id: usize) -> &Core {
        self.cores[id]
            .get_or_init(|| Core::new(id, self.config.slots_per_core, self.config.stack_size))
    }

    fn spawn_kernel_thread(self: &Arc<Self>, core_id: usize) -> std::thread::JoinHandle<()> {
        let runtime = self.clone();
        std::thread::Builder::new()
            .name(format!("arachne-core-{core_id}"))
            .spawn(move || kernel_thread_main(runtime, core_id))
            .unwrap_or_else(|error| fatal_spawn_error(&error))
    }

    #[inline]
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Acquire)
    }

    fn context(&self, id: ThreadId) -> Option<(&Core, &ThreadContext)> {
        let core = self.cores.get(id.core)?.get()?;
        let context = core.slots.get(id.index)?;
        Some((core, context))
    }

    /// Reserves a slot on `core_id` and publishes `invocation` as a new
    /// runnable thread. The invocation is handed back on failure so the
    /// caller can retry elsewhere.
    fn try_spawn(
        &self,
        core_id: usize,
        invocation: Invocation,
    ) -> Result<ThreadId, (Error, Invocation)> {
        if core_id >= self.num_cores.load(Acquire) {
            return Err((Error::InvalidCore { core: core_id }, invocation));
        }
        let core = self.cores[core_id]
            .get()
            .expect("active cores are initialized before being published");
        if core.draining.load(Acquire) {
            return Err((Error::SlotsFull, invocation));
        }
        let Ok(slot) = core.occupancy.reserve_lowest_zero(self.config.slots_per_core) else {
            return Err((Error::SlotsFull, invocation));
        };
        let context = &core.slots[slot];
        // Safety: the reservation above gives us the creation window: the
        // slot is ours until the wakeup word is published.
        unsafe { context.set_invocation(invocation) };
        // Read the generation before publishing; afterwards the thread
        // could run, exit, and bump it.
        let id = context.id();
        core.stats.note_created();
        // The linearization point: the owning dispatcher observes this store
        // and the thread becomes immediately runnable.
        context.wakeup.store(0, Release);
        test_trace!(core = core_id, slot, "created thread");
        Ok(id)
    }

    /// Rate-limited growth request from a dispatcher that found runnable
    /// work with no scanning.
    #[inline]
    pub(crate) fn note_pressure(&self) {
        if self.num_cores_precursor.load(Relaxed) >= self.config.max_cores() {
            return;
        }
        let now = time::now();
        let last = self.last_grow.load(Relaxed);
        if now.wrapping_sub(last) < self.grow_cooldown_cycles {
            return;
        }
        if self
            .last_grow
            .compare_exchange(last, now, Relaxed, Relaxed)
            .is_ok()
        {
            self.grow();
        }
    }

    /// Activates one more core, if allowed. Contention simply drops the
    /// request; pressure will re-raise it.
    fn grow(&self) {
        let Ok(mut change) = self.core_change.try_lock() else {
            return;
        };
        if self.shutdown.load(Acquire) || self.draining_core.load(Acquire) != NO_DRAIN {
            return;
        }
        let precursor = self.num_cores_precursor.load(Acquire);
        if precursor >= self.config.max_cores() {
            return;
        }
        self.num_cores_precursor.store(precursor + 1, Release);
        // The slot table is allocated here, under the lock, so the new core
        // index is fully usable the instant its count is published.
        self.activate(precursor);
        self.estimator
            .lock()
            .unwrap()
            .record_scale_up(precursor);
        let Some(runtime) = self.me.upgrade() else {
            return;
        };
        change
            .kernel_threads
            .push(Self::spawn_kernel_thread(&runtime, precursor));
        tracing::info!(core = precursor, "growing the core pool");
    }

    /// Marks the highest-index core as draining. Returns `false` if
    /// retirement is not currently possible.
    fn begin_drain(&self) -> bool {
        let Ok(_change) = self.core_change.try_lock() else {
            return false;
        };
        let active = self.num_cores.load(Acquire);
        if active <= 1 || self.num_cores_precursor.load(Acquire) != active {
            return false;
        }
        let victim = active - 1;
        let core = self.cores[victim]
            .get()
            .expect("active cores are initialized");
        self.draining_core.store(victim, Release);
        core.draining.store(true, Release);
        tracing::info!(core = victim, "draining core for retirement");
        true
    }

    fn cancel_drain(&self) {
        let Ok(_change) = self.core_change.try_lock() else {
            return;
        };
        let victim = self.draining_core.load(Acquire);
        if victim == NO_DRAIN {
            return;
        }
        if let Some(core) = self.cores[victim].get() {
            core.draining.store(false, Release);
        }
        self.draining_core.store(NO_DRAIN, Release);
        tracing::info!(core = victim, "abandoned core retirement");
    }

    fn collect_stats(&self) -> StatsSnapshot {
        let mut snapshot = StatsSnapshot {
            collected_at: time::now(),
            ..Default::default()
        };
        for cell in self.cores.iter() {
            if let Some(core) = cell.get() {
                core.stats.accumulate_into(&mut snapshot);
            }
        }
        snapshot
    }
}

fn kernel_thread_main(runtime: Arc<Runtime>, core_id: usize) {
    let _span = tracing::info_span!("core", id = core_id).entered();
    pin_current_thread(core_id);
    let core = runtime.activate(core_id);
    // A retired core keeps its draining flag so that a creator racing the
    // retirement cannot strand a thread on it; re-activation lifts it.
    core.draining.store(false, Release);
    // For a grown core this is the publication making it a spawn target;
    // initial cores were published by init.
    runtime.num_cores.fetch_max(core_id + 1, AcqRel);

    scheduler::install(CoreNav {
        runtime: Arc::as_ptr(&runtime),
        core: core as *const Core,
    });
    tracing::info!("scheduler running");
    scheduler::enter(core);
    scheduler::uninstall();

    if runtime.is_shutdown() {
        tracing::info!("scheduler stopped");
    } else {
        // Retirement: only the highest-index core drains, so the active
        // range stays contiguous. The core's own draining flag stays set
        // until re-activation (see above).
        let _change = runtime.core_change.lock().unwrap();
        runtime.num_cores.store(core_id, Release);
        runtime.num_cores_precursor.store(core_id, Release);
        runtime.draining_core.store(NO_DRAIN, Release);
        tracing::info!("core retired");
    }
}

fn monitor_main(runtime: Arc<Runtime>) {
    let _span = tracing::info_span!("load-monitor").entered();
    let mut drain_deadline: Option<Instant> = None;
    loop {
        // Unparked early by shut_down.
        std::thread::park_timeout(runtime.config.estimation_interval);
        if runtime.is_shutdown() {
            break;
        }
        let active = runtime.num_cores.load(Acquire);
        let snapshot = runtime.collect_stats();
        let estimate = runtime.estimator.lock().unwrap().estimate(
            snapshot,
            active,
            runtime.config.slots_per_core,
        );
        match estimate {
            Estimate::Grow => {
                if runtime.draining_core.load(Acquire) != NO_DRAIN {
                    runtime.cancel_drain();
                }
                runtime.grow();
            }
            Estimate::Shrink => {
                if runtime.draining_core.load(Acquire) == NO_DRAIN && runtime.begin_drain() {
                    drain_deadline = Some(Instant::now() + runtime.config.drain_window);
                }
            }
            Estimate::Hold => {}
        }
        if runtime.draining_core.load(Acquire) == NO_DRAIN {
            drain_deadline = None;
        } else if drain_deadline.is_some_and(|deadline| Instant::now() > deadline) {
            runtime.cancel_drain();
            drain_deadline = None;
        }
    }
    tracing::debug!("load monitor stopped");
}

fn pin_current_thread(core_id: usize) {
    match core_affinity::get_core_ids() {
        Some(ids) if !ids.is_empty() => {
            let target = ids[core_id % ids.len()];
            if !core_affinity::set_for_current(target) {
                tracing::warn!(core = core_id, "could not pin to a physical core");
            }
        }
        _ => tracing::warn!(core = core_id, "no affinity information; running unpinned"),
    }
}

fn fatal_spawn_error(error: &std::io::Error) -> ! {
    write_error(format_args!(
        "arachne: failed to spawn a kernel thread: {error}\n"
    ));
    std::process::exit(1);
}

/// Runs `f` against the live runtime: the one this thread is scheduled on,
/// or the process-global one.
fn with_runtime<R>(f: impl FnOnce(&Runtime) -> R) -> Result<R, Error> {
    if let Some(nav) = scheduler::nav() {
        if !nav.runtime.is_null() {
            // Safety: a scheduled thread's runtime outlives it; teardown
            // joins every kernel thread before dropping the runtime.
            return Ok(f(unsafe { &*nav.runtime }));
        }
    }
    let runtime = RUNTIME.read().unwrap().clone();
    match runtime {
        Some(runtime) => Ok(f(&runtime)),
        None => Err(Error::Uninitialized),
    }
}

/// Resolves a [`ThreadId`] to its slot and runs `f` on it. Returns `None`
/// (silently) when the id cannot refer to a live thread.
fn with_context<R>(id: ThreadId, f: impl FnOnce(&Core, &ThreadContext) -> R) -> Option<R> {
    if id.core >= DETACHED_CORE_BASE {
        let core = {
            let detached = DETACHED.read().unwrap();
            detached.get(id.core - DETACHED_CORE_BASE)?.clone()?
        };
        let context = core.slots.get(id.index)?;
        return Some(f(&core, context));
    }
    with_runtime(|runtime| {
        let (core, context) = runtime.context(id)?;
        Some(f(core, context))
    })
    .ok()
    .flatten()
}

// === public API ===

/// Initializes the runtime: allocates per-core slot tables, spawns one
/// pinned kernel thread per initial core, and starts the load monitor.
///
/// Idempotent: if the runtime is already initialized this is a silent no-op
/// (the new configuration is discarded).
///
/// # Errors
///
/// Returns [`Error::InvalidConfig`] for an unusable configuration.
/// Allocation failure during initialization aborts the process.
pub fn init(config: Config) -> Result<(), Error> {
    let mut slot = RUNTIME.write().unwrap();
    if slot.is_some() {
        tracing::debug!("runtime already initialized; ignoring");
        return Ok(());
    }
    let config = config.validated()?;
    time::calibrate();
    tracing::info!(
        num_cores = config.num_cores,
        max_num_cores = config.max_cores(),
        stack_size = config.stack_size,
        "initializing runtime"
    );
    let runtime = Runtime::new(config);
    runtime.start();
    *slot = Some(runtime);
    Ok(())
}

/// Requests runtime shutdown. Safe to call from any thread, including user
/// threads running on scheduling cores.
///
/// Schedulers observe the flag once their current user thread blocks or
/// exits (the runtime is cooperative), return to their kernel stacks, and
/// terminate.
pub fn shut_down() {
    let notify = |runtime: &Runtime| {
        runtime.shutdown.store(true, Release);
        if let Some(thread) = runtime.monitor_thread.get() {
            thread.unpark();
        }
        tracing::info!("shutdown requested");
    };
    if let Some(nav) = scheduler::nav() {
        if !nav.runtime.is_null() {
            // Safety: as in with_runtime.
            return notify(unsafe { &*nav.runtime });
        }
    }
    if let Some(runtime) = RUNTIME.read().unwrap().clone() {
        notify(&runtime);
    }
}

/// Blocks until every kernel thread has terminated, then frees all per-core
/// state. After this returns the library may be initialized again.
///
/// Termination requires [`shut_down`] to be called (before or during this
/// wait) from a runtime thread.
pub fn wait_for_termination() {
    let Some(runtime) = RUNTIME.write().unwrap().take() else {
        return;
    };
    let (kernel_threads, monitor) = {
        let mut change = runtime.core_change.lock().unwrap();
        (
            std::mem::take(&mut change.kernel_threads),
            change.monitor.take(),
        )
    };
    for thread in kernel_threads {
        let _ = thread.join();
    }
    if let Some(monitor) = monitor {
        let _ = monitor.join();
    }
    tracing::info!("runtime terminated");
    // The joined kernel threads dropped their handles; this drop frees the
    // per-core state (barring a caller still blocked in join or signal).
    drop(runtime);
}

/// Creates a user thread on `core`, running `f`.
///
/// The thread becomes immediately runnable on that core's scheduler. On
/// success the returned [`ThreadId`] can be [`signal`]ed and [`join`]ed.
///
/// # Errors
///
/// - [`Error::SlotsFull`] if every slot on the core holds a live thread (or
///   the core is draining for retirement); the caller may retry on another
///   core or apply back-pressure. No partial state is left behind.
/// - [`Error::InvalidCore`] if `core` is not an active core index.
/// - [`Error::Uninitialized`] if the runtime is not running.
pub fn spawn_on<F>(core: usize, f: F) -> Result<ThreadId, Error>
where
    F: FnOnce() + Send + 'static,
{
    with_runtime(|runtime| {
        runtime
            .try_spawn(core, Box::new(f))
            .map_err(|(error, _)| error)
    })?
}

/// Creates a user thread on an automatically chosen core (round-robin over
/// active cores, skipping full or draining ones).
///
/// # Errors
///
/// As [`spawn_on`], with [`Error::SlotsFull`] meaning every active core is
/// full.
pub fn spawn<F>(f: F) -> Result<ThreadId, Error>
where
    F: FnOnce() + Send + 'static,
{
    with_runtime(|runtime| {
        let mut invocation: Invocation = Box::new(f);
        let active = runtime.num_cores.load(Acquire);
        if active == 0 {
            return Err(Error::Uninitialized);
        }
        let start = runtime.next_spawn_core.fetch_add(1, Relaxed);
        for offset in 0..active {
            match runtime.try_spawn((start + offset) % active, invocation) {
                Ok(id) => return Ok(id),
                Err((_, rejected)) => invocation = rejected,
            }
        }
        Err(Error::SlotsFull)
    })?
}

/// Makes the thread identified by `id` runnable and elevates it to the head
/// of its core's dispatch order.
///
/// A no-op if the thread has already exited (detected by the handle's
/// generation). Because the liveness check and the wakeup are separate
/// steps, a thread that recycles the slot in between can observe a
/// *spurious* wakeup; every blocking primitive in this crate re-checks its
/// condition after waking for exactly this reason.
pub fn signal(id: ThreadId) {
    with_context(id, |core, context| {
        if context.generation.load(Acquire) != id.generation {
            return;
        }
        let old = context.wakeup.load(Acquire);
        if old == UNOCCUPIED {
            return;
        }
        // Single shot: retrying would risk overwriting UNOCCUPIED written
        // by a concurrent slot reclaim.
        let _ = context.wakeup.compare_exchange(old, 0, AcqRel, Relaxed);
        core.elevate(id.index);
    });
}

/// Blocks until the thread identified by `id` has exited.
///
/// Returns immediately if the thread already exited, the handle is stale,
/// or the runtime is gone. Joining the calling thread itself deadlocks.
pub fn join(id: ThreadId) {
    with_context(id, |_core, context| {
        let mut guard = context.join_lock.lock();
        while context.generation.load(Acquire) == id.generation {
            guard = context.join_cv.wait(guard);
        }
    });
}

/// The number of currently active scheduling cores (0 when the runtime is
/// not initialized).
pub fn active_cores() -> usize {
    with_runtime(|runtime| runtime.num_cores.load(Acquire)).unwrap_or(0)
}

/// Redirects the runtime's fatal diagnostics (stack-canary failures,
/// allocation failures, ignored-option reports) from standard error to
/// `stream`.
pub fn set_error_stream<W: Write + Send + 'static>(stream: W) {
    let mut guard = ERROR_STREAM.lock().unwrap_or_else(PoisonError::into_inner);
    *guard = Some(Box::new(stream));
}

pub(crate) fn write_error(args: fmt::Arguments<'_>) {
    // Recover from poisoning: this runs on abort paths.
    let mut guard = ERROR_STREAM.lock().unwrap_or_else(PoisonError::into_inner);
    match guard.as_mut() {
        Some(stream) => {
            let _ = stream.write_fmt(args);
            let _ = stream.flush();
        }
        None => {
            let _ = std::io::stderr().write_fmt(args);
        }
    }
}

/// Installs just enough per-thread state for this (non-scheduled) thread to
/// use the blocking API — [`current`](crate::current),
/// [`dispatch`](crate::dispatch), [`sleep`](crate::sleep), [`join`], the
/// [sync primitives](crate::sync) — in unit tests. Idempotent.
///
/// A thread prepared this way occupies the single slot of a detached,
/// one-slot core: `dispatch` degenerates to waiting in place (there is no
/// other slot to switch to), and other threads may `signal` it through the
/// id returned by [`current`](crate::current).
pub fn test_init() {
    TEST_CORE.with(|cell| {
        let mut cell = cell.borrow_mut();
        if cell.is_some() {
            return;
        }
        assert!(
            scheduler::nav().is_none(),
            "test_init must not be called from a runtime-managed thread"
        );
        time::calibrate();
        let mut detached = DETACHED.write().unwrap();
        let index = match detached.iter().position(Option::is_none) {
            Some(index) => index,
            None => {
                detached.push(None);
                detached.len() - 1
            }
        };
        let core = Arc::new(Core::new(
            DETACHED_CORE_BASE + index,
            1,
            TEST_CORE_STACK,
        ));
        core.occupancy
            .reserve_lowest_zero(1)
            .expect("a fresh detached core has a free slot");
        core.slots[0].wakeup.store(BLOCKED, Release);
        scheduler::install(CoreNav {
            runtime: core::ptr::null(),
            core: Arc::as_ptr(&core),
        });
        detached[index] = Some(core.clone());
        *cell = Some(core);
    });
}

/// Removes the state installed by [`test_init`]. Idempotent.
pub fn test_destroy() {
    TEST_CORE.with(|cell| {
        let Some(core) = cell.borrow_mut().take() else {
            return;
        };
        scheduler::uninstall();
        let mut detached = DETACHED.write().unwrap();
        detached[core.id - DETACHED_CORE_BASE] = None;
    });
}
