//! Per-thread fiber runtime.
//!
//! The host thread's own frame is the dispatcher: it loops picking the next
//! ready context and granting it the thread of control through the context's
//! handoff latch. Fibers give control back at explicit suspension points —
//! [`yield_now`], [`sleep_until`], a wait primitive, or the reactor loop's
//! own parking — so there is no preemption anywhere.
//!
//! All scheduler state lives under one core lock. Fiber threads take it
//! briefly at suspension points; foreign threads take it to submit wake-ups,
//! which additionally kick the reactor via the scheduler's `notify` so a
//! blocked `run_one` returns promptly.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::SchedulerConfig;
use crate::error::Error;
use crate::fiber::{FiberContext, FiberProperties};
use crate::reactor::Reactor;
use crate::sched::{ReactorScheduler, SchedAlgorithm};
use crate::tracing_compat::{error, trace};
use crate::types::{FiberId, FiberKind, FiberState};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<CurrentFiber>> = const { RefCell::new(None) };
    static CONTEXT_ID: std::cell::Cell<Option<u64>> = const { std::cell::Cell::new(None) };
}

#[derive(Clone)]
struct CurrentFiber {
    ctx: Arc<FiberContext>,
    rt: Arc<RuntimeShared>,
}

fn current() -> Option<CurrentFiber> {
    CURRENT.with(|slot| slot.borrow().clone())
}

/// A fiber parked on a timed sleep, ordered by deadline.
struct Sleeper {
    deadline: Instant,
    seq: u64,
    ctx: Arc<FiberContext>,
}

impl PartialEq for Sleeper {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Sleeper {}

impl PartialOrd for Sleeper {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Sleeper {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Scheduler state guarded by the core lock.
pub(crate) struct SchedCore {
    pub(crate) algo: ReactorScheduler,
    sleepers: BinaryHeap<Reverse<Sleeper>>,
    sleep_seq: u64,
    live_fibers: usize,
    dispatcher: Arc<FiberContext>,
}

impl SchedCore {
    fn push_sleeper(&mut self, deadline: Instant, ctx: &Arc<FiberContext>) {
        let seq = self.sleep_seq;
        self.sleep_seq += 1;
        self.sleepers.push(Reverse(Sleeper {
            deadline,
            seq,
            ctx: Arc::clone(ctx),
        }));
    }

    fn earliest_sleeper(&self) -> Option<Instant> {
        self.sleepers.peek().map(|Reverse(sleeper)| sleeper.deadline)
    }

    /// Re-awakens every sleeper whose deadline has passed. Entries whose
    /// fiber is no longer waiting are stale and dropped.
    fn wake_due_sleepers(&mut self) {
        let now = Instant::now();
        while let Some(Reverse(top)) = self.sleepers.peek() {
            if top.deadline > now {
                break;
            }
            let Reverse(sleeper) = self.sleepers.pop().expect("peeked entry exists");
            if sleeper.ctx.state() == FiberState::Waiting {
                sleeper.ctx.set_state(FiberState::Ready);
                self.algo.awakened(&sleeper.ctx);
            }
        }
    }
}

/// State shared between the dispatcher, its fibers, and foreign threads.
pub(crate) struct RuntimeShared {
    pub(crate) core: Mutex<SchedCore>,
    /// Wakes the dispatcher out of its idle park.
    idle_cond: Condvar,
    pub(crate) reactor: Reactor,
    pub(crate) config: SchedulerConfig,
    context_id: u64,
}

impl RuntimeShared {
    pub(crate) fn new(reactor: Reactor, config: SchedulerConfig) -> Arc<Self> {
        let algo = ReactorScheduler::new(&reactor, config.main_switch_limit);
        let dispatcher = FiberContext::new(
            FiberKind::Dispatcher,
            FiberProperties::new("dispatch", FiberProperties::MAX_NICE_LEVEL),
            false,
        );
        Arc::new(Self {
            core: Mutex::new(SchedCore {
                algo,
                sleepers: BinaryHeap::new(),
                sleep_seq: 0,
                live_fibers: 0,
                dispatcher,
            }),
            idle_cond: Condvar::new(),
            reactor,
            config,
            context_id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// Whether the calling thread belongs to this runtime (the host thread
    /// or one of its fiber threads).
    pub(crate) fn on_context_thread(&self) -> bool {
        CONTEXT_ID.with(|id| id.get()) == Some(self.context_id)
    }

    pub(crate) fn has_ready_fibers(&self) -> bool {
        self.core.lock().algo.has_ready_fibers()
    }

    pub(crate) fn main_resumes(&self) -> u64 {
        self.core.lock().algo.main_resumes()
    }

    pub(crate) fn active_fiber_count(&self) -> usize {
        self.core.lock().algo.active_fiber_count()
    }

    /// Transitions a waiting fiber back to ready. Safe to call from any
    /// thread; wake-ups that arrive before the fiber finished parking are
    /// latched and consumed at the park point.
    pub(crate) fn make_ready(&self, ctx: &Arc<FiberContext>) {
        let mut core = self.core.lock();
        if ctx.state() == FiberState::Waiting {
            ctx.set_state(FiberState::Ready);
            core.algo.awakened(ctx);
            if !self.on_context_thread() {
                // The loop fiber may be blocked inside run_one; break it out
                // so the new arrival is scheduled promptly.
                core.algo.notify();
            }
            drop(core);
            self.idle_cond.notify_all();
        } else {
            ctx.set_pending_wake();
        }
    }

    /// Parks the calling fiber if `setup` agrees to, all under the core
    /// lock: `setup` registers the wake-up path (or reports that the waited
    /// condition already holds by returning `false`) atomically with the
    /// state transition, so a wake-up can never slip between them.
    ///
    /// Also returns without parking when a wake-up raced ahead of the park;
    /// callers re-check their predicate in a loop either way.
    pub(crate) fn park_current<F>(&self, ctx: &Arc<FiberContext>, setup: F)
    where
        F: FnOnce(&mut SchedCore) -> bool,
    {
        {
            let mut core = self.core.lock();
            if ctx.take_pending_wake() {
                return;
            }
            if !setup(&mut core) {
                return;
            }
            ctx.set_state(FiberState::Waiting);
        }
        let handoff = ctx.handoff();
        handoff.yield_back();
        handoff.wait_granted();
    }

    /// Spawns a fiber of `kind` running `body` on a dedicated thread.
    pub(crate) fn spawn(
        self: &Arc<Self>,
        kind: FiberKind,
        options: SpawnOptions,
        body: Box<dyn FnOnce() + Send + 'static>,
    ) -> Result<JoinHandle, Error> {
        let props = FiberProperties::new(options.name, options.nice_level);
        let ctx = FiberContext::new(kind, props, true);
        let rt = Arc::clone(self);
        let thread_ctx = Arc::clone(&ctx);
        std::thread::Builder::new()
            .name(ctx.name())
            .spawn(move || fiber_main(rt, thread_ctx, body))?;

        {
            let mut core = self.core.lock();
            core.live_fibers += 1;
            ctx.set_state(FiberState::Ready);
            core.algo.awakened(&ctx);
            if !self.on_context_thread() {
                core.algo.notify();
            }
        }
        self.idle_cond.notify_all();
        trace!(fiber = %ctx.id(), name = %ctx.name(), "fiber spawned");

        Ok(JoinHandle {
            ctx,
            rt: Arc::clone(self),
        })
    }

    /// Grants the thread of control to `ctx` and blocks until it gives the
    /// control back. Handles terminal bookkeeping when the fiber finished.
    fn resume(&self, ctx: &Arc<FiberContext>) {
        ctx.set_state(FiberState::Running);
        let handoff = ctx.handoff();
        handoff.grant();
        handoff.wait_returned();

        if ctx.state() == FiberState::Terminated && !ctx.join_latch().is_done() {
            let mut core = self.core.lock();
            core.live_fibers -= 1;
            for waiter in ctx.join_latch().complete() {
                waiter.set_state(FiberState::Ready);
                core.algo.awakened(&waiter);
            }
            trace!(fiber = %ctx.id(), "fiber terminated");
        }
    }

    /// The dispatcher body: runs on the host thread until every fiber of
    /// this runtime has terminated.
    pub(crate) fn dispatch(self: &Arc<Self>) {
        CONTEXT_ID.with(|id| id.set(Some(self.context_id)));
        loop {
            let next = {
                let mut core = self.core.lock();
                core.wake_due_sleepers();
                if core.live_fibers == 0 {
                    break;
                }
                if !core.dispatcher.is_linked() {
                    let dispatcher = Arc::clone(&core.dispatcher);
                    core.algo.awakened(&dispatcher);
                }
                core.algo.pick_next()
            };
            match next {
                Some(ctx) if ctx.is_dispatcher() => self.idle(),
                Some(ctx) => self.resume(&ctx),
                None => self.idle(),
            }
        }
        trace!("dispatcher drained");
    }

    /// Nothing is runnable: hand the sleep decision to the scheduler, then
    /// park until a wake-up or the next sleeper deadline.
    fn idle(&self) {
        let mut core = self.core.lock();
        let deadline = core.earliest_sleeper();
        core.algo.suspend_until(deadline);

        while !core.algo.has_ready_fibers() {
            let cap = Instant::now() + self.config.idle_park_cap;
            let wake_at = deadline.map_or(cap, |d| d.min(cap));
            if self.idle_cond.wait_until(&mut core, wake_at).timed_out() {
                break;
            }
        }
    }
}

fn fiber_main(rt: Arc<RuntimeShared>, ctx: Arc<FiberContext>, body: Box<dyn FnOnce() + Send>) {
    ctx.handoff().wait_granted();

    CONTEXT_ID.with(|id| id.set(Some(rt.context_id)));
    CURRENT.with(|slot| {
        *slot.borrow_mut() = Some(CurrentFiber {
            ctx: Arc::clone(&ctx),
            rt: Arc::clone(&rt),
        });
    });

    if catch_unwind(AssertUnwindSafe(body)).is_err() {
        error!(fiber = %ctx.id(), name = %ctx.name(), "fiber body panicked");
    }

    CURRENT.with(|slot| *slot.borrow_mut() = None);
    {
        let _core = rt.core.lock();
        ctx.set_state(FiberState::Terminated);
    }
    ctx.handoff().yield_back();
}

/// Options for spawning a fiber.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    name: String,
    nice_level: usize,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            nice_level: 0,
        }
    }
}

impl SpawnOptions {
    /// Default options: name `"worker"`, nice level 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the fiber's diagnostic name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the initial nice level, clamped to the valid band.
    #[must_use]
    pub fn nice_level(mut self, nice: usize) -> Self {
        self.nice_level = nice.min(FiberProperties::MAX_NICE_LEVEL);
        self
    }
}

/// Owned handle to a spawned fiber.
pub struct JoinHandle {
    ctx: Arc<FiberContext>,
    rt: Arc<RuntimeShared>,
}

impl JoinHandle {
    /// The fiber's id.
    #[must_use]
    pub fn id(&self) -> FiberId {
        self.ctx.id()
    }

    /// Whether the fiber body has returned.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.ctx.join_latch().is_done()
    }

    /// Blocks until the fiber terminates.
    ///
    /// From a fiber of the same context this suspends cooperatively; from
    /// any other thread it blocks the OS thread.
    pub fn join(self) {
        if let Some(cur) = current() {
            if Arc::ptr_eq(&cur.rt, &self.rt) {
                while !self.ctx.join_latch().is_done() {
                    self.rt.park_current(&cur.ctx, |_core| {
                        // Completion drains the waiter list under the same
                        // core lock, so the done re-check and registration
                        // cannot straddle it.
                        if self.ctx.join_latch().is_done() {
                            return false;
                        }
                        self.ctx.join_latch().add_waiter(Arc::clone(&cur.ctx));
                        true
                    });
                }
                return;
            }
        }
        self.ctx.join_latch().wait_done();
    }
}

impl std::fmt::Debug for JoinHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.ctx.id())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Yields the current fiber back to the scheduler.
///
/// On a non-fiber thread this is a plain OS yield.
pub fn yield_now() {
    let Some(cur) = current() else {
        std::thread::yield_now();
        return;
    };
    {
        let mut core = cur.rt.core.lock();
        cur.ctx.set_state(FiberState::Ready);
        core.algo.awakened(&cur.ctx);
    }
    let handoff = cur.ctx.handoff();
    handoff.yield_back();
    handoff.wait_granted();
}

/// The calling fiber's context and runtime, for crate-internal callers that
/// need more than an id.
pub(crate) fn current_parts() -> Option<(Arc<FiberContext>, Arc<RuntimeShared>)> {
    current().map(|cur| (cur.ctx, cur.rt))
}

/// Yield used by reactor timer handlers: a no-op off fiber threads.
pub(crate) fn yield_current() {
    if CURRENT.with(|slot| slot.borrow().is_some()) {
        yield_now();
    }
}

/// Suspends the current fiber until `deadline`.
///
/// On a non-fiber thread this falls back to a thread sleep.
pub fn sleep_until(deadline: Instant) {
    let Some(cur) = current() else {
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
        return;
    };
    while Instant::now() < deadline {
        cur.rt.park_current(&cur.ctx, |core| {
            core.push_sleeper(deadline, &cur.ctx);
            true
        });
    }
}

/// Suspends the current fiber for `duration`.
pub fn sleep_for(duration: Duration) {
    sleep_until(Instant::now() + duration);
}

/// Changes the current fiber's nice level.
///
/// The running fiber is not linked in any ready queue, so the change takes
/// effect the next time it becomes ready. No-op off fiber threads.
pub fn set_nice_level(nice: usize) {
    let Some(cur) = current() else {
        return;
    };
    let mut core = cur.rt.core.lock();
    let changed = cur.ctx.props().lock().set_nice_level(nice);
    if changed {
        core.algo.property_change(&cur.ctx);
    }
}

/// The current fiber's id, if the caller is a fiber.
#[must_use]
pub fn current_id() -> Option<FiberId> {
    current().map(|cur| cur.ctx.id())
}

/// Whether the caller runs on a fiber thread.
#[must_use]
pub fn in_fiber() -> bool {
    CURRENT.with(|slot| slot.borrow().is_some())
}
