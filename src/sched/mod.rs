//! The fiber scheduling policy.
//!
//! One [`ReactorScheduler`] instance runs per OS thread and decides which
//! fiber runs next, when the thread may sleep, and how external wake-ups
//! interleave with fiber-ready events. Worker fibers are grouped into FIFO
//! ready queues by nice level; the dispatcher context has a dedicated slot
//! past the worker band and runs only when no worker is ready.
//!
//! The scheduler owns a single reactor-hosted [`SteadyTimer`], the handle
//! through which the thread's sleep is armed (`suspend_until`) and broken
//! (`notify`). While the reactor-driving loop fiber is parked waiting for
//! workers to drain, a bounded run of worker-to-worker switches forcibly
//! resumes it so the reactor is never starved.

pub(crate) mod main_loop;

use std::sync::Arc;
use std::time::Instant;

use crate::fiber::ready_queue::ReadyQueue;
use crate::fiber::{FiberContext, FiberProperties};
use crate::reactor::{Reactor, SteadyTimer};
use crate::tracing_compat::{debug, trace};
use crate::types::FiberState;

/// Nice level reserved for the reactor-driving loop fiber.
pub const MAIN_NICE_LEVEL: usize = 0;

/// Loop fiber is blocked inside `Reactor::run_one`.
pub(crate) const LOOP_RUN_ONE: u8 = 0b01;
/// Loop fiber is parked waiting for ready fibers to drain.
pub(crate) const LOOP_SUSPEND: u8 = 0b10;

const NUM_NICE_LEVELS: usize = FiberProperties::NUM_NICE_LEVELS;
/// Queue slot index reserved for the dispatcher context.
const DISPATCHER_SLOT: usize = NUM_NICE_LEVELS;

/// The operations the fiber runtime drives a scheduling policy through.
///
/// Implementations are installed once per thread and called with the runtime
/// core lock held; they never block.
pub trait SchedAlgorithm {
    /// Links a context that became runnable. Precondition: `ctx` is not
    /// currently linked in any ready queue.
    fn awakened(&mut self, ctx: &Arc<FiberContext>);

    /// Unlinks and returns the next context to run, or `None` when idle.
    fn pick_next(&mut self) -> Option<Arc<FiberContext>>;

    /// Reshuffles a linked context after its properties changed. A context
    /// that is not linked is left alone; the change takes effect on its next
    /// `awakened`.
    fn property_change(&mut self, ctx: &Arc<FiberContext>);

    /// Whether any worker fiber is ready. The dispatcher is deliberately
    /// excluded so idleness is detected correctly.
    fn has_ready_fibers(&self) -> bool;

    /// Invoked by the dispatcher when nothing is runnable. `None` means
    /// "sleep until `notify`"; a deadline arms the suspend timer so the
    /// blocked reactor eventually returns.
    fn suspend_until(&mut self, deadline: Option<Instant>);

    /// External wake path: breaks the thread out of a blocking reactor wait
    /// before the suspend timer would fire.
    fn notify(&mut self);
}

/// Scheduling policy fused with a [`Reactor`].
pub struct ReactorScheduler {
    /// Worker queues indexed by nice level, plus the dispatcher slot.
    rqueues: [ReadyQueue; NUM_NICE_LEVELS + 1],
    /// Ready *worker* fibers, i.e. not including the dispatcher.
    ready_cnt: usize,
    /// Scan cursor: always at or below the lowest occupied worker level.
    last_nice_level: usize,
    /// Fiber switches since the loop fiber parked.
    switch_cnt: u32,
    main_switch_limit: u32,
    mask: u8,
    /// Armed to stop and wake the thread; released at scheduler teardown.
    suspend_timer: Option<SteadyTimer>,
    /// The parked loop fiber, when `LOOP_SUSPEND` is set.
    loop_waiter: Option<Arc<FiberContext>>,
    /// Times the loop fiber was forcibly resumed by the switch bound.
    main_resumes: u64,
}

impl ReactorScheduler {
    /// Creates a scheduler bound to `reactor`, owning a fresh suspend timer.
    #[must_use]
    pub fn new(reactor: &Reactor, main_switch_limit: u32) -> Self {
        Self {
            rqueues: std::array::from_fn(|_| ReadyQueue::new()),
            ready_cnt: 0,
            last_nice_level: 0,
            switch_cnt: 0,
            main_switch_limit,
            mask: 0,
            suspend_timer: Some(SteadyTimer::new(reactor)),
            loop_waiter: None,
            main_resumes: 0,
        }
    }

    /// Ready worker fibers (excludes the dispatcher).
    #[must_use]
    pub fn active_fiber_count(&self) -> usize {
        self.ready_cnt
    }

    /// Times the loop fiber was forcibly resumed by the switch bound.
    #[must_use]
    pub fn main_resumes(&self) -> u64 {
        self.main_resumes
    }

    /// `expires_at` calls on the suspend timer, `None` after teardown.
    #[must_use]
    pub fn suspend_timer_rearms(&self) -> Option<u64> {
        self.suspend_timer.as_ref().map(SteadyTimer::rearm_count)
    }

    /// Parks the loop fiber: sets `LOOP_SUSPEND`, resets the switch count
    /// and records the waiter to be re-awakened by `suspend_until` or the
    /// switch bound.
    pub(crate) fn begin_loop_wait(&mut self, ctx: Arc<FiberContext>) {
        self.mask |= LOOP_SUSPEND;
        self.switch_cnt = 0;
        ctx.set_state(FiberState::Waiting);
        self.loop_waiter = Some(ctx);
    }

    /// Clears `LOOP_SUSPEND` once the loop fiber resumes.
    pub(crate) fn end_loop_wait(&mut self) {
        self.mask &= !LOOP_SUSPEND;
    }

    pub(crate) fn enter_run_one(&mut self) {
        self.mask |= LOOP_RUN_ONE;
    }

    pub(crate) fn leave_run_one(&mut self) {
        self.mask &= !LOOP_RUN_ONE;
    }

    /// Drops the suspend timer; subsequent `notify` calls become no-ops.
    pub(crate) fn release_suspend_timer(&mut self) {
        self.suspend_timer = None;
    }

    fn wake_loop_fiber(&mut self) -> bool {
        match self.loop_waiter.take() {
            Some(loop_fiber) => {
                loop_fiber.set_state(FiberState::Ready);
                self.awakened(&loop_fiber);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn queue_live_len(&self, level: usize) -> usize {
        self.rqueues[level].live_len()
    }

    #[cfg(test)]
    pub(crate) fn worker_queue_total(&self) -> usize {
        (0..NUM_NICE_LEVELS)
            .map(|level| self.rqueues[level].live_len())
            .sum()
    }
}

impl SchedAlgorithm for ReactorScheduler {
    fn awakened(&mut self, ctx: &Arc<FiberContext>) {
        if ctx.is_dispatcher() {
            trace!(fiber = %ctx.id(), "ready link: dispatcher");
            self.rqueues[DISPATCHER_SLOT].push_back(ctx);
            return;
        }

        let nice = ctx.nice_level();
        debug_assert!(nice < NUM_NICE_LEVELS);
        trace!(fiber = %ctx.id(), nice, "ready link");
        self.rqueues[nice].push_back(ctx);
        self.ready_cnt += 1;
        if self.last_nice_level > nice {
            self.last_nice_level = nice;
        }
    }

    fn pick_next(&mut self) -> Option<Arc<FiberContext>> {
        trace!(ready = self.ready_cnt, "pick_next");

        // Scan the worker band from the cursor. The cursor advances past
        // drained levels but must not move past the level we pop from: the
        // next awakened may refill a lower level.
        while self.last_nice_level < NUM_NICE_LEVELS {
            match self.rqueues[self.last_nice_level].pop_front() {
                Some(ctx) => {
                    debug_assert!(!ctx.is_dispatcher());
                    debug_assert!(self.ready_cnt > 0);
                    self.ready_cnt -= 1;

                    if self.mask & LOOP_SUSPEND != 0 {
                        self.switch_cnt += 1;
                        if self.switch_cnt > self.main_switch_limit && self.wake_loop_fiber() {
                            // A long worker-to-worker run would starve the
                            // reactor; bring the loop fiber back even though
                            // workers remain ready.
                            self.main_resumes += 1;
                            debug!(
                                switches = self.switch_cnt,
                                "switch bound hit, resuming io loop"
                            );
                        }
                    }

                    trace!(fiber = %ctx.id(), "pick_next: worker");
                    return Some(ctx);
                }
                None => self.last_nice_level += 1,
            }
        }

        debug_assert_eq!(self.ready_cnt, 0);

        if let Some(ctx) = self.rqueues[DISPATCHER_SLOT].pop_front() {
            trace!(mask = self.mask, "pick_next: dispatcher");
            return Some(ctx);
        }

        trace!("pick_next: idle");
        None
    }

    fn property_change(&mut self, ctx: &Arc<FiberContext>) {
        // The context might not be linked at all when the caller is changing
        // the nice level of the running fiber; the change then takes effect
        // on its next awakened.
        if !ctx.is_linked() {
            return;
        }

        ctx.unlink();
        if !ctx.is_dispatcher() {
            debug_assert!(self.ready_cnt > 0);
            self.ready_cnt -= 1;
        }
        self.awakened(ctx);
    }

    fn has_ready_fibers(&self) -> bool {
        self.ready_cnt > 0
    }

    fn suspend_until(&mut self, deadline: Option<Instant>) {
        trace!(?deadline, "suspend_until");

        if let (Some(deadline), Some(timer)) = (deadline, self.suspend_timer.as_ref()) {
            // Re-arming at an unchanged expiry would bounce the loop between
            // an aborted wait and an identical re-arm; only touch the timer
            // when the deadline actually moves.
            if timer.expiry() != Some(deadline) {
                timer.expires_at(deadline);
                timer.async_wait(|_| crate::runtime::yield_current());
            }
        }

        assert_eq!(
            self.mask & LOOP_RUN_ONE,
            0,
            "deadlock detected: suspend requested while the reactor is blocked in run_one"
        );

        self.wake_loop_fiber();
    }

    fn notify(&mut self) {
        let Some(timer) = self.suspend_timer.as_ref() else {
            debug!("wake requested during shutdown phase");
            return;
        };

        // Reset the expiry to now instead of cancelling: a plain cancel
        // would leave the stored expiry in place and a later suspend at the
        // same deadline would be suppressed. This ticks the loop twice, once
        // for the aborted wait and once for the immediate expiry; both
        // handlers just yield.
        timer.expires_at(Instant::now());
        timer.async_wait(|_| crate::runtime::yield_current());
    }
}
