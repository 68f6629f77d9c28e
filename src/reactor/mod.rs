//! Handler-queue reactor.
//!
//! The reactor owns everything the scheduler blocks on: a thread-safe queue
//! of posted handlers and a table of steady-clock timers. `run_one` is the
//! only operation that blocks the calling thread; it returns after
//! dispatching a single handler, or with 0 once the reactor is stopped.
//!
//! Real descriptor sources (sockets, pipes) plug in behind `post`: a
//! completion posts a handler that resumes the waiting fiber. The scheduler
//! itself only needs the operations below plus [`SteadyTimer`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::tracing_compat::trace;

type Handler = Box<dyn FnOnce() + Send + 'static>;
type TimerHandler = Box<dyn FnOnce(TimerStatus) + Send + 'static>;

/// How a timer wait completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerStatus {
    /// The deadline was reached.
    Fired,
    /// The wait was cancelled by a re-arm or by dropping the timer.
    Aborted,
}

struct TimerSlot {
    expiry: Option<Instant>,
    waiter: Option<TimerHandler>,
    rearms: u64,
}

struct ReactorState {
    handlers: VecDeque<Handler>,
    timers: Vec<Option<TimerSlot>>,
    stopped: bool,
}

impl ReactorState {
    /// Removes one dispatchable item: posted handlers first, then due timers.
    fn take_due(&mut self, now: Instant) -> Option<Handler> {
        if let Some(handler) = self.handlers.pop_front() {
            return Some(handler);
        }
        for slot in self.timers.iter_mut().flatten() {
            if slot.waiter.is_some() && slot.expiry.is_some_and(|expiry| expiry <= now) {
                let waiter = slot.waiter.take().expect("checked above");
                return Some(Box::new(move || waiter(TimerStatus::Fired)));
            }
        }
        None
    }

    /// Earliest expiry among timers with a registered waiter.
    fn earliest_armed_expiry(&self) -> Option<Instant> {
        self.timers
            .iter()
            .flatten()
            .filter(|slot| slot.waiter.is_some())
            .filter_map(|slot| slot.expiry)
            .min()
    }
}

struct ReactorShared {
    state: Mutex<ReactorState>,
    cond: Condvar,
}

/// Single-threaded event demultiplexer with a thread-safe submission side.
///
/// Cloning is cheap and shares the underlying queue.
#[derive(Clone)]
pub struct Reactor {
    shared: Arc<ReactorShared>,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    /// Creates an empty, running reactor.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ReactorShared {
                state: Mutex::new(ReactorState {
                    handlers: VecDeque::new(),
                    timers: Vec::new(),
                    stopped: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Enqueues `handler` to run on the reactor thread. Thread-safe; this is
    /// the only way foreign threads submit work to a scheduler instance.
    pub fn post<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        state.handlers.push_back(Box::new(handler));
        drop(state);
        self.shared.cond.notify_all();
    }

    /// Dispatches every due handler without blocking.
    ///
    /// Returns the number of handlers dispatched; 0 while stopped.
    pub fn poll(&self) -> usize {
        let mut dispatched = 0;
        loop {
            let handler = {
                let mut state = self.shared.state.lock();
                if state.stopped {
                    None
                } else {
                    state.take_due(Instant::now())
                }
            };
            match handler {
                Some(handler) => {
                    handler();
                    dispatched += 1;
                }
                None => return dispatched,
            }
        }
    }

    /// Blocks the calling thread until one handler is dispatched or the
    /// reactor stops.
    ///
    /// Returns 1 after dispatching a handler, 0 once stopped.
    pub fn run_one(&self) -> usize {
        let handler = {
            let mut state = self.shared.state.lock();
            loop {
                if state.stopped {
                    return 0;
                }
                if let Some(handler) = state.take_due(Instant::now()) {
                    break handler;
                }
                match state.earliest_armed_expiry() {
                    Some(expiry) => {
                        self.shared.cond.wait_until(&mut state, expiry);
                    }
                    None => self.shared.cond.wait(&mut state),
                }
            }
        };
        handler();
        1
    }

    /// Stops the reactor: pending and future `run_one`/`poll` calls return 0
    /// until [`restart`](Self::restart).
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        state.stopped = true;
        drop(state);
        self.shared.cond.notify_all();
        trace!("reactor stopped");
    }

    /// Clears the stopped flag so queued handlers become dispatchable again.
    pub fn restart(&self) {
        let mut state = self.shared.state.lock();
        state.stopped = false;
    }

    /// Returns whether the reactor is stopped.
    #[must_use]
    pub fn stopped(&self) -> bool {
        self.shared.state.lock().stopped
    }

    /// Number of handlers currently queued. Diagnostic only.
    #[must_use]
    pub fn queued_handlers(&self) -> usize {
        self.shared.state.lock().handlers.len()
    }

    fn alloc_timer(&self) -> usize {
        let mut state = self.shared.state.lock();
        if let Some(key) = state.timers.iter().position(Option::is_none) {
            state.timers[key] = Some(TimerSlot {
                expiry: None,
                waiter: None,
                rearms: 0,
            });
            return key;
        }
        state.timers.push(Some(TimerSlot {
            expiry: None,
            waiter: None,
            rearms: 0,
        }));
        state.timers.len() - 1
    }
}

/// Steady-clock one-shot timer hosted by a [`Reactor`].
///
/// `expires_at` stores the expiry and cancels any pending wait (its handler
/// is dispatched with [`TimerStatus::Aborted`]); `async_wait` registers a
/// handler against the stored expiry. At most one wait is pending at a time.
pub struct SteadyTimer {
    shared: Arc<ReactorShared>,
    key: usize,
}

impl SteadyTimer {
    /// Creates a timer with no expiry and no pending wait.
    #[must_use]
    pub fn new(reactor: &Reactor) -> Self {
        let key = reactor.alloc_timer();
        Self {
            shared: Arc::clone(&reactor.shared),
            key,
        }
    }

    fn slot<'a>(state: &'a mut ReactorState, key: usize) -> &'a mut TimerSlot {
        state.timers[key].as_mut().expect("timer slot freed")
    }

    /// Sets the expiry, cancelling a pending wait if there is one.
    ///
    /// Returns the number of waits cancelled (0 or 1). The cancelled handler
    /// is dispatched with [`TimerStatus::Aborted`] on the reactor thread.
    pub fn expires_at(&self, deadline: Instant) -> usize {
        let cancelled = {
            let mut state = self.shared.state.lock();
            let slot = Self::slot(&mut state, self.key);
            slot.rearms += 1;
            slot.expiry = Some(deadline);
            let cancelled = slot.waiter.take();
            if let Some(waiter) = cancelled {
                state
                    .handlers
                    .push_back(Box::new(move || waiter(TimerStatus::Aborted)));
                1
            } else {
                0
            }
        };
        self.shared.cond.notify_all();
        cancelled
    }

    /// Registers `handler` to run when the stored expiry is reached.
    ///
    /// Replaces a previously registered handler, which is dispatched with
    /// [`TimerStatus::Aborted`].
    pub fn async_wait<F>(&self, handler: F)
    where
        F: FnOnce(TimerStatus) + Send + 'static,
    {
        {
            let mut state = self.shared.state.lock();
            let slot = Self::slot(&mut state, self.key);
            if let Some(previous) = slot.waiter.replace(Box::new(handler)) {
                state
                    .handlers
                    .push_back(Box::new(move || previous(TimerStatus::Aborted)));
            }
        }
        self.shared.cond.notify_all();
    }

    /// The currently stored expiry, if any.
    #[must_use]
    pub fn expiry(&self) -> Option<Instant> {
        let mut state = self.shared.state.lock();
        Self::slot(&mut state, self.key).expiry
    }

    /// Number of `expires_at` calls since construction. Diagnostic only.
    #[must_use]
    pub fn rearm_count(&self) -> u64 {
        let mut state = self.shared.state.lock();
        Self::slot(&mut state, self.key).rearms
    }
}

impl Drop for SteadyTimer {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if let Some(slot) = state.timers[self.key].take() {
            if let Some(waiter) = slot.waiter {
                state
                    .handlers
                    .push_back(Box::new(move || waiter(TimerStatus::Aborted)));
            }
        }
        drop(state);
        self.shared.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn poll_dispatches_in_post_order() {
        let reactor = Reactor::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            reactor.post(move || order.lock().push(i));
        }
        assert_eq!(reactor.poll(), 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(reactor.poll(), 0);
    }

    #[test]
    fn run_one_dispatches_exactly_one() {
        let reactor = Reactor::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let hits = Arc::clone(&hits);
            reactor.post(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(reactor.run_one(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_one_blocks_until_cross_thread_post() {
        let reactor = Reactor::new();
        let remote = reactor.clone();
        let poster = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.post(|| {});
        });
        assert_eq!(reactor.run_one(), 1);
        poster.join().unwrap();
    }

    #[test]
    fn stop_wakes_blocked_run_one() {
        let reactor = Reactor::new();
        let remote = reactor.clone();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.stop();
        });
        assert_eq!(reactor.run_one(), 0);
        assert!(reactor.stopped());
        stopper.join().unwrap();
    }

    #[test]
    fn poll_is_inert_while_stopped_until_restart() {
        let reactor = Reactor::new();
        reactor.post(|| {});
        reactor.stop();
        assert_eq!(reactor.poll(), 0);
        reactor.restart();
        assert_eq!(reactor.poll(), 1);
    }

    #[test]
    fn timer_fires_at_deadline() {
        let reactor = Reactor::new();
        let timer = SteadyTimer::new(&reactor);
        let status = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&status);
        timer.expires_at(Instant::now() + Duration::from_millis(15));
        timer.async_wait(move |s| *seen.lock() = Some(s));
        assert_eq!(reactor.run_one(), 1);
        assert_eq!(*status.lock(), Some(TimerStatus::Fired));
    }

    #[test]
    fn rearm_cancels_pending_wait() {
        let reactor = Reactor::new();
        let timer = SteadyTimer::new(&reactor);
        let statuses = Arc::new(Mutex::new(Vec::new()));

        timer.expires_at(Instant::now() + Duration::from_secs(60));
        let seen = Arc::clone(&statuses);
        timer.async_wait(move |s| seen.lock().push(s));

        // Re-arming far in the future cancels the pending wait immediately.
        let cancelled = timer.expires_at(Instant::now() + Duration::from_secs(60));
        assert_eq!(cancelled, 1);
        assert_eq!(timer.rearm_count(), 2);

        assert_eq!(reactor.run_one(), 1);
        assert_eq!(*statuses.lock(), vec![TimerStatus::Aborted]);
    }

    #[test]
    fn expiry_reflects_last_rearm() {
        let reactor = Reactor::new();
        let timer = SteadyTimer::new(&reactor);
        assert_eq!(timer.expiry(), None);
        let deadline = Instant::now() + Duration::from_secs(5);
        timer.expires_at(deadline);
        assert_eq!(timer.expiry(), Some(deadline));
    }

    #[test]
    fn dropping_timer_aborts_pending_wait() {
        let reactor = Reactor::new();
        let status = Arc::new(Mutex::new(None));
        {
            let timer = SteadyTimer::new(&reactor);
            timer.expires_at(Instant::now() + Duration::from_secs(60));
            let seen = Arc::clone(&status);
            timer.async_wait(move |s| *seen.lock() = Some(s));
        }
        assert_eq!(reactor.poll(), 1);
        assert_eq!(*status.lock(), Some(TimerStatus::Aborted));
    }
}
