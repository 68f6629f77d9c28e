//! Fiber contexts and their scheduler-visible metadata.
//!
//! A [`FiberContext`] is the scheduler's handle to one stackful fiber: its
//! identity, kind, run state, mutable properties, and the intrusive link
//! bookkeeping used by the ready queues. The scheduler never owns a context;
//! it only links and unlinks it while the fiber is ready.
//!
//! Execution is backed by a dedicated OS thread per fiber, gated by a
//! [`Handoff`] latch so that exactly one side — the dispatcher or one fiber —
//! runs at any instant. The latch is the stack; the context is the metadata.

pub(crate) mod ready_queue;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::types::{FiberId, FiberKind, FiberState};

/// Mutable per-fiber metadata: a name for diagnostics and a nice level that
/// selects the ready queue the fiber is linked into.
///
/// Lower nice value means higher priority. Level 0 is reserved by convention
/// for the reactor-driving loop fiber.
#[derive(Debug, Clone)]
pub struct FiberProperties {
    name: String,
    nice: usize,
}

impl FiberProperties {
    /// Number of worker priority classes.
    pub const NUM_NICE_LEVELS: usize = 4;
    /// Highest (least urgent) worker nice level.
    pub const MAX_NICE_LEVEL: usize = Self::NUM_NICE_LEVELS - 1;

    /// Creates properties with `nice` clamped to the valid band.
    #[must_use]
    pub fn new(name: impl Into<String>, nice: usize) -> Self {
        Self {
            name: name.into(),
            nice: nice.min(Self::MAX_NICE_LEVEL),
        }
    }

    /// The fiber's diagnostic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current nice level.
    #[must_use]
    pub fn nice_level(&self) -> usize {
        self.nice
    }

    /// Stores a new nice level, clamped to [`Self::MAX_NICE_LEVEL`].
    ///
    /// Returns `true` if the level actually changed; the caller is then
    /// responsible for reshuffling the ready queues via the scheduler's
    /// property-change hook. Reshuffling on a no-op change would be wasted
    /// work, which is why the setter reports it.
    pub fn set_nice_level(&mut self, nice: usize) -> bool {
        let nice = nice.min(Self::MAX_NICE_LEVEL);
        if nice == self.nice {
            return false;
        }
        self.nice = nice;
        true
    }
}

/// Intrusive-link bookkeeping for the ready queues.
///
/// `linked` says whether the context is currently in some queue. `token`
/// increments on every unlink, so queue entries stamped with an older token
/// are recognized as stale and skipped by the queue pop. This gives O(1)
/// unlink without a doubly-linked list.
#[derive(Debug)]
struct ReadyLink {
    linked: AtomicBool,
    token: AtomicU64,
}

/// Scheduler handle to one fiber.
pub struct FiberContext {
    id: FiberId,
    kind: FiberKind,
    props: Mutex<FiberProperties>,
    state: Mutex<FiberState>,
    pending_wake: AtomicBool,
    link: ReadyLink,
    handoff: Option<Handoff>,
    join: JoinLatch,
}

impl FiberContext {
    /// Creates a context. `threaded` selects whether the context owns a
    /// handoff latch (everything except the dispatcher, which runs on the
    /// host thread's own frame).
    pub(crate) fn new(kind: FiberKind, props: FiberProperties, threaded: bool) -> Arc<Self> {
        Arc::new(Self {
            id: FiberId::next(),
            kind,
            props: Mutex::new(props),
            state: Mutex::new(FiberState::Waiting),
            pending_wake: AtomicBool::new(false),
            link: ReadyLink {
                linked: AtomicBool::new(false),
                token: AtomicU64::new(0),
            },
            handoff: threaded.then(Handoff::new),
            join: JoinLatch::new(),
        })
    }

    /// The fiber's unique id.
    #[must_use]
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// The fiber's kind.
    #[must_use]
    pub fn kind(&self) -> FiberKind {
        self.kind
    }

    /// True for the dispatcher context.
    #[must_use]
    pub fn is_dispatcher(&self) -> bool {
        self.kind == FiberKind::Dispatcher
    }

    /// The fiber's diagnostic name.
    #[must_use]
    pub fn name(&self) -> String {
        self.props.lock().name().to_string()
    }

    /// The fiber's current nice level.
    #[must_use]
    pub fn nice_level(&self) -> usize {
        self.props.lock().nice_level()
    }

    /// The fiber's current run state.
    #[must_use]
    pub fn state(&self) -> FiberState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: FiberState) {
        *self.state.lock() = state;
    }

    pub(crate) fn props(&self) -> &Mutex<FiberProperties> {
        &self.props
    }

    pub(crate) fn handoff(&self) -> &Handoff {
        self.handoff
            .as_ref()
            .expect("dispatcher context has no handoff latch")
    }

    pub(crate) fn join_latch(&self) -> &JoinLatch {
        &self.join
    }

    /// Marks the context linked and returns the token to stamp the queue
    /// entry with.
    ///
    /// # Panics
    ///
    /// Panics if the context is already linked: a context appears in at most
    /// one ready queue at a time.
    pub(crate) fn link(&self) -> u64 {
        let was_linked = self.link.linked.swap(true, Ordering::SeqCst);
        assert!(!was_linked, "{} linked twice", self.id);
        self.link.token.load(Ordering::SeqCst)
    }

    /// Unlinks the context, invalidating every queue entry stamped with the
    /// previous token.
    pub(crate) fn unlink(&self) {
        self.link.token.fetch_add(1, Ordering::SeqCst);
        self.link.linked.store(false, Ordering::SeqCst);
    }

    /// Whether the context is currently linked in a ready queue.
    pub(crate) fn is_linked(&self) -> bool {
        self.link.linked.load(Ordering::SeqCst)
    }

    /// Whether a queue entry stamped with `token` still refers to the
    /// current linkage.
    pub(crate) fn link_matches(&self, token: u64) -> bool {
        self.link.linked.load(Ordering::SeqCst) && self.link.token.load(Ordering::SeqCst) == token
    }

    /// Records a wake-up that arrived before the fiber finished parking.
    pub(crate) fn set_pending_wake(&self) {
        self.pending_wake.store(true, Ordering::SeqCst);
    }

    /// Consumes a pending wake-up, if one was recorded.
    pub(crate) fn take_pending_wake(&self) -> bool {
        self.pending_wake.swap(false, Ordering::SeqCst)
    }
}

impl std::fmt::Debug for FiberContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberContext")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("linked", &self.is_linked())
            .finish_non_exhaustive()
    }
}

/// Which side of a handoff latch currently holds the thread of control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Dispatcher,
    Fiber,
}

/// Two-party baton between the dispatcher and one fiber thread.
///
/// The latch starts on the dispatcher side; the fiber thread blocks in
/// [`wait_granted`](Self::wait_granted) until the dispatcher grants control.
/// There is no third state: a grant while the fiber side already holds the
/// baton is a scheduler bug.
#[derive(Debug)]
pub(crate) struct Handoff {
    side: Mutex<Side>,
    cond: Condvar,
}

impl Handoff {
    fn new() -> Self {
        Self {
            side: Mutex::new(Side::Dispatcher),
            cond: Condvar::new(),
        }
    }

    /// Dispatcher side: hand control to the fiber.
    pub(crate) fn grant(&self) {
        let mut side = self.side.lock();
        debug_assert_eq!(*side, Side::Dispatcher, "granted while fiber running");
        *side = Side::Fiber;
        drop(side);
        self.cond.notify_all();
    }

    /// Dispatcher side: block until the fiber gives control back.
    pub(crate) fn wait_returned(&self) {
        let mut side = self.side.lock();
        while *side == Side::Fiber {
            self.cond.wait(&mut side);
        }
    }

    /// Fiber side: give control back to the dispatcher.
    pub(crate) fn yield_back(&self) {
        let mut side = self.side.lock();
        debug_assert_eq!(*side, Side::Fiber, "yield from a parked fiber");
        *side = Side::Dispatcher;
        drop(side);
        self.cond.notify_all();
    }

    /// Fiber side: block until the dispatcher grants control.
    pub(crate) fn wait_granted(&self) {
        let mut side = self.side.lock();
        while *side == Side::Dispatcher {
            self.cond.wait(&mut side);
        }
    }
}

/// Completion latch for joiners.
///
/// Fiber joiners register a context to be re-awakened; foreign threads block
/// on the condvar. Both paths observe the same `done` flag, flipped exactly
/// once when the fiber body returns.
#[derive(Debug)]
pub(crate) struct JoinLatch {
    done: Mutex<bool>,
    cond: Condvar,
    waiters: Mutex<Vec<Arc<FiberContext>>>,
}

impl JoinLatch {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
            waiters: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        *self.done.lock()
    }

    /// Registers a fiber to be woken on completion. Caller must hold the
    /// scheduler core lock so registration cannot race completion.
    pub(crate) fn add_waiter(&self, ctx: Arc<FiberContext>) {
        self.waiters.lock().push(ctx);
    }

    /// Flips the done flag and returns the fibers to re-awaken. Caller must
    /// hold the scheduler core lock.
    pub(crate) fn complete(&self) -> Vec<Arc<FiberContext>> {
        *self.done.lock() = true;
        self.cond.notify_all();
        std::mem::take(&mut *self.waiters.lock())
    }

    /// Blocks the calling OS thread until completion.
    pub(crate) fn wait_done(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_clamp_nice_level() {
        let props = FiberProperties::new("clamped", 99);
        assert_eq!(props.nice_level(), FiberProperties::MAX_NICE_LEVEL);
    }

    #[test]
    fn set_nice_level_reports_change() {
        let mut props = FiberProperties::new("w", 1);
        assert!(!props.set_nice_level(1));
        assert!(props.set_nice_level(2));
        assert_eq!(props.nice_level(), 2);
        assert!(props.set_nice_level(usize::MAX));
        assert_eq!(props.nice_level(), FiberProperties::MAX_NICE_LEVEL);
        // Clamped to the same stored value: no change.
        assert!(!props.set_nice_level(usize::MAX));
    }

    #[test]
    fn link_tokens_invalidate_on_unlink() {
        let ctx = FiberContext::new(FiberKind::Worker, FiberProperties::new("w", 1), false);
        let token = ctx.link();
        assert!(ctx.is_linked());
        assert!(ctx.link_matches(token));
        ctx.unlink();
        assert!(!ctx.link_matches(token));
        // Relink hands out a fresh token; the old one stays stale.
        let token2 = ctx.link();
        assert_ne!(token, token2);
        assert!(ctx.link_matches(token2));
        assert!(!ctx.link_matches(token));
    }

    #[test]
    #[should_panic(expected = "linked twice")]
    fn double_link_is_a_contract_violation() {
        let ctx = FiberContext::new(FiberKind::Worker, FiberProperties::new("w", 0), false);
        ctx.link();
        ctx.link();
    }

    #[test]
    fn pending_wake_is_consumed_once() {
        let ctx = FiberContext::new(FiberKind::Worker, FiberProperties::new("w", 0), false);
        assert!(!ctx.take_pending_wake());
        ctx.set_pending_wake();
        assert!(ctx.take_pending_wake());
        assert!(!ctx.take_pending_wake());
    }

    #[test]
    fn handoff_round_trip_across_threads() {
        let ctx = FiberContext::new(FiberKind::Worker, FiberProperties::new("w", 0), true);
        let peer = Arc::clone(&ctx);
        let t = std::thread::spawn(move || {
            peer.handoff().wait_granted();
            peer.handoff().yield_back();
        });
        ctx.handoff().grant();
        ctx.handoff().wait_returned();
        t.join().unwrap();
    }
}
