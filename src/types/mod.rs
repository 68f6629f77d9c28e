//! Core identifier and state types shared across the runtime.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a fiber within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

impl FiberId {
    /// Allocates the next process-unique fiber id.
    pub(crate) fn next() -> Self {
        Self(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw id value.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber-{}", self.0)
    }
}

/// The role a context plays in the scheduler.
///
/// The dispatcher is the runtime-owned context that parks the thread when
/// nothing is runnable; it is scheduled through its own queue slot and never
/// counted as a ready worker. The reactor-driving loop fiber is an ordinary
/// worker pinned at the highest priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberKind {
    /// The fiber that drives the reactor (`"io_loop"`).
    Main,
    /// The runtime context that suspends the thread when idle.
    Dispatcher,
    /// A user fiber.
    Worker,
}

/// Run state of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Linked in a ready queue, waiting to be picked.
    Ready,
    /// Currently executing.
    Running,
    /// Suspended on a wait primitive, a sleep, or the reactor.
    Waiting,
    /// Body finished; the context will not run again.
    Terminated,
}
