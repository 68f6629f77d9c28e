//! Cooperative cancellation for long-running context work.
//!
//! Cancellation is a protocol, not a kill: a [`Cancellable`] runs inside a
//! fiber owned by its context and must observe `cancel` at its own pace.
//! During shutdown the host fans out one cancel fiber per registration,
//! waits for all of them on a countdown latch, and only then joins the
//! workers and stops the reactor — so user work always observes its
//! cancellation before the reactor refuses new submissions.

/// Long-running work that can be asked to wind down.
///
/// `run` is the body of the worker fiber the host spawns at registration
/// time. `cancel` may be called from a different fiber; it must cause `run`
/// to return promptly, and whether the work finished cleanly is between the
/// implementation and its owner.
pub trait Cancellable: Send + Sync {
    /// Body of the owning worker fiber.
    fn run(&self);

    /// Requests that `run` return. Called once, from a cancel fiber.
    fn cancel(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct FlagWork {
        cancelled: AtomicBool,
        ran: AtomicBool,
    }

    impl Cancellable for FlagWork {
        fn run(&self) {
            self.ran.store(true, Ordering::SeqCst);
        }

        fn cancel(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn trait_object_dispatch() {
        let flags = Arc::new(FlagWork {
            cancelled: AtomicBool::new(false),
            ran: AtomicBool::new(false),
        });
        let work: Arc<dyn Cancellable> = Arc::clone(&flags) as Arc<dyn Cancellable>;
        work.run();
        work.cancel();
        assert!(flags.ran.load(Ordering::SeqCst));
        assert!(flags.cancelled.load(Ordering::SeqCst));
    }
}
