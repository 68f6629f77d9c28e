//! Fiber-blocking condition variable.
//!
//! Pairs with [`FiberMutex`]: `wait` releases the guard, suspends the
//! calling fiber, and relocks before returning. Wake-ups that race the
//! suspension are latched by the runtime, so the usual
//! check-the-predicate-in-a-loop discipline is all a caller needs.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex as ParkingMutex;

use crate::fiber::FiberContext;
use crate::runtime::{current_parts, RuntimeShared};
use crate::sync::mutex::FiberMutexGuard;

/// Condition variable for fibers.
#[derive(Default)]
pub struct FiberCondVar {
    waiters: ParkingMutex<VecDeque<(Arc<FiberContext>, Arc<RuntimeShared>)>>,
}

impl FiberCondVar {
    /// Creates a condition variable with no waiters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Releases `guard`, suspends the calling fiber until notified, then
    /// relocks and returns the guard.
    ///
    /// # Panics
    ///
    /// Panics outside a fiber.
    pub fn wait<'a, T>(&self, guard: FiberMutexGuard<'a, T>) -> FiberMutexGuard<'a, T> {
        let (ctx, rt) = current_parts().expect("FiberCondVar::wait outside a fiber");
        self.waiters
            .lock()
            .push_back((Arc::clone(&ctx), Arc::clone(&rt)));

        let mutex = guard.mutex();
        drop(guard);
        rt.park_current(&ctx, |_core| true);
        mutex.lock()
    }

    /// Wakes one waiting fiber, if any.
    pub fn notify_one(&self) {
        let released = self.waiters.lock().pop_front();
        if let Some((ctx, rt)) = released {
            rt.make_ready(&ctx);
        }
    }

    /// Wakes every waiting fiber.
    pub fn notify_all(&self) {
        let released: Vec<_> = self.waiters.lock().drain(..).collect();
        for (ctx, rt) in released {
            rt.make_ready(&ctx);
        }
    }

    /// Number of fibers currently registered to be woken.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }
}

impl std::fmt::Debug for FiberCondVar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberCondVar")
            .field("waiters", &self.waiter_count())
            .finish()
    }
}
