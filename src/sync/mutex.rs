//! Fiber-blocking mutex.
//!
//! Contended lockers suspend their fiber instead of the OS thread. There is
//! no baton handoff: a released waiter re-contends, which keeps the unlock
//! path cheap and is fair enough for the short critical sections this
//! runtime has.

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex as ParkingMutex;

use crate::fiber::FiberContext;
use crate::runtime::{current_parts, RuntimeShared};

struct MutexState {
    locked: bool,
    waiters: VecDeque<(Arc<FiberContext>, Arc<RuntimeShared>)>,
}

/// Mutual exclusion for fibers.
pub struct FiberMutex<T> {
    data: UnsafeCell<T>,
    state: ParkingMutex<MutexState>,
}

// Safety: access to `data` is serialized by the lock protocol below.
unsafe impl<T: Send> Send for FiberMutex<T> {}
unsafe impl<T: Send> Sync for FiberMutex<T> {}

impl<T> FiberMutex<T> {
    /// Creates an unlocked mutex holding `value`.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            data: UnsafeCell::new(value),
            state: ParkingMutex::new(MutexState {
                locked: false,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Locks the mutex, suspending the calling fiber while contended.
    ///
    /// # Panics
    ///
    /// Panics when contended on a non-fiber thread; foreign threads have no
    /// way to suspend cooperatively.
    pub fn lock(&self) -> FiberMutexGuard<'_, T> {
        loop {
            let fiber = {
                let mut state = self.state.lock();
                if !state.locked {
                    state.locked = true;
                    return FiberMutexGuard { mutex: self };
                }
                let (ctx, rt) = current_parts()
                    .expect("FiberMutex contended outside a fiber");
                state
                    .waiters
                    .push_back((Arc::clone(&ctx), Arc::clone(&rt)));
                (ctx, rt)
            };
            let (ctx, rt) = fiber;
            rt.park_current(&ctx, |_core| true);
        }
    }

    /// Attempts to lock without suspending.
    #[must_use]
    pub fn try_lock(&self) -> Option<FiberMutexGuard<'_, T>> {
        let mut state = self.state.lock();
        if state.locked {
            return None;
        }
        state.locked = true;
        Some(FiberMutexGuard { mutex: self })
    }

    /// Consumes the mutex, returning the inner value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    fn unlock(&self) {
        let released = {
            let mut state = self.state.lock();
            state.locked = false;
            state.waiters.pop_front()
        };
        if let Some((ctx, rt)) = released {
            rt.make_ready(&ctx);
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for FiberMutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("FiberMutex").field("data", &*guard).finish(),
            None => f.debug_struct("FiberMutex").field("data", &"<locked>").finish(),
        }
    }
}

/// RAII guard; unlocks on drop.
pub struct FiberMutexGuard<'a, T> {
    mutex: &'a FiberMutex<T>,
}

impl<'a, T> FiberMutexGuard<'a, T> {
    /// The mutex this guard locks, used by condition variables to relock
    /// after a wait.
    pub(crate) fn mutex(&self) -> &'a FiberMutex<T> {
        self.mutex
    }
}

impl<T> Deref for FiberMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves exclusive ownership of the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for FiberMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves exclusive ownership of the lock.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for FiberMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
