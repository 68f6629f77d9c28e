//! Countdown latch for N-way completion signalling.
//!
//! The counter trips when it reaches zero. Waiters arriving on a fiber
//! thread suspend cooperatively; waiters on foreign threads block on a
//! condvar. Decrements may come from either world, which is what the host
//! needs: startup is signalled from a reactor handler to the caller's
//! thread, shutdown from cancel fibers to the thread running `stop`.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::fiber::FiberContext;
use crate::runtime::{current_parts, RuntimeShared};

struct CounterState {
    count: usize,
    fiber_waiters: VecDeque<(Arc<FiberContext>, Arc<RuntimeShared>)>,
}

struct CounterInner {
    state: Mutex<CounterState>,
    cond: Condvar,
}

/// Countdown latch; clones share the count.
#[derive(Clone)]
pub struct BlockingCounter {
    inner: Arc<CounterInner>,
}

impl BlockingCounter {
    /// Creates a counter that trips after `count` decrements.
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            inner: Arc::new(CounterInner {
                state: Mutex::new(CounterState {
                    count,
                    fiber_waiters: VecDeque::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// The current count.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.state.lock().count
    }

    /// Decrements the counter, releasing all waiters when it reaches zero.
    ///
    /// # Panics
    ///
    /// Panics on a decrement below zero; that is a bookkeeping bug.
    pub fn dec(&self) {
        let released = {
            let mut state = self.inner.state.lock();
            assert!(state.count > 0, "blocking counter decremented below zero");
            state.count -= 1;
            if state.count == 0 {
                std::mem::take(&mut state.fiber_waiters)
            } else {
                VecDeque::new()
            }
        };
        self.inner.cond.notify_all();
        for (ctx, rt) in released {
            rt.make_ready(&ctx);
        }
    }

    /// Blocks until the counter reaches zero.
    pub fn wait(&self) {
        loop {
            let fiber = {
                let mut state = self.inner.state.lock();
                if state.count == 0 {
                    return;
                }
                match current_parts() {
                    Some((ctx, rt)) => {
                        state
                            .fiber_waiters
                            .push_back((Arc::clone(&ctx), Arc::clone(&rt)));
                        Some((ctx, rt))
                    }
                    None => {
                        while state.count > 0 {
                            self.inner.cond.wait(&mut state);
                        }
                        return;
                    }
                }
            };
            if let Some((ctx, rt)) = fiber {
                rt.park_current(&ctx, |_core| true);
            }
        }
    }
}

impl std::fmt::Debug for BlockingCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingCounter")
            .field("count", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn wait_returns_immediately_at_zero() {
        let counter = BlockingCounter::new(0);
        counter.wait();
    }

    #[test]
    fn thread_waiter_released_on_last_dec() {
        let counter = BlockingCounter::new(2);
        let remote = counter.clone();
        let waiter = std::thread::spawn(move || remote.wait());
        std::thread::sleep(Duration::from_millis(10));
        counter.dec();
        assert_eq!(counter.count(), 1);
        counter.dec();
        waiter.join().unwrap();
        assert_eq!(counter.count(), 0);
    }

    #[test]
    #[should_panic(expected = "below zero")]
    fn extra_dec_is_a_bug() {
        let counter = BlockingCounter::new(1);
        counter.dec();
        counter.dec();
    }
}
