//! Blocking primitives usable from fibers.
//!
//! [`FiberMutex`] and [`FiberCondVar`] suspend the calling fiber instead of
//! the OS thread. [`BlockingCounter`] is the bridge between worlds: fibers
//! suspend on it, foreign threads block on it, and either side can count it
//! down.

pub mod barrier;
pub mod condvar;
pub mod mutex;

pub use barrier::BlockingCounter;
pub use condvar::FiberCondVar;
pub use mutex::{FiberMutex, FiberMutexGuard};
