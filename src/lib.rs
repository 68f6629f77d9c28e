//! Cooperative fiber scheduler fused with a single-threaded I/O reactor.
//!
//! Each [`IoContext`] owns one OS thread. User logic runs as stackful
//! fibers multiplexed over the thread's reactor: while worker fibers are
//! runnable the reactor is drained without blocking, and once nothing is
//! runnable the whole thread sleeps inside the reactor until an I/O
//! completion, a timer, or an external wake-up arrives. A small nice band
//! orders workers strictly by priority, FIFO within a level, with the
//! reactor-driving loop fiber pinned at the highest priority and a bounded
//! switch count that keeps worker-only loops from starving the reactor.
//!
//! Parallelism is obtained by running one context per thread; instances
//! share no scheduler state, and cross-thread submission goes through the
//! reactor's thread-safe post path.
//!
//! # Example
//!
//! ```
//! use fiberloop::sync::BlockingCounter;
//! use fiberloop::{IoContext, SchedulerConfig, SpawnOptions};
//!
//! let context = IoContext::new(SchedulerConfig::default());
//! context.run().unwrap();
//!
//! let done = BlockingCounter::new(1);
//! let signal = done.clone();
//! context
//!     .spawn_fiber(SpawnOptions::new().name("greeter").nice_level(1), move || {
//!         fiberloop::yield_now();
//!         signal.dec();
//!     })
//!     .unwrap();
//!
//! done.wait();
//! context.stop();
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod fiber;
pub mod io_context;
pub mod reactor;
pub mod runtime;
pub mod sched;
pub mod sync;
pub mod tracing_compat;
pub mod types;

pub use cancel::Cancellable;
pub use config::{ConfigError, SchedulerConfig};
pub use error::Error;
pub use io_context::{IoContext, SchedulerStats};
pub use runtime::{
    current_id, in_fiber, set_nice_level, sleep_for, sleep_until, yield_now, JoinHandle,
    SpawnOptions,
};
pub use types::{FiberId, FiberKind, FiberState};
