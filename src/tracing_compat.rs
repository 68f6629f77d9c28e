//! Compatibility shim over the `tracing` crate.
//!
//! All runtime logging goes through this module so the crate builds with or
//! without the `tracing` feature. With the feature enabled (default) the
//! macros are the real `tracing` macros; without it they expand to nothing.

#[cfg(feature = "tracing")]
pub use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing"))]
mod noop {
    macro_rules! trace {
        ($($arg:tt)*) => {};
    }
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }
    macro_rules! info {
        ($($arg:tt)*) => {};
    }
    macro_rules! warn_ {
        ($($arg:tt)*) => {};
    }
    macro_rules! error {
        ($($arg:tt)*) => {};
    }

    pub(crate) use {debug, error, info, trace, warn_ as warn};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use noop::{debug, error, info, trace, warn};
