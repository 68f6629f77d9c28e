//! Error types and error handling strategy.
//!
//! Scheduler state is never signalled through errors: contract violations
//! (double-linking a context, suspending outside the dispatcher, requesting
//! a sleep while the reactor is blocked) are bugs and abort via assertions.
//! The error type below covers the recoverable host surface only: lifecycle
//! misuse and fiber spawn failures.

use core::fmt;

/// Error returned by the host context API.
#[derive(Debug)]
pub enum Error {
    /// The context thread has not been started yet.
    NotStarted,
    /// The context thread is already running.
    AlreadyStarted,
    /// The OS refused to create a fiber thread.
    Spawn(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "io context not started"),
            Self::AlreadyStarted => write!(f, "io context already started"),
            Self::Spawn(err) => write!(f, "failed to spawn fiber thread: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Spawn(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_covers_variants() {
        assert_eq!(Error::NotStarted.to_string(), "io context not started");
        assert_eq!(Error::AlreadyStarted.to_string(), "io context already started");
        let spawn = Error::Spawn(std::io::Error::other("no threads"));
        assert!(spawn.to_string().contains("no threads"));
    }

    #[test]
    fn spawn_error_exposes_source() {
        use std::error::Error as _;
        let err = Error::Spawn(std::io::Error::other("boom"));
        assert!(err.source().is_some());
        assert!(Error::NotStarted.source().is_none());
    }
}
