use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Embertree errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Invalid parameters, typically caught at construction time (fanout out
    /// of range, prefix too long, key shorter than the routing span).
    Invalid(String),
    /// An invariant that should be unreachable was violated at runtime, e.g.
    /// a node id that must exist was not found.
    Bug(String),
    /// The block allocator reports that the media is full.
    NoSpace,
    /// The operation observed a cancellation request and aborted. Canceled
    /// jobs are expected during shutdown and are not reported as failures.
    Shutdown,
    /// On-media or in-memory structure corruption: spill ordering violated,
    /// dgen ordering broken, journal record damaged.
    Corrupt(String),
    /// A journal or I/O failure during commit. These are reported through the
    /// health channel but do not tear down the tree.
    Transient(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Invalid(msg) => write!(f, "invalid argument: {msg}"),
            Error::Bug(msg) => write!(f, "internal invariant violated: {msg}"),
            Error::NoSpace => write!(f, "out of space"),
            Error::Shutdown => write!(f, "operation canceled by shutdown"),
            Error::Corrupt(msg) => write!(f, "corruption detected: {msg}"),
            Error::Transient(msg) => write!(f, "transient failure: {msg}"),
        }
    }
}

/// Constructs an Error::Invalid for the given format string.
#[macro_export]
macro_rules! errinval {
    ($($args:tt)*) => { $crate::error::Error::Invalid(format!($($args)*)) };
}

/// Constructs an Error::Bug for the given format string.
#[macro_export]
macro_rules! errbug {
    ($($args:tt)*) => { $crate::error::Error::Bug(format!($($args)*)) };
}

/// An embertree Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transient(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Bug(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Error::NoSpace.to_string(), "out of space");
        assert_eq!(
            Error::Corrupt("dgen order".to_string()).to_string(),
            "corruption detected: dgen order"
        );
    }

    #[test]
    fn test_macros() {
        assert_eq!(errinval!("fanout {}", 99), Error::Invalid("fanout 99".to_string()));
        assert_eq!(errbug!("node {} missing", 7), Error::Bug("node 7 missing".to_string()));
    }
}
