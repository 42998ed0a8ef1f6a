//! Health channel.
//!
//! Compaction failures are recorded here rather than returned to a caller:
//! the worker that hit the failure has nobody above it to report to. The
//! scheduler consults [`Health::check`] before starting new work, so a tree
//! that has seen an unrecoverable error quiesces instead of burning workers.
//! Shutdown cancellations are expected and never recorded.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};

const FLAG_INVALID: u32 = 1 << 0;
const FLAG_BUG: u32 = 1 << 1;
const FLAG_NOSPACE: u32 = 1 << 2;
const FLAG_CORRUPT: u32 = 1 << 3;
const FLAG_TRANSIENT: u32 = 1 << 4;

/// Sticky per-tree health state.
#[derive(Default)]
pub struct Health {
    flags: AtomicU32,
    last: Mutex<Option<Error>>,
}

impl Health {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error event. Shutdown is not an event.
    pub fn error(&self, err: &Error) {
        let flag = match err {
            Error::Invalid(_) => FLAG_INVALID,
            Error::Bug(_) => FLAG_BUG,
            Error::NoSpace => FLAG_NOSPACE,
            Error::Corrupt(_) => FLAG_CORRUPT,
            Error::Transient(_) => FLAG_TRANSIENT,
            Error::Shutdown => return,
        };

        tracing::error!(error = %err, "health event");

        self.flags.fetch_or(flag, Ordering::SeqCst);
        *self.last.lock() = Some(err.clone());
    }

    /// Gate for new work: fails with the last recorded error once any event
    /// has been seen.
    pub fn check(&self) -> Result<()> {
        if self.flags.load(Ordering::SeqCst) == 0 {
            return Ok(());
        }

        match self.last.lock().clone() {
            Some(err) => Err(err),
            None => Err(Error::Bug("health flag set with no error recorded".to_string())),
        }
    }

    pub fn last_error(&self) -> Option<Error> {
        self.last.lock().clone()
    }

    /// Clear all recorded events (restart path and tests).
    pub fn reset(&self) {
        self.flags.store(0, Ordering::SeqCst);
        *self.last.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_gates_after_event() {
        let health = Health::new();
        assert!(health.check().is_ok());

        health.error(&Error::NoSpace);
        assert_eq!(health.check(), Err(Error::NoSpace));
        assert_eq!(health.last_error(), Some(Error::NoSpace));

        health.reset();
        assert!(health.check().is_ok());
    }

    #[test]
    fn test_shutdown_not_recorded() {
        let health = Health::new();
        health.error(&Error::Shutdown);
        assert!(health.check().is_ok());
        assert_eq!(health.last_error(), None);
    }
}
