//! Per-operation deadlines.
//!
//! Every public volume operation accepts a [`Deadline`] and checks it at
//! its I/O suspension points. An expired deadline aborts the operation
//! before the commit point, so the store is left unchanged.

use std::time::{Duration, Instant};

use crate::errors::{GeofsError, GeofsResult};

/// An optional wall-clock cutoff for a single operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No cutoff; the operation may block indefinitely.
    pub const NONE: Deadline = Deadline(None);

    /// Deadline `timeout` from now.
    pub fn within(timeout: Duration) -> Self {
        Deadline(Some(Instant::now() + timeout))
    }

    /// Deadline at an absolute instant.
    pub fn at(instant: Instant) -> Self {
        Deadline(Some(instant))
    }

    pub fn is_expired(&self) -> bool {
        self.0.is_some_and(|cutoff| Instant::now() >= cutoff)
    }

    /// Fail with `deadline-exceeded` if the cutoff has passed. `op` names
    /// the operation for the error message.
    pub fn check(&self, op: &'static str) -> GeofsResult<()> {
        if self.is_expired() {
            return Err(GeofsError::DeadlineExceeded(op));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_never_expires() {
        assert!(!Deadline::NONE.is_expired());
        assert!(Deadline::NONE.check("read").is_ok());
    }

    #[test]
    fn test_elapsed_deadline_fails() {
        let d = Deadline::at(Instant::now() - Duration::from_millis(1));
        assert!(d.is_expired());
        assert!(matches!(
            d.check("write"),
            Err(GeofsError::DeadlineExceeded("write"))
        ));
    }

    #[test]
    fn test_future_deadline_passes() {
        let d = Deadline::within(Duration::from_secs(60));
        assert!(d.check("snapshot").is_ok());
    }
}
