//! Cooperative deadlines.
//!
//! A [`Deadline`] is carried through every dispatch; suspension points call
//! [`Deadline::check`] and surface a cancellation error once it has passed.
//! Cancellation is cooperative — nothing is forcibly killed before its
//! timeout window closes.

use std::time::{Duration, Instant};

use crate::error::{CoreError, CoreResult};

/// A fixed point in time after which work must stop.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline `ms` milliseconds from now. Zero expires immediately.
    pub fn after_ms(ms: u64) -> Self {
        Self(Some(Instant::now() + Duration::from_millis(ms)))
    }

    /// No deadline: never expires.
    pub fn none() -> Self {
        Self(None)
    }

    /// Time left, if a deadline is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn expired(&self) -> bool {
        self.remaining().map(|r| r.is_zero()).unwrap_or(false)
    }

    /// Raise a cancellation error when the deadline has passed.
    pub fn check(&self) -> CoreResult<()> {
        if self.expired() {
            Err(CoreError::Cancelled("deadline exceeded".into()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_never_expires() {
        let d = Deadline::none();
        assert!(!d.expired());
        assert!(d.check().is_ok());
        assert_eq!(d.remaining(), None);
    }

    #[test]
    fn zero_expires_immediately() {
        let d = Deadline::after_ms(0);
        assert!(d.expired());
        assert_eq!(
            d.check().unwrap_err().kind(),
            crate::error::ErrorKind::Cancelled
        );
    }

    #[tokio::test]
    async fn future_deadline_expires_after_wait() {
        let d = Deadline::after_ms(20);
        assert!(d.check().is_ok());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(d.expired());
    }
}
