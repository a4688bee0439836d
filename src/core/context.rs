//! Cancellation and deadlines for I/O-bound operations
//!
//! In-memory index and bitmap updates are never interrupted. The context is
//! checked at the I/O boundary, before and after the physical write, so a
//! store that is cancelled or overruns its deadline is rolled back instead of
//! being committed.

use crate::error::{ContractManagerError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Per-operation cancellation and deadline
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    cancel: Option<CancelToken>,
    deadline: Option<Instant>,
}

impl OpContext {
    /// A context that never cancels or expires
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Keep the earlier of the current deadline and `now + timeout`
    pub(crate) fn bounded_by(mut self, timeout: Option<Duration>) -> Self {
        if let Some(timeout) = timeout {
            let limit = Instant::now() + timeout;
            self.deadline = Some(match self.deadline {
                Some(existing) if existing < limit => existing,
                _ => limit,
            });
        }
        self
    }

    /// Fail with `Cancelled` or `TimedOut` if the operation must stop
    pub fn check(&self) -> Result<()> {
        if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Err(ContractManagerError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(ContractManagerError::TimedOut);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_never_stops() {
        assert!(OpContext::background().check().is_ok());
    }

    #[test]
    fn test_cancel() {
        let token = CancelToken::new();
        let ctx = OpContext::background().with_cancel(token.clone());
        assert!(ctx.check().is_ok());

        token.cancel();
        assert!(matches!(ctx.check(), Err(ContractManagerError::Cancelled)));
    }

    #[test]
    fn test_expired_deadline() {
        let ctx = OpContext::background().with_deadline(Instant::now() - Duration::from_millis(1));
        assert!(matches!(ctx.check(), Err(ContractManagerError::TimedOut)));
    }

    #[test]
    fn test_bounded_by_keeps_earlier_deadline() {
        let early = Instant::now() - Duration::from_secs(1);
        let ctx = OpContext::background()
            .with_deadline(early)
            .bounded_by(Some(Duration::from_secs(60)));
        assert!(matches!(ctx.check(), Err(ContractManagerError::TimedOut)));
    }
}
