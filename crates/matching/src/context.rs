//! Per-call context: deadline and cancellation
//!
//! Every blocking operation of the engine takes a [`RequestContext`]. The
//! deadline bounds how long the call may suspend; the cancellation token
//! lets the caller (or its transport) abandon it early.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::MatchingError;

/// Deadline and cancellation signal of one call
#[derive(Debug, Clone)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancellation: CancellationToken,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    /// Context without a deadline
    ///
    /// Long polls and queries reject such a context.
    pub fn new() -> Self {
        Self {
            deadline: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Context that expires `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// Context that expires at `deadline`
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancellation: CancellationToken::new(),
        }
    }

    /// Use an existing cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has passed
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Cancel the call
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when the deadline passes; never resolves without one
    pub(crate) async fn expired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

/// Check that a long-poll style call carries a bounded deadline
///
/// A missing deadline or one longer than `max` is a bad request. Deadlines
/// shorter than `critical` are accepted but logged, since workers polling
/// that briefly mostly produce empty responses.
pub fn validate_long_poll_context(
    ctx: &RequestContext,
    operation: &str,
    max: Duration,
    critical: Duration,
) -> Result<(), MatchingError> {
    let Some(remaining) = ctx.remaining() else {
        return Err(MatchingError::BadRequest(format!(
            "{operation}: request context has no deadline"
        )));
    };

    if remaining > max {
        return Err(MatchingError::BadRequest(format!(
            "{operation}: deadline of {}ms exceeds the maximum of {}ms",
            remaining.as_millis(),
            max.as_millis()
        )));
    }

    if remaining < critical {
        warn!(
            operation,
            timeout_ms = remaining.as_millis() as u64,
            "long poll deadline is shorter than the critical threshold"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: Duration = Duration::from_secs(60);
    const CRITICAL: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_missing_deadline_is_rejected() {
        let err = validate_long_poll_context(&RequestContext::new(), "Poll", MAX, CRITICAL)
            .unwrap_err();
        assert!(matches!(err, MatchingError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_absurd_deadline_is_rejected() {
        let ctx = RequestContext::with_timeout(Duration::from_secs(3600));
        assert!(validate_long_poll_context(&ctx, "Poll", MAX, CRITICAL).is_err());
    }

    #[tokio::test]
    async fn test_short_deadline_is_accepted() {
        let ctx = RequestContext::with_timeout(Duration::from_millis(500));
        assert!(validate_long_poll_context(&ctx, "Poll", MAX, CRITICAL).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let ctx = RequestContext::with_timeout(Duration::from_secs(1));
        assert!(!ctx.is_expired());
        ctx.expired().await;
        assert!(ctx.is_expired());
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_cancel() {
        let ctx = RequestContext::new();
        let clone = ctx.clone();
        clone.cancel();
        assert!(ctx.is_cancelled());
    }
}
