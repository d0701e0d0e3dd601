//! Exponential backoff between attempts of one call.
//!
//! Only transport failures are retried: connection errors, attempt
//! timeouts, 408/429 and 5xx. Business rejections and unreadable success
//! bodies are returned on the first attempt, since the authority has
//! already processed the request.
use crate::config::RetryPolicy;
use std::fmt::Display;
use std::time::Duration;

/// Tracks attempts of a single call against its [`RetryPolicy`].
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    attempts: u32,
}

impl Backoff {
    pub(crate) fn new(policy: &RetryPolicy) -> Self {
        Self {
            max_attempts: policy.max_attempts(),
            base_delay: policy.base_delay(),
            max_delay: policy.max_delay(),
            attempts: 0,
        }
    }

    /// Attempts made so far.
    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failed attempt and return how long to wait before the next
    /// one, or `None` once the ceiling is reached.
    ///
    /// Delays: base, 2 x base, 4 x base, ... capped at the policy maximum.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            return None;
        }
        let factor = 1u32 << (self.attempts - 1).min(20);
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }

    /// Log and sleep before the next attempt. Returns `false` when the
    /// ceiling has been reached.
    pub(crate) async fn wait(&mut self, cause: &impl Display) -> bool {
        let Some(delay) = self.next_delay() else {
            tracing::warn!(
                attempts = self.attempts,
                max_attempts = self.max_attempts,
                "NFSe request failed, giving up: {cause}"
            );
            return false;
        };
        tracing::warn!(
            attempt = self.attempts,
            max_attempts = self.max_attempts,
            "NFSe request failed, retrying in {delay:?}: {cause}"
        );
        tokio::time::sleep(delay).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_and_stop_at_ceiling() {
        let policy = RetryPolicy::new(4, Duration::from_millis(200));
        let mut backoff = Backoff::new(&policy);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(400)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(800)));
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.attempts(), 4);
    }

    #[test]
    fn delays_are_capped() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(3));
        let mut backoff = Backoff::new(&policy);
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_delay()).collect();
        assert_eq!(delays.len(), 9);
        assert_eq!(delays[1], Duration::from_secs(2));
        assert!(delays[2..].iter().all(|d| *d == Duration::from_secs(3)));
    }

    #[test]
    fn single_attempt_policy_never_waits() {
        let mut backoff = Backoff::new(&RetryPolicy::new(1, Duration::from_millis(200)));
        assert_eq!(backoff.next_delay(), None);
    }

    #[tokio::test]
    async fn wait_reports_exhaustion() {
        let mut backoff = Backoff::new(&RetryPolicy::new(2, Duration::from_millis(1)));
        assert!(backoff.wait(&"HTTP 503").await);
        assert!(!backoff.wait(&"HTTP 503").await);
        assert_eq!(backoff.attempts(), 2);
    }
}
