//! Exponential backoff with jitter over the classified error taxonomy.

use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;

use crate::error::{ErrorKind, PivoxError};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub jitter: bool,
    pub retryable_kinds: HashSet<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
            retryable_kinds: [
                ErrorKind::ProxyConnect,
                ErrorKind::ProxyTimeout,
                ErrorKind::RateLimited,
            ]
            .into_iter()
            .collect(),
        }
    }
}

impl RetryPolicy {
    /// A policy that performs exactly one attempt.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable_kinds.contains(&kind)
    }

    /// Whether attempt `attempt` (0-based count of retries already made)
    /// should be followed by another try for this error.
    pub fn should_retry(&self, attempt: u32, error: &PivoxError) -> bool {
        attempt < self.max_retries && self.is_retryable(error.kind())
    }

    /// Backoff before retry `i` (0-based): `min(max, initial * multiplier^i)`,
    /// scaled by uniform `[0.5, 1.0]` when jitter is on.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.min(31) as i32);
        let base = self.initial_backoff.as_secs_f64() * exp;
        let capped = base.min(self.max_backoff.as_secs_f64());
        let scaled = if self.jitter {
            capped * rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            capped
        };
        Duration::from_secs_f64(scaled)
    }

    pub async fn wait(&self, attempt: u32) {
        tokio::time::sleep(self.backoff_for(attempt)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = no_jitter();
        assert_eq!(policy.backoff_for(0), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(2000));
        assert_eq!(policy.backoff_for(10), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let backoff = policy.backoff_for(1);
            assert!(backoff >= Duration::from_millis(500));
            assert!(backoff <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_closed_policy_never_retries() {
        let policy = RetryPolicy::none();
        assert!(!policy.should_retry(0, &PivoxError::ProxyTimeout));
    }

    #[test]
    fn test_non_retryable_kind() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0, &PivoxError::ProxyConnect("reset".into())));
        assert!(!policy.should_retry(0, &PivoxError::NoProxiesAvailable));
        assert!(!policy.should_retry(3, &PivoxError::ProxyTimeout));
    }
}
