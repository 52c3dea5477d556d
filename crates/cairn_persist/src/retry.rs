//! Bounded retry with exponential backoff.

use crate::persister::PersistError;
use cairn_storage::StoreResult;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy for store calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay
    pub max_backoff_ms: u64,
    /// Growth factor between delays
    pub multiplier: u32,
}

impl RetryPolicy {
    /// Create a policy with the given attempt budget
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Policy that never retries
    #[must_use]
    pub fn no_retry() -> Self {
        Self::new(1)
    }

    /// Set initial backoff
    #[must_use]
    pub fn with_initial_backoff(mut self, backoff_ms: u64) -> Self {
        self.initial_backoff_ms = backoff_ms;
        self
    }

    /// Set maximum backoff
    #[must_use]
    pub fn with_max_backoff(mut self, backoff_ms: u64) -> Self {
        self.max_backoff_ms = backoff_ms;
        self
    }

    /// Set multiplier
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Delay before retry number `attempt` (1-based: the delay after the first failure is attempt 1)
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(exp);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            multiplier: 2,
        }
    }
}

/// Run a store call under a per-attempt timeout, retrying transient failures
///
/// # Errors
///
/// Returns the first non-transient store error, or
/// [`PersistError::RetriesExhausted`] once the attempt budget is spent
pub async fn retry_with_timeout<T, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    operation: &str,
    mut call: F,
) -> Result<T, PersistError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match tokio::time::timeout(timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if !e.is_transient() => return Err(e.into()),
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => {
                last_error = format!("timed out after {}ms", timeout.as_millis());
            }
        }

        if attempt < attempts {
            let delay = policy.backoff_for(attempt);
            warn!(
                operation,
                attempt,
                max_attempts = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %last_error,
                "store call failed; retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    Err(PersistError::RetriesExhausted {
        operation: operation.to_string(),
        attempts,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_storage::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_growth_is_capped() {
        let policy = RetryPolicy::default()
            .with_initial_backoff(100)
            .with_max_backoff(1_000)
            .with_multiplier(3);
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(300));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(900));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_for(60), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(3);
        let result = retry_with_timeout(&policy, Duration::from_secs(1), "put", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::Unavailable {
                    reason: "down".to_string(),
                })
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reported() {
        let policy = RetryPolicy::new(2);
        let result: Result<(), _> =
            retry_with_timeout(&policy, Duration::from_secs(1), "put", || async {
                Err(StoreError::Unavailable {
                    reason: "down".to_string(),
                })
            })
            .await;
        assert!(matches!(
            result,
            Err(PersistError::RetriesExhausted { attempts: 2, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(2);
        let result = retry_with_timeout(&policy, Duration::from_millis(50), "put", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            Ok(())
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> =
            retry_with_timeout(&RetryPolicy::new(5), Duration::from_secs(1), "put", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::InvalidPath {
                    path: "..".to_string(),
                    reason: "relative".to_string(),
                })
            })
            .await;
        assert!(matches!(result, Err(PersistError::Store(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
