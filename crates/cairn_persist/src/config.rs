//! Persister configuration.

use crate::persister::PersistError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Persister configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersisterConfig {
    /// Quiet period after the last change to an id before it is written
    pub debounce_ms: u64,
    /// Longest any change may wait, even while the id keeps changing
    pub max_delay_ms: u64,
    /// Timeout for a single store call
    pub write_timeout_ms: u64,
    /// Retry policy for store calls
    pub retry: RetryPolicy,
    /// Refuse to overwrite records stamped with a higher master epoch
    pub fenced_writes: bool,
}

impl PersisterConfig {
    /// Create a config with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set debounce window
    #[must_use]
    pub fn with_debounce(mut self, debounce_ms: u64) -> Self {
        self.debounce_ms = debounce_ms;
        self
    }

    /// Set maximum delay
    #[must_use]
    pub fn with_max_delay(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Set write timeout
    #[must_use]
    pub fn with_write_timeout(mut self, timeout_ms: u64) -> Self {
        self.write_timeout_ms = timeout_ms;
        self
    }

    /// Set retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Enable or disable epoch checks against stored records
    #[must_use]
    pub fn with_fenced_writes(mut self, fenced: bool) -> Self {
        self.fenced_writes = fenced;
        self
    }

    /// Debounce window
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Maximum delay
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Per-call timeout
    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// How often the background task looks for ready writes
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis((self.debounce_ms / 2).clamp(10, 500))
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns error if the delays or retry budget are inconsistent
    pub fn validate(&self) -> Result<(), PersistError> {
        if self.max_delay_ms < self.debounce_ms {
            return Err(PersistError::InvalidConfig {
                reason: format!(
                    "max_delay_ms ({}) is shorter than debounce_ms ({})",
                    self.max_delay_ms, self.debounce_ms
                ),
            });
        }
        if self.write_timeout_ms == 0 {
            return Err(PersistError::InvalidConfig {
                reason: "write_timeout_ms must be positive".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(PersistError::InvalidConfig {
                reason: "retry.max_attempts must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            max_delay_ms: 1_000,
            write_timeout_ms: 5_000,
            retry: RetryPolicy::default(),
            fenced_writes: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = PersisterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.debounce(), Duration::from_millis(100));
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_max_delay_shorter_than_debounce_rejected() {
        let config = PersisterConfig::new().with_debounce(500).with_max_delay(100);
        assert!(matches!(
            config.validate(),
            Err(PersistError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: PersisterConfig = serde_json::from_str(r#"{"debounce_ms": 20}"#).unwrap();
        assert_eq!(config.debounce_ms, 20);
        assert_eq!(config.max_delay_ms, 1_000);
        assert!(config.fenced_writes);
    }
}
