//! HA configuration.

use crate::coordinator::HaError;
use cairn_core::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// How a node takes part in election
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HaMode {
    /// Participate in election
    #[default]
    Auto,
    /// Promote as soon as discovery completes, unless another master is live
    Master,
    /// Never promote
    Standby,
    /// No HA; act as sole master without writing plane records
    Disabled,
}

impl fmt::Display for HaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::Master => "master",
            Self::Standby => "standby",
            Self::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

/// HA configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HaConfig {
    /// This node's id
    pub node_id: NodeId,
    /// How peers reach this node
    pub uri: String,
    /// Election weight; higher wins
    pub priority: i32,
    /// Participation mode
    pub mode: HaMode,
    /// Heartbeat period in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Age after which a heartbeat or master record counts as absent, in milliseconds
    pub failure_threshold_ms: u64,
    /// Bound on one heartbeat cycle in milliseconds
    pub tick_timeout_ms: u64,
}

impl HaConfig {
    /// Create a config with default timings
    #[must_use]
    pub fn new(node_id: NodeId, uri: impl Into<String>) -> Self {
        Self {
            node_id,
            uri: uri.into(),
            priority: 0,
            mode: HaMode::Auto,
            heartbeat_interval_ms: 1_000,
            failure_threshold_ms: 30_000,
            tick_timeout_ms: 5_000,
        }
    }

    /// Set priority
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set mode
    #[must_use]
    pub fn with_mode(mut self, mode: HaMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set heartbeat period
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    /// Set failure threshold
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold_ms: u64) -> Self {
        self.failure_threshold_ms = threshold_ms;
        self
    }

    /// Set tick timeout
    #[must_use]
    pub fn with_tick_timeout(mut self, timeout_ms: u64) -> Self {
        self.tick_timeout_ms = timeout_ms;
        self
    }

    /// Heartbeat period
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Failure threshold
    #[must_use]
    pub fn failure_threshold(&self) -> Duration {
        Duration::from_millis(self.failure_threshold_ms)
    }

    /// Tick timeout
    #[must_use]
    pub fn tick_timeout(&self) -> Duration {
        Duration::from_millis(self.tick_timeout_ms)
    }

    /// Check the timings are usable
    ///
    /// # Errors
    ///
    /// Returns error if an interval is zero or the failure threshold does not
    /// cover at least two heartbeats
    pub fn validate(&self) -> Result<(), HaError> {
        let invalid = |reason: &str| {
            Err(HaError::InvalidConfig {
                reason: reason.to_string(),
            })
        };
        if self.heartbeat_interval_ms == 0 || self.tick_timeout_ms == 0 {
            return invalid("heartbeat interval and tick timeout must be positive");
        }
        if self.failure_threshold_ms < self.heartbeat_interval_ms.saturating_mul(2) {
            return invalid("failure threshold must cover at least two heartbeats");
        }
        Ok(())
    }
}

impl Default for HaConfig {
    fn default() -> Self {
        Self::new(NodeId::new(), "local")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = HaConfig::default();
        assert_eq!(config.failure_threshold(), Duration::from_secs(30));
        assert_eq!(config.mode, HaMode::Auto);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        let node = NodeId::parse("a").unwrap();
        let short = HaConfig::new(node.clone(), "a").with_failure_threshold(1_500);
        assert!(matches!(short.validate(), Err(HaError::InvalidConfig { .. })));
        let zero = HaConfig::new(node, "a").with_heartbeat_interval(0);
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_mode_serde() {
        let config: HaConfig =
            serde_json::from_str(r#"{"node_id":"n1","mode":"standby","priority":4}"#).unwrap();
        assert_eq!(config.mode, HaMode::Standby);
        assert_eq!(config.priority, 4);
        assert_eq!(config.heartbeat_interval_ms, 1_000);
    }
}
