//! Management node records.

use cairn_core::{NodeId, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Status of a management node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManagerStatus {
    /// Starting up; has not yet completed a heartbeat cycle
    Initializing,
    /// Passive, ready to take over
    Standby,
    /// The active node
    Master,
    /// Unhealthy; may return to standby after recovery
    Failed,
    /// Shut down deliberately
    Terminated,
}

impl ManagerStatus {
    /// Whether a node in this status may be elected
    #[must_use]
    pub const fn is_candidate(&self) -> bool {
        matches!(self, Self::Initializing | Self::Standby | Self::Master)
    }
}

impl fmt::Display for ManagerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "INITIALIZING",
            Self::Standby => "STANDBY",
            Self::Master => "MASTER",
            Self::Failed => "FAILED",
            Self::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}

/// Heartbeat record of one management node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerMemento {
    /// Node id
    pub node_id: NodeId,
    /// How to reach the node
    pub uri: String,
    /// Current status
    pub status: ManagerStatus,
    /// Election weight; higher wins
    pub priority: i32,
    /// Time of the heartbeat that wrote this record
    pub timestamp_utc: Timestamp,
    /// Platform version of the node
    #[serde(default)]
    pub platform_version: Version,
    /// Whether the node's persister has given up writing
    #[serde(default)]
    pub persistence_degraded: bool,
}

impl ManagerMemento {
    /// Create a record for a node that is starting up
    #[must_use]
    pub fn new(node_id: NodeId, uri: impl Into<String>) -> Self {
        Self {
            node_id,
            uri: uri.into(),
            status: ManagerStatus::Initializing,
            priority: 0,
            timestamp_utc: Timestamp::EPOCH,
            platform_version: Version::current(),
            persistence_degraded: false,
        }
    }

    /// Set status
    #[must_use]
    pub fn with_status(mut self, status: ManagerStatus) -> Self {
        self.status = status;
        self
    }

    /// Set priority
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set heartbeat time
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp_utc = timestamp;
        self
    }

    /// Set persistence health flag
    #[must_use]
    pub fn with_persistence_degraded(mut self, degraded: bool) -> Self {
        self.persistence_degraded = degraded;
        self
    }

    /// Whether the heartbeat is within `threshold` of `now`
    #[must_use]
    pub fn is_fresh(&self, now: Timestamp, threshold: Duration) -> bool {
        !self.timestamp_utc.is_expired(now, threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_form() {
        let json = serde_json::to_string(&ManagerStatus::Master).unwrap();
        assert_eq!(json, "\"MASTER\"");
        assert_eq!(ManagerStatus::Initializing.to_string(), "INITIALIZING");
    }

    #[test]
    fn test_candidates() {
        assert!(ManagerStatus::Standby.is_candidate());
        assert!(!ManagerStatus::Failed.is_candidate());
        assert!(!ManagerStatus::Terminated.is_candidate());
    }

    #[test]
    fn test_freshness() {
        let node = ManagerMemento::new(NodeId::parse("a").unwrap(), "http://a:8081")
            .with_timestamp(Timestamp::from_millis(1_000));
        let threshold = Duration::from_secs(30);
        assert!(node.is_fresh(Timestamp::from_millis(31_000), threshold));
        assert!(!node.is_fresh(Timestamp::from_millis(31_001), threshold));
    }

    #[test]
    fn test_camel_case_fields() {
        let node = ManagerMemento::new(NodeId::parse("a").unwrap(), "http://a")
            .with_priority(5)
            .with_status(ManagerStatus::Standby);
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["nodeId"], "a");
        assert_eq!(json["timestampUtc"], 0);
        assert_eq!(json["status"], "STANDBY");
        assert_eq!(json["persistenceDegraded"], false);
    }
}
