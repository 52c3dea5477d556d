//! Plane records shared between nodes.

use cairn_core::{NodeId, Timestamp};
use cairn_memento::{ManagerMemento, ManagerStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// The master record at [`cairn_memento::paths::MASTER`].
///
/// Clearing the master keeps the record with no `master_id` so the epoch is
/// never lost and never goes backwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterRecord {
    /// Current master, if any
    pub master_id: Option<NodeId>,
    /// Master epoch; bumped whenever mastership is taken
    pub epoch: u64,
    /// Time of the last write
    pub timestamp_utc: Timestamp,
    /// Node that wrote the record
    pub writer: NodeId,
}

impl MasterRecord {
    /// Whether the record names a master and was written within `threshold`
    #[must_use]
    pub fn is_live(&self, now: Timestamp, threshold: Duration) -> bool {
        self.master_id.is_some() && !self.timestamp_utc.is_expired(now, threshold)
    }

    /// Whether the record names `node`
    #[must_use]
    pub fn names(&self, node: &NodeId) -> bool {
        self.master_id.as_ref() == Some(node)
    }
}

/// Everything a node reads from the plane in one heartbeat
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagementPlaneSyncRecord {
    /// Master named by the master record
    pub master_id: Option<NodeId>,
    /// Epoch of the master record
    pub master_epoch: u64,
    /// Time the master record was last written
    pub master_timestamp: Option<Timestamp>,
    /// Node records by id
    pub nodes: BTreeMap<NodeId, ManagerMemento>,
}

impl ManagementPlaneSyncRecord {
    /// Build from the raw records
    #[must_use]
    pub fn new(master: Option<&MasterRecord>, nodes: impl IntoIterator<Item = ManagerMemento>) -> Self {
        Self {
            master_id: master.and_then(|m| m.master_id.clone()),
            master_epoch: master.map_or(0, |m| m.epoch),
            master_timestamp: master.map(|m| m.timestamp_utc),
            nodes: nodes.into_iter().map(|n| (n.node_id.clone(), n)).collect(),
        }
    }

    /// Node record by id
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&ManagerMemento> {
        self.nodes.get(id)
    }

    /// Record of the named master
    #[must_use]
    pub fn master(&self) -> Option<&ManagerMemento> {
        self.master_id.as_ref().and_then(|id| self.nodes.get(id))
    }

    /// Nodes with the given status
    pub fn with_status(&self, status: ManagerStatus) -> impl Iterator<Item = &ManagerMemento> {
        self.nodes.values().filter(move |n| n.status == status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeId {
        NodeId::parse(id).unwrap()
    }

    #[test]
    fn test_master_record_liveness() {
        let record = MasterRecord {
            master_id: Some(node("b")),
            epoch: 2,
            timestamp_utc: Timestamp::from_millis(1_000),
            writer: node("b"),
        };
        let threshold = Duration::from_secs(30);
        assert!(record.is_live(Timestamp::from_millis(31_000), threshold));
        assert!(!record.is_live(Timestamp::from_millis(31_001), threshold));
        assert!(record.names(&node("b")));

        let cleared = MasterRecord {
            master_id: None,
            ..record
        };
        assert!(!cleared.is_live(Timestamp::from_millis(1_000), threshold));
    }

    #[test]
    fn test_sync_record_view() {
        let master = MasterRecord {
            master_id: Some(node("b")),
            epoch: 4,
            timestamp_utc: Timestamp::from_millis(10),
            writer: node("b"),
        };
        let nodes = vec![
            ManagerMemento::new(node("a"), "a").with_status(ManagerStatus::Standby),
            ManagerMemento::new(node("b"), "b").with_status(ManagerStatus::Master),
        ];
        let view = ManagementPlaneSyncRecord::new(Some(&master), nodes);
        assert_eq!(view.master_epoch, 4);
        assert_eq!(view.master().map(|m| m.uri.as_str()), Some("b"));
        assert_eq!(view.with_status(ManagerStatus::Standby).count(), 1);

        let empty = ManagementPlaneSyncRecord::new(None, Vec::new());
        assert_eq!(empty.master_epoch, 0);
        assert!(empty.master().is_none());
    }
}
