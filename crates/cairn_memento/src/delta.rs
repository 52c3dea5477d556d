//! Incremental changes to the management plane view.

use crate::manager::ManagerMemento;
use cairn_core::NodeId;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// Change to the recorded master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MasterChange {
    /// Leave the master record as it is
    NoChange,
    /// Record a new master
    SetMaster,
    /// Remove the master record
    ClearMaster,
}

impl fmt::Display for MasterChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoChange => "NO_CHANGE",
            Self::SetMaster => "SET_MASTER",
            Self::ClearMaster => "CLEAR_MASTER",
        };
        f.write_str(s)
    }
}

/// Errors building a delta
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeltaError {
    /// SET_MASTER without a master id
    #[error("SET_MASTER requires a master id")]
    MissingMasterId,

    /// A master id supplied with a change that does not set one
    #[error("{change} must not carry a master id (got {master_id})")]
    UnexpectedMasterId {
        /// The change requested
        change: MasterChange,
        /// The stray id
        master_id: NodeId,
    },

    /// The same node both upserted and removed
    #[error("node {0} is both upserted and removed")]
    ConflictingNode(NodeId),
}

/// Composable change set applied to the management plane.
///
/// `master_id` is present exactly when `master_change` is
/// [`MasterChange::SetMaster`]; [`ManagementPlaneMementoDeltaBuilder::build`]
/// enforces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagementPlaneMementoDelta {
    nodes: Vec<ManagerMemento>,
    removed_node_ids: BTreeSet<NodeId>,
    master_change: MasterChange,
    master_id: Option<NodeId>,
}

impl ManagementPlaneMementoDelta {
    /// Start building a delta
    #[must_use]
    pub fn builder() -> ManagementPlaneMementoDeltaBuilder {
        ManagementPlaneMementoDeltaBuilder::default()
    }

    /// Upserted node records
    #[must_use]
    pub fn nodes(&self) -> &[ManagerMemento] {
        &self.nodes
    }

    /// Removed node ids
    #[must_use]
    pub fn removed_node_ids(&self) -> &BTreeSet<NodeId> {
        &self.removed_node_ids
    }

    /// Master change
    #[must_use]
    pub fn master_change(&self) -> MasterChange {
        self.master_change
    }

    /// New master, iff the change is SET_MASTER
    #[must_use]
    pub fn master_id(&self) -> Option<&NodeId> {
        self.master_id.as_ref()
    }

    /// Whether applying this delta changes nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.removed_node_ids.is_empty()
            && self.master_change == MasterChange::NoChange
    }
}

/// Builder for [`ManagementPlaneMementoDelta`]
#[derive(Debug, Clone)]
pub struct ManagementPlaneMementoDeltaBuilder {
    nodes: Vec<ManagerMemento>,
    removed_node_ids: BTreeSet<NodeId>,
    master_change: MasterChange,
    master_id: Option<NodeId>,
}

impl Default for ManagementPlaneMementoDeltaBuilder {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            removed_node_ids: BTreeSet::new(),
            master_change: MasterChange::NoChange,
            master_id: None,
        }
    }
}

impl ManagementPlaneMementoDeltaBuilder {
    /// Upsert a node record
    #[must_use]
    pub fn node(mut self, node: ManagerMemento) -> Self {
        self.nodes.push(node);
        self
    }

    /// Remove a node record
    #[must_use]
    pub fn remove_node(mut self, node_id: NodeId) -> Self {
        self.removed_node_ids.insert(node_id);
        self
    }

    /// Set the master change without touching the master id
    #[must_use]
    pub fn master_change(mut self, change: MasterChange) -> Self {
        self.master_change = change;
        self
    }

    /// Set the master id without touching the master change
    #[must_use]
    pub fn master_id(mut self, master_id: Option<NodeId>) -> Self {
        self.master_id = master_id;
        self
    }

    /// Record `master_id` as the new master
    #[must_use]
    pub fn set_master(self, master_id: NodeId) -> Self {
        self.master_change(MasterChange::SetMaster)
            .master_id(Some(master_id))
    }

    /// Clear the master record
    #[must_use]
    pub fn clear_master(self) -> Self {
        self.master_change(MasterChange::ClearMaster).master_id(None)
    }

    /// Validate and build
    ///
    /// # Errors
    ///
    /// Returns error if the master id does not match the master change, or a
    /// node is both upserted and removed
    pub fn build(self) -> Result<ManagementPlaneMementoDelta, DeltaError> {
        match (self.master_change, &self.master_id) {
            (MasterChange::SetMaster, None) => return Err(DeltaError::MissingMasterId),
            (change @ (MasterChange::NoChange | MasterChange::ClearMaster), Some(id)) => {
                return Err(DeltaError::UnexpectedMasterId {
                    change,
                    master_id: id.clone(),
                });
            }
            _ => {}
        }

        if let Some(node) = self
            .nodes
            .iter()
            .find(|n| self.removed_node_ids.contains(&n.node_id))
        {
            return Err(DeltaError::ConflictingNode(node.node_id.clone()));
        }

        Ok(ManagementPlaneMementoDelta {
            nodes: self.nodes,
            removed_node_ids: self.removed_node_ids,
            master_change: self.master_change,
            master_id: self.master_id,
        })
    }
}
