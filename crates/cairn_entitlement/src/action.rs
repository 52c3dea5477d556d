//! Entitlement actions, callers, and targets.

use cairn_core::{NodeId, ObjectId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Something a caller may be entitled to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementAction {
    /// See that an entity exists
    SeeEntity,
    /// Read a sensor value
    SeeSensor,
    /// Invoke an effector
    InvokeEffector,
    /// Deploy a new application
    DeployApplication,
    /// See full server and management plane details
    SeeAllServerInfo,
    /// Create, change, or remove managed objects
    ModifyTopology,
    /// Promote, demote, or change the HA mode of a node
    ChangeHaState,
    /// Rebuild the live topology from the store
    Rebind,
}

impl EntitlementAction {
    /// Every action; a table must handle all of them
    pub const ALL: [EntitlementAction; 8] = [
        Self::SeeEntity,
        Self::SeeSensor,
        Self::InvokeEffector,
        Self::DeployApplication,
        Self::SeeAllServerInfo,
        Self::ModifyTopology,
        Self::ChangeHaState,
        Self::Rebind,
    ];

    /// Whether the action only reads
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        matches!(self, Self::SeeEntity | Self::SeeSensor | Self::SeeAllServerInfo)
    }
}

impl fmt::Display for EntitlementAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SeeEntity => "see_entity",
            Self::SeeSensor => "see_sensor",
            Self::InvokeEffector => "invoke_effector",
            Self::DeployApplication => "deploy_application",
            Self::SeeAllServerInfo => "see_all_server_info",
            Self::ModifyTopology => "modify_topology",
            Self::ChangeHaState => "change_ha_state",
            Self::Rebind => "rebind",
        };
        f.write_str(s)
    }
}

/// Who is asking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementContext {
    /// User name
    pub user: String,
    /// Roles held
    pub roles: BTreeSet<String>,
}

impl EntitlementContext {
    /// Role that bypasses every check
    pub const ROOT_ROLE: &'static str = "root";

    /// Create a context with no roles
    #[must_use]
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            roles: BTreeSet::new(),
        }
    }

    /// The management process acting on its own behalf
    #[must_use]
    pub fn system() -> Self {
        Self::new("system").with_role(Self::ROOT_ROLE)
    }

    /// Add a role
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    /// Check for a role
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Check for the root role
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.has_role(Self::ROOT_ROLE)
    }
}

/// What the action applies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum EntitlementTarget {
    /// No specific target
    None,
    /// A managed object
    Entity {
        /// Object id
        id: ObjectId,
    },
    /// A named item (sensor, effector) of a managed object
    EntityItem {
        /// Object id
        id: ObjectId,
        /// Item name
        item: String,
    },
    /// An application blueprint or type
    Application {
        /// Blueprint name or type tag
        name: String,
    },
    /// A management node
    Node {
        /// Node id
        id: NodeId,
    },
}

impl EntitlementTarget {
    /// Object id, if the target names one
    #[must_use]
    pub fn object_id(&self) -> Option<&ObjectId> {
        match self {
            Self::Entity { id } | Self::EntityItem { id, .. } => Some(id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_actions_distinct() {
        let set: BTreeSet<_> = EntitlementAction::ALL.iter().collect();
        assert_eq!(set.len(), EntitlementAction::ALL.len());
    }

    #[test]
    fn test_context_roles() {
        let ctx = EntitlementContext::new("alice").with_role("operator");
        assert!(ctx.has_role("operator"));
        assert!(!ctx.is_root());
        assert!(EntitlementContext::system().is_root());
    }

    #[test]
    fn test_target_object_id() {
        let id = ObjectId::parse("web").unwrap();
        let target = EntitlementTarget::EntityItem {
            id: id.clone(),
            item: "restart".to_string(),
        };
        assert_eq!(target.object_id(), Some(&id));
        assert_eq!(EntitlementTarget::None.object_id(), None);
    }
}
