//! Recording of simulation runs.

use crate::failure::FailureEvent;
use crate::seed::SimSeed;
use cairn_core::NodeId;
use cairn_memento::ManagerStatus;
use serde::{Deserialize, Serialize};

/// What happened to a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimEventKind {
    /// Status changed after a tick
    StatusChanged {
        /// Before the tick
        from: ManagerStatus,
        /// After the tick
        to: ManagerStatus,
        /// Epoch held by the node after the tick
        epoch: u64,
    },
    /// A failure started or ended
    Injected(FailureEvent),
    /// A tick returned an error
    TickFailed {
        /// Error text
        error: String,
    },
}

/// One recorded event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimEvent {
    /// Round it happened in
    pub round: u64,
    /// Node concerned
    pub node: NodeId,
    /// What happened
    pub kind: SimEventKind,
}

/// A node becoming master
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promotion {
    /// Round of the promotion
    pub round: u64,
    /// New master
    pub node: NodeId,
    /// Its epoch
    pub epoch: u64,
}

/// Record of a simulation run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimRecord {
    /// Seed used for the run
    pub seed: SimSeed,
    /// Events in order
    pub events: Vec<SimEvent>,
}

impl SimRecord {
    /// Create an empty record
    #[must_use]
    pub fn new(seed: SimSeed) -> Self {
        Self {
            seed,
            events: Vec::new(),
        }
    }

    /// Append an event
    pub fn push(&mut self, round: u64, node: NodeId, kind: SimEventKind) {
        self.events.push(SimEvent { round, node, kind });
    }

    /// Get event count
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Events for a node
    pub fn events_for<'a>(&'a self, node: &'a NodeId) -> impl Iterator<Item = &'a SimEvent> + 'a {
        self.events.iter().filter(move |e| &e.node == node)
    }

    /// Every promotion, in order
    #[must_use]
    pub fn promotions(&self) -> Vec<Promotion> {
        self.events
            .iter()
            .filter_map(|e| match e.kind {
                SimEventKind::StatusChanged {
                    to: ManagerStatus::Master,
                    epoch,
                    ..
                } => Some(Promotion {
                    round: e.round,
                    node: e.node.clone(),
                    epoch,
                }),
                _ => None,
            })
            .collect()
    }

    /// Serialize to JSON
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Deserialize from JSON
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
