//! Master choice.
//!
//! Authority is `(priority desc, node_id asc)`. Arrival order and clock skew
//! never decide an election, so every node reading the same records picks
//! the same winner.

use crate::record::ManagementPlaneSyncRecord;
use cairn_core::Timestamp;
use cairn_memento::ManagerMemento;
use std::cmp::Ordering;
use std::time::Duration;

fn authority(a: &ManagerMemento, b: &ManagerMemento) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| b.node_id.cmp(&a.node_id))
}

/// Whether `a` outranks `b`
#[must_use]
pub fn has_authority_over(a: &ManagerMemento, b: &ManagerMemento) -> bool {
    authority(a, b) == Ordering::Greater
}

/// Node that should be master if none is live.
///
/// Only fresh nodes in a candidate status are considered. Nodes reporting
/// degraded persistence win only when no healthy candidate exists.
#[must_use]
pub fn choose_master(
    view: &ManagementPlaneSyncRecord,
    now: Timestamp,
    threshold: Duration,
) -> Option<&ManagerMemento> {
    let candidates = || {
        view.nodes
            .values()
            .filter(move |n| n.status.is_candidate() && n.is_fresh(now, threshold))
    };
    candidates()
        .filter(|n| !n.persistence_degraded)
        .max_by(|a, b| authority(a, b))
        .or_else(|| candidates().max_by(|a, b| authority(a, b)))
}

/// The recorded master, if its record and its own heartbeat are both fresh
#[must_use]
pub fn live_master(
    view: &ManagementPlaneSyncRecord,
    now: Timestamp,
    threshold: Duration,
) -> Option<&ManagerMemento> {
    let written = view.master_timestamp?;
    if written.is_expired(now, threshold) {
        return None;
    }
    view.master()
        .filter(|m| m.status.is_candidate() && m.is_fresh(now, threshold))
}
