//! Explicit retention pass over a store.
//!
//! Nothing is ever deleted implicitly. A compaction plan names each record
//! to remove and why; executing the plan deletes exactly those records.

use crate::store::{ObjectStore, StoreResult};
use cairn_core::{ObjectId, Timestamp};
use cairn_memento::encoding::{self, RecordHeader, RecordKind, paths};
use cairn_memento::{ManagerMemento, ManagerStatus, Memento, MementoKind, field_names};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Why a record is scheduled for deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactReason {
    /// Record could not be decoded
    Corrupt,
    /// Memento not reachable from any application or top-level location
    Unreachable,
    /// Node terminated or failed longer ago than the retention window
    StaleNode,
}

impl fmt::Display for CompactReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Corrupt => "corrupt",
            Self::Unreachable => "unreachable",
            Self::StaleNode => "stale node",
        };
        f.write_str(s)
    }
}

/// Compaction plan
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompactPlan {
    /// Records to keep
    pub keep: BTreeSet<String>,
    /// Records to delete, with the reason
    pub delete: BTreeMap<String, CompactReason>,
}

impl CompactPlan {
    /// Create a new empty compaction plan
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if plan is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.delete.is_empty()
    }

    /// Get number of records to keep
    #[must_use]
    pub fn keep_count(&self) -> usize {
        self.keep.len()
    }

    /// Get number of records to delete
    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.delete.len()
    }

    /// Count of deletions for one reason
    #[must_use]
    pub fn count(&self, reason: CompactReason) -> usize {
        self.delete.values().filter(|r| **r == reason).count()
    }
}

/// Compaction result
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompactResult {
    /// Number of records deleted
    pub deleted_count: usize,
    /// Number of records kept
    pub kept_count: usize,
    /// Number of errors during compaction
    pub error_count: usize,
}

impl CompactResult {
    /// Check if compaction was successful
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error_count == 0
    }
}

/// Compactor for store cleanup
#[derive(Debug)]
pub struct Compactor {
    store: Arc<dyn ObjectStore>,
    node_retention: Duration,
}

impl Compactor {
    /// Default retention for terminated and failed node records
    pub const DEFAULT_NODE_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

    /// Create a new compactor
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            node_retention: Self::DEFAULT_NODE_RETENTION,
        }
    }

    /// Set node record retention
    #[must_use]
    pub fn with_node_retention(mut self, retention: Duration) -> Self {
        self.node_retention = retention;
        self
    }

    /// Analyze the store to create a compaction plan
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be listed or read
    pub async fn analyze(&self, now: Timestamp) -> StoreResult<CompactPlan> {
        let mut plan = CompactPlan::new();

        let mut mementos: HashMap<ObjectId, (String, Memento)> = HashMap::new();
        for path in self.store.list(paths::MEMENTOS).await? {
            let Some(bytes) = self.store.get(&path).await? else {
                continue;
            };
            let decoded: Result<(RecordHeader, Memento), _> =
                encoding::decode(&bytes, RecordKind::Memento);
            match decoded {
                Ok((_, memento)) => {
                    mementos.insert(memento.id.clone(), (path, memento));
                }
                Err(e) => {
                    warn!(%path, error = %e, "corrupt memento record");
                    plan.delete.insert(path, CompactReason::Corrupt);
                }
            }
        }

        let reachable = reachable_ids(mementos.values().map(|(_, m)| m));
        for (id, (path, _)) in mementos {
            if reachable.contains(&id) {
                plan.keep.insert(path);
            } else {
                plan.delete.insert(path, CompactReason::Unreachable);
            }
        }

        for path in self.store.list(paths::PLANE_NODES).await? {
            let Some(bytes) = self.store.get(&path).await? else {
                continue;
            };
            let decoded: Result<(RecordHeader, ManagerMemento), _> =
                encoding::decode(&bytes, RecordKind::Node);
            match decoded {
                Ok((_, node)) => {
                    let gone = matches!(
                        node.status,
                        ManagerStatus::Terminated | ManagerStatus::Failed
                    );
                    if gone && node.timestamp_utc.is_expired(now, self.node_retention) {
                        plan.delete.insert(path, CompactReason::StaleNode);
                    } else {
                        plan.keep.insert(path);
                    }
                }
                Err(e) => {
                    warn!(%path, error = %e, "corrupt node record");
                    plan.delete.insert(path, CompactReason::Corrupt);
                }
            }
        }

        Ok(plan)
    }

    /// Execute a compaction plan
    pub async fn compact(&self, plan: &CompactPlan) -> CompactResult {
        let mut result = CompactResult {
            kept_count: plan.keep_count(),
            ..CompactResult::default()
        };

        for (path, reason) in &plan.delete {
            match self.store.delete(path).await {
                Ok(true) => {
                    info!(%path, %reason, "compacted record");
                    result.deleted_count += 1;
                }
                Ok(false) => {
                    // Already deleted
                }
                Err(e) => {
                    warn!(%path, error = %e, "failed to delete record");
                    result.error_count += 1;
                }
            }
        }

        result
    }

    /// Analyze and compact in one step
    ///
    /// # Errors
    ///
    /// Returns error if analysis fails
    pub async fn run(&self, now: Timestamp) -> StoreResult<CompactResult> {
        let plan = self.analyze(now).await?;
        Ok(self.compact(&plan).await)
    }
}

/// Ids reachable from roots: components and locations with no parent.
///
/// Edges follow every reference a memento holds, plus an edge from a
/// policy's entity to the policy.
fn reachable_ids<'a>(mementos: impl Iterator<Item = &'a Memento>) -> BTreeSet<ObjectId> {
    let mut edges: HashMap<ObjectId, BTreeSet<ObjectId>> = HashMap::new();
    let mut queue = VecDeque::new();

    for memento in mementos {
        edges
            .entry(memento.id.clone())
            .or_default()
            .extend(memento.references());
        match memento.kind {
            MementoKind::Component | MementoKind::Location => {
                if memento.ref_field(field_names::PARENT).is_none() {
                    queue.push_back(memento.id.clone());
                }
            }
            MementoKind::Policy => {
                if let Some(entity) = memento.ref_field(field_names::ENTITY) {
                    edges
                        .entry(entity.clone())
                        .or_default()
                        .insert(memento.id.clone());
                }
            }
        }
    }

    let mut seen = BTreeSet::new();
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        if let Some(next) = edges.get(&id) {
            queue.extend(next.iter().filter(|n| !seen.contains(*n)).cloned());
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryObjectStore;
    use cairn_core::NodeId;
    use cairn_memento::FieldValue;

    fn id(s: &str) -> ObjectId {
        ObjectId::parse(s).unwrap()
    }

    async fn put_memento(store: &InMemoryObjectStore, memento: &Memento) {
        let bytes =
            encoding::encode(RecordKind::Memento, memento.id.as_str(), 1, 1, memento).unwrap();
        store.put(&paths::memento(&memento.id), bytes).await.unwrap();
    }

    async fn put_node(store: &InMemoryObjectStore, node: &ManagerMemento) {
        let bytes = encoding::encode(RecordKind::Node, node.node_id.as_str(), 0, 1, node).unwrap();
        store.put(&paths::node(&node.node_id), bytes).await.unwrap();
    }

    #[tokio::test]
    async fn test_plan_marks_unreachable_and_corrupt() {
        let store = Arc::new(InMemoryObjectStore::new());
        let app = Memento::builder(MementoKind::Component, id("app"), "cairn.application")
            .field(field_names::CHILDREN, FieldValue::refs(&[id("web")]))
            .build();
        let web = Memento::builder(MementoKind::Component, id("web"), "cairn.component")
            .field(field_names::PARENT, id("app"))
            .build();
        let policy = Memento::builder(MementoKind::Policy, id("pol"), "cairn.policy.basic")
            .field(field_names::ENTITY, id("web"))
            .build();
        let orphan = Memento::builder(MementoKind::Component, id("orphan"), "cairn.component")
            .field(field_names::PARENT, id("gone"))
            .build();
        for m in [&app, &web, &policy, &orphan] {
            put_memento(&store, m).await;
        }
        store.insert_raw("mementos/broken", &b"not a record"[..]);

        let compactor = Compactor::new(store.clone());
        let plan = compactor.analyze(Timestamp::from_millis(0)).await.unwrap();

        assert_eq!(plan.keep_count(), 3);
        assert_eq!(plan.delete.get("mementos/orphan"), Some(&CompactReason::Unreachable));
        assert_eq!(plan.delete.get("mementos/broken"), Some(&CompactReason::Corrupt));

        let result = compactor.compact(&plan).await;
        assert_eq!(result.deleted_count, 2);
        assert!(result.is_success());
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_stale_nodes_removed_after_retention() {
        let store = Arc::new(InMemoryObjectStore::new());
        let old = ManagerMemento::new(NodeId::parse("old").unwrap(), "http://old")
            .with_status(ManagerStatus::Terminated)
            .with_timestamp(Timestamp::from_millis(0));
        let live = ManagerMemento::new(NodeId::parse("live").unwrap(), "http://live")
            .with_status(ManagerStatus::Standby)
            .with_timestamp(Timestamp::from_millis(0));
        put_node(&store, &old).await;
        put_node(&store, &live).await;

        let compactor = Compactor::new(store.clone()).with_node_retention(Duration::from_secs(60));

        let early = compactor.analyze(Timestamp::from_millis(30_000)).await.unwrap();
        assert!(early.is_empty());

        let result = compactor.run(Timestamp::from_millis(120_000)).await.unwrap();
        assert_eq!(result.deleted_count, 1);
        assert_eq!(store.list(paths::PLANE_NODES).await.unwrap(), vec!["plane/nodes/live"]);
    }
}
