//! Failure injection: silenced nodes and per-node store partitions.

use async_trait::async_trait;
use bytes::Bytes;
use cairn_core::NodeId;
use cairn_storage::{ObjectStore, StoreError, StoreResult};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Kind of failure to inject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Node stops ticking, as in a long pause or a stuck thread
    Silence,
    /// Node keeps ticking but cannot reach the store
    Partition,
}

/// A scheduled change to one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureEvent {
    /// Start a failure
    Fail(FailureKind),
    /// End every failure on the node
    Recover,
}

/// Failures planned by round
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSchedule {
    events: BTreeMap<u64, Vec<(NodeId, FailureEvent)>>,
}

impl FailureSchedule {
    /// Empty schedule
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event at the start of `round`
    #[must_use]
    pub fn at(mut self, round: u64, node: NodeId, event: FailureEvent) -> Self {
        self.events.entry(round).or_default().push((node, event));
        self
    }

    /// Events for a round, in insertion order
    #[must_use]
    pub fn events_at(&self, round: u64) -> &[(NodeId, FailureEvent)] {
        self.events.get(&round).map_or(&[], Vec::as_slice)
    }

    /// Number of scheduled events
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.values().map(Vec::len).sum()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Random failures drawn from the seeded RNG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureModel {
    /// Chance per round that a healthy node fails
    pub fail_probability: f64,
    /// Chance per round that a failed node recovers
    pub recover_probability: f64,
    /// Kinds to choose from
    pub kinds: Vec<FailureKind>,
}

impl FailureModel {
    /// Create a model
    #[must_use]
    pub fn new(fail_probability: f64, recover_probability: f64) -> Self {
        Self {
            fail_probability,
            recover_probability,
            kinds: vec![FailureKind::Silence, FailureKind::Partition],
        }
    }

    /// Set failure kinds
    #[must_use]
    pub fn with_kinds(mut self, kinds: Vec<FailureKind>) -> Self {
        self.kinds = kinds;
        self
    }

    /// Draw this round's event for a node
    #[must_use]
    pub fn draw(&self, rng: &mut ChaCha8Rng, failed: bool) -> Option<FailureEvent> {
        let roll = rng.r#gen::<f64>();
        if failed {
            return (roll < self.recover_probability).then_some(FailureEvent::Recover);
        }
        if roll >= self.fail_probability || self.kinds.is_empty() {
            return None;
        }
        let kind = self.kinds[rng.gen_range(0..self.kinds.len())];
        Some(FailureEvent::Fail(kind))
    }
}

impl Default for FailureModel {
    fn default() -> Self {
        Self::new(0.0, 0.0)
    }
}

/// One node's view of the shared store, which can be cut off
#[derive(Debug)]
pub struct PartitionedStore {
    inner: Arc<dyn ObjectStore>,
    reachable: AtomicBool,
}

impl PartitionedStore {
    /// Wrap the shared store
    #[must_use]
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            reachable: AtomicBool::new(true),
        }
    }

    /// Cut the node off or reconnect it
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Check if the node can reach the store
    #[must_use]
    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn check(&self) -> StoreResult<()> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(StoreError::Unavailable {
                reason: "partitioned".to_string(),
            })
        }
    }
}

#[async_trait]
impl ObjectStore for PartitionedStore {
    fn summary_name(&self) -> String {
        format!("partitioned({})", self.inner.summary_name())
    }

    async fn put(&self, path: &str, data: Bytes) -> StoreResult<()> {
        self.check()?;
        self.inner.put(path, data).await
    }

    async fn get(&self, path: &str) -> StoreResult<Option<Bytes>> {
        self.check()?;
        self.inner.get(path).await
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.check()?;
        self.inner.list(prefix).await
    }

    async fn delete(&self, path: &str) -> StoreResult<bool> {
        self.check()?;
        self.inner.delete(path).await
    }
}
