//! Reading and writing plane records.

use crate::coordinator::HaError;
use crate::record::{ManagementPlaneSyncRecord, MasterRecord};
use cairn_core::{Clock, NodeId};
use cairn_memento::encoding::{self, RecordKind, paths};
use cairn_memento::{ManagementPlaneMementoDelta, ManagerMemento, MasterChange};
use cairn_persist::{RetryPolicy, retry_with_timeout};
use cairn_storage::ObjectStore;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Applies plane deltas to the store and reads the plane back.
///
/// Store calls are not retried here: a failed heartbeat is retried by the
/// next tick.
#[derive(Debug)]
pub struct SyncRecordPersister {
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    failure_threshold: Duration,
    call_timeout: Duration,
    sequence: AtomicU64,
    highest_epoch: AtomicU64,
}

impl SyncRecordPersister {
    /// Create a persister over the shared store
    #[must_use]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
        failure_threshold: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            failure_threshold,
            call_timeout,
            sequence: AtomicU64::new(0),
            highest_epoch: AtomicU64::new(0),
        }
    }

    /// Shared store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Highest master epoch this node has read or written
    #[must_use]
    pub fn highest_epoch(&self) -> u64 {
        self.highest_epoch.load(Ordering::SeqCst)
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn observe_epoch(&self, epoch: u64) {
        self.highest_epoch.fetch_max(epoch, Ordering::SeqCst);
    }

    async fn get(&self, path: &str) -> Result<Option<bytes::Bytes>, HaError> {
        let store = &self.store;
        Ok(retry_with_timeout(&RetryPolicy::no_retry(), self.call_timeout, "plane get", || {
            store.get(path)
        })
        .await?)
    }

    async fn put(&self, path: &str, data: bytes::Bytes) -> Result<(), HaError> {
        let store = &self.store;
        Ok(retry_with_timeout(&RetryPolicy::no_retry(), self.call_timeout, "plane put", || {
            store.put(path, data.clone())
        })
        .await?)
    }

    /// Read the master record; a corrupt record reads as absent
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read
    pub async fn load_master(&self) -> Result<Option<MasterRecord>, HaError> {
        let Some(bytes) = self.get(paths::MASTER).await? else {
            return Ok(None);
        };
        match encoding::decode::<MasterRecord>(&bytes, RecordKind::Master) {
            Ok((_, record)) => {
                self.observe_epoch(record.epoch);
                Ok(Some(record))
            }
            Err(e) => {
                warn!(error = %e, "master record unreadable; treating as absent");
                Ok(None)
            }
        }
    }

    /// Read every node record and the master record
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be listed or read
    pub async fn load(&self) -> Result<ManagementPlaneSyncRecord, HaError> {
        let store = &self.store;
        let node_paths = retry_with_timeout(
            &RetryPolicy::no_retry(),
            self.call_timeout,
            "plane list",
            || store.list(paths::PLANE_NODES),
        )
        .await?;

        let mut nodes = Vec::with_capacity(node_paths.len());
        for path in node_paths {
            let Some(bytes) = self.get(&path).await? else {
                continue;
            };
            match encoding::decode::<ManagerMemento>(&bytes, RecordKind::Node) {
                Ok((_, node)) if paths::node_id(&path).as_ref() == Some(&node.node_id) => {
                    nodes.push(node);
                }
                Ok((_, node)) => {
                    warn!(path, node = %node.node_id, "node record stored under another id; skipped");
                }
                Err(e) => warn!(path, error = %e, "node record unreadable; skipped"),
            }
        }

        let master = self.load_master().await?;
        Ok(ManagementPlaneSyncRecord::new(master.as_ref(), nodes))
    }

    /// Apply a delta written by `writer`.
    ///
    /// `SET_MASTER` keeps the current epoch when it renews a live record
    /// naming the same node, and otherwise takes the next epoch above any
    /// seen. `CLEAR_MASTER` only clears a record that names `writer`.
    /// Returns the master record as written, or `None` if it was untouched.
    ///
    /// # Errors
    ///
    /// Returns error if a store call fails or a record cannot be encoded
    pub async fn apply(
        &self,
        writer: &NodeId,
        delta: &ManagementPlaneMementoDelta,
    ) -> Result<Option<MasterRecord>, HaError> {
        for node in delta.nodes() {
            let bytes = encoding::encode(
                RecordKind::Node,
                node.node_id.as_str(),
                0,
                self.next_sequence(),
                node,
            )?;
            self.put(&paths::node(&node.node_id), bytes).await?;
        }

        for removed in delta.removed_node_ids() {
            let path = paths::node(removed);
            let store = &self.store;
            retry_with_timeout(&RetryPolicy::no_retry(), self.call_timeout, "plane delete", || {
                store.delete(&path)
            })
            .await?;
            debug!(node = %removed, "node record removed");
        }

        let now = self.clock.now();
        let record = match (delta.master_change(), delta.master_id()) {
            (MasterChange::SetMaster, Some(master)) => {
                let current = self.load_master().await?;
                let renew = current
                    .as_ref()
                    .is_some_and(|c| c.names(master) && c.is_live(now, self.failure_threshold));
                let epoch = match current {
                    Some(c) if renew => c.epoch,
                    _ => self.highest_epoch() + 1,
                };
                if !renew {
                    info!(%master, epoch, %writer, "master record set");
                }
                MasterRecord {
                    master_id: Some(master.clone()),
                    epoch,
                    timestamp_utc: now,
                    writer: writer.clone(),
                }
            }
            (MasterChange::ClearMaster, _) => {
                let Some(current) = self.load_master().await? else {
                    return Ok(None);
                };
                if !current.names(writer) {
                    debug!(%writer, master = ?current.master_id, "not clearing a master record naming another node");
                    return Ok(None);
                }
                info!(%writer, epoch = current.epoch, "master record cleared");
                MasterRecord {
                    master_id: None,
                    epoch: current.epoch,
                    timestamp_utc: now,
                    writer: writer.clone(),
                }
            }
            _ => return Ok(None),
        };

        let bytes = encoding::encode(
            RecordKind::Master,
            "master",
            record.epoch,
            self.next_sequence(),
            &record,
        )?;
        self.put(paths::MASTER, bytes).await?;
        self.observe_epoch(record.epoch);
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::{ManualClock, Timestamp};
    use cairn_memento::ManagerStatus;
    use cairn_storage::InMemoryObjectStore;

    fn node(id: &str) -> NodeId {
        NodeId::parse(id).unwrap()
    }

    fn fixture() -> (Arc<InMemoryObjectStore>, Arc<ManualClock>, SyncRecordPersister) {
        let store = Arc::new(InMemoryObjectStore::new());
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
        let sync = SyncRecordPersister::new(
            store.clone(),
            clock.clone(),
            Duration::from_secs(30),
            Duration::from_secs(1),
        );
        (store, clock, sync)
    }

    fn heartbeat(id: &str, status: ManagerStatus, clock: &ManualClock) -> ManagerMemento {
        ManagerMemento::new(node(id), format!("http://{}", id))
            .with_status(status)
            .with_timestamp(clock.now())
    }

    #[tokio::test]
    async fn test_heartbeats_and_master() {
        let (_, clock, sync) = fixture();
        let delta = ManagementPlaneMementoDelta::builder()
            .node(heartbeat("a", ManagerStatus::Standby, &clock))
            .node(heartbeat("b", ManagerStatus::Master, &clock))
            .set_master(node("b"))
            .build()
            .unwrap();
        let record = sync.apply(&node("b"), &delta).await.unwrap().unwrap();
        assert_eq!(record.epoch, 1);

        let view = sync.load().await.unwrap();
        assert_eq!(view.nodes.len(), 2);
        assert_eq!(view.master_id, Some(node("b")));
        assert_eq!(view.master_epoch, 1);
    }

    #[tokio::test]
    async fn test_epoch_renewed_then_bumped() {
        let (_, clock, sync) = fixture();
        let set_b = ManagementPlaneMementoDelta::builder()
            .set_master(node("b"))
            .build()
            .unwrap();
        sync.apply(&node("b"), &set_b).await.unwrap();
        clock.advance(Duration::from_secs(1));
        let renewed = sync.apply(&node("b"), &set_b).await.unwrap().unwrap();
        assert_eq!(renewed.epoch, 1);

        let set_c = ManagementPlaneMementoDelta::builder()
            .set_master(node("c"))
            .build()
            .unwrap();
        let taken = sync.apply(&node("c"), &set_c).await.unwrap().unwrap();
        assert_eq!(taken.epoch, 2);

        // Same master after expiry still takes a new epoch.
        clock.advance(Duration::from_secs(31));
        let retaken = sync.apply(&node("c"), &set_c).await.unwrap().unwrap();
        assert_eq!(retaken.epoch, 3);
    }

    #[tokio::test]
    async fn test_clear_only_own_record() {
        let (_, _, sync) = fixture();
        let set_b = ManagementPlaneMementoDelta::builder()
            .set_master(node("b"))
            .build()
            .unwrap();
        sync.apply(&node("b"), &set_b).await.unwrap();

        let clear = ManagementPlaneMementoDelta::builder().clear_master().build().unwrap();
        assert!(sync.apply(&node("a"), &clear).await.unwrap().is_none());
        assert_eq!(sync.load().await.unwrap().master_id, Some(node("b")));

        let cleared = sync.apply(&node("b"), &clear).await.unwrap().unwrap();
        assert_eq!(cleared.master_id, None);
        assert_eq!(cleared.epoch, 1);

        let view = sync.load().await.unwrap();
        assert_eq!(view.master_id, None);
        assert_eq!(view.master_epoch, 1);
    }

    #[tokio::test]
    async fn test_corrupt_node_record_skipped() {
        let (store, clock, sync) = fixture();
        let delta = ManagementPlaneMementoDelta::builder()
            .node(heartbeat("a", ManagerStatus::Standby, &clock))
            .build()
            .unwrap();
        sync.apply(&node("a"), &delta).await.unwrap();
        store.insert_raw("plane/nodes/z", "not a record");

        let view = sync.load().await.unwrap();
        assert_eq!(view.nodes.len(), 1);
        assert!(view.node(&node("a")).is_some());
    }

    #[tokio::test]
    async fn test_remove_node() {
        let (_, clock, sync) = fixture();
        let add = ManagementPlaneMementoDelta::builder()
            .node(heartbeat("a", ManagerStatus::Terminated, &clock))
            .build()
            .unwrap();
        sync.apply(&node("a"), &add).await.unwrap();
        let remove = ManagementPlaneMementoDelta::builder()
            .remove_node(node("a"))
            .build()
            .unwrap();
        sync.apply(&node("b"), &remove).await.unwrap();
        assert!(sync.load().await.unwrap().nodes.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let (store, _, sync) = fixture();
        store.set_available(false);
        assert!(matches!(sync.load().await, Err(HaError::Persist(_))));
    }
}
