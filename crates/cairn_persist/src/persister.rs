//! Memento persister.

use crate::config::PersisterConfig;
use crate::fencing::{EpochGuard, FenceError};
use crate::health::{HealthTracker, PersistenceHealth};
use crate::queue::{Pending, PendingOp, WriteQueue};
use crate::retry::retry_with_timeout;
use cairn_core::{Clock, ObjectId, Version};
use cairn_memento::encoding::{self, EncodingError, RecordHeader, RecordKind, paths};
use cairn_memento::{Memento, TopologyDelta, TopologyMemento};
use cairn_storage::{ObjectStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Persister result type
pub type PersistResult<T> = Result<T, PersistError>;

/// Persister errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistError {
    /// Non-transient store failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Record could not be encoded
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Write refused by epoch fencing
    #[error("fenced: {0}")]
    Fenced(#[from] FenceError),

    /// Store call failed on every attempt
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Operation name
        operation: String,
        /// Attempts made
        attempts: u32,
        /// Last failure
        last_error: String,
    },

    /// Some queued writes could not be applied
    #[error("{failed} of {attempted} writes failed; first: {first_error}")]
    FlushIncomplete {
        /// Writes attempted in the batch
        attempted: usize,
        /// Writes that failed
        failed: usize,
        /// First failure
        first_error: String,
    },

    /// Invalid configuration
    #[error("invalid persister config: {reason}")]
    InvalidConfig {
        /// What is wrong
        reason: String,
    },
}

/// A record skipped while loading
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadError {
    /// Store path of the record
    pub path: String,
    /// Why it was skipped
    pub reason: String,
}

/// Result of reading every memento
#[derive(Debug, Clone, Default)]
pub struct LoadOutcome {
    /// Mementos that decoded cleanly
    pub mementos: Vec<Memento>,
    /// Records that were skipped
    pub errors: Vec<LoadError>,
}

enum Applied {
    Done,
    Fenced,
}

/// Writes mementos to an object store through a coalescing queue.
///
/// `write`, `delete`, and `delta` only enqueue and never block; a background
/// task started with [`MementoPersister::start`] drains the queue. Writes are
/// refused while the [`EpochGuard`] holds no grant.
///
/// The persister tracks which stored ids it has read cleanly or written
/// itself. A checkpoint only removes records from that set; anything else in
/// the store is left for explicit compaction.
#[derive(Debug)]
pub struct MementoPersister {
    store: Arc<dyn ObjectStore>,
    config: PersisterConfig,
    guard: Arc<EpochGuard>,
    clock: Arc<dyn Clock>,
    queue: WriteQueue,
    health: HealthTracker,
    flush_lock: Mutex<()>,
    known: std::sync::Mutex<BTreeSet<ObjectId>>,
}

impl MementoPersister {
    /// Create a persister
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(
        store: Arc<dyn ObjectStore>,
        config: PersisterConfig,
        guard: Arc<EpochGuard>,
        clock: Arc<dyn Clock>,
    ) -> PersistResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            guard,
            clock,
            queue: WriteQueue::new(),
            health: HealthTracker::new(),
            flush_lock: Mutex::new(()),
            known: std::sync::Mutex::new(BTreeSet::new()),
        })
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &PersisterConfig {
        &self.config
    }

    /// Fencing guard shared with the HA coordinator
    #[must_use]
    pub fn guard(&self) -> &Arc<EpochGuard> {
        &self.guard
    }

    /// Underlying store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Current persistence health
    #[must_use]
    pub fn health(&self) -> PersistenceHealth {
        self.health.current()
    }

    /// Watch persistence health
    #[must_use]
    pub fn subscribe_health(&self) -> watch::Receiver<PersistenceHealth> {
        self.health.subscribe()
    }

    /// Number of ids with unwritten changes
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Queue a memento for writing
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::Fenced`] if this node may not write
    pub fn write(&self, memento: Memento) -> PersistResult<()> {
        self.guard.permit()?;
        let id = memento.id.clone();
        let sequence = self.queue.enqueue(id.clone(), PendingOp::Write(Box::new(memento)));
        debug!(%id, sequence, "queued memento write");
        Ok(())
    }

    /// Queue deletion of a memento
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::Fenced`] if this node may not write
    pub fn delete(&self, id: &ObjectId) -> PersistResult<()> {
        self.guard.permit()?;
        let sequence = self.queue.enqueue(id.clone(), PendingOp::Delete);
        debug!(%id, sequence, "queued memento delete");
        Ok(())
    }

    /// Queue every change in a delta
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::Fenced`] if this node may not write
    pub fn delta(&self, delta: TopologyDelta) -> PersistResult<()> {
        self.guard.permit()?;
        for memento in delta.upserts {
            self.queue
                .enqueue(memento.id.clone(), PendingOp::Write(Box::new(memento)));
        }
        for id in delta.removals {
            self.queue.enqueue(id, PendingOp::Delete);
        }
        Ok(())
    }

    /// Ids whose stored records this persister has read or written
    #[must_use]
    pub fn known_ids(&self) -> BTreeSet<ObjectId> {
        self.known.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Stop tracking ids, so no checkpoint removes their records
    pub fn forget<'a>(&self, ids: impl IntoIterator<Item = &'a ObjectId>) {
        let mut known = self.known.lock().unwrap_or_else(PoisonError::into_inner);
        for id in ids {
            known.remove(id);
        }
    }

    fn track(&self, id: &ObjectId, present: bool) {
        let mut known = self.known.lock().unwrap_or_else(PoisonError::into_inner);
        if present {
            known.insert(id.clone());
        } else {
            known.remove(id);
        }
    }

    /// Write a complete snapshot and delete known records it does not contain.
    ///
    /// Records that failed to decode, and ids released with
    /// [`MementoPersister::forget`], are never removed here.
    ///
    /// # Errors
    ///
    /// Returns error if fenced, if the store cannot be listed, or if any
    /// write fails after retries
    #[instrument(skip_all, fields(mementos = topology.len()))]
    pub async fn checkpoint(&self, topology: &TopologyMemento) -> PersistResult<()> {
        self.guard.permit()?;
        let stored = self.list_ids().await?;
        let known = self.known_ids();
        let keep = topology.ids();

        let mut delta = TopologyDelta::new();
        for memento in topology.iter() {
            delta = delta.upsert(memento.clone());
        }
        for id in stored.intersection(&known).filter(|id| !keep.contains(id)) {
            delta = delta.remove(id.clone());
        }
        let removals = delta.removals.len();
        self.delta(delta)?;
        self.flush().await?;
        info!(written = keep.len(), removed = removals, "checkpoint complete");
        Ok(())
    }

    /// Write everything pending now, ignoring the debounce window
    ///
    /// # Errors
    ///
    /// Returns error if any write fails after retries; failed writes stay queued
    pub async fn flush(&self) -> PersistResult<()> {
        // One pass; writes failing here are requeued for the background task.
        self.process_batch(true).await.map(|_| ())
    }

    /// Drop all pending writes; used when mastership is lost
    pub fn discard_pending(&self) -> usize {
        let n = self.queue.clear();
        if n > 0 {
            info!(discarded = n, "discarded pending writes");
        }
        n
    }

    /// Start the background flush task
    #[must_use]
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.poll_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        if this.guard.is_writable() {
                            if let Err(e) = this.flush().await {
                                warn!(error = %e, "final flush failed");
                            }
                        }
                        debug!("persister stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = this.process_batch(false).await {
                            warn!(error = %e, "flush cycle incomplete");
                        }
                    }
                }
            }
        })
    }

    #[instrument(skip(self), level = "debug")]
    async fn process_batch(&self, force: bool) -> PersistResult<usize> {
        let _batch = self.flush_lock.lock().await;
        let ready = self
            .queue
            .take_ready(self.config.debounce(), self.config.max_delay(), force);
        if ready.is_empty() {
            return Ok(0);
        }

        let attempted = ready.len();
        let outcomes = futures::future::join_all(
            ready
                .into_iter()
                .map(|(id, pending)| async move {
                    let result = self.apply(&id, &pending).await;
                    (id, pending, result)
                }),
        )
        .await;

        let mut written = 0;
        let mut failures = Vec::new();
        for (id, pending, result) in outcomes {
            match result {
                Ok(Applied::Done) => written += 1,
                Ok(Applied::Fenced) => {}
                Err(e) => {
                    warn!(%id, sequence = pending.sequence, error = %e, "memento write failed");
                    failures.push(e.to_string());
                    if !self.queue.requeue(id, pending) {
                        debug!("failed write superseded by a newer change");
                    }
                }
            }
        }

        if let Some(first_error) = failures.first() {
            self.health.mark_degraded(first_error.clone(), self.clock.now());
            return Err(PersistError::FlushIncomplete {
                attempted,
                failed: failures.len(),
                first_error: first_error.clone(),
            });
        }
        self.health.mark_healthy();
        debug!(written, "flushed batch");
        Ok(written)
    }

    async fn apply(&self, id: &ObjectId, pending: &Pending) -> PersistResult<Applied> {
        let epoch = match self.guard.permit() {
            Ok(epoch) => epoch,
            Err(_) => {
                debug!(%id, "dropping queued write: mastership lost");
                return Ok(Applied::Fenced);
            }
        };
        let path = paths::memento(id);

        if self.config.fenced_writes {
            if let Some(stored) = self.read_header(&path).await? {
                if let Err(e) = EpochGuard::check_overwrite(epoch, stored.epoch) {
                    warn!(%id, error = %e, "refusing to overwrite newer record");
                    return Ok(Applied::Fenced);
                }
            }
        }

        let timeout = self.config.write_timeout();
        match &pending.op {
            PendingOp::Write(memento) => {
                let bytes = encoding::encode(
                    RecordKind::Memento,
                    id.as_str(),
                    epoch,
                    pending.sequence,
                    memento.as_ref(),
                )?;
                retry_with_timeout(&self.config.retry, timeout, "put", || {
                    self.store.put(&path, bytes.clone())
                })
                .await?;
                self.track(id, true);
            }
            PendingOp::Delete => {
                retry_with_timeout(&self.config.retry, timeout, "delete", || {
                    self.store.delete(&path)
                })
                .await?;
                self.track(id, false);
            }
        }
        Ok(Applied::Done)
    }

    async fn read_header(&self, path: &str) -> PersistResult<Option<RecordHeader>> {
        let existing = retry_with_timeout(
            &self.config.retry,
            self.config.write_timeout(),
            "get",
            || self.store.get(path),
        )
        .await?;
        // A corrupt record carries no trustworthy epoch, so it may be replaced.
        Ok(existing.and_then(|bytes| encoding::decode_header(&bytes).ok()))
    }

    async fn list_ids(&self) -> PersistResult<BTreeSet<ObjectId>> {
        let listed = retry_with_timeout(
            &self.config.retry,
            self.config.write_timeout(),
            "list",
            || self.store.list(paths::MEMENTOS),
        )
        .await?;
        Ok(listed.iter().filter_map(|p| paths::memento_id(p)).collect())
    }

    /// Read every memento, skipping records that fail to decode
    ///
    /// Corrupt, truncated, or mislabelled records are reported in
    /// [`LoadOutcome::errors`] rather than failing the load.
    ///
    /// # Errors
    ///
    /// Returns error only if the store itself cannot be listed or read
    #[instrument(skip(self))]
    pub async fn list_all(&self) -> PersistResult<LoadOutcome> {
        let timeout = self.config.write_timeout();
        let listed = retry_with_timeout(&self.config.retry, timeout, "list", || {
            self.store.list(paths::MEMENTOS)
        })
        .await?;

        let current = Version::current();
        let mut outcome = LoadOutcome::default();
        for path in listed {
            let Some(bytes) = retry_with_timeout(&self.config.retry, timeout, "get", || {
                self.store.get(&path)
            })
            .await?
            else {
                continue;
            };

            let decoded: Result<(RecordHeader, Memento), _> =
                encoding::decode(&bytes, RecordKind::Memento);
            let reason = match decoded {
                Ok((_, memento)) if paths::memento_id(&path).as_ref() == Some(&memento.id) => {
                    if !current.is_compatible_with(&memento.platform_version) {
                        warn!(
                            id = %memento.id,
                            written_by = %memento.platform_version,
                            running = %current,
                            "memento written by an incompatible platform version"
                        );
                    }
                    self.track(&memento.id, true);
                    outcome.mementos.push(memento);
                    continue;
                }
                Ok((_, memento)) => format!("record holds memento {} under the wrong path", memento.id),
                Err(e) => e.to_string(),
            };
            warn!(%path, %reason, "skipping unreadable memento record");
            outcome.errors.push(LoadError { path, reason });
        }

        info!(
            loaded = outcome.mementos.len(),
            skipped = outcome.errors.len(),
            "read mementos"
        );
        Ok(outcome)
    }

    /// Read every memento into a topology
    ///
    /// # Errors
    ///
    /// Returns error only if the store itself cannot be listed or read
    pub async fn load_topology(&self) -> PersistResult<(TopologyMemento, Vec<LoadError>)> {
        let outcome = self.list_all().await?;
        Ok((TopologyMemento::from_mementos(outcome.mementos), outcome.errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use cairn_core::{ManualClock, Timestamp};
    use cairn_memento::{FieldValue, MementoKind, field_names};
    use cairn_storage::{InMemoryObjectStore, ListeningObjectStore};

    fn id(s: &str) -> ObjectId {
        ObjectId::parse(s).unwrap()
    }

    fn memento(name: &str, display: &str) -> Memento {
        Memento::builder(MementoKind::Component, id(name), "cairn.component")
            .display_name(display)
            .build()
    }

    fn fast_config() -> PersisterConfig {
        PersisterConfig::new()
            .with_debounce(50)
            .with_max_delay(200)
            .with_write_timeout(1_000)
            .with_retry(RetryPolicy::new(2).with_initial_backoff(1).with_max_backoff(1))
    }

    fn persister(store: Arc<dyn ObjectStore>, guard: Arc<EpochGuard>) -> MementoPersister {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
        MementoPersister::new(store, fast_config(), guard, clock).unwrap()
    }

    #[tokio::test]
    async fn test_write_then_list_all() {
        let store = Arc::new(InMemoryObjectStore::new());
        let p = persister(store.clone(), Arc::new(EpochGuard::granted(1)));
        p.write(memento("a", "first")).unwrap();
        p.write(memento("b", "second")).unwrap();
        p.flush().await.unwrap();

        let outcome = p.list_all().await.unwrap();
        assert_eq!(outcome.mementos.len(), 2);
        assert!(outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_writes_collapse() {
        let inner = Arc::new(InMemoryObjectStore::new());
        let listening = Arc::new(ListeningObjectStore::new(inner));
        let p = persister(listening.clone(), Arc::new(EpochGuard::granted(1)));

        for i in 0..10 {
            p.write(memento("a", &format!("v{}", i))).unwrap();
        }
        p.flush().await.unwrap();
        assert_eq!(listening.stats().puts, 1);

        let outcome = p.list_all().await.unwrap();
        assert_eq!(outcome.mementos[0].display_name, "v9");
    }

    #[tokio::test]
    async fn test_partial_load_tolerance() {
        let store = Arc::new(InMemoryObjectStore::new());
        let p = persister(store.clone(), Arc::new(EpochGuard::granted(1)));
        for name in ["a", "b", "c"] {
            p.write(memento(name, name)).unwrap();
        }
        p.flush().await.unwrap();

        let good = store.get("mementos/c").await.unwrap().unwrap();
        store.insert_raw("mementos/c", good.slice(..good.len() - 4));

        let outcome = p.list_all().await.unwrap();
        assert_eq!(outcome.mementos.len(), 2);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].path, "mementos/c");
    }

    #[tokio::test]
    async fn test_list_all_fails_when_store_unavailable() {
        let store = Arc::new(InMemoryObjectStore::new());
        let p = persister(store.clone(), Arc::new(EpochGuard::granted(1)));
        store.set_available(false);
        assert!(matches!(
            p.list_all().await,
            Err(PersistError::RetriesExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn test_standby_cannot_write() {
        let store = Arc::new(InMemoryObjectStore::new());
        let p = persister(store.clone(), Arc::new(EpochGuard::new()));
        assert_eq!(
            p.write(memento("a", "a")),
            Err(PersistError::Fenced(FenceError::NotMaster))
        );
        assert_eq!(p.pending(), 0);
    }

    #[tokio::test]
    async fn test_demotion_drops_queued_writes() {
        let store = Arc::new(InMemoryObjectStore::new());
        let guard = Arc::new(EpochGuard::granted(1));
        let p = persister(store.clone(), guard.clone());
        p.write(memento("a", "a")).unwrap();
        guard.revoke();
        p.flush().await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_stale_epoch_cannot_overwrite() {
        let store = Arc::new(InMemoryObjectStore::new());
        let newer = persister(store.clone(), Arc::new(EpochGuard::granted(5)));
        newer.write(memento("a", "from epoch 5")).unwrap();
        newer.flush().await.unwrap();

        let stale = persister(store.clone(), Arc::new(EpochGuard::granted(4)));
        stale.write(memento("a", "from epoch 4")).unwrap();
        stale.flush().await.unwrap();

        let outcome = stale.list_all().await.unwrap();
        assert_eq!(outcome.mementos[0].display_name, "from epoch 5");
    }

    #[tokio::test]
    async fn test_exhausted_retries_degrade_and_recover() {
        let store = Arc::new(InMemoryObjectStore::new());
        let p = persister(store.clone(), Arc::new(EpochGuard::granted(1)));
        store.fail_next_puts(2);
        p.write(memento("a", "a")).unwrap();

        assert!(matches!(
            p.flush().await,
            Err(PersistError::FlushIncomplete { failed: 1, .. })
        ));
        assert!(p.health().is_degraded());
        assert_eq!(p.pending(), 1);

        p.flush().await.unwrap();
        assert!(!p.health().is_degraded());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_replaces_store_contents() {
        let store = Arc::new(InMemoryObjectStore::new());
        let p = persister(store.clone(), Arc::new(EpochGuard::granted(1)));
        p.write(memento("stale", "old")).unwrap();
        p.flush().await.unwrap();

        let app = Memento::builder(MementoKind::Component, id("app"), "cairn.application")
            .field(field_names::CHILDREN, FieldValue::refs(&[id("web")]))
            .build();
        let web = Memento::builder(MementoKind::Component, id("web"), "cairn.component")
            .field(field_names::PARENT, id("app"))
            .build();
        p.checkpoint(&TopologyMemento::from_mementos(vec![app, web]))
            .await
            .unwrap();

        let (topology, errors) = p.load_topology().await.unwrap();
        assert!(errors.is_empty());
        assert_eq!(topology.ids(), BTreeSet::from([id("app"), id("web")]));
        assert_eq!(topology.application_ids, BTreeSet::from([id("app")]));
    }

    #[tokio::test]
    async fn test_checkpoint_keeps_unreadable_records() {
        let store = Arc::new(InMemoryObjectStore::new());
        let writer = persister(store.clone(), Arc::new(EpochGuard::granted(1)));
        writer.write(memento("a", "a")).unwrap();
        writer.write(memento("b", "b")).unwrap();
        writer.flush().await.unwrap();
        let good = store.get("mementos/b").await.unwrap().unwrap();
        store.insert_raw("mementos/b", good.slice(..good.len() - 4));

        let p = persister(store.clone(), Arc::new(EpochGuard::granted(2)));
        let (topology, errors) = p.load_topology().await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(p.known_ids(), BTreeSet::from([id("a")]));

        p.checkpoint(&topology).await.unwrap();
        assert!(store.get("mementos/a").await.unwrap().is_some());
        assert!(store.get("mementos/b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_checkpoint_keeps_forgotten_records() {
        let store = Arc::new(InMemoryObjectStore::new());
        let p = persister(store.clone(), Arc::new(EpochGuard::granted(1)));
        p.write(memento("a", "a")).unwrap();
        p.write(memento("b", "b")).unwrap();
        p.flush().await.unwrap();

        p.forget([&id("b")]);
        p.checkpoint(&TopologyMemento::from_mementos(vec![memento("a", "a")]))
            .await
            .unwrap();
        assert_eq!(store.len(), 2);

        p.checkpoint(&TopologyMemento::default()).await.unwrap();
        assert_eq!(store.list("mementos/").await.unwrap(), vec!["mementos/b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_task_honours_debounce() {
        let store = Arc::new(InMemoryObjectStore::new());
        let p = Arc::new(persister(store.clone(), Arc::new(EpochGuard::granted(1))));
        let cancel = CancellationToken::new();
        let handle = p.start(cancel.clone());

        p.write(memento("a", "a")).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(store.is_empty());

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(store.len(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_removes_record() {
        let store = Arc::new(InMemoryObjectStore::new());
        let p = persister(store.clone(), Arc::new(EpochGuard::granted(1)));
        p.write(memento("a", "a")).unwrap();
        p.flush().await.unwrap();
        p.delete(&id("a")).unwrap();
        p.flush().await.unwrap();
        assert!(store.is_empty());
    }
}
