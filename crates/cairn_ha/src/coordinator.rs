//! HA coordinator: the per-node heartbeat and election loop.

use crate::config::{HaConfig, HaMode};
use crate::election::{choose_master, has_authority_over, live_master};
use crate::record::ManagementPlaneSyncRecord;
use crate::sync::SyncRecordPersister;
use async_trait::async_trait;
use cairn_core::{Clock, NodeId, Timestamp};
use cairn_entitlement::{
    EntitlementAction, EntitlementContext, EntitlementError, EntitlementManager, EntitlementTarget,
    require,
};
use cairn_memento::{
    DeltaError, EncodingError, ManagementPlaneMementoDelta, ManagerMemento, ManagerStatus,
};
use cairn_persist::{EpochGuard, PersistError, PersistenceHealth};
use cairn_storage::ObjectStore;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// HA errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HaError {
    /// Plane store call failed
    #[error("plane store error: {0}")]
    Persist(#[from] PersistError),

    /// Delta rejected by its builder
    #[error("invalid delta: {0}")]
    Delta(#[from] DeltaError),

    /// Plane record could not be encoded
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Invalid configuration
    #[error("invalid HA config: {reason}")]
    InvalidConfig {
        /// What is wrong
        reason: String,
    },

    /// Told to be master while another live master exists
    #[error("another master is live: {master}")]
    MasterConflict {
        /// The live master
        master: NodeId,
    },

    /// A heartbeat cycle overran its bound
    #[error("heartbeat cycle exceeded {timeout_ms}ms")]
    TickTimeout {
        /// Bound in milliseconds
        timeout_ms: u64,
    },

    /// Caller not entitled
    #[error("denied: {0}")]
    Denied(#[from] EntitlementError),
}

/// Told when this node gains or loses mastership
#[async_trait]
pub trait PromotionListener: Send + Sync + fmt::Debug {
    /// This node became master under `epoch`
    async fn promoted(&self, epoch: u64);

    /// This node stopped being master
    async fn demoted(&self);
}

/// Listener that does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPromotionListener;

#[async_trait]
impl PromotionListener for NoopPromotionListener {
    async fn promoted(&self, _epoch: u64) {}

    async fn demoted(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Promoted(u64),
    Demoted,
}

#[derive(Debug)]
struct State {
    status: ManagerStatus,
    mode: HaMode,
    epoch: u64,
    last_heartbeat: Option<Timestamp>,
    cycles: u64,
    transitions: Vec<Transition>,
}

/// Runs the heartbeat protocol for one node.
///
/// Each tick writes this node's heartbeat, reads the plane, and promotes or
/// demotes. Promotion grants the new master epoch to the shared
/// [`EpochGuard`]; demotion revokes it before any listener runs.
pub struct HaCoordinator {
    config: HaConfig,
    sync: SyncRecordPersister,
    guard: Arc<EpochGuard>,
    clock: Arc<dyn Clock>,
    listener: Arc<dyn PromotionListener>,
    health: Option<watch::Receiver<PersistenceHealth>>,
    state: Mutex<State>,
    status_tx: watch::Sender<ManagerStatus>,
}

impl fmt::Debug for HaCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HaCoordinator")
            .field("node_id", &self.config.node_id)
            .field("status", &self.status())
            .field("epoch", &self.guard.epoch())
            .finish()
    }
}

impl HaCoordinator {
    /// Create a coordinator
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid
    pub fn new(
        config: HaConfig,
        store: Arc<dyn ObjectStore>,
        guard: Arc<EpochGuard>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, HaError> {
        config.validate()?;
        let sync = SyncRecordPersister::new(
            store,
            clock.clone(),
            config.failure_threshold(),
            config.tick_timeout(),
        );
        let (status_tx, _) = watch::channel(ManagerStatus::Initializing);
        Ok(Self {
            state: Mutex::new(State {
                status: ManagerStatus::Initializing,
                mode: config.mode,
                epoch: 0,
                last_heartbeat: None,
                cycles: 0,
                transitions: Vec::new(),
            }),
            config,
            sync,
            guard,
            clock,
            listener: Arc::new(NoopPromotionListener),
            health: None,
            status_tx,
        })
    }

    /// Set the promotion listener
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn PromotionListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Publish persistence health in heartbeats
    #[must_use]
    pub fn with_health(mut self, health: watch::Receiver<PersistenceHealth>) -> Self {
        self.health = Some(health);
        self
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &HaConfig {
        &self.config
    }

    /// This node's id
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> ManagerStatus {
        *self.status_tx.borrow()
    }

    /// Watch status changes
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<ManagerStatus> {
        self.status_tx.subscribe()
    }

    /// Highest master epoch granted to this node
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.guard.epoch()
    }

    /// Check if this node is master
    #[must_use]
    pub fn is_master(&self) -> bool {
        self.status() == ManagerStatus::Master
    }

    /// Current participation mode
    pub async fn mode(&self) -> HaMode {
        self.state.lock().await.mode
    }

    /// Completed heartbeat cycles
    pub async fn cycles(&self) -> u64 {
        self.state.lock().await.cycles
    }

    /// Read the whole plane; allowed on any node
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read
    pub async fn plane(&self) -> Result<ManagementPlaneSyncRecord, HaError> {
        self.sync.load().await
    }

    fn heartbeat(&self, status: ManagerStatus, now: Timestamp) -> ManagerMemento {
        let degraded = self
            .health
            .as_ref()
            .is_some_and(|h| h.borrow().is_degraded());
        ManagerMemento::new(self.config.node_id.clone(), self.config.uri.clone())
            .with_status(status)
            .with_priority(self.config.priority)
            .with_timestamp(now)
            .with_persistence_degraded(degraded)
    }

    fn promote(&self, state: &mut State, epoch: u64) {
        info!(node = %self.config.node_id, epoch, "promoted to master");
        state.status = ManagerStatus::Master;
        state.epoch = epoch;
        self.guard.grant(epoch);
        state.transitions.push(Transition::Promoted(epoch));
    }

    fn demote(&self, state: &mut State, status: ManagerStatus, reason: &str) {
        if state.status == ManagerStatus::Master {
            warn!(node = %self.config.node_id, epoch = state.epoch, reason, "demoting");
            self.guard.revoke();
            state.transitions.push(Transition::Demoted);
        }
        state.status = status;
    }

    /// Run one heartbeat cycle
    ///
    /// # Errors
    ///
    /// Returns error if the plane could not be written or read, or the cycle
    /// overran its timeout; the next tick retries
    #[instrument(skip(self), fields(node = %self.config.node_id))]
    pub async fn tick(&self) -> Result<ManagerStatus, HaError> {
        let mut state = self.state.lock().await;
        let timeout = self.config.tick_timeout();
        let result = match tokio::time::timeout(timeout, self.tick_inner(&mut state)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = self.config.tick_timeout_ms, "heartbeat cycle timed out");
                Err(HaError::TickTimeout {
                    timeout_ms: self.config.tick_timeout_ms,
                })
            }
        };
        state.cycles += 1;
        let status = state.status;
        let transitions = std::mem::take(&mut state.transitions);
        drop(state);

        self.status_tx.send_replace(status);
        for transition in transitions {
            match transition {
                Transition::Promoted(epoch) => self.listener.promoted(epoch).await,
                Transition::Demoted => self.listener.demoted().await,
            }
        }
        result.map(|()| status)
    }

    async fn tick_inner(&self, state: &mut State) -> Result<(), HaError> {
        let id = self.config.node_id.clone();
        let now = self.clock.now();
        let threshold = self.config.failure_threshold();

        if state.mode == HaMode::Disabled {
            if state.status != ManagerStatus::Master {
                if let Err(e) = self.sync.load_master().await {
                    warn!(error = %e, "could not read the last master epoch");
                }
                let epoch = self.sync.highest_epoch().max(self.guard.epoch()) + 1;
                self.promote(state, epoch);
            }
            state.last_heartbeat = Some(now);
            return Ok(());
        }

        let overdue = state
            .last_heartbeat
            .is_some_and(|t| t.is_expired(now, threshold));
        if state.status == ManagerStatus::Master && overdue {
            self.demote(state, ManagerStatus::Standby, "missed own heartbeat deadline");
        }

        let beat = ManagementPlaneMementoDelta::builder()
            .node(self.heartbeat(state.status, now))
            .build()?;
        let view = match self.sync.apply(&id, &beat).await {
            Ok(_) => self.sync.load().await,
            Err(e) => Err(e),
        };
        let view = match view {
            Ok(view) => view,
            Err(e) => {
                if state.status != ManagerStatus::Master {
                    if state.status != ManagerStatus::Failed {
                        error!(error = %e, "plane unreachable; marking failed");
                    }
                    state.status = ManagerStatus::Failed;
                }
                return Err(e);
            }
        };
        state.last_heartbeat = Some(now);

        match state.status {
            ManagerStatus::Initializing => {
                debug!(peers = view.nodes.len(), "discovery round complete");
                state.status = ManagerStatus::Standby;
                Ok(())
            }
            ManagerStatus::Master => self.as_master(state, &view, now).await,
            ManagerStatus::Failed => {
                info!("plane reachable again; returning to standby");
                state.status = ManagerStatus::Standby;
                self.as_standby(state, &view, now).await
            }
            ManagerStatus::Standby => self.as_standby(state, &view, now).await,
            ManagerStatus::Terminated => Ok(()),
        }
    }

    async fn as_master(
        &self,
        state: &mut State,
        view: &ManagementPlaneSyncRecord,
        now: Timestamp,
    ) -> Result<(), HaError> {
        let id = &self.config.node_id;
        if state.mode == HaMode::Standby {
            let clear = ManagementPlaneMementoDelta::builder().clear_master().build()?;
            self.sync.apply(id, &clear).await?;
            self.demote(state, ManagerStatus::Standby, "mode changed to standby");
            return Ok(());
        }

        let threshold = self.config.failure_threshold();
        if let Some(other) = live_master(view, now, threshold).filter(|m| &m.node_id != id) {
            let me = self.heartbeat(ManagerStatus::Master, now);
            let superseded = view.master_epoch > state.epoch
                || (view.master_epoch == state.epoch && has_authority_over(other, &me));
            if superseded {
                info!(master = %other.node_id, epoch = view.master_epoch, "another master has authority");
                self.demote(state, ManagerStatus::Standby, "superseded by another master");
                return Ok(());
            }
            warn!(other = %other.node_id, epoch = view.master_epoch, "conflicting master claim; re-asserting");
        }

        let renew = ManagementPlaneMementoDelta::builder()
            .set_master(id.clone())
            .build()?;
        if let Some(record) = self.sync.apply(id, &renew).await? {
            if record.epoch != state.epoch {
                info!(from = state.epoch, to = record.epoch, "master epoch advanced");
                state.epoch = record.epoch;
                self.guard.grant(record.epoch);
            }
        }
        Ok(())
    }

    async fn as_standby(
        &self,
        state: &mut State,
        view: &ManagementPlaneSyncRecord,
        now: Timestamp,
    ) -> Result<(), HaError> {
        let id = &self.config.node_id;
        if state.mode == HaMode::Standby {
            return Ok(());
        }

        let threshold = self.config.failure_threshold();
        if let Some(master) = live_master(view, now, threshold).filter(|m| &m.node_id != id) {
            if state.mode == HaMode::Master {
                return Err(HaError::MasterConflict {
                    master: master.node_id.clone(),
                });
            }
            debug!(master = %master.node_id, "following live master");
            return Ok(());
        }

        let winner = state.mode == HaMode::Master
            || choose_master(view, now, threshold).is_some_and(|w| &w.node_id == id);
        if !winner {
            return Ok(());
        }

        let claim = ManagementPlaneMementoDelta::builder()
            .node(self.heartbeat(ManagerStatus::Master, now))
            .set_master(id.clone())
            .build()?;
        if let Some(record) = self.sync.apply(id, &claim).await? {
            self.promote(state, record.epoch);
        }
        Ok(())
    }

    /// Run [`HaCoordinator::tick`] every heartbeat interval until cancelled
    #[must_use]
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.heartbeat_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!(node = %this.config.node_id, "heartbeat loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = this.tick().await {
                            warn!(node = %this.config.node_id, error = %e, "heartbeat cycle failed");
                        }
                    }
                }
            }
        })
    }

    /// Leave the plane: publish `TERMINATED`, clear the master record if it
    /// names this node, and revoke the write grant
    ///
    /// # Errors
    ///
    /// Returns error if the plane could not be written; the grant is revoked
    /// regardless
    pub async fn stop(&self) -> Result<(), HaError> {
        let mut state = self.state.lock().await;
        let was_master = state.status == ManagerStatus::Master;
        let mut result = Ok(());
        if state.mode != HaMode::Disabled {
            let mut delta = ManagementPlaneMementoDelta::builder()
                .node(self.heartbeat(ManagerStatus::Terminated, self.clock.now()));
            if was_master {
                delta = delta.clear_master();
            }
            result = self.sync.apply(&self.config.node_id, &delta.build()?).await.map(|_| ());
        }
        self.guard.revoke();
        state.status = ManagerStatus::Terminated;
        drop(state);

        self.status_tx.send_replace(ManagerStatus::Terminated);
        info!(node = %self.config.node_id, "left the management plane");
        if was_master {
            self.listener.demoted().await;
        }
        result
    }

    /// Change participation mode; takes effect on the next tick
    ///
    /// # Errors
    ///
    /// Returns [`HaError::Denied`] if the caller may not change HA state
    pub async fn change_mode(
        &self,
        caller: &EntitlementContext,
        entitlements: &dyn EntitlementManager,
        mode: HaMode,
    ) -> Result<HaMode, HaError> {
        require(
            entitlements,
            caller,
            EntitlementAction::ChangeHaState,
            &EntitlementTarget::Node {
                id: self.config.node_id.clone(),
            },
        )?;
        let mut state = self.state.lock().await;
        let previous = std::mem::replace(&mut state.mode, mode);
        if previous != mode {
            info!(node = %self.config.node_id, from = %previous, to = %mode, user = %caller.user, "HA mode changed");
        }
        Ok(previous)
    }
}
