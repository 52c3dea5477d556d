//! A running management node: persister, live topology, and HA loop.

use crate::config::NodeConfig;
use async_trait::async_trait;
use cairn_core::{Clock, SystemClock};
use cairn_entitlement::{AllowAll, EntitlementContext};
use cairn_ha::{HaCoordinator, PromotionListener};
use cairn_persist::{EpochGuard, MementoPersister};
use cairn_rebind::{
    ManagementContext, PersistingChangeListener, RebindError, RebindManager, RebindSupportRegistry,
    Rebinder,
};
use cairn_storage::{FsObjectStore, ObjectStore};
use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Rebinds from the store on promotion and drops the topology on demotion.
///
/// The rebind runs in its own task so the heartbeat loop is never held up
/// by it.
#[derive(Debug)]
struct RebindOnPromotion {
    manager: Arc<RebindManager>,
    pass: Mutex<Option<CancellationToken>>,
}

impl RebindOnPromotion {
    fn new(manager: Arc<RebindManager>) -> Self {
        Self {
            manager,
            pass: Mutex::new(None),
        }
    }

    fn cancel_pass(&self) {
        let previous = self.pass.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(cancel) = previous {
            cancel.cancel();
        }
    }
}

#[async_trait]
impl PromotionListener for RebindOnPromotion {
    async fn promoted(&self, epoch: u64) {
        self.cancel_pass();
        let cancel = CancellationToken::new();
        *self.pass.lock().unwrap_or_else(PoisonError::into_inner) = Some(cancel.clone());

        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move {
            match manager.rebind(&EntitlementContext::system(), &cancel).await {
                Ok(report) => info!(
                    epoch,
                    activated = report.activated(),
                    failures = report.failures.len(),
                    unresolved = report.unresolved.len(),
                    load_errors = report.load_errors.len(),
                    "topology rebound"
                ),
                Err(RebindError::Cancelled { phase }) => info!(epoch, phase, "rebind cancelled"),
                Err(e) => error!(epoch, error = %e, "rebind failed; serving an empty topology"),
            }
        });
    }

    async fn demoted(&self) {
        self.cancel_pass();
        self.manager.clear();
    }
}

/// A management node wired to a filesystem store
pub struct Node {
    store: Arc<dyn ObjectStore>,
    persister: Arc<MementoPersister>,
    manager: Arc<RebindManager>,
    coordinator: Arc<HaCoordinator>,
}

impl Node {
    /// Open the store and wire every component
    pub async fn open(config: &NodeConfig) -> Result<Self> {
        let fs = FsObjectStore::open(&config.store_dir)
            .await
            .wrap_err_with(|| format!("opening store {}", config.store_dir.display()))?;
        let store: Arc<dyn ObjectStore> = Arc::new(fs);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let guard = Arc::new(EpochGuard::new());

        let persister = Arc::new(MementoPersister::new(
            store.clone(),
            config.persister.clone(),
            guard.clone(),
            clock.clone(),
        )?);
        let registry = Arc::new(RebindSupportRegistry::with_defaults());
        let listener = Arc::new(
            PersistingChangeListener::new(persister.clone(), registry.clone())
                .with_custom_fields(config.rebind.custom_fields.clone()),
        );
        let context = Arc::new(ManagementContext::new(listener, Arc::new(AllowAll)));
        let manager = Arc::new(RebindManager::new(
            context,
            persister.clone(),
            Rebinder::new(registry, config.rebind.clone()),
        ));

        let coordinator = HaCoordinator::new(config.ha.clone(), store.clone(), guard, clock)?
            .with_listener(Arc::new(RebindOnPromotion::new(manager.clone())))
            .with_health(persister.subscribe_health());

        Ok(Self {
            store,
            persister,
            manager,
            coordinator: Arc::new(coordinator),
        })
    }

    /// HA coordinator
    #[must_use]
    pub fn coordinator(&self) -> &Arc<HaCoordinator> {
        &self.coordinator
    }

    /// Live topology manager
    #[must_use]
    pub fn manager(&self) -> &Arc<RebindManager> {
        &self.manager
    }

    /// Run until `shutdown` completes, then leave the plane cleanly
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let config = self.coordinator.config();
        info!(
            node = %config.node_id,
            store = %self.store.summary_name(),
            mode = %config.mode,
            priority = config.priority,
            "management node starting"
        );

        let cancel = CancellationToken::new();
        let persist_task = self.persister.start(cancel.clone());
        let ha_task = self.coordinator.start(cancel.clone());

        shutdown.await;
        info!("shutdown requested");

        cancel.cancel();
        if let Err(e) = ha_task.await {
            warn!(error = %e, "heartbeat task ended abnormally");
        }
        if let Err(e) = persist_task.await {
            warn!(error = %e, "persister task ended abnormally");
        }
        self.coordinator
            .stop()
            .await
            .wrap_err("leaving the management plane")?;
        info!(pending = self.persister.pending(), "management node stopped");
        Ok(())
    }
}
