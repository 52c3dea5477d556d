//! Persistence health, observable by the HA coordinator and operators.

use cairn_core::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

/// Whether persistence is keeping up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PersistenceHealth {
    /// Writes are succeeding
    Healthy,
    /// Writes exhausted their retries; the live system keeps running in memory
    Degraded {
        /// Last failure
        reason: String,
        /// When the persister first gave up
        since: Timestamp,
    },
}

impl PersistenceHealth {
    /// Check if degraded
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

/// Publishes health transitions to any number of watchers
#[derive(Debug)]
pub struct HealthTracker {
    tx: watch::Sender<PersistenceHealth>,
}

impl HealthTracker {
    /// Create a tracker starting healthy
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(PersistenceHealth::Healthy);
        Self { tx }
    }

    /// Current health
    #[must_use]
    pub fn current(&self) -> PersistenceHealth {
        self.tx.borrow().clone()
    }

    /// Watch health changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PersistenceHealth> {
        self.tx.subscribe()
    }

    /// Record a failure; keeps the original `since` if already degraded
    pub fn mark_degraded(&self, reason: impl Into<String>, now: Timestamp) {
        let reason = reason.into();
        self.tx.send_if_modified(|health| match health {
            PersistenceHealth::Healthy => {
                warn!(%reason, "persistence degraded");
                *health = PersistenceHealth::Degraded { reason, since: now };
                true
            }
            PersistenceHealth::Degraded { reason: last, .. } => {
                *last = reason;
                false
            }
        });
    }

    /// Record recovery
    pub fn mark_healthy(&self) {
        self.tx.send_if_modified(|health| {
            if health.is_degraded() {
                info!("persistence recovered");
                *health = PersistenceHealth::Healthy;
                true
            } else {
                false
            }
        });
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}
