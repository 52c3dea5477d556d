//! Master epoch fencing.
//!
//! The HA coordinator grants the guard an epoch when this node becomes
//! master and revokes it on demotion. The persister asks for a permit before
//! each store call and stamps the epoch into the record header, so a demoted
//! node cannot finish a write it started as master, and a stale master's
//! record never replaces one written under a later epoch.

use std::sync::{PoisonError, RwLock};

/// Fencing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FenceError {
    /// This node does not hold mastership
    #[error("not master: topology writes are fenced")]
    NotMaster,

    /// The stored record was written under a later epoch
    #[error("stale epoch {ours}: record written under epoch {stored}")]
    StaleEpoch {
        /// Epoch held by this node
        ours: u64,
        /// Epoch stamped on the stored record
        stored: u64,
    },
}

#[derive(Debug, Clone, Copy, Default)]
struct GuardState {
    epoch: u64,
    granted: bool,
}

/// Holds the epoch this node may write under, if any
#[derive(Debug, Default)]
pub struct EpochGuard {
    state: RwLock<GuardState>,
}

impl EpochGuard {
    /// Create a guard with no grant
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a guard already granted `epoch`; for single-node deployments
    #[must_use]
    pub fn granted(epoch: u64) -> Self {
        Self {
            state: RwLock::new(GuardState {
                epoch,
                granted: true,
            }),
        }
    }

    /// Allow writes under `epoch`; an epoch lower than one already seen is ignored
    pub fn grant(&self, epoch: u64) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if epoch >= state.epoch {
            state.epoch = epoch;
            state.granted = true;
        }
    }

    /// Stop allowing writes
    pub fn revoke(&self) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .granted = false;
    }

    /// Highest epoch ever granted
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.state.read().unwrap_or_else(PoisonError::into_inner).epoch
    }

    /// Check if writes are allowed
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.state.read().unwrap_or_else(PoisonError::into_inner).granted
    }

    /// Epoch to stamp on a write
    ///
    /// # Errors
    ///
    /// Returns [`FenceError::NotMaster`] if no grant is held
    pub fn permit(&self) -> Result<u64, FenceError> {
        let state = *self.state.read().unwrap_or_else(PoisonError::into_inner);
        if state.granted {
            Ok(state.epoch)
        } else {
            Err(FenceError::NotMaster)
        }
    }

    /// Check a write under `ours` against a stored record's epoch
    ///
    /// # Errors
    ///
    /// Returns [`FenceError::StaleEpoch`] if the stored record is newer
    pub fn check_overwrite(ours: u64, stored: u64) -> Result<(), FenceError> {
        if stored > ours {
            Err(FenceError::StaleEpoch { ours, stored })
        } else {
            Ok(())
        }
    }
}
