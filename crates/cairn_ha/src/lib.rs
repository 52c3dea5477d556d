//! CAIRN HA
//!
//! Elects one master among management nodes sharing a store. Every node
//! writes a heartbeat record on a fixed interval and reads its peers'
//! records and the master record. With no live master, the fresh candidate
//! with the highest priority (then lowest node id) promotes itself.
//!
//! The election is a lease, not consensus: two nodes may briefly both
//! believe they are master. Each promotion bumps a master epoch, which the
//! persister stamps on every memento write, so the stale master's writes are
//! refused once it has been superseded.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod coordinator;
pub mod election;
pub mod record;
pub mod sync;

pub use config::{HaConfig, HaMode};
pub use coordinator::{HaCoordinator, HaError, NoopPromotionListener, PromotionListener};
pub use election::{choose_master, has_authority_over, live_master};
pub use record::{ManagementPlaneSyncRecord, MasterRecord};
pub use sync::SyncRecordPersister;
