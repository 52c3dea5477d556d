//! CAIRN deterministic HA simulation
//!
//! Runs several HA coordinators against one shared in-memory store with a
//! manual clock. Node order within a round, and any random failures, come
//! from a seed, so every run can be replayed exactly.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod failure;
pub mod harness;
pub mod record;
pub mod seed;

pub use failure::{FailureEvent, FailureKind, FailureModel, FailureSchedule, PartitionedStore};
pub use harness::{SimConfig, SimHarness, SimResult};
pub use record::{Promotion, SimEvent, SimEventKind, SimRecord};
pub use seed::{SeedStream, SimSeed};
