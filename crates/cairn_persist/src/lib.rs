//! CAIRN Persister
//!
//! Records mementos in an object store. Writes are queued without blocking
//! the caller, collapsed per id within a debounce window, and flushed by a
//! background task with bounded retries and per-attempt timeouts. Only a
//! node holding the current master epoch may write.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod fencing;
pub mod health;
pub mod persister;
pub mod queue;
pub mod retry;

pub use config::PersisterConfig;
pub use fencing::{EpochGuard, FenceError};
pub use health::{HealthTracker, PersistenceHealth};
pub use persister::{LoadError, LoadOutcome, MementoPersister, PersistError, PersistResult};
pub use queue::{PendingOp, WriteQueue};
pub use retry::{RetryPolicy, retry_with_timeout};
