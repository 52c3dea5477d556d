//! CAIRN Core Types
//!
//! Pure types shared by every crate in the workspace: identifiers, wall-clock
//! timestamps with an injectable clock, platform versions, and checksums.
//! Nothing in this crate performs I/O.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod hash;
pub mod id;
pub mod time;
pub mod version;

// Re-exports
pub use error::{CoreError, CoreResult};
pub use hash::{Checksum, HashError};
pub use id::{NodeId, ObjectId};
pub use time::{Clock, ManualClock, SystemClock, Timestamp};
pub use version::{Version, VersionError};
