//! CAIRN Storage
//!
//! The byte-oriented store contract every persisted record goes through,
//! with in-memory and filesystem implementations, a metering decorator, and
//! an explicit compaction pass. Stores know nothing about mementos except
//! the compactor, which decodes records to decide what is garbage.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compact;
pub mod fs;
pub mod listening;
pub mod store;

pub use compact::{CompactPlan, CompactReason, CompactResult, Compactor};
pub use fs::FsObjectStore;
pub use listening::{ListeningObjectStore, StoreStats};
pub use store::{InMemoryObjectStore, ObjectStore, StoreError, StoreResult, validate_path};
