//! CAIRN Memento Model
//!
//! Immutable, serializable snapshots of managed objects (components,
//! locations, policies) and of management nodes, plus the record envelope
//! used to store them. A memento never holds a live object: other objects
//! are referred to by id, so cyclic graphs serialize without recursion.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod delta;
pub mod encoding;
pub mod manager;
pub mod memento;
pub mod topology;
pub mod value;

pub use delta::{
    DeltaError, ManagementPlaneMementoDelta, ManagementPlaneMementoDeltaBuilder, MasterChange,
};
pub use encoding::{EncodingError, RecordHeader, RecordKind, paths};
pub use manager::{ManagerMemento, ManagerStatus};
pub use memento::{Memento, MementoBuilder, MementoKind, field_names};
pub use topology::{TopologyDelta, TopologyMemento, TopologyMementoBuilder};
pub use value::FieldValue;
