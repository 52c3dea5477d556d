//! CAIRN Rebind
//!
//! Live managed objects, the change listener that captures them into
//! mementos, and the two-phase rebind that rebuilds the live graph from
//! mementos after a restart or failover.
//!
//! Rebind runs in two phases. Every memento is first instantiated as an
//! inert object and registered by id; only then is each object wired, so
//! any reference (including cyclic ones) can be resolved. Objects are then
//! activated parents-first.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod context;
pub mod listener;
pub mod manager;
pub mod object;
pub mod provision;
pub mod rebinder;
pub mod support;

pub use context::{RebindContext, UnresolvedReference};
pub use listener::{
    ChangeEvent, ChangeListener, ListenerError, NoopChangeListener, PersistingChangeListener,
    notify,
};
pub use manager::{ManageError, ManagementContext, RebindManager};
pub use object::{Lifecycle, ManagedObject, ObjectState};
pub use provision::{FixedListProvisioner, Machine, MachineProvisioner, ProvisionError, ProvisionFlags};
pub use rebinder::{RebindConfig, RebindError, RebindOutcome, RebindReport, Rebinder};
pub use support::{
    FieldShape, FieldTableSupport, FixedListLocationSupport, RebindFailure, RebindSupport,
    RebindSupportRegistry, capture, reconstruct, type_tags,
};
