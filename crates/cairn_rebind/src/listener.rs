//! Change listeners.
//!
//! Every managed object reports lifecycle and state changes to one listener.
//! The persisting listener turns each report into a memento write; in a
//! standby the writes are fenced and silently dropped.

use crate::object::ManagedObject;
use crate::support::{RebindFailure, RebindSupportRegistry};
use cairn_memento::FieldValue;
use cairn_persist::{MementoPersister, PersistError};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// What happened to an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeEvent {
    /// Came under management
    Managed,
    /// Left management
    Unmanaged,
    /// State changed while managed
    Changed,
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Managed => write!(f, "managed"),
            Self::Unmanaged => write!(f, "unmanaged"),
            Self::Changed => write!(f, "changed"),
        }
    }
}

/// Listener failures; reported in the log and never to the caller that made the change
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ListenerError {
    /// The object could not be captured
    #[error("capture failed: {0}")]
    Capture(#[from] RebindFailure),

    /// The capture could not be queued
    #[error("persist failed: {0}")]
    Persist(#[from] PersistError),
}

/// Receives change reports from managed objects
pub trait ChangeListener: Send + Sync + fmt::Debug {
    /// The object came under management
    ///
    /// # Errors
    ///
    /// Returns error if the change could not be recorded
    fn on_managed(&self, object: &ManagedObject) -> Result<(), ListenerError>;

    /// The object left management
    ///
    /// # Errors
    ///
    /// Returns error if the change could not be recorded
    fn on_unmanaged(&self, object: &ManagedObject) -> Result<(), ListenerError>;

    /// The object's state changed
    ///
    /// # Errors
    ///
    /// Returns error if the change could not be recorded
    fn on_changed(&self, object: &ManagedObject) -> Result<(), ListenerError>;
}

/// Dispatch an event; failures are logged and swallowed
pub fn notify(listener: &dyn ChangeListener, event: ChangeEvent, object: &ManagedObject) {
    let result = match event {
        ChangeEvent::Managed => listener.on_managed(object),
        ChangeEvent::Unmanaged => listener.on_unmanaged(object),
        ChangeEvent::Changed => listener.on_changed(object),
    };
    if let Err(error) = result {
        warn!(id = %object.id(), %event, %error, "change listener failed");
    }
}

/// Ignores every change
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopChangeListener;

impl ChangeListener for NoopChangeListener {
    fn on_managed(&self, _: &ManagedObject) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_unmanaged(&self, _: &ManagedObject) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_changed(&self, _: &ManagedObject) -> Result<(), ListenerError> {
        Ok(())
    }
}

/// Captures changed objects and queues them with the persister
#[derive(Debug)]
pub struct PersistingChangeListener {
    persister: Arc<MementoPersister>,
    supports: Arc<RebindSupportRegistry>,
    custom_fields: BTreeMap<String, FieldValue>,
}

impl PersistingChangeListener {
    /// Create a listener
    #[must_use]
    pub fn new(persister: Arc<MementoPersister>, supports: Arc<RebindSupportRegistry>) -> Self {
        Self {
            persister,
            supports,
            custom_fields: BTreeMap::new(),
        }
    }

    /// Merge these constant fields into every capture
    #[must_use]
    pub fn with_custom_fields(mut self, fields: BTreeMap<String, FieldValue>) -> Self {
        self.custom_fields = fields;
        self
    }

    fn write(&self, object: &ManagedObject) -> Result<(), ListenerError> {
        let memento = self.supports.capture(object, &self.custom_fields)?;
        self.queued(object, self.persister.write(memento))
    }

    fn queued(&self, object: &ManagedObject, result: Result<(), PersistError>) -> Result<(), ListenerError> {
        match result {
            Err(PersistError::Fenced(reason)) => {
                debug!(id = %object.id(), %reason, "change not persisted");
                Ok(())
            }
            other => other.map_err(ListenerError::from),
        }
    }
}

impl ChangeListener for PersistingChangeListener {
    fn on_managed(&self, object: &ManagedObject) -> Result<(), ListenerError> {
        self.write(object)
    }

    fn on_unmanaged(&self, object: &ManagedObject) -> Result<(), ListenerError> {
        self.queued(object, self.persister.delete(object.id()))
    }

    fn on_changed(&self, object: &ManagedObject) -> Result<(), ListenerError> {
        self.write(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::{ManualClock, ObjectId, Timestamp};
    use cairn_memento::MementoKind;
    use cairn_persist::{EpochGuard, PersisterConfig};
    use cairn_storage::InMemoryObjectStore;

    fn id(s: &str) -> ObjectId {
        ObjectId::parse(s).unwrap()
    }

    fn setup(guard: EpochGuard) -> (Arc<MementoPersister>, PersistingChangeListener) {
        let store = Arc::new(InMemoryObjectStore::new());
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
        let persister = Arc::new(
            MementoPersister::new(store, PersisterConfig::new(), Arc::new(guard), clock).unwrap(),
        );
        let listener = PersistingChangeListener::new(
            persister.clone(),
            Arc::new(RebindSupportRegistry::with_defaults()),
        );
        (persister, listener)
    }

    #[test]
    fn test_changes_queue_writes() {
        let (persister, listener) = setup(EpochGuard::granted(1));
        let listener = Arc::new(listener);
        let web = ManagedObject::new(MementoKind::Component, id("web"), "cairn.component");
        web.activate(listener.clone());
        web.set_display_name("Web");
        web.set_config("port", 8080);
        assert_eq!(persister.pending(), 1);

        notify(listener.as_ref(), ChangeEvent::Unmanaged, &web);
        assert_eq!(persister.pending(), 1);
    }

    #[test]
    fn test_standby_swallows_fenced_writes() {
        let (persister, listener) = setup(EpochGuard::new());
        let web = ManagedObject::new(MementoKind::Component, id("web"), "cairn.component");
        assert_eq!(listener.on_changed(&web), Ok(()));
        assert_eq!(listener.on_unmanaged(&web), Ok(()));
        assert_eq!(persister.pending(), 0);
    }

    #[test]
    fn test_unknown_type_fails_capture() {
        let (persister, listener) = setup(EpochGuard::granted(1));
        let odd = ManagedObject::new(MementoKind::Component, id("odd"), "vendor.mystery");
        assert!(matches!(
            listener.on_changed(&odd),
            Err(ListenerError::Capture(RebindFailure::UnknownType { .. }))
        ));
        // The failure is logged, not raised to the object.
        notify(&listener, ChangeEvent::Changed, &odd);
        assert_eq!(persister.pending(), 0);
    }
}
