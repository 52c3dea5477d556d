//! Live managed objects.

use crate::listener::{ChangeEvent, ChangeListener, NoopChangeListener, notify};
use cairn_core::ObjectId;
use cairn_memento::{FieldValue, MementoKind};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Where an object is in its management lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// Instantiated by rebind, not yet wired or activated
    Inert,
    /// Managed; changes are reported to the listener
    Active,
    /// Removed from management
    Unmanaged,
}

/// Mutable state of a managed object.
///
/// Kind-specific fields the common model has no slot for (a machine
/// address, a fixed-list location's machines) live in `extra` and are
/// written back unchanged on capture.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectState {
    /// Display name
    pub display_name: String,
    /// Tags
    pub tags: BTreeSet<String>,
    /// Parent component or location
    pub parent: Option<ObjectId>,
    /// Children
    pub children: BTreeSet<ObjectId>,
    /// Locations a component is deployed to
    pub locations: BTreeSet<ObjectId>,
    /// Policies attached to a component
    pub policies: BTreeSet<ObjectId>,
    /// Entity a policy is attached to
    pub entity: Option<ObjectId>,
    /// Configuration
    pub config: BTreeMap<String, FieldValue>,
    /// Sensor attributes
    pub attributes: BTreeMap<String, FieldValue>,
    /// Kind-specific fields
    pub extra: BTreeMap<String, FieldValue>,
    /// Custom fields carried by the memento this object was rebuilt from
    pub custom_fields: BTreeMap<String, FieldValue>,
    /// Unrecognised memento keys
    pub unknown: BTreeMap<String, Value>,
    /// Lifecycle
    pub lifecycle: Lifecycle,
}

impl Default for ObjectState {
    fn default() -> Self {
        Self {
            display_name: String::new(),
            tags: BTreeSet::new(),
            parent: None,
            children: BTreeSet::new(),
            locations: BTreeSet::new(),
            policies: BTreeSet::new(),
            entity: None,
            config: BTreeMap::new(),
            attributes: BTreeMap::new(),
            extra: BTreeMap::new(),
            custom_fields: BTreeMap::new(),
            unknown: BTreeMap::new(),
            lifecycle: Lifecycle::Inert,
        }
    }
}

impl ObjectState {
    /// References held in a kind-specific list field
    #[must_use]
    pub fn extra_refs(&self, field: &str) -> BTreeSet<ObjectId> {
        self.extra
            .get(field)
            .and_then(FieldValue::as_list)
            .map(|items| items.iter().filter_map(FieldValue::as_ref_id).cloned().collect())
            .unwrap_or_default()
    }

    /// Store a set of references in a kind-specific list field
    pub fn set_extra_refs(&mut self, field: &str, ids: &BTreeSet<ObjectId>) {
        self.extra.insert(field.to_string(), FieldValue::refs(ids));
    }

    /// Every id this state refers to
    #[must_use]
    pub fn references(&self) -> BTreeSet<ObjectId> {
        let mut out: BTreeSet<ObjectId> = self
            .parent
            .iter()
            .chain(self.entity.iter())
            .chain(&self.children)
            .chain(&self.locations)
            .chain(&self.policies)
            .cloned()
            .collect();
        for value in self
            .config
            .values()
            .chain(self.attributes.values())
            .chain(self.extra.values())
            .chain(self.custom_fields.values())
        {
            out.extend(value.references());
        }
        out
    }

    /// Remove every reference to an id in `gone`; returns true if anything changed
    pub fn prune_refs(&mut self, gone: &BTreeSet<ObjectId>) -> bool {
        let before = self.clone();
        if self.parent.as_ref().is_some_and(|p| gone.contains(p)) {
            self.parent = None;
        }
        if self.entity.as_ref().is_some_and(|e| gone.contains(e)) {
            self.entity = None;
        }
        for set in [&mut self.children, &mut self.locations, &mut self.policies] {
            set.retain(|id| !gone.contains(id));
        }
        for map in [
            &mut self.config,
            &mut self.attributes,
            &mut self.extra,
            &mut self.custom_fields,
        ] {
            for value in map.values_mut() {
                *value = prune_value(value, &|id: &ObjectId| !gone.contains(id));
            }
        }
        *self != before
    }
}

/// Copy of `value` with references failing `keep` removed.
///
/// A dropped list entry disappears; a dropped single reference becomes null.
pub(crate) fn prune_value(value: &FieldValue, keep: &dyn Fn(&ObjectId) -> bool) -> FieldValue {
    match value {
        FieldValue::Ref(id) if !keep(id) => FieldValue::Null,
        FieldValue::List(items) => FieldValue::List(
            items
                .iter()
                .filter(|v| v.as_ref_id().is_none_or(keep))
                .map(|v| prune_value(v, keep))
                .collect(),
        ),
        FieldValue::Record(map) => FieldValue::Record(
            map.iter()
                .map(|(k, v)| (k.clone(), prune_value(v, keep)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// A live object under management
pub struct ManagedObject {
    id: ObjectId,
    kind: MementoKind,
    type_tag: String,
    state: RwLock<ObjectState>,
    listener: RwLock<Arc<dyn ChangeListener>>,
}

impl ManagedObject {
    /// Create an inert object with no listener attached
    #[must_use]
    pub fn new(kind: MementoKind, id: ObjectId, type_tag: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            type_tag: type_tag.into(),
            state: RwLock::new(ObjectState::default()),
            listener: RwLock::new(Arc::new(NoopChangeListener)),
        })
    }

    /// Object id
    #[must_use]
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// Object kind
    #[must_use]
    pub fn kind(&self) -> MementoKind {
        self.kind
    }

    /// Type tag
    #[must_use]
    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    /// Copy of the current state
    #[must_use]
    pub fn snapshot(&self) -> ObjectState {
        self.read(ObjectState::clone)
    }

    /// Read the state under the lock
    pub fn read<R>(&self, f: impl FnOnce(&ObjectState) -> R) -> R {
        f(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Current lifecycle
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.read(|s| s.lifecycle)
    }

    /// Check if the object is active
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.lifecycle() == Lifecycle::Active
    }

    /// Change the state; an active object reports the change to its listener
    pub fn update<R>(&self, f: impl FnOnce(&mut ObjectState) -> R) -> R {
        let (result, active) = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let result = f(&mut state);
            (result, state.lifecycle == Lifecycle::Active)
        };
        if active {
            self.notify(ChangeEvent::Changed);
        }
        result
    }

    /// Change the state without notifying; used while wiring during rebind
    pub(crate) fn update_silently<R>(&self, f: impl FnOnce(&mut ObjectState) -> R) -> R {
        f(&mut self.state.write().unwrap_or_else(PoisonError::into_inner))
    }

    /// Set the display name
    pub fn set_display_name(&self, name: impl Into<String>) {
        let name = name.into();
        self.update(|s| s.display_name = name);
    }

    /// Set a config key
    pub fn set_config(&self, key: impl Into<String>, value: impl Into<FieldValue>) {
        let (key, value) = (key.into(), value.into());
        self.update(|s| s.config.insert(key, value));
    }

    /// Publish a sensor attribute
    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<FieldValue>) {
        let (key, value) = (key.into(), value.into());
        self.update(|s| s.attributes.insert(key, value));
    }

    /// Add a tag
    pub fn add_tag(&self, tag: impl Into<String>) {
        let tag = tag.into();
        self.update(|s| s.tags.insert(tag));
    }

    /// Attach the change listener
    pub fn set_listener(&self, listener: Arc<dyn ChangeListener>) {
        *self.listener.write().unwrap_or_else(PoisonError::into_inner) = listener;
    }

    /// Move to the active state without notifying
    pub(crate) fn activate(&self, listener: Arc<dyn ChangeListener>) {
        self.set_listener(listener);
        self.update_silently(|s| s.lifecycle = Lifecycle::Active);
    }

    /// Move to the unmanaged state without notifying
    pub(crate) fn deactivate(&self) {
        self.update_silently(|s| s.lifecycle = Lifecycle::Unmanaged);
    }

    /// Report an event to the attached listener
    pub fn notify(&self, event: ChangeEvent) {
        let listener = Arc::clone(&self.listener.read().unwrap_or_else(PoisonError::into_inner));
        notify(listener.as_ref(), event, self);
    }
}

impl fmt::Debug for ManagedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedObject")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("type_tag", &self.type_tag)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ListenerError;
    use std::sync::Mutex;

    fn id(s: &str) -> ObjectId {
        ObjectId::parse(s).unwrap()
    }

    #[derive(Debug, Default)]
    struct Recorder {
        events: Mutex<Vec<(ChangeEvent, ObjectId)>>,
    }

    impl ChangeListener for Recorder {
        fn on_managed(&self, object: &ManagedObject) -> Result<(), ListenerError> {
            self.events.lock().unwrap().push((ChangeEvent::Managed, object.id().clone()));
            Ok(())
        }

        fn on_unmanaged(&self, object: &ManagedObject) -> Result<(), ListenerError> {
            self.events.lock().unwrap().push((ChangeEvent::Unmanaged, object.id().clone()));
            Ok(())
        }

        fn on_changed(&self, object: &ManagedObject) -> Result<(), ListenerError> {
            // Reading state from inside the callback must not deadlock.
            let _ = object.snapshot();
            self.events.lock().unwrap().push((ChangeEvent::Changed, object.id().clone()));
            Ok(())
        }
    }

    #[test]
    fn test_inert_changes_are_silent() {
        let recorder = Arc::new(Recorder::default());
        let obj = ManagedObject::new(MementoKind::Component, id("web"), "cairn.component");
        obj.set_listener(recorder.clone());
        obj.set_display_name("Web");
        assert!(recorder.events.lock().unwrap().is_empty());

        obj.activate(recorder.clone());
        obj.set_config("port", 8080);
        obj.add_tag("prod");
        let events = recorder.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|(e, _)| *e == ChangeEvent::Changed));
    }

    #[test]
    fn test_prune_refs() {
        let mut state = ObjectState {
            parent: Some(id("gone")),
            children: [id("a"), id("gone")].into_iter().collect(),
            ..ObjectState::default()
        };
        state.config.insert(
            "peers".to_string(),
            FieldValue::List(vec![FieldValue::Ref(id("gone")), FieldValue::Ref(id("b"))]),
        );
        state.extra.insert("owner".to_string(), FieldValue::Ref(id("gone")));

        let gone: BTreeSet<_> = [id("gone")].into_iter().collect();
        assert!(state.prune_refs(&gone));
        assert_eq!(state.parent, None);
        assert_eq!(state.children, [id("a")].into_iter().collect());
        assert_eq!(
            state.config["peers"],
            FieldValue::List(vec![FieldValue::Ref(id("b"))])
        );
        assert!(state.extra["owner"].is_null());
        assert!(!state.references().contains(&id("gone")));
        assert!(!state.prune_refs(&gone));
    }

    #[test]
    fn test_extra_refs() {
        let mut state = ObjectState::default();
        let ids: BTreeSet<_> = [id("m1"), id("m2")].into_iter().collect();
        state.set_extra_refs("machines", &ids);
        assert_eq!(state.extra_refs("machines"), ids);
        assert!(state.extra_refs("missing").is_empty());
    }
}
