//! Per-type rebind supports.
//!
//! A support knows how to instantiate, wire, and capture objects of one
//! type tag. The common fields (display name, tags, parent and children,
//! locations, policies, config, attributes) are handled by [`capture`] and
//! [`reconstruct`]; a support only adds what is specific to its type.

use crate::context::RebindContext;
use crate::object::{ManagedObject, ObjectState, prune_value};
use cairn_core::ObjectId;
use cairn_memento::{FieldValue, Memento, MementoBuilder, MementoKind, field_names};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Type tags of the built-in supports
pub mod type_tags {
    /// Top-level application
    pub const APPLICATION: &str = "cairn.application";
    /// Generic component
    pub const COMPONENT: &str = "cairn.component";
    /// Location handing out machines from a fixed list
    pub const FIXED_LIST_LOCATION: &str = "cairn.location.fixed-list";
    /// A single machine
    pub const MACHINE_LOCATION: &str = "cairn.location.machine";
    /// Policy attached to one entity
    pub const BASIC_POLICY: &str = "cairn.policy.basic";
}

/// Why one object could not be rebound or captured
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RebindFailure {
    /// Memento has no type tag
    #[error("{id}: empty type tag")]
    EmptyTypeTag {
        /// Object id
        id: ObjectId,
    },

    /// No support registered for the type tag
    #[error("{id}: no rebind support for type {type_tag}")]
    UnknownType {
        /// Object id
        id: ObjectId,
        /// Unrecognised type tag
        type_tag: String,
    },

    /// Memento kind disagrees with the support's kind
    #[error("{id}: type {type_tag} is a {expected}, memento is a {found}")]
    KindMismatch {
        /// Object id
        id: ObjectId,
        /// Type tag
        type_tag: String,
        /// Kind the support handles
        expected: MementoKind,
        /// Kind recorded in the memento
        found: MementoKind,
    },

    /// A field the type requires is absent
    #[error("{id}: required field {field} is missing")]
    MissingField {
        /// Object id
        id: ObjectId,
        /// Field name
        field: String,
    },

    /// A field holds the wrong shape of value
    #[error("{id}: field {field} should be {expected}")]
    WrongFieldType {
        /// Object id
        id: ObjectId,
        /// Field name
        field: String,
        /// Expected shape
        expected: &'static str,
    },

    /// The object is part of a parent or attachment cycle
    #[error("{id}: dependency cycle")]
    Cycle {
        /// Object id
        id: ObjectId,
    },

    /// Type-specific failure
    #[error("{id}: {reason}")]
    Invalid {
        /// Object id
        id: ObjectId,
        /// Description
        reason: String,
    },
}

impl RebindFailure {
    /// Id of the object that failed
    #[must_use]
    pub fn id(&self) -> &ObjectId {
        match self {
            Self::EmptyTypeTag { id }
            | Self::UnknownType { id, .. }
            | Self::KindMismatch { id, .. }
            | Self::MissingField { id, .. }
            | Self::WrongFieldType { id, .. }
            | Self::Cycle { id }
            | Self::Invalid { id, .. } => id,
        }
    }

    fn wrong_type(id: &ObjectId, field: &str, expected: &'static str) -> Self {
        Self::WrongFieldType {
            id: id.clone(),
            field: field.to_string(),
            expected,
        }
    }
}

/// Rebind behaviour for one type tag
pub trait RebindSupport: Send + Sync + fmt::Debug {
    /// Type tag handled
    fn type_tag(&self) -> &str;

    /// Kind of object handled
    fn kind(&self) -> MementoKind;

    /// Check type-specific fields before instantiation
    ///
    /// # Errors
    ///
    /// Returns a failure if a required field is missing or malformed
    fn validate(&self, memento: &Memento) -> Result<(), RebindFailure> {
        let _ = memento;
        Ok(())
    }

    /// Create an inert object carrying only identity
    ///
    /// # Errors
    ///
    /// Returns a failure if the memento is not of this support's kind or
    /// does not validate
    fn instantiate(&self, memento: &Memento) -> Result<Arc<ManagedObject>, RebindFailure> {
        if memento.kind != self.kind() {
            return Err(RebindFailure::KindMismatch {
                id: memento.id.clone(),
                type_tag: memento.type_tag.clone(),
                expected: self.kind(),
                found: memento.kind,
            });
        }
        self.validate(memento)?;
        Ok(ManagedObject::new(
            memento.kind,
            memento.id.clone(),
            memento.type_tag.clone(),
        ))
    }

    /// Type-specific wiring after the common fields are restored
    ///
    /// # Errors
    ///
    /// Returns a failure if the object cannot be wired
    fn reconstruct_extra(
        &self,
        context: &mut RebindContext,
        memento: &Memento,
        state: &mut ObjectState,
    ) -> Result<(), RebindFailure> {
        let _ = (context, memento, state);
        Ok(())
    }

    /// Type-specific additions to a capture
    ///
    /// # Errors
    ///
    /// Returns a failure if the state cannot be captured
    fn capture_extra(
        &self,
        state: &ObjectState,
        builder: MementoBuilder,
    ) -> Result<MementoBuilder, RebindFailure> {
        let _ = state;
        Ok(builder)
    }
}

/// Expected shape of a type-specific field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldShape {
    /// Text
    Text,
    /// Single reference
    Ref,
    /// List of references
    RefList,
}

impl FieldShape {
    fn describe(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Ref => "a reference",
            Self::RefList => "a list of references",
        }
    }

    fn matches(self, value: &FieldValue) -> bool {
        match self {
            Self::Text => value.as_str().is_some(),
            Self::Ref => value.as_ref_id().is_some(),
            Self::RefList => value
                .as_list()
                .is_some_and(|items| items.iter().all(|v| v.as_ref_id().is_some())),
        }
    }
}

/// Support described by the fields it requires
#[derive(Debug, Clone)]
pub struct FieldTableSupport {
    type_tag: &'static str,
    kind: MementoKind,
    required: &'static [(&'static str, FieldShape)],
    optional: &'static [(&'static str, FieldShape)],
}

impl FieldTableSupport {
    /// Create a support
    #[must_use]
    pub const fn new(
        type_tag: &'static str,
        kind: MementoKind,
        required: &'static [(&'static str, FieldShape)],
        optional: &'static [(&'static str, FieldShape)],
    ) -> Self {
        Self {
            type_tag,
            kind,
            required,
            optional,
        }
    }
}

impl RebindSupport for FieldTableSupport {
    fn type_tag(&self) -> &str {
        self.type_tag
    }

    fn kind(&self) -> MementoKind {
        self.kind
    }

    fn validate(&self, memento: &Memento) -> Result<(), RebindFailure> {
        for &(field, shape) in self.required {
            match memento.field(field) {
                None | Some(FieldValue::Null) => {
                    return Err(RebindFailure::MissingField {
                        id: memento.id.clone(),
                        field: field.to_string(),
                    });
                }
                Some(value) if !shape.matches(value) => {
                    return Err(RebindFailure::wrong_type(&memento.id, field, shape.describe()));
                }
                Some(_) => {}
            }
        }
        for &(field, shape) in self.optional {
            let malformed = memento
                .field(field)
                .is_some_and(|value| !value.is_null() && !shape.matches(value));
            if malformed {
                return Err(RebindFailure::wrong_type(&memento.id, field, shape.describe()));
            }
        }
        Ok(())
    }
}

/// Fixed-list location; machines in use must be members of the list
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedListLocationSupport;

impl FixedListLocationSupport {
    const FIELDS: FieldTableSupport = FieldTableSupport::new(
        type_tags::FIXED_LIST_LOCATION,
        MementoKind::Location,
        &[(field_names::MACHINES, FieldShape::RefList)],
        &[(field_names::IN_USE, FieldShape::RefList)],
    );
}

impl RebindSupport for FixedListLocationSupport {
    fn type_tag(&self) -> &str {
        type_tags::FIXED_LIST_LOCATION
    }

    fn kind(&self) -> MementoKind {
        MementoKind::Location
    }

    fn validate(&self, memento: &Memento) -> Result<(), RebindFailure> {
        Self::FIELDS.validate(memento)
    }

    fn reconstruct_extra(
        &self,
        _: &mut RebindContext,
        memento: &Memento,
        state: &mut ObjectState,
    ) -> Result<(), RebindFailure> {
        let machines = state.extra_refs(field_names::MACHINES);
        let in_use = state.extra_refs(field_names::IN_USE);
        let stray: BTreeSet<_> = in_use.difference(&machines).cloned().collect();
        if !stray.is_empty() {
            warn!(id = %memento.id, ?stray, "releasing in-use machines not in the machine list");
            let kept = in_use.intersection(&machines).cloned().collect();
            state.set_extra_refs(field_names::IN_USE, &kept);
        }
        Ok(())
    }

    fn capture_extra(
        &self,
        state: &ObjectState,
        builder: MementoBuilder,
    ) -> Result<MementoBuilder, RebindFailure> {
        let in_use = state.extra_refs(field_names::IN_USE);
        Ok(builder.field(field_names::IN_USE, FieldValue::refs(&in_use)))
    }
}

/// Supports by type tag
#[derive(Debug, Default)]
pub struct RebindSupportRegistry {
    supports: BTreeMap<String, Arc<dyn RebindSupport>>,
}

impl RebindSupportRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in types
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(FieldTableSupport::new(
            type_tags::APPLICATION,
            MementoKind::Component,
            &[],
            &[],
        )));
        registry.register(Arc::new(FieldTableSupport::new(
            type_tags::COMPONENT,
            MementoKind::Component,
            &[],
            &[],
        )));
        registry.register(Arc::new(FieldTableSupport::new(
            type_tags::MACHINE_LOCATION,
            MementoKind::Location,
            &[(field_names::ADDRESS, FieldShape::Text)],
            &[],
        )));
        registry.register(Arc::new(FixedListLocationSupport));
        registry.register(Arc::new(FieldTableSupport::new(
            type_tags::BASIC_POLICY,
            MementoKind::Policy,
            &[(field_names::ENTITY, FieldShape::Ref)],
            &[],
        )));
        registry
    }

    /// Register a support; returns the one it replaced
    pub fn register(&mut self, support: Arc<dyn RebindSupport>) -> Option<Arc<dyn RebindSupport>> {
        self.supports.insert(support.type_tag().to_string(), support)
    }

    /// Support for a type tag
    #[must_use]
    pub fn get(&self, type_tag: &str) -> Option<&Arc<dyn RebindSupport>> {
        self.supports.get(type_tag)
    }

    /// Support for an object's type tag
    ///
    /// # Errors
    ///
    /// Returns a failure if the tag is empty or unregistered
    pub fn lookup(&self, id: &ObjectId, type_tag: &str) -> Result<&Arc<dyn RebindSupport>, RebindFailure> {
        if type_tag.is_empty() {
            return Err(RebindFailure::EmptyTypeTag { id: id.clone() });
        }
        self.get(type_tag).ok_or_else(|| RebindFailure::UnknownType {
            id: id.clone(),
            type_tag: type_tag.to_string(),
        })
    }

    /// Registered type tags
    pub fn type_tags(&self) -> impl Iterator<Item = &str> {
        self.supports.keys().map(String::as_str)
    }

    /// Capture an object with the support for its type
    ///
    /// # Errors
    ///
    /// Returns a failure if no support is registered or capture fails
    pub fn capture(
        &self,
        object: &ManagedObject,
        custom_fields: &BTreeMap<String, FieldValue>,
    ) -> Result<Memento, RebindFailure> {
        let support = self.lookup(object.id(), object.type_tag())?;
        capture(support.as_ref(), object, custom_fields)
    }
}

/// Capture an object's current state as a memento.
///
/// `custom_fields` are merged over the custom fields the object carries.
///
/// # Errors
///
/// Returns a failure if the object is not of the support's kind or the
/// support cannot capture it
pub fn capture(
    support: &dyn RebindSupport,
    object: &ManagedObject,
    custom_fields: &BTreeMap<String, FieldValue>,
) -> Result<Memento, RebindFailure> {
    if object.kind() != support.kind() {
        return Err(RebindFailure::KindMismatch {
            id: object.id().clone(),
            type_tag: object.type_tag().to_string(),
            expected: support.kind(),
            found: object.kind(),
        });
    }
    let state = object.snapshot();
    let mut builder = Memento::builder(object.kind(), object.id().clone(), object.type_tag())
        .display_name(state.display_name.clone())
        .tags(state.tags.iter().cloned());

    if let Some(parent) = &state.parent {
        builder = builder.field(field_names::PARENT, parent.clone());
    }
    if let Some(entity) = &state.entity {
        builder = builder.field(field_names::ENTITY, entity.clone());
    }
    for (name, ids) in [
        (field_names::CHILDREN, &state.children),
        (field_names::LOCATIONS, &state.locations),
        (field_names::POLICIES, &state.policies),
    ] {
        if !ids.is_empty() {
            builder = builder.field(name, FieldValue::refs(ids));
        }
    }
    for (name, map) in [
        (field_names::CONFIG, &state.config),
        (field_names::ATTRIBUTES, &state.attributes),
    ] {
        if !map.is_empty() {
            builder = builder.field(name, FieldValue::Record(map.clone()));
        }
    }
    for (name, value) in &state.extra {
        builder = builder.field(name.clone(), value.clone());
    }
    builder = builder
        .custom_fields(&state.custom_fields)
        .custom_fields(custom_fields)
        .unknown(state.unknown.clone());

    support.capture_extra(&state, builder).map(MementoBuilder::build)
}

const COMMON_FIELDS: [&str; 7] = [
    field_names::PARENT,
    field_names::CHILDREN,
    field_names::LOCATIONS,
    field_names::POLICIES,
    field_names::ENTITY,
    field_names::CONFIG,
    field_names::ATTRIBUTES,
];

fn optional_ref(memento: &Memento, field: &str) -> Result<Option<ObjectId>, RebindFailure> {
    match memento.field(field) {
        None | Some(FieldValue::Null) => Ok(None),
        Some(FieldValue::Ref(id)) => Ok(Some(id.clone())),
        Some(_) => Err(RebindFailure::wrong_type(&memento.id, field, "a reference")),
    }
}

fn ref_set(memento: &Memento, field: &str) -> Result<BTreeSet<ObjectId>, RebindFailure> {
    match memento.field(field) {
        None | Some(FieldValue::Null) => Ok(BTreeSet::new()),
        Some(value) if FieldShape::RefList.matches(value) => Ok(memento.ref_list(field).into_iter().collect()),
        Some(_) => Err(RebindFailure::wrong_type(&memento.id, field, "a list of references")),
    }
}

fn resolved_set(
    context: &mut RebindContext,
    memento: &Memento,
    field: &str,
    kind: MementoKind,
) -> Result<BTreeSet<ObjectId>, RebindFailure> {
    Ok(ref_set(memento, field)?
        .into_iter()
        .filter(|target| context.resolve(&memento.id, field, target, Some(kind)))
        .collect())
}

fn record(memento: &Memento, field: &str) -> Result<BTreeMap<String, FieldValue>, RebindFailure> {
    match memento.field(field) {
        None | Some(FieldValue::Null) => Ok(BTreeMap::new()),
        Some(value) => value
            .as_record()
            .cloned()
            .ok_or_else(|| RebindFailure::wrong_type(&memento.id, field, "a record")),
    }
}

/// Restore a value, dropping references that do not resolve
fn resolve_value(context: &mut RebindContext, owner: &ObjectId, field: &str, value: &FieldValue) -> FieldValue {
    let missing: BTreeSet<ObjectId> = value
        .references()
        .into_iter()
        .filter(|target| !context.resolve(owner, field, target, None))
        .collect();
    if missing.is_empty() {
        value.clone()
    } else {
        prune_value(value, &|id: &ObjectId| !missing.contains(id))
    }
}

fn resolve_map(
    context: &mut RebindContext,
    owner: &ObjectId,
    field: &str,
    map: &BTreeMap<String, FieldValue>,
) -> BTreeMap<String, FieldValue> {
    map.iter()
        .map(|(key, value)| {
            let path = format!("{}.{}", field, key);
            (key.clone(), resolve_value(context, owner, &path, value))
        })
        .collect()
}

/// Wire an instantiated object from its memento.
///
/// Every reference is resolved through the context; references to objects
/// that are not present are recorded and dropped. Applying the same memento
/// twice leaves the object unchanged.
///
/// # Errors
///
/// Returns a failure if a common field is malformed or the support's own
/// wiring fails
pub fn reconstruct(
    support: &dyn RebindSupport,
    context: &mut RebindContext,
    object: &ManagedObject,
    memento: &Memento,
) -> Result<(), RebindFailure> {
    let id = &memento.id;
    let own_kind = memento.kind;
    let (parent_kind, entity_kind) = (Some(own_kind), Some(MementoKind::Component));

    let parent = optional_ref(memento, field_names::PARENT)?
        .filter(|p| context.resolve(id, field_names::PARENT, p, parent_kind));
    let entity = optional_ref(memento, field_names::ENTITY)?
        .filter(|e| context.resolve(id, field_names::ENTITY, e, entity_kind));

    let children = resolved_set(context, memento, field_names::CHILDREN, own_kind)?;
    let locations = resolved_set(context, memento, field_names::LOCATIONS, MementoKind::Location)?;
    let policies = resolved_set(context, memento, field_names::POLICIES, MementoKind::Policy)?;

    let config = record(memento, field_names::CONFIG)?;
    let attributes = record(memento, field_names::ATTRIBUTES)?;
    let config = resolve_map(context, id, field_names::CONFIG, &config);
    let attributes = resolve_map(context, id, field_names::ATTRIBUTES, &attributes);

    let extra: BTreeMap<String, FieldValue> = memento
        .fields
        .iter()
        .filter(|(name, _)| !COMMON_FIELDS.contains(&name.as_str()))
        .map(|(name, value)| (name.clone(), resolve_value(context, id, name, value)))
        .collect();
    let custom_fields = resolve_map(context, id, "customFields", &memento.custom_fields);

    let mut state = object.snapshot();
    state.display_name = memento.display_name.clone();
    state.tags = memento.tags.clone();
    state.parent = parent;
    state.entity = entity;
    state.children = children;
    state.locations = locations;
    state.policies = policies;
    state.config = config;
    state.attributes = attributes;
    state.extra = extra;
    state.custom_fields = custom_fields;
    state.unknown = memento.unknown.clone();

    support.reconstruct_extra(context, memento, &mut state)?;
    object.update_silently(|current| {
        let lifecycle = current.lifecycle;
        *current = state;
        current.lifecycle = lifecycle;
    });
    Ok(())
}
