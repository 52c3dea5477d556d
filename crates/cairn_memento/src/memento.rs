//! Snapshots of managed objects.

use crate::value::FieldValue;
use cairn_core::{ObjectId, Version};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Well-known field names shared by the built-in rebind supports
pub mod field_names {
    /// Parent component or location
    pub const PARENT: &str = "parent";
    /// Child components or locations
    pub const CHILDREN: &str = "children";
    /// Locations a component is deployed to
    pub const LOCATIONS: &str = "locations";
    /// Policies attached to a component
    pub const POLICIES: &str = "policies";
    /// Entity a policy is attached to
    pub const ENTITY: &str = "entity";
    /// Configuration keys
    pub const CONFIG: &str = "config";
    /// Sensor attributes published by a component
    pub const ATTRIBUTES: &str = "attributes";
    /// Machine address of a machine location
    pub const ADDRESS: &str = "address";
    /// Machines owned by a fixed-list location
    pub const MACHINES: &str = "machines";
    /// Machines currently handed out by a fixed-list location
    pub const IN_USE: &str = "inUse";
}

/// Kind of managed object a memento describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MementoKind {
    /// Application or application component
    Component,
    /// Location, including machines
    Location,
    /// Policy attached to a component
    Policy,
}

impl MementoKind {
    /// All kinds
    pub const ALL: [MementoKind; 3] = [Self::Component, Self::Location, Self::Policy];

    /// Lowercase name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Component => "component",
            Self::Location => "location",
            Self::Policy => "policy",
        }
    }
}

impl fmt::Display for MementoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable snapshot of one managed object.
///
/// Keys not recognised by this version are kept in `unknown` and written
/// back unchanged, so a record written by a newer node survives a round trip
/// through an older one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memento {
    /// Object kind
    pub kind: MementoKind,
    /// Object id
    pub id: ObjectId,
    /// Concrete type tag selecting the rebind support
    #[serde(rename = "type")]
    pub type_tag: String,
    /// Display name
    #[serde(default)]
    pub display_name: String,
    /// Tags
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    /// Platform version of the writer
    #[serde(default)]
    pub platform_version: Version,
    /// Kind-specific fields
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, FieldValue>,
    /// Constant extra fields supplied by configuration
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_fields: BTreeMap<String, FieldValue>,
    /// Unrecognised top-level keys, preserved opaquely
    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

impl Memento {
    /// Start building a memento
    #[must_use]
    pub fn builder(kind: MementoKind, id: ObjectId, type_tag: impl Into<String>) -> MementoBuilder {
        MementoBuilder::new(kind, id, type_tag)
    }

    /// Look up a kind-specific field
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Single reference stored in a field
    #[must_use]
    pub fn ref_field(&self, name: &str) -> Option<&ObjectId> {
        self.field(name).and_then(FieldValue::as_ref_id)
    }

    /// References stored as a list in a field; non-reference entries are skipped
    #[must_use]
    pub fn ref_list(&self, name: &str) -> Vec<ObjectId> {
        self.field(name)
            .and_then(FieldValue::as_list)
            .map(|items| items.iter().filter_map(FieldValue::as_ref_id).cloned().collect())
            .unwrap_or_default()
    }

    /// Every id this memento refers to, in fields and custom fields
    #[must_use]
    pub fn references(&self) -> BTreeSet<ObjectId> {
        let mut out = BTreeSet::new();
        for value in self.fields.values().chain(self.custom_fields.values()) {
            value.collect_references(&mut out);
        }
        out
    }
}

/// Builder for [`Memento`]
#[derive(Debug, Clone)]
pub struct MementoBuilder {
    memento: Memento,
}

impl MementoBuilder {
    /// Create a builder with the required identity fields
    #[must_use]
    pub fn new(kind: MementoKind, id: ObjectId, type_tag: impl Into<String>) -> Self {
        Self {
            memento: Memento {
                kind,
                id,
                type_tag: type_tag.into(),
                display_name: String::new(),
                tags: BTreeSet::new(),
                platform_version: Version::current(),
                fields: BTreeMap::new(),
                custom_fields: BTreeMap::new(),
                unknown: BTreeMap::new(),
            },
        }
    }

    /// Set display name
    #[must_use]
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.memento.display_name = name.into();
        self
    }

    /// Add a tag
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.memento.tags.insert(tag.into());
        self
    }

    /// Replace all tags
    #[must_use]
    pub fn tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.memento.tags = tags.into_iter().collect();
        self
    }

    /// Set a kind-specific field
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.memento.fields.insert(name.into(), value.into());
        self
    }

    /// Set a custom field
    #[must_use]
    pub fn custom_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.memento.custom_fields.insert(name.into(), value.into());
        self
    }

    /// Merge custom fields; existing keys are overwritten
    #[must_use]
    pub fn custom_fields(mut self, fields: &BTreeMap<String, FieldValue>) -> Self {
        self.memento
            .custom_fields
            .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Carry unrecognised keys forward
    #[must_use]
    pub fn unknown(mut self, unknown: BTreeMap<String, Value>) -> Self {
        self.memento.unknown = unknown;
        self
    }

    /// Override the platform version stamp
    #[must_use]
    pub fn platform_version(mut self, version: Version) -> Self {
        self.memento.platform_version = version;
        self
    }

    /// Finish
    #[must_use]
    pub fn build(self) -> Memento {
        self.memento
    }
}
