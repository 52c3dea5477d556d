//! Aggregate snapshot of a whole managed topology.

use crate::memento::{Memento, MementoKind, field_names};
use cairn_core::{ObjectId, Version};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Every memento of a topology, grouped by kind.
///
/// Application ids are the components with no parent; top-level location ids
/// are the locations with no parent. Both are recomputed on every change.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyMemento {
    /// Platform version of the writer
    pub platform_version: Version,
    /// Top-level components
    pub application_ids: BTreeSet<ObjectId>,
    /// Locations with no parent location
    pub top_level_location_ids: BTreeSet<ObjectId>,
    /// Component mementos by id
    pub components: BTreeMap<ObjectId, Memento>,
    /// Location mementos by id
    pub locations: BTreeMap<ObjectId, Memento>,
    /// Policy mementos by id
    pub policies: BTreeMap<ObjectId, Memento>,
}

impl TopologyMemento {
    /// Start building a topology
    #[must_use]
    pub fn builder() -> TopologyMementoBuilder {
        TopologyMementoBuilder::default()
    }

    /// Build from a set of mementos; later duplicates win
    #[must_use]
    pub fn from_mementos(mementos: impl IntoIterator<Item = Memento>) -> Self {
        Self::builder().mementos(mementos).build()
    }

    fn map_for(&self, kind: MementoKind) -> &BTreeMap<ObjectId, Memento> {
        match kind {
            MementoKind::Component => &self.components,
            MementoKind::Location => &self.locations,
            MementoKind::Policy => &self.policies,
        }
    }

    fn map_for_mut(&mut self, kind: MementoKind) -> &mut BTreeMap<ObjectId, Memento> {
        match kind {
            MementoKind::Component => &mut self.components,
            MementoKind::Location => &mut self.locations,
            MementoKind::Policy => &mut self.policies,
        }
    }

    /// Look up a memento of any kind
    #[must_use]
    pub fn get(&self, id: &ObjectId) -> Option<&Memento> {
        MementoKind::ALL
            .iter()
            .find_map(|kind| self.map_for(*kind).get(id))
    }

    /// Check whether an id is present
    #[must_use]
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.get(id).is_some()
    }

    /// Total number of mementos
    #[must_use]
    pub fn len(&self) -> usize {
        self.components.len() + self.locations.len() + self.policies.len()
    }

    /// Check if there are no mementos
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over all mementos: components, then locations, then policies
    pub fn iter(&self) -> impl Iterator<Item = &Memento> {
        self.components
            .values()
            .chain(self.locations.values())
            .chain(self.policies.values())
    }

    /// All ids
    #[must_use]
    pub fn ids(&self) -> BTreeSet<ObjectId> {
        self.iter().map(|m| m.id.clone()).collect()
    }

    /// Insert or replace a memento; an id moves kind if it was stored under another
    pub fn insert(&mut self, memento: Memento) {
        self.remove_quiet(&memento.id);
        let kind = memento.kind;
        self.map_for_mut(kind).insert(memento.id.clone(), memento);
        self.refresh_roots();
    }

    /// Remove a memento of any kind
    pub fn remove(&mut self, id: &ObjectId) -> Option<Memento> {
        let removed = self.remove_quiet(id);
        self.refresh_roots();
        removed
    }

    fn remove_quiet(&mut self, id: &ObjectId) -> Option<Memento> {
        MementoKind::ALL
            .iter()
            .find_map(|kind| self.map_for_mut(*kind).remove(id))
    }

    /// Apply a delta: upserts first, then removals
    pub fn apply(&mut self, delta: &TopologyDelta) {
        for memento in &delta.upserts {
            self.remove_quiet(&memento.id);
            self.map_for_mut(memento.kind)
                .insert(memento.id.clone(), memento.clone());
        }
        for id in &delta.removals {
            self.remove_quiet(id);
        }
        self.refresh_roots();
    }

    /// Consume into a flat list of mementos
    #[must_use]
    pub fn into_mementos(self) -> Vec<Memento> {
        self.components
            .into_values()
            .chain(self.locations.into_values())
            .chain(self.policies.into_values())
            .collect()
    }

    fn refresh_roots(&mut self) {
        self.application_ids = roots(&self.components);
        self.top_level_location_ids = roots(&self.locations);
    }
}

fn roots(map: &BTreeMap<ObjectId, Memento>) -> BTreeSet<ObjectId> {
    map.values()
        .filter(|m| m.ref_field(field_names::PARENT).is_none())
        .map(|m| m.id.clone())
        .collect()
}

/// Builder for [`TopologyMemento`]
#[derive(Debug, Clone, Default)]
pub struct TopologyMementoBuilder {
    platform_version: Option<Version>,
    mementos: Vec<Memento>,
}

impl TopologyMementoBuilder {
    /// Add one memento
    #[must_use]
    pub fn memento(mut self, memento: Memento) -> Self {
        self.mementos.push(memento);
        self
    }

    /// Add many mementos
    #[must_use]
    pub fn mementos(mut self, mementos: impl IntoIterator<Item = Memento>) -> Self {
        self.mementos.extend(mementos);
        self
    }

    /// Override the platform version stamp
    #[must_use]
    pub fn platform_version(mut self, version: Version) -> Self {
        self.platform_version = Some(version);
        self
    }

    /// Finish
    #[must_use]
    pub fn build(self) -> TopologyMemento {
        let mut topology = TopologyMemento {
            platform_version: self.platform_version.unwrap_or_else(Version::current),
            ..TopologyMemento::default()
        };
        for memento in self.mementos {
            topology.remove_quiet(&memento.id);
            topology
                .map_for_mut(memento.kind)
                .insert(memento.id.clone(), memento);
        }
        topology.refresh_roots();
        topology
    }
}

/// Incremental change to a topology
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TopologyDelta {
    /// Mementos to write
    pub upserts: Vec<Memento>,
    /// Ids to delete
    pub removals: BTreeSet<ObjectId>,
}

impl TopologyDelta {
    /// Create an empty delta
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an upsert
    #[must_use]
    pub fn upsert(mut self, memento: Memento) -> Self {
        self.upserts.push(memento);
        self
    }

    /// Add a removal
    #[must_use]
    pub fn remove(mut self, id: ObjectId) -> Self {
        self.removals.insert(id);
        self
    }

    /// Check if the delta is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }

    /// Number of changes
    #[must_use]
    pub fn len(&self) -> usize {
        self.upserts.len() + self.removals.len()
    }
}
