//! Shared state of one rebind pass.

use crate::object::ManagedObject;
use crate::support::RebindFailure;
use cairn_core::ObjectId;
use cairn_memento::MementoKind;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A reference whose target is not part of the rebound topology
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnresolvedReference {
    /// Object holding the reference
    pub from: ObjectId,
    /// Field the reference was found in
    pub field: String,
    /// Missing target
    pub target: ObjectId,
}

impl fmt::Display for UnresolvedReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} -> {}", self.from, self.field, self.target)
    }
}

/// Registry of the objects instantiated so far, by kind and id
#[derive(Debug, Default)]
pub struct RebindContext {
    components: BTreeMap<ObjectId, Arc<ManagedObject>>,
    locations: BTreeMap<ObjectId, Arc<ManagedObject>>,
    policies: BTreeMap<ObjectId, Arc<ManagedObject>>,
    unresolved: Vec<UnresolvedReference>,
    failures: Vec<RebindFailure>,
}

impl RebindContext {
    /// Create an empty context
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn objects_of(&self, kind: MementoKind) -> &BTreeMap<ObjectId, Arc<ManagedObject>> {
        match kind {
            MementoKind::Component => &self.components,
            MementoKind::Location => &self.locations,
            MementoKind::Policy => &self.policies,
        }
    }

    fn objects_of_mut(&mut self, kind: MementoKind) -> &mut BTreeMap<ObjectId, Arc<ManagedObject>> {
        match kind {
            MementoKind::Component => &mut self.components,
            MementoKind::Location => &mut self.locations,
            MementoKind::Policy => &mut self.policies,
        }
    }

    /// Register an instantiated object
    pub fn register(&mut self, object: Arc<ManagedObject>) {
        let kind = object.kind();
        self.objects_of_mut(kind).insert(object.id().clone(), object);
    }

    /// Drop an object; references to it no longer resolve
    pub fn remove(&mut self, id: &ObjectId) -> Option<Arc<ManagedObject>> {
        MementoKind::ALL
            .into_iter()
            .find_map(|kind| self.objects_of_mut(kind).remove(id))
    }

    /// Look up an object of any kind
    #[must_use]
    pub fn lookup(&self, id: &ObjectId) -> Option<&Arc<ManagedObject>> {
        MementoKind::ALL
            .into_iter()
            .find_map(|kind| self.objects_of(kind).get(id))
    }

    /// Look up an object of one kind
    #[must_use]
    pub fn lookup_kind(&self, kind: MementoKind, id: &ObjectId) -> Option<&Arc<ManagedObject>> {
        self.objects_of(kind).get(id)
    }

    /// Check if an object of any kind is registered
    #[must_use]
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.lookup(id).is_some()
    }

    /// Resolve a reference, recording it if the target is missing or of another kind
    pub fn resolve(
        &mut self,
        from: &ObjectId,
        field: &str,
        target: &ObjectId,
        kind: Option<MementoKind>,
    ) -> bool {
        let found = match kind {
            Some(kind) => self.lookup_kind(kind, target).is_some(),
            None => self.contains(target),
        };
        if !found {
            self.unresolved.push(UnresolvedReference {
                from: from.clone(),
                field: field.to_string(),
                target: target.clone(),
            });
        }
        found
    }

    /// Record an object that could not be rebound
    pub fn record_failure(&mut self, failure: RebindFailure) {
        self.failures.push(failure);
    }

    /// Every registered object, components first
    pub fn objects(&self) -> impl Iterator<Item = &Arc<ManagedObject>> {
        self.components
            .values()
            .chain(self.locations.values())
            .chain(self.policies.values())
    }

    /// Number of registered objects
    #[must_use]
    pub fn len(&self) -> usize {
        self.components.len() + self.locations.len() + self.policies.len()
    }

    /// Check if nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of registered objects of one kind
    #[must_use]
    pub fn count(&self, kind: MementoKind) -> usize {
        self.objects_of(kind).len()
    }

    /// References recorded as unresolved so far
    #[must_use]
    pub fn unresolved(&self) -> &[UnresolvedReference] {
        &self.unresolved
    }

    /// Failures recorded so far
    #[must_use]
    pub fn failures(&self) -> &[RebindFailure] {
        &self.failures
    }

    pub(crate) fn take_diagnostics(&mut self) -> (Vec<RebindFailure>, Vec<UnresolvedReference>) {
        (
            std::mem::take(&mut self.failures),
            std::mem::take(&mut self.unresolved),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ObjectId {
        ObjectId::parse(s).unwrap()
    }

    #[test]
    fn test_lookup_by_kind() {
        let mut ctx = RebindContext::new();
        ctx.register(ManagedObject::new(MementoKind::Component, id("web"), "cairn.component"));
        ctx.register(ManagedObject::new(MementoKind::Location, id("dc"), "cairn.location.machine"));

        assert_eq!(ctx.len(), 2);
        assert!(ctx.lookup(&id("dc")).is_some());
        assert!(ctx.lookup_kind(MementoKind::Component, &id("dc")).is_none());
        assert_eq!(ctx.count(MementoKind::Location), 1);

        assert!(ctx.remove(&id("dc")).is_some());
        assert!(!ctx.contains(&id("dc")));
    }

    #[test]
    fn test_resolve_records_misses() {
        let mut ctx = RebindContext::new();
        ctx.register(ManagedObject::new(MementoKind::Location, id("dc"), "cairn.location.machine"));

        assert!(ctx.resolve(&id("web"), "locations", &id("dc"), Some(MementoKind::Location)));
        assert!(!ctx.resolve(&id("web"), "parent", &id("dc"), Some(MementoKind::Component)));
        assert!(!ctx.resolve(&id("web"), "config", &id("nowhere"), None));

        let unresolved = ctx.unresolved();
        assert_eq!(unresolved.len(), 2);
        assert_eq!(unresolved[1].to_string(), "web.config -> nowhere");
    }
}
