//! Live topology and rebind orchestration.

use crate::listener::{ChangeEvent, ChangeListener};
use crate::object::ManagedObject;
use crate::rebinder::{RebindError, RebindReport, Rebinder};
use crate::support::RebindFailure;
use cairn_core::ObjectId;
use cairn_entitlement::{
    EntitlementAction, EntitlementContext, EntitlementError, EntitlementManager, EntitlementTarget,
    require,
};
use cairn_memento::{MementoKind, TopologyDelta, TopologyMemento};
use cairn_persist::MementoPersister;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Errors changing the live topology
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManageError {
    /// Id already in use
    #[error("{0} is already managed")]
    AlreadyManaged(ObjectId),

    /// Id not under management
    #[error("{0} is not managed")]
    NotManaged(ObjectId),

    /// Object of the wrong kind for the operation
    #[error("{id} is a {found}, expected a {expected}")]
    WrongKind {
        /// Object id
        id: ObjectId,
        /// Kind required
        expected: MementoKind,
        /// Kind found
        found: MementoKind,
    },

    /// The caller may not change the topology
    #[error(transparent)]
    Denied(#[from] EntitlementError),
}

/// Every managed object, by id
pub struct ManagementContext {
    objects: RwLock<BTreeMap<ObjectId, Arc<ManagedObject>>>,
    listener: Arc<dyn ChangeListener>,
    entitlements: Arc<dyn EntitlementManager>,
}

impl ManagementContext {
    /// Create an empty context; managed objects report to `listener`
    #[must_use]
    pub fn new(listener: Arc<dyn ChangeListener>, entitlements: Arc<dyn EntitlementManager>) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            listener,
            entitlements,
        }
    }

    /// Listener attached to managed objects
    #[must_use]
    pub fn listener(&self) -> Arc<dyn ChangeListener> {
        Arc::clone(&self.listener)
    }

    /// Entitlement manager gating changes
    #[must_use]
    pub fn entitlements(&self) -> &Arc<dyn EntitlementManager> {
        &self.entitlements
    }

    fn gate(&self, caller: &EntitlementContext, id: &ObjectId) -> Result<(), ManageError> {
        let target = EntitlementTarget::Entity { id: id.clone() };
        require(self.entitlements.as_ref(), caller, EntitlementAction::ModifyTopology, &target)?;
        Ok(())
    }

    fn get(&self, id: &ObjectId) -> Result<Arc<ManagedObject>, ManageError> {
        self.lookup(id).ok_or_else(|| ManageError::NotManaged(id.clone()))
    }

    /// Bring an object under management
    ///
    /// # Errors
    ///
    /// Returns error if the caller is not entitled or the id is taken
    pub fn manage(&self, caller: &EntitlementContext, object: Arc<ManagedObject>) -> Result<(), ManageError> {
        self.gate(caller, object.id())?;
        {
            let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
            if objects.contains_key(object.id()) {
                return Err(ManageError::AlreadyManaged(object.id().clone()));
            }
            objects.insert(object.id().clone(), Arc::clone(&object));
        }
        object.activate(self.listener());
        object.notify(ChangeEvent::Managed);
        info!(id = %object.id(), kind = %object.kind(), "managed");
        Ok(())
    }

    /// Remove an object, its descendants, and policies attached to any of them.
    ///
    /// Returns the ids removed.
    ///
    /// # Errors
    ///
    /// Returns error if the caller is not entitled or the id is not managed
    pub fn unmanage(&self, caller: &EntitlementContext, id: &ObjectId) -> Result<Vec<ObjectId>, ManageError> {
        self.gate(caller, id)?;
        let root = self.get(id)?;

        let mut removed = Vec::new();
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([root.clone()]);
        while let Some(object) = queue.pop_front() {
            if !seen.insert(object.id().clone()) {
                continue;
            }
            let next = object.read(|s| s.children.iter().chain(&s.policies).cloned().collect::<Vec<_>>());
            queue.extend(next.iter().filter_map(|n| self.lookup(n)));
            removed.push(object);
        }

        {
            let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
            for object in &removed {
                objects.remove(object.id());
            }
        }
        for object in &removed {
            object.notify(ChangeEvent::Unmanaged);
            object.deactivate();
        }

        let (parent, entity) = root.read(|s| (s.parent.clone(), s.entity.clone()));
        if let Some(parent) = parent.and_then(|p| self.lookup(&p)) {
            parent.update(|s| s.children.remove(id));
        }
        if let Some(entity) = entity.and_then(|e| self.lookup(&e)) {
            entity.update(|s| s.policies.remove(id));
        }
        info!(%id, removed = removed.len(), "unmanaged");
        Ok(removed.into_iter().map(|o| o.id().clone()).collect())
    }

    /// Make `parent` the parent of `child`, detaching it from any previous parent
    ///
    /// # Errors
    ///
    /// Returns error if the caller is not entitled, either id is not managed,
    /// or the two are of different kinds
    pub fn set_parent(
        &self,
        caller: &EntitlementContext,
        child: &ObjectId,
        parent: &ObjectId,
    ) -> Result<(), ManageError> {
        self.gate(caller, child)?;
        let (child_obj, parent_obj) = (self.get(child)?, self.get(parent)?);
        if child_obj.kind() != parent_obj.kind() || child_obj.kind() == MementoKind::Policy {
            return Err(ManageError::WrongKind {
                id: parent.clone(),
                expected: child_obj.kind(),
                found: parent_obj.kind(),
            });
        }
        let previous = child_obj.update(|s| s.parent.replace(parent.clone()));
        if let Some(old) = previous.filter(|old| old != parent).and_then(|old| self.lookup(&old)) {
            old.update(|s| s.children.remove(child));
        }
        parent_obj.update(|s| s.children.insert(child.clone()));
        Ok(())
    }

    /// Attach a policy to a component
    ///
    /// # Errors
    ///
    /// Returns error if the caller is not entitled, either id is not managed,
    /// or the kinds are wrong
    pub fn attach_policy(
        &self,
        caller: &EntitlementContext,
        policy: &ObjectId,
        entity: &ObjectId,
    ) -> Result<(), ManageError> {
        self.gate(caller, entity)?;
        let (policy_obj, entity_obj) = (self.get(policy)?, self.get(entity)?);
        for (obj, expected) in [(&policy_obj, MementoKind::Policy), (&entity_obj, MementoKind::Component)] {
            if obj.kind() != expected {
                return Err(ManageError::WrongKind {
                    id: obj.id().clone(),
                    expected,
                    found: obj.kind(),
                });
            }
        }
        policy_obj.update(|s| s.entity = Some(entity.clone()));
        entity_obj.update(|s| s.policies.insert(policy.clone()));
        Ok(())
    }

    /// Look up a managed object
    #[must_use]
    pub fn lookup(&self, id: &ObjectId) -> Option<Arc<ManagedObject>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Every managed object, by id
    #[must_use]
    pub fn objects(&self) -> Vec<Arc<ManagedObject>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Top-level components
    #[must_use]
    pub fn applications(&self) -> Vec<Arc<ManagedObject>> {
        self.objects()
            .into_iter()
            .filter(|o| o.kind() == MementoKind::Component && o.read(|s| s.parent.is_none()))
            .collect()
    }

    /// Number of managed objects
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check if nothing is managed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capture every managed object; objects that cannot be captured are reported
    #[must_use]
    pub fn capture_all(
        &self,
        rebinder: &Rebinder,
    ) -> (TopologyMemento, Vec<RebindFailure>) {
        let custom_fields = &rebinder.config().custom_fields;
        let mut failures = Vec::new();
        let mementos: Vec<_> = self
            .objects()
            .iter()
            .filter_map(|o| match rebinder.registry().capture(o, custom_fields) {
                Ok(memento) => Some(memento),
                Err(failure) => {
                    warn!(%failure, "object could not be captured");
                    failures.push(failure);
                    None
                }
            })
            .collect();
        (TopologyMemento::from_mementos(mementos), failures)
    }

    /// Replace the live view with objects activated by a rebind
    pub fn adopt(&self, objects: Vec<Arc<ManagedObject>>) {
        self.adopt_unless_cancelled(objects, &CancellationToken::new());
    }

    /// Replace the live view unless `cancel` has fired.
    ///
    /// The token is checked under the write lock, so a cancel followed by
    /// [`ManagementContext::clear`] always leaves the view empty. Objects
    /// that are not adopted are deactivated. Returns whether they were adopted.
    pub fn adopt_unless_cancelled(
        &self,
        objects: Vec<Arc<ManagedObject>>,
        cancel: &CancellationToken,
    ) -> bool {
        let replaced = {
            let mut current = self.objects.write().unwrap_or_else(PoisonError::into_inner);
            if cancel.is_cancelled() {
                None
            } else {
                Some(std::mem::replace(
                    &mut *current,
                    objects.iter().map(|o| (o.id().clone(), Arc::clone(o))).collect(),
                ))
            }
        };
        let Some(replaced) = replaced else {
            for object in &objects {
                object.deactivate();
            }
            return false;
        };
        for object in replaced.values() {
            object.deactivate();
        }
        true
    }

    /// Drop the live view without recording deletions; returns how many objects were dropped
    pub fn clear(&self) -> usize {
        let dropped = std::mem::take(&mut *self.objects.write().unwrap_or_else(PoisonError::into_inner));
        for object in dropped.values() {
            object.deactivate();
        }
        dropped.len()
    }
}

impl fmt::Debug for ManagementContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagementContext")
            .field("objects", &self.len())
            .field("listener", &self.listener)
            .finish()
    }
}

/// Loads, rebinds, and checkpoints the live topology
#[derive(Debug)]
pub struct RebindManager {
    context: Arc<ManagementContext>,
    persister: Arc<MementoPersister>,
    rebinder: Rebinder,
}

impl RebindManager {
    /// Create a manager
    #[must_use]
    pub fn new(context: Arc<ManagementContext>, persister: Arc<MementoPersister>, rebinder: Rebinder) -> Self {
        Self {
            context,
            persister,
            rebinder,
        }
    }

    /// Live topology
    #[must_use]
    pub fn context(&self) -> &Arc<ManagementContext> {
        &self.context
    }

    /// Persister
    #[must_use]
    pub fn persister(&self) -> &Arc<MementoPersister> {
        &self.persister
    }

    /// Rebinder
    #[must_use]
    pub fn rebinder(&self) -> &Rebinder {
        &self.rebinder
    }

    /// Replace the live topology with the one in the store.
    ///
    /// Unreadable records are reported in [`RebindReport::load_errors`]; the
    /// rest of the topology is still rebound.
    ///
    /// # Errors
    ///
    /// Returns error if the caller is not entitled, the store cannot be
    /// read, or the pass fails
    #[instrument(skip_all, fields(user = %caller.user))]
    pub async fn rebind(
        &self,
        caller: &EntitlementContext,
        cancel: &CancellationToken,
    ) -> Result<RebindReport, RebindError> {
        require(
            self.context.entitlements().as_ref(),
            caller,
            EntitlementAction::Rebind,
            &EntitlementTarget::None,
        )?;
        let (topology, load_errors) = self.persister.load_topology().await?;
        let outcome = self
            .rebinder
            .rebind(&topology, self.context.listener(), cancel)
            .await?;
        let adopted: BTreeSet<ObjectId> = outcome.objects.iter().map(|o| o.id().clone()).collect();
        if !self.context.adopt_unless_cancelled(outcome.objects, cancel) {
            info!("rebind cancelled before adoption");
            return Err(RebindError::Cancelled { phase: "adopt" });
        }
        // Records of objects left out stay in the store until compaction.
        self.persister.forget(topology.ids().difference(&adopted));
        let mut report = outcome.report;
        report.load_errors = load_errors;
        Ok(report)
    }

    /// Write every live object to the store.
    ///
    /// When every object captures, records of ids no longer managed are
    /// deleted. Otherwise only the captured objects are written and nothing
    /// is deleted, so an object that failed to capture keeps its last record.
    ///
    /// # Errors
    ///
    /// Returns error if the caller is not entitled or the write fails
    #[instrument(skip_all, fields(user = %caller.user))]
    pub async fn checkpoint(&self, caller: &EntitlementContext) -> Result<Vec<RebindFailure>, RebindError> {
        require(
            self.context.entitlements().as_ref(),
            caller,
            EntitlementAction::ModifyTopology,
            &EntitlementTarget::None,
        )?;
        let (topology, failures) = self.context.capture_all(&self.rebinder);
        if failures.is_empty() {
            self.persister.checkpoint(&topology).await?;
        } else {
            let delta = topology
                .into_mementos()
                .into_iter()
                .fold(TopologyDelta::new(), TopologyDelta::upsert);
            self.persister.delta(delta)?;
            self.persister.flush().await?;
        }
        Ok(failures)
    }

    /// Drop the live topology and pending writes; used on demotion
    pub fn clear(&self) -> usize {
        let discarded = self.persister.discard_pending();
        let dropped = self.context.clear();
        info!(dropped, discarded, "live topology cleared");
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::PersistingChangeListener;
    use crate::rebinder::RebindConfig;
    use crate::support::{RebindSupportRegistry, type_tags};
    use cairn_core::{ManualClock, Timestamp};
    use cairn_entitlement::{AllowAll, EntitlementTable};
    use cairn_memento::{Memento, field_names};
    use cairn_persist::{EpochGuard, PersisterConfig};
    use cairn_storage::{InMemoryObjectStore, ObjectStore};

    fn id(s: &str) -> ObjectId {
        ObjectId::parse(s).unwrap()
    }

    fn system() -> EntitlementContext {
        EntitlementContext::system()
    }

    struct Node {
        manager: RebindManager,
        persister: Arc<MementoPersister>,
    }

    fn node(store: Arc<dyn ObjectStore>, guard: Arc<EpochGuard>, entitlements: Arc<dyn EntitlementManager>) -> Node {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
        let persister =
            Arc::new(MementoPersister::new(store, PersisterConfig::new(), guard, clock).unwrap());
        let registry = Arc::new(RebindSupportRegistry::with_defaults());
        let listener = Arc::new(PersistingChangeListener::new(persister.clone(), registry.clone()));
        let context = Arc::new(ManagementContext::new(listener, entitlements));
        let rebinder = Rebinder::new(registry, RebindConfig::new());
        Node {
            manager: RebindManager::new(context, persister.clone(), rebinder),
            persister,
        }
    }

    fn component(name: &str) -> Arc<ManagedObject> {
        ManagedObject::new(MementoKind::Component, id(name), type_tags::COMPONENT)
    }

    #[tokio::test]
    async fn test_manage_persist_rebind() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let master = node(store.clone(), Arc::new(EpochGuard::granted(1)), Arc::new(AllowAll));
        let ctx = master.manager.context();

        let app = ManagedObject::new(MementoKind::Component, id("app"), type_tags::APPLICATION);
        ctx.manage(&system(), app).unwrap();
        ctx.manage(&system(), component("web")).unwrap();
        ctx.set_parent(&system(), &id("web"), &id("app")).unwrap();
        ctx.lookup(&id("web")).unwrap().set_config("port", 8080);
        master.persister.flush().await.unwrap();

        let standby = node(store, Arc::new(EpochGuard::new()), Arc::new(AllowAll));
        let report = standby
            .manager
            .rebind(&system(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.is_clean());
        assert_eq!(report.components, 2);

        let rebound = standby.manager.context();
        let web = rebound.lookup(&id("web")).unwrap();
        assert_eq!(web.read(|s| s.parent.clone()), Some(id("app")));
        assert_eq!(web.read(|s| s.config["port"].as_i64()), Some(8080));
        assert_eq!(rebound.applications().len(), 1);

        // A standby's changes are fenced and never queued.
        web.set_display_name("changed on standby");
        assert_eq!(standby.persister.pending(), 0);
    }

    #[tokio::test]
    async fn test_unmanage_removes_subtree() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let master = node(store.clone(), Arc::new(EpochGuard::granted(1)), Arc::new(AllowAll));
        let ctx = master.manager.context();
        for name in ["app", "web", "db"] {
            ctx.manage(&system(), component(name)).unwrap();
        }
        ctx.set_parent(&system(), &id("web"), &id("app")).unwrap();
        ctx.set_parent(&system(), &id("db"), &id("web")).unwrap();
        ctx.manage(
            &system(),
            ManagedObject::new(MementoKind::Policy, id("scale"), type_tags::BASIC_POLICY),
        )
        .unwrap();
        ctx.attach_policy(&system(), &id("scale"), &id("db")).unwrap();
        master.persister.flush().await.unwrap();
        assert_eq!(store.list("mementos/").await.unwrap().len(), 4);

        let removed = ctx.unmanage(&system(), &id("web")).unwrap();
        assert_eq!(removed.len(), 3);
        assert_eq!(ctx.len(), 1);
        assert!(ctx.lookup(&id("app")).unwrap().read(|s| s.children.is_empty()));
        master.persister.flush().await.unwrap();
        assert_eq!(store.list("mementos/").await.unwrap(), vec!["mementos/app".to_string()]);

        assert_eq!(
            ctx.unmanage(&system(), &id("web")),
            Err(ManageError::NotManaged(id("web")))
        );
    }

    #[tokio::test]
    async fn test_checkpoint_removes_stale_records() {
        let store = Arc::new(InMemoryObjectStore::new());
        let master = node(store.clone(), Arc::new(EpochGuard::granted(1)), Arc::new(AllowAll));
        let ctx = master.manager.context();
        ctx.manage(&system(), component("web")).unwrap();
        master.persister.flush().await.unwrap();

        // A record the live topology does not know about.
        ctx.manage(&system(), component("old")).unwrap();
        master.persister.flush().await.unwrap();
        ctx.clear();
        ctx.adopt(vec![component("web")]);

        let failures = master.manager.checkpoint(&system()).await.unwrap();
        assert!(failures.is_empty());
        assert_eq!(store.list("mementos/").await.unwrap(), vec!["mementos/web".to_string()]);
    }

    #[tokio::test]
    async fn test_cancel_after_pass_discards_objects() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let master = node(store.clone(), Arc::new(EpochGuard::granted(1)), Arc::new(AllowAll));
        master.manager.context().manage(&system(), component("web")).unwrap();
        master.persister.flush().await.unwrap();

        let standby = node(store, Arc::new(EpochGuard::new()), Arc::new(AllowAll));
        let (topology, _) = standby.persister.load_topology().await.unwrap();
        let cancel = CancellationToken::new();
        let ctx = standby.manager.context();
        let outcome = standby
            .manager
            .rebinder()
            .rebind(&topology, ctx.listener(), &cancel)
            .await
            .unwrap();
        let web = Arc::clone(&outcome.objects[0]);
        assert!(web.is_active());

        cancel.cancel();
        standby.manager.clear();
        assert!(!ctx.adopt_unless_cancelled(outcome.objects, &cancel));
        assert!(ctx.is_empty());
        assert!(!web.is_active());
    }

    #[tokio::test]
    async fn test_cancelled_rebind_adopts_nothing() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let master = node(store.clone(), Arc::new(EpochGuard::granted(1)), Arc::new(AllowAll));
        master.manager.context().manage(&system(), component("web")).unwrap();
        master.persister.flush().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let standby = node(store, Arc::new(EpochGuard::new()), Arc::new(AllowAll));
        assert!(matches!(
            standby.manager.rebind(&system(), &cancel).await,
            Err(RebindError::Cancelled { .. })
        ));
        assert!(standby.manager.context().is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_keeps_records_that_failed_rebind() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let seed = node(store.clone(), Arc::new(EpochGuard::granted(1)), Arc::new(AllowAll));
        let odd = Memento::builder(MementoKind::Component, id("odd"), type_tags::COMPONENT)
            .field(field_names::CONFIG, "not a record")
            .build();
        seed.persister.write(odd).unwrap();
        seed.manager.context().manage(&system(), component("web")).unwrap();
        seed.persister.flush().await.unwrap();

        let master = node(store.clone(), Arc::new(EpochGuard::granted(2)), Arc::new(AllowAll));
        let report = master
            .manager
            .rebind(&system(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(master.manager.checkpoint(&system()).await.unwrap().is_empty());

        let mut stored = store.list("mementos/").await.unwrap();
        stored.sort();
        assert_eq!(stored, vec!["mementos/odd".to_string(), "mementos/web".to_string()]);
    }

    #[tokio::test]
    async fn test_entitlements_gate_changes() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let table = Arc::new(EntitlementTable::read_only_except("operator"));
        let master = node(store, Arc::new(EpochGuard::granted(1)), table);
        let guest = EntitlementContext::new("gus");

        assert!(matches!(
            master.manager.context().manage(&guest, component("web")),
            Err(ManageError::Denied(_))
        ));
        assert!(matches!(
            master.manager.rebind(&guest, &CancellationToken::new()).await,
            Err(RebindError::Denied(_))
        ));
        let operator = EntitlementContext::new("olive").with_role("operator");
        master.manager.context().manage(&operator, component("web")).unwrap();
    }

    #[tokio::test]
    async fn test_clear_on_demotion() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let guard = Arc::new(EpochGuard::granted(1));
        let master = node(store.clone(), guard.clone(), Arc::new(AllowAll));
        master.manager.context().manage(&system(), component("web")).unwrap();
        assert_eq!(master.persister.pending(), 1);

        guard.revoke();
        assert_eq!(master.manager.clear(), 1);
        assert_eq!(master.persister.pending(), 0);
        assert!(master.manager.context().is_empty());
        assert!(store.list("mementos/").await.unwrap().is_empty());
    }
}
