//! Two-phase rebind.
//!
//! 1. Instantiate: every memento becomes an inert object registered in the
//!    [`RebindContext`]. Nothing is wired yet.
//! 2. Reconstruct: each object is wired from its memento. All objects exist
//!    by now, so references in any direction (cycles included) resolve.
//! 3. Activate: surviving objects are activated parents first, and policies
//!    after the entity they attach to.
//!
//! An object that fails either phase is left out and references to it are
//! pruned from the rest. A cancelled pass returns an error and activates
//! nothing.

use crate::context::{RebindContext, UnresolvedReference};
use crate::listener::ChangeListener;
use crate::object::ManagedObject;
use crate::support::{RebindFailure, RebindSupport, RebindSupportRegistry, reconstruct};
use cairn_core::ObjectId;
use cairn_entitlement::EntitlementError;
use cairn_memento::{FieldValue, Memento, MementoKind, TopologyMemento};
use cairn_persist::{LoadError, PersistError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Objects handled between cancellation checks
const YIELD_EVERY: usize = 64;

/// Rebind configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebindConfig {
    /// Abort the whole pass on a memento with an unregistered type tag
    pub fail_on_unknown_type: bool,
    /// Constant fields merged into every capture
    pub custom_fields: BTreeMap<String, FieldValue>,
}

impl RebindConfig {
    /// Create default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether an unknown type aborts the pass
    #[must_use]
    pub fn with_fail_on_unknown_type(mut self, fail: bool) -> Self {
        self.fail_on_unknown_type = fail;
        self
    }

    /// Add a constant capture field
    #[must_use]
    pub fn with_custom_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.custom_fields.insert(name.into(), value.into());
        self
    }
}

impl Default for RebindConfig {
    fn default() -> Self {
        Self {
            fail_on_unknown_type: true,
            custom_fields: BTreeMap::new(),
        }
    }
}

/// Rebind errors; any of these discards the whole pass
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RebindError {
    /// Another pass is in progress
    #[error("rebind already in progress")]
    AlreadyRunning,

    /// The pass was cancelled before activation
    #[error("rebind cancelled during {phase}")]
    Cancelled {
        /// Phase reached
        phase: &'static str,
    },

    /// A memento names a type with no registered support
    #[error("no rebind support for type {type_tag} of {id}")]
    UnknownType {
        /// Object id
        id: ObjectId,
        /// Unrecognised type tag
        type_tag: String,
    },

    /// The store could not be read or written
    #[error("persistence failed: {0}")]
    Persist(#[from] PersistError),

    /// The caller may not rebind
    #[error(transparent)]
    Denied(#[from] EntitlementError),
}

/// What a completed pass produced besides the objects
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RebindReport {
    /// Components activated
    pub components: usize,
    /// Locations activated
    pub locations: usize,
    /// Policies activated
    pub policies: usize,
    /// Objects left out
    pub failures: Vec<RebindFailure>,
    /// References dropped because their target was missing
    pub unresolved: Vec<UnresolvedReference>,
    /// Records that could not be read from the store
    pub load_errors: Vec<LoadError>,
}

impl RebindReport {
    /// Total objects activated
    #[must_use]
    pub fn activated(&self) -> usize {
        self.components + self.locations + self.policies
    }

    /// Check if nothing was left out or dropped
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.unresolved.is_empty() && self.load_errors.is_empty()
    }
}

/// Result of a completed pass
#[derive(Debug)]
pub struct RebindOutcome {
    /// Active objects in activation order
    pub objects: Vec<Arc<ManagedObject>>,
    /// Diagnostics
    pub report: RebindReport,
}

/// Rebuilds live objects from a topology memento
#[derive(Debug)]
pub struct Rebinder {
    registry: Arc<RebindSupportRegistry>,
    config: RebindConfig,
    running: Mutex<()>,
}

impl Rebinder {
    /// Create a rebinder
    #[must_use]
    pub fn new(registry: Arc<RebindSupportRegistry>, config: RebindConfig) -> Self {
        Self {
            registry,
            config,
            running: Mutex::new(()),
        }
    }

    /// Support registry
    #[must_use]
    pub fn registry(&self) -> &Arc<RebindSupportRegistry> {
        &self.registry
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &RebindConfig {
        &self.config
    }

    /// Rebuild, wire, and activate every object in `topology`.
    ///
    /// Activated objects report later changes to `listener`.
    ///
    /// # Errors
    ///
    /// Returns error if another pass is running, the pass is cancelled, or
    /// an unknown type is found while `fail_on_unknown_type` is set
    #[instrument(skip_all, fields(mementos = topology.len()))]
    pub async fn rebind(
        &self,
        topology: &TopologyMemento,
        listener: Arc<dyn ChangeListener>,
        cancel: &CancellationToken,
    ) -> Result<RebindOutcome, RebindError> {
        let _running = self
            .running
            .try_lock()
            .map_err(|_| RebindError::AlreadyRunning)?;
        info!("rebind starting");

        let mut context = RebindContext::new();
        let wiring = self.instantiate(topology, &mut context, cancel).await?;

        let mut failed = BTreeSet::new();
        for (i, (support, object, memento)) in wiring.iter().enumerate() {
            checkpoint(cancel, i, "reconstruct").await?;
            if let Err(failure) = reconstruct(support.as_ref(), &mut context, object, memento) {
                warn!(%failure, "object could not be wired");
                failed.insert(failure.id().clone());
                context.record_failure(failure);
            }
        }
        for id in &failed {
            context.remove(id);
        }

        link_back_references(&context);
        let (order, cyclic) = activation_order(&context);
        for id in cyclic {
            warn!(%id, "object is part of a dependency cycle");
            context.remove(&id);
            context.record_failure(RebindFailure::Cycle { id: id.clone() });
            failed.insert(id);
        }
        if !failed.is_empty() {
            for object in context.objects() {
                object.update_silently(|s| s.prune_refs(&failed));
            }
        }

        if cancel.is_cancelled() {
            return Err(RebindError::Cancelled { phase: "activate" });
        }
        let objects: Vec<_> = order
            .iter()
            .filter_map(|id| context.lookup(id).cloned())
            .collect();
        for object in &objects {
            object.activate(Arc::clone(&listener));
        }

        let (failures, unresolved) = context.take_diagnostics();
        let report = RebindReport {
            components: context.count(MementoKind::Component),
            locations: context.count(MementoKind::Location),
            policies: context.count(MementoKind::Policy),
            failures,
            unresolved,
            load_errors: Vec::new(),
        };
        info!(
            activated = report.activated(),
            failed = report.failures.len(),
            unresolved = report.unresolved.len(),
            "rebind complete"
        );
        Ok(RebindOutcome { objects, report })
    }

    async fn instantiate<'a>(
        &self,
        topology: &'a TopologyMemento,
        context: &mut RebindContext,
        cancel: &CancellationToken,
    ) -> Result<Vec<(Arc<dyn RebindSupport>, Arc<ManagedObject>, &'a Memento)>, RebindError> {
        let mut wiring = Vec::with_capacity(topology.len());
        for (i, memento) in topology.iter().enumerate() {
            checkpoint(cancel, i, "instantiate").await?;
            let support = match self.registry.lookup(&memento.id, &memento.type_tag) {
                Ok(support) => Arc::clone(support),
                Err(RebindFailure::UnknownType { id, type_tag }) if self.config.fail_on_unknown_type => {
                    warn!(%id, %type_tag, "unknown type; abandoning rebind");
                    return Err(RebindError::UnknownType { id, type_tag });
                }
                Err(failure) => {
                    warn!(%failure, "object skipped");
                    context.record_failure(failure);
                    continue;
                }
            };
            match support.instantiate(memento) {
                Ok(object) => {
                    debug!(id = %memento.id, type_tag = %memento.type_tag, "instantiated");
                    context.register(Arc::clone(&object));
                    wiring.push((support, object, memento));
                }
                Err(failure) => {
                    warn!(%failure, "object could not be instantiated");
                    context.record_failure(failure);
                }
            }
        }
        Ok(wiring)
    }
}

async fn checkpoint(cancel: &CancellationToken, i: usize, phase: &'static str) -> Result<(), RebindError> {
    if i % YIELD_EVERY == 0 {
        tokio::task::yield_now().await;
    }
    if cancel.is_cancelled() {
        info!(phase, "rebind cancelled");
        return Err(RebindError::Cancelled { phase });
    }
    Ok(())
}

/// Make parent/child and entity/policy links agree from both ends
fn link_back_references(context: &RebindContext) {
    for object in context.objects() {
        let (parent, children, entity) =
            object.read(|s| (s.parent.clone(), s.children.clone(), s.entity.clone()));
        if let Some(parent) = parent.and_then(|p| context.lookup(&p)) {
            parent.update_silently(|s| s.children.insert(object.id().clone()));
        }
        for child in children.iter().filter_map(|c| context.lookup(c)) {
            child.update_silently(|s| {
                if s.parent.is_none() {
                    s.parent = Some(object.id().clone());
                }
            });
        }
        if let Some(entity) = entity.and_then(|e| context.lookup(&e)) {
            entity.update_silently(|s| s.policies.insert(object.id().clone()));
        }
    }
}

/// Order objects so that dependencies come first; returns the order and the ids left in cycles
fn activation_order(context: &RebindContext) -> (Vec<ObjectId>, Vec<ObjectId>) {
    let mut in_degree: BTreeMap<ObjectId, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<ObjectId, Vec<ObjectId>> = BTreeMap::new();
    for object in context.objects() {
        in_degree.entry(object.id().clone()).or_default();
        let prerequisites = object.read(|s| {
            let mut deps: BTreeSet<ObjectId> = s.parent.iter().chain(s.entity.iter()).cloned().collect();
            if object.kind() == MementoKind::Component {
                deps.extend(s.locations.iter().cloned());
            }
            deps
        });
        for dep in prerequisites.into_iter().filter(|d| context.contains(d)) {
            *in_degree.entry(object.id().clone()).or_default() += 1;
            dependents.entry(dep).or_default().push(object.id().clone());
        }
    }

    let mut ready: VecDeque<ObjectId> = in_degree
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| id.clone())
        .collect();
    let mut order = Vec::with_capacity(in_degree.len());
    while let Some(id) = ready.pop_front() {
        for dependent in dependents.get(&id).into_iter().flatten() {
            if let Some(n) = in_degree.get_mut(dependent) {
                *n -= 1;
                if *n == 0 {
                    ready.push_back(dependent.clone());
                }
            }
        }
        order.push(id);
    }

    let placed: BTreeSet<&ObjectId> = order.iter().collect();
    let cyclic = in_degree
        .keys()
        .filter(|id| !placed.contains(id))
        .cloned()
        .collect();
    (order, cyclic)
}
