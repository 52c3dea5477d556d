//! Machine provisioning from locations.

use crate::manager::ManagementContext;
use cairn_core::ObjectId;
use cairn_memento::{FieldValue, MementoKind, field_names};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// A machine handed out by a location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    /// Machine location id
    pub id: ObjectId,
    /// Network address
    pub address: String,
}

/// Constraints on the machine wanted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionFlags {
    /// Tags the machine must carry
    pub required_tags: BTreeSet<String>,
}

impl ProvisionFlags {
    /// No constraints
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require a tag
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.required_tags.insert(tag.into());
        self
    }
}

/// Provisioning errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisionError {
    /// Every matching machine is in use; the caller may retry later
    #[error("no machines available in {location}")]
    NoMachinesAvailable {
        /// Location asked
        location: ObjectId,
    },

    /// Released a machine the location had not handed out
    #[error("{machine} is not in use in {location}")]
    NotInUse {
        /// Machine id
        machine: ObjectId,
        /// Location asked
        location: ObjectId,
    },

    /// The location is not managed or not a location
    #[error("location {location} is not managed")]
    UnknownLocation {
        /// Location id
        location: ObjectId,
    },
}

impl ProvisionError {
    /// Check if the failure is a transient shortage rather than a fault
    #[must_use]
    pub fn is_no_machines_available(&self) -> bool {
        matches!(self, Self::NoMachinesAvailable { .. })
    }
}

/// Hands out and takes back machines
pub trait MachineProvisioner: Send + Sync + fmt::Debug {
    /// Obtain a machine
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::NoMachinesAvailable`] if nothing matching is free
    fn obtain(&self, flags: &ProvisionFlags) -> Result<Machine, ProvisionError>;

    /// Return a machine
    ///
    /// # Errors
    ///
    /// Returns error if the machine was not handed out by this provisioner
    fn release(&self, machine: &Machine) -> Result<(), ProvisionError>;
}

/// Provisions from a fixed-list location.
///
/// The in-use set is part of the location's state, so it is captured with
/// the location and survives a rebind.
#[derive(Debug)]
pub struct FixedListProvisioner {
    context: Arc<ManagementContext>,
    location: ObjectId,
    lock: Mutex<()>,
}

impl FixedListProvisioner {
    /// Create a provisioner over a managed fixed-list location
    #[must_use]
    pub fn new(context: Arc<ManagementContext>, location: ObjectId) -> Self {
        Self {
            context,
            location,
            lock: Mutex::new(()),
        }
    }

    fn candidate(&self, id: &ObjectId, flags: &ProvisionFlags) -> Option<Machine> {
        let Some(machine) = self.context.lookup(id) else {
            warn!(location = %self.location, machine = %id, "listed machine is not managed");
            return None;
        };
        machine.read(|s| {
            if !flags.required_tags.is_subset(&s.tags) {
                return None;
            }
            let address = s.extra.get(field_names::ADDRESS).and_then(FieldValue::as_str)?;
            Some(Machine {
                id: id.clone(),
                address: address.to_string(),
            })
        })
    }
}

impl MachineProvisioner for FixedListProvisioner {
    fn obtain(&self, flags: &ProvisionFlags) -> Result<Machine, ProvisionError> {
        let _held = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let location = self
            .context
            .lookup(&self.location)
            .filter(|l| l.kind() == MementoKind::Location)
            .ok_or_else(|| ProvisionError::UnknownLocation {
                location: self.location.clone(),
            })?;
        let (machines, in_use) = location.read(|s| {
            (
                s.extra_refs(field_names::MACHINES),
                s.extra_refs(field_names::IN_USE),
            )
        });

        let machine = machines
            .difference(&in_use)
            .find_map(|id| self.candidate(id, flags))
            .ok_or_else(|| {
                debug!(location = %self.location, in_use = in_use.len(), "no free machine");
                ProvisionError::NoMachinesAvailable {
                    location: self.location.clone(),
                }
            })?;

        location.update(|s| {
            let mut in_use = s.extra_refs(field_names::IN_USE);
            in_use.insert(machine.id.clone());
            s.set_extra_refs(field_names::IN_USE, &in_use);
        });
        info!(location = %self.location, machine = %machine.id, "machine obtained");
        Ok(machine)
    }

    fn release(&self, machine: &Machine) -> Result<(), ProvisionError> {
        let _held = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let location = self.context.lookup(&self.location).ok_or_else(|| {
            ProvisionError::UnknownLocation {
                location: self.location.clone(),
            }
        })?;
        let in_use = location.read(|s| s.extra_refs(field_names::IN_USE));
        if !in_use.contains(&machine.id) {
            return Err(ProvisionError::NotInUse {
                machine: machine.id.clone(),
                location: self.location.clone(),
            });
        }
        location.update(|s| {
            let mut in_use = s.extra_refs(field_names::IN_USE);
            in_use.remove(&machine.id);
            s.set_extra_refs(field_names::IN_USE, &in_use);
        });
        info!(location = %self.location, machine = %machine.id, "machine released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::PersistingChangeListener;
    use crate::manager::RebindManager;
    use crate::rebinder::{RebindConfig, Rebinder};
    use crate::support::{RebindSupportRegistry, type_tags};
    use cairn_core::{ManualClock, Timestamp};
    use cairn_entitlement::{AllowAll, EntitlementContext};
    use cairn_memento::{Memento, TopologyMemento};
    use cairn_persist::{EpochGuard, MementoPersister, PersisterConfig};
    use cairn_storage::{InMemoryObjectStore, ObjectStore};
    use tokio_util::sync::CancellationToken;

    fn id(s: &str) -> ObjectId {
        ObjectId::parse(s).unwrap()
    }

    fn pool() -> TopologyMemento {
        let machines = [id("m1"), id("m2")];
        let mut mementos = vec![
            Memento::builder(MementoKind::Location, id("pool"), type_tags::FIXED_LIST_LOCATION)
                .field(field_names::MACHINES, FieldValue::refs(&machines))
                .build(),
        ];
        for (i, m) in machines.iter().enumerate() {
            let mut b = Memento::builder(MementoKind::Location, m.clone(), type_tags::MACHINE_LOCATION)
                .field(field_names::ADDRESS, format!("10.0.0.{}", i + 1))
                .field(field_names::PARENT, id("pool"));
            if i == 1 {
                b = b.tag("gpu");
            }
            mementos.push(b.build());
        }
        TopologyMemento::from_mementos(mementos)
    }

    fn manager(store: Arc<dyn ObjectStore>) -> RebindManager {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
        let persister = Arc::new(
            MementoPersister::new(store, PersisterConfig::new(), Arc::new(EpochGuard::granted(1)), clock)
                .unwrap(),
        );
        let registry = Arc::new(RebindSupportRegistry::with_defaults());
        let listener = Arc::new(PersistingChangeListener::new(persister.clone(), registry.clone()));
        let context = Arc::new(ManagementContext::new(listener, Arc::new(AllowAll)));
        RebindManager::new(context, persister, Rebinder::new(registry, RebindConfig::new()))
    }

    async fn seeded() -> (Arc<dyn ObjectStore>, RebindManager) {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let seed = manager(store.clone());
        let outcome = seed
            .rebinder()
            .rebind(&pool(), seed.context().listener(), &CancellationToken::new())
            .await
            .unwrap();
        seed.context().adopt(outcome.objects);
        seed.checkpoint(&EntitlementContext::system()).await.unwrap();

        let m = manager(store.clone());
        m.rebind(&EntitlementContext::system(), &CancellationToken::new())
            .await
            .unwrap();
        (store, m)
    }

    #[tokio::test]
    async fn test_obtain_until_exhausted() {
        let (_, m) = seeded().await;
        let provisioner = FixedListProvisioner::new(m.context().clone(), id("pool"));

        let first = provisioner.obtain(&ProvisionFlags::new()).unwrap();
        assert_eq!(first.address, "10.0.0.1");
        let second = provisioner.obtain(&ProvisionFlags::new()).unwrap();
        assert_eq!(second.id, id("m2"));

        let err = provisioner.obtain(&ProvisionFlags::new()).unwrap_err();
        assert!(err.is_no_machines_available());

        provisioner.release(&first).unwrap();
        assert_eq!(
            provisioner.release(&first),
            Err(ProvisionError::NotInUse {
                machine: id("m1"),
                location: id("pool"),
            })
        );
        assert_eq!(provisioner.obtain(&ProvisionFlags::new()).unwrap(), first);
    }

    #[tokio::test]
    async fn test_flags_filter_machines() {
        let (_, m) = seeded().await;
        let provisioner = FixedListProvisioner::new(m.context().clone(), id("pool"));
        let gpu = provisioner.obtain(&ProvisionFlags::new().with_tag("gpu")).unwrap();
        assert_eq!(gpu.id, id("m2"));
        assert!(provisioner
            .obtain(&ProvisionFlags::new().with_tag("gpu"))
            .unwrap_err()
            .is_no_machines_available());
    }

    #[tokio::test]
    async fn test_in_use_survives_rebind() {
        let (store, m) = seeded().await;
        let provisioner = FixedListProvisioner::new(m.context().clone(), id("pool"));
        let taken = provisioner.obtain(&ProvisionFlags::new()).unwrap();
        m.persister().flush().await.unwrap();

        let after = manager(store);
        after
            .rebind(&EntitlementContext::system(), &CancellationToken::new())
            .await
            .unwrap();
        let provisioner = FixedListProvisioner::new(after.context().clone(), id("pool"));
        let next = provisioner.obtain(&ProvisionFlags::new()).unwrap();
        assert_ne!(next.id, taken.id);
        provisioner.release(&taken).unwrap();
    }

    #[tokio::test]
    async fn test_unknown_location() {
        let (_, m) = seeded().await;
        let provisioner = FixedListProvisioner::new(m.context().clone(), id("m1-missing"));
        assert!(matches!(
            provisioner.obtain(&ProvisionFlags::new()),
            Err(ProvisionError::UnknownLocation { .. })
        ));
    }
}
