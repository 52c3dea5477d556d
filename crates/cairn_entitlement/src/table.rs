//! Action-to-check dispatch table.

use crate::action::{EntitlementAction, EntitlementContext, EntitlementTarget};
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// A typed entitlement check
pub type CheckFn = Arc<dyn Fn(&EntitlementContext, &EntitlementTarget) -> bool + Send + Sync>;

/// Entitlement errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntitlementError {
    /// A table was built without a check for some actions
    #[error("no entitlement check registered for: {}", list(.0))]
    MissingHandlers(Vec<EntitlementAction>),

    /// The same action registered twice
    #[error("entitlement check for {0} registered twice")]
    DuplicateHandler(EntitlementAction),

    /// The caller is not entitled
    #[error("{user} is not entitled to {action}")]
    Denied {
        /// Caller
        user: String,
        /// Action refused
        action: EntitlementAction,
    },
}

fn list(actions: &[EntitlementAction]) -> String {
    actions
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Answers whether a caller may perform an action
pub trait EntitlementManager: Send + Sync + fmt::Debug {
    /// Check an action against a target
    fn is_entitled(
        &self,
        context: &EntitlementContext,
        action: EntitlementAction,
        target: &EntitlementTarget,
    ) -> bool;
}

/// Gate an operation
///
/// # Errors
///
/// Returns [`EntitlementError::Denied`] if the manager refuses
pub fn require(
    manager: &dyn EntitlementManager,
    context: &EntitlementContext,
    action: EntitlementAction,
    target: &EntitlementTarget,
) -> Result<(), EntitlementError> {
    if manager.is_entitled(context, action, target) {
        Ok(())
    } else {
        debug!(user = %context.user, %action, "entitlement denied");
        Err(EntitlementError::Denied {
            user: context.user.clone(),
            action,
        })
    }
}

/// Grants everything; used when entitlements are not configured
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl EntitlementManager for AllowAll {
    fn is_entitled(&self, _: &EntitlementContext, _: EntitlementAction, _: &EntitlementTarget) -> bool {
        true
    }
}

/// Complete mapping from action to check
pub struct EntitlementTable {
    checks: IndexMap<EntitlementAction, CheckFn>,
}

impl EntitlementTable {
    /// Start building a table
    #[must_use]
    pub fn builder() -> EntitlementTableBuilder {
        EntitlementTableBuilder::default()
    }

    /// Read-only actions for everyone; everything else needs `role`
    #[must_use]
    pub fn read_only_except(role: &str) -> Self {
        let mut builder = Self::builder();
        for action in EntitlementAction::ALL {
            let role = role.to_string();
            builder = if action.is_read_only() {
                builder.on(action, |_, _| true)
            } else {
                builder.on(action, move |ctx, _| ctx.has_role(&role))
            };
        }
        EntitlementTable {
            checks: builder.checks,
        }
    }

    /// Actions in registration order
    pub fn actions(&self) -> impl Iterator<Item = EntitlementAction> + '_ {
        self.checks.keys().copied()
    }
}

impl fmt::Debug for EntitlementTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntitlementTable")
            .field("actions", &self.checks.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EntitlementManager for EntitlementTable {
    fn is_entitled(
        &self,
        context: &EntitlementContext,
        action: EntitlementAction,
        target: &EntitlementTarget,
    ) -> bool {
        trace!(user = %context.user, %action, ?target, "checking entitlement");
        if context.is_root() {
            return true;
        }
        // Completeness is checked at build time.
        self.checks
            .get(&action)
            .is_some_and(|check| check(context, target))
    }
}

/// Builder for [`EntitlementTable`]
#[derive(Default)]
pub struct EntitlementTableBuilder {
    checks: IndexMap<EntitlementAction, CheckFn>,
    duplicate: Option<EntitlementAction>,
}

impl EntitlementTableBuilder {
    /// Register the check for an action
    #[must_use]
    pub fn on<F>(mut self, action: EntitlementAction, check: F) -> Self
    where
        F: Fn(&EntitlementContext, &EntitlementTarget) -> bool + Send + Sync + 'static,
    {
        let check: CheckFn = Arc::new(check);
        if self.checks.insert(action, check).is_some() && self.duplicate.is_none() {
            self.duplicate = Some(action);
        }
        self
    }

    /// Validate completeness and build
    ///
    /// # Errors
    ///
    /// Returns error if an action was registered twice or has no check
    pub fn build(self) -> Result<EntitlementTable, EntitlementError> {
        if let Some(action) = self.duplicate {
            return Err(EntitlementError::DuplicateHandler(action));
        }
        let missing: Vec<_> = EntitlementAction::ALL
            .into_iter()
            .filter(|a| !self.checks.contains_key(a))
            .collect();
        if !missing.is_empty() {
            return Err(EntitlementError::MissingHandlers(missing));
        }
        Ok(EntitlementTable {
            checks: self.checks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::ObjectId;

    fn full_builder() -> EntitlementTableBuilder {
        EntitlementAction::ALL
            .into_iter()
            .fold(EntitlementTable::builder(), |b, action| {
                b.on(action, |ctx, _| ctx.has_role("admin"))
            })
    }

    #[test]
    fn test_incomplete_table_rejected() {
        let result = EntitlementTable::builder()
            .on(EntitlementAction::SeeEntity, |_, _| true)
            .build();
        match result {
            Err(EntitlementError::MissingHandlers(missing)) => {
                assert_eq!(missing.len(), EntitlementAction::ALL.len() - 1);
                assert!(!missing.contains(&EntitlementAction::SeeEntity));
            }
            other => panic!("expected missing handlers, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_duplicate_rejected() {
        let result = full_builder()
            .on(EntitlementAction::Rebind, |_, _| true)
            .build();
        assert!(matches!(
            result,
            Err(EntitlementError::DuplicateHandler(EntitlementAction::Rebind))
        ));
    }

    #[test]
    fn test_dispatch_by_action() {
        let table = EntitlementAction::ALL
            .into_iter()
            .fold(EntitlementTable::builder(), |b, action| match action {
                EntitlementAction::SeeEntity => b.on(action, |_, target| {
                    target.object_id().is_some_and(|id| id.as_str() != "secret")
                }),
                _ => b.on(action, |_, _| false),
            })
            .build()
            .unwrap();
        let bob = EntitlementContext::new("bob");
        let visible = EntitlementTarget::Entity {
            id: ObjectId::parse("web").unwrap(),
        };
        let hidden = EntitlementTarget::Entity {
            id: ObjectId::parse("secret").unwrap(),
        };
        assert!(table.is_entitled(&bob, EntitlementAction::SeeEntity, &visible));
        assert!(!table.is_entitled(&bob, EntitlementAction::SeeEntity, &hidden));
        assert!(!table.is_entitled(&bob, EntitlementAction::Rebind, &EntitlementTarget::None));
        assert!(table.is_entitled(
            &EntitlementContext::system(),
            EntitlementAction::Rebind,
            &EntitlementTarget::None
        ));
    }

    #[test]
    fn test_require() {
        let table = full_builder().build().unwrap();
        let admin = EntitlementContext::new("ann").with_role("admin");
        let guest = EntitlementContext::new("gus");
        assert!(require(&table, &admin, EntitlementAction::ChangeHaState, &EntitlementTarget::None).is_ok());
        assert_eq!(
            require(&table, &guest, EntitlementAction::ChangeHaState, &EntitlementTarget::None),
            Err(EntitlementError::Denied {
                user: "gus".to_string(),
                action: EntitlementAction::ChangeHaState,
            })
        );
    }

    #[test]
    fn test_read_only_preset() {
        let table = EntitlementTable::read_only_except("operator");
        assert_eq!(table.actions().count(), EntitlementAction::ALL.len());
        let guest = EntitlementContext::new("gus");
        let op = EntitlementContext::new("olive").with_role("operator");
        assert!(table.is_entitled(&guest, EntitlementAction::SeeSensor, &EntitlementTarget::None));
        assert!(!table.is_entitled(&guest, EntitlementAction::ModifyTopology, &EntitlementTarget::None));
        assert!(table.is_entitled(&op, EntitlementAction::ModifyTopology, &EntitlementTarget::None));
        assert!(AllowAll.is_entitled(&guest, EntitlementAction::Rebind, &EntitlementTarget::None));
    }

    proptest::proptest! {
        #[test]
        fn prop_read_only_preset(index in 0..EntitlementAction::ALL.len(), operator: bool, root: bool) {
            let action = EntitlementAction::ALL[index];
            let mut ctx = EntitlementContext::new("someone");
            if operator {
                ctx = ctx.with_role("operator");
            }
            if root {
                ctx = ctx.with_role(EntitlementContext::ROOT_ROLE);
            }
            let table = EntitlementTable::read_only_except("operator");
            let expected = root || operator || action.is_read_only();
            proptest::prop_assert_eq!(
                table.is_entitled(&ctx, action, &EntitlementTarget::None),
                expected
            );
        }
    }
}
