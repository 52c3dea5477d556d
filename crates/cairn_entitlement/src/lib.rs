//! CAIRN Entitlements
//!
//! A yes/no gate consulted before sensitive and master-only operations.
//! Each action kind maps to a typed check; a table missing any action is
//! rejected when it is built, not when the action is first checked.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod action;
pub mod table;

pub use action::{EntitlementAction, EntitlementContext, EntitlementTarget};
pub use table::{
    AllowAll, CheckFn, EntitlementError, EntitlementManager, EntitlementTable,
    EntitlementTableBuilder, require,
};
