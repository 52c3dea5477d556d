//! Identifiers for CAIRN entities.
//!
//! Ids are opaque strings, stable for the lifetime of the thing they name.
//! They are embedded in store paths, so they may not be empty and may not
//! contain path separators or whitespace.

use crate::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Length of randomly generated ids
const RANDOM_ID_LEN: usize = 10;

fn validate(kind: &str, value: &str) -> CoreResult<()> {
    if value.is_empty() {
        return Err(CoreError::InvalidId {
            reason: format!("{} id must not be empty", kind),
        });
    }
    if let Some(bad) = value
        .chars()
        .find(|c| *c == '/' || *c == '\\' || c.is_whitespace() || c.is_control())
    {
        return Err(CoreError::InvalidId {
            reason: format!("{} id {:?} contains illegal character {:?}", kind, value, bad),
        });
    }
    if value == "." || value == ".." {
        return Err(CoreError::InvalidId {
            reason: format!("{} id {:?} is reserved", kind, value),
        });
    }
    Ok(())
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Create a new random id
            #[must_use]
            pub fn new() -> Self {
                let mut raw = Uuid::new_v4().simple().to_string();
                raw.truncate(RANDOM_ID_LEN);
                Self(raw)
            }

            /// Parse and validate an id
            ///
            /// # Errors
            ///
            /// Returns error if the id is empty or contains illegal characters
            pub fn parse(value: impl Into<String>) -> CoreResult<Self> {
                let value = value.into();
                validate($kind, &value)?;
                Ok(Self(value))
            }

            /// Get as string slice
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = CoreError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Managed object identifier - components, locations, and policies
    ObjectId,
    "object"
);

string_id!(
    /// Management node identifier - one per process in the management plane
    NodeId,
    "node"
);
