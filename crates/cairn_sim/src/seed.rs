//! Seeds for reproducible HA runs.
//!
//! A run draws from several independent random streams (tick order,
//! injected failures). Each stream gets its own ChaCha generator keyed off
//! the run seed, so adding draws to one stream never shifts another.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::hash::Hasher;

/// Independent random streams of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeedStream {
    /// Order nodes tick in within a round
    TickOrder,
    /// Failures drawn from the failure model
    Failures,
}

impl SeedStream {
    const fn tag(self) -> &'static [u8] {
        match self {
            Self::TickOrder => b"tick-order",
            Self::Failures => b"failures",
        }
    }
}

/// Run seed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimSeed {
    /// Seed value
    pub value: u64,
    /// Label the value was hashed from, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl SimSeed {
    /// Seed from a number
    #[must_use]
    pub fn from_literal(value: u64) -> Self {
        Self { value, label: None }
    }

    /// Seed from a human-readable label, such as a test or scenario name
    #[must_use]
    pub fn from_label(label: impl Into<String>) -> Self {
        let label = label.into();
        let mut hasher = fnv::FnvHasher::default();
        hasher.write(label.as_bytes());
        Self {
            value: hasher.finish(),
            label: Some(label),
        }
    }

    /// Generator for one stream of this run
    #[must_use]
    pub fn stream(&self, stream: SeedStream) -> ChaCha8Rng {
        let mut hasher = fnv::FnvHasher::default();
        hasher.write_u64(self.value);
        hasher.write(stream.tag());
        ChaCha8Rng::seed_from_u64(hasher.finish())
    }
}

impl Default for SimSeed {
    fn default() -> Self {
        Self::from_literal(42)
    }
}
