//! Coalescing write queue.
//!
//! Holds at most one pending operation per id. A new operation for an id
//! replaces the pending one but keeps its original queue time, so an id
//! that changes continuously is still written once `max_delay` has passed.

use cairn_core::ObjectId;
use cairn_memento::Memento;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Operation waiting to be applied to the store
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOp {
    /// Write the latest memento
    Write(Box<Memento>),
    /// Delete the record
    Delete,
}

/// One queued operation
#[derive(Debug, Clone)]
pub struct Pending {
    /// What to do
    pub op: PendingOp,
    /// Per-queue sequence number, increasing with every enqueue
    pub sequence: u64,
    /// When the id first became dirty
    pub first_queued: Instant,
    /// When the op was last replaced
    pub last_update: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: BTreeMap<ObjectId, Pending>,
    next_sequence: u64,
}

/// Pending writes keyed by id
#[derive(Debug, Default)]
pub struct WriteQueue {
    state: Mutex<QueueState>,
}

impl WriteQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an operation, replacing any pending one for the same id; returns its sequence
    pub fn enqueue(&self, id: ObjectId, op: PendingOp) -> u64 {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.next_sequence += 1;
        let sequence = state.next_sequence;
        match state.pending.get_mut(&id) {
            Some(pending) => {
                pending.op = op;
                pending.sequence = sequence;
                pending.last_update = now;
            }
            None => {
                state.pending.insert(
                    id,
                    Pending {
                        op,
                        sequence,
                        first_queued: now,
                        last_update: now,
                    },
                );
            }
        }
        sequence
    }

    /// Remove and return entries ready to write.
    ///
    /// An entry is ready once it has been quiet for `debounce`, or has been
    /// waiting `max_delay` in total. With `force` everything is ready.
    pub fn take_ready(
        &self,
        debounce: Duration,
        max_delay: Duration,
        force: bool,
    ) -> Vec<(ObjectId, Pending)> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let ready: Vec<ObjectId> = state
            .pending
            .iter()
            .filter(|(_, p)| {
                force
                    || now.duration_since(p.last_update) >= debounce
                    || now.duration_since(p.first_queued) >= max_delay
            })
            .map(|(id, _)| id.clone())
            .collect();
        ready
            .into_iter()
            .filter_map(|id| state.pending.remove(&id).map(|p| (id, p)))
            .collect()
    }

    /// Put back an entry whose write failed, unless a newer op has been queued since
    pub fn requeue(&self, id: ObjectId, pending: Pending) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.pending.contains_key(&id) {
            return false;
        }
        state.pending.insert(id, pending);
        true
    }

    /// Number of pending ids
    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .len()
    }

    /// Check if nothing is pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything pending; returns how many ops were discarded
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let n = state.pending.len();
        state.pending.clear();
        n
    }
}
