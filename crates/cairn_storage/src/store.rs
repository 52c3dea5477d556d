//! Object store contract.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock};

/// Store result type
pub type StoreResult<T> = Result<T, StoreError>;

/// Store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Store cannot be reached
    #[error("store unavailable: {reason}")]
    Unavailable {
        /// Why
        reason: String,
    },

    /// Store refused the write
    #[error("write to {path} rejected: {reason}")]
    Rejected {
        /// Target path
        path: String,
        /// Why
        reason: String,
    },

    /// Underlying I/O failure
    #[error("I/O error on {path}: {reason}")]
    Io {
        /// Target path
        path: String,
        /// OS message
        reason: String,
    },

    /// Path not acceptable to the store
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath {
        /// Offending path
        path: String,
        /// Why
        reason: String,
    },
}

impl StoreError {
    /// Whether retrying the same call may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::InvalidPath { .. })
    }
}

/// Byte-oriented persistent store.
///
/// Paths are `/`-separated relative names. Writes are durable once `put`
/// returns. Implementations must be safe to share between tasks.
#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    /// Short human-readable description for logs
    fn summary_name(&self) -> String;

    /// Write bytes, replacing any existing record
    async fn put(&self, path: &str, data: Bytes) -> StoreResult<()>;

    /// Read bytes; `None` if absent
    async fn get(&self, path: &str) -> StoreResult<Option<Bytes>>;

    /// Paths starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Delete a record; `false` if it was absent
    async fn delete(&self, path: &str) -> StoreResult<bool>;
}

/// Check that a path is relative, normalised, and `/`-separated
///
/// # Errors
///
/// Returns [`StoreError::InvalidPath`] describing the first problem found
pub fn validate_path(path: &str) -> StoreResult<()> {
    let invalid = |reason: &str| StoreError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };
    if path.is_empty() {
        return Err(invalid("empty"));
    }
    if path.contains('\\') {
        return Err(invalid("backslash"));
    }
    for segment in path.split('/') {
        match segment {
            "" => return Err(invalid("empty segment")),
            "." | ".." => return Err(invalid("relative segment")),
            s if s.starts_with('.') => return Err(invalid("hidden segment")),
            _ => {}
        }
    }
    Ok(())
}

/// In-memory store.
///
/// Has an availability switch and a write-failure injector so tests can
/// simulate an unreachable store or transient write failures.
#[derive(Debug)]
pub struct InMemoryObjectStore {
    records: RwLock<BTreeMap<String, Bytes>>,
    available: AtomicBool,
    failing_puts: AtomicU32,
}

impl InMemoryObjectStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
            failing_puts: AtomicU32::new(0),
        }
    }

    /// Make every call fail with [`StoreError::Unavailable`] (or stop doing so)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Reject the next `count` puts
    pub fn fail_next_puts(&self, count: u32) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    /// Number of records held
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite a record without any checks (for corrupting records in tests)
    pub fn insert_raw(&self, path: impl Into<String>, data: impl Into<Bytes>) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.into(), data.into());
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable {
                reason: "in-memory store switched off".to_string(),
            })
        }
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    fn summary_name(&self) -> String {
        "in-memory".to_string()
    }

    async fn put(&self, path: &str, data: Bytes) -> StoreResult<()> {
        self.check_available()?;
        validate_path(path)?;
        let injected = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Rejected {
                path: path.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string(), data);
        Ok(())
    }

    async fn get(&self, path: &str) -> StoreResult<Option<Bytes>> {
        self.check_available()?;
        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.check_available()?;
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn delete(&self, path: &str) -> StoreResult<bool> {
        self.check_available()?;
        Ok(self
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path)
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = InMemoryObjectStore::new();
        store.put("mementos/a", Bytes::from_static(b"one")).await.unwrap();
        assert_eq!(
            store.get("mementos/a").await.unwrap(),
            Some(Bytes::from_static(b"one"))
        );
        assert!(store.delete("mementos/a").await.unwrap());
        assert!(!store.delete("mementos/a").await.unwrap());
        assert_eq!(store.get("mementos/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_prefix_sorted() {
        let store = InMemoryObjectStore::new();
        for path in ["mementos/b", "plane/master", "mementos/a", "plane/nodes/x"] {
            store.put(path, Bytes::new()).await.unwrap();
        }
        assert_eq!(
            store.list("mementos/").await.unwrap(),
            vec!["mementos/a".to_string(), "mementos/b".to_string()]
        );
        assert_eq!(store.list("").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = InMemoryObjectStore::new();
        store.set_available(false);
        let err = store.put("a", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable { .. }));
        assert!(err.is_transient());
        store.set_available(true);
        store.put("a", Bytes::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_injected_put_failures() {
        let store = InMemoryObjectStore::new();
        store.fail_next_puts(2);
        assert!(store.put("a", Bytes::new()).await.is_err());
        assert!(store.put("a", Bytes::new()).await.is_err());
        store.put("a", Bytes::new()).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("mementos/web").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("/abs").is_err());
        assert!(validate_path("a//b").is_err());
        assert!(validate_path("a/../b").is_err());
        assert!(validate_path("a/.tmp").is_err());
        let err = validate_path("a\\b").unwrap_err();
        assert!(!err.is_transient());
    }
}
