//! Store decorator that meters traffic.

use crate::store::{ObjectStore, StoreResult};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of store traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoreStats {
    /// Successful puts
    pub puts: u64,
    /// Gets, hits or misses
    pub gets: u64,
    /// Lists
    pub lists: u64,
    /// Deletes
    pub deletes: u64,
    /// Bytes written by successful puts
    pub bytes_in: u64,
    /// Bytes returned by gets
    pub bytes_out: u64,
    /// Calls that returned an error
    pub failures: u64,
}

impl StoreStats {
    /// Calls that only read metadata (list, delete)
    #[must_use]
    pub fn query_ops(&self) -> u64 {
        self.lists + self.deletes
    }

    /// Calls that move record data (put, get)
    #[must_use]
    pub fn data_ops(&self) -> u64 {
        self.puts + self.gets
    }
}

#[derive(Debug, Default)]
struct Counters {
    puts: AtomicU64,
    gets: AtomicU64,
    lists: AtomicU64,
    deletes: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    failures: AtomicU64,
}

/// Wraps another store and counts every call
#[derive(Debug)]
pub struct ListeningObjectStore {
    inner: Arc<dyn ObjectStore>,
    counters: Counters,
}

impl ListeningObjectStore {
    /// Wrap a store
    #[must_use]
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            counters: Counters::default(),
        }
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let c = &self.counters;
        StoreStats {
            puts: c.puts.load(Ordering::Relaxed),
            gets: c.gets.load(Ordering::Relaxed),
            lists: c.lists.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
            bytes_in: c.bytes_in.load(Ordering::Relaxed),
            bytes_out: c.bytes_out.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
        }
    }

    /// Zero all counters
    pub fn reset(&self) {
        let c = &self.counters;
        for counter in [
            &c.puts,
            &c.gets,
            &c.lists,
            &c.deletes,
            &c.bytes_in,
            &c.bytes_out,
            &c.failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn track<T>(&self, result: StoreResult<T>) -> StoreResult<T> {
        if result.is_err() {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

#[async_trait]
impl ObjectStore for ListeningObjectStore {
    fn summary_name(&self) -> String {
        format!("listening({})", self.inner.summary_name())
    }

    async fn put(&self, path: &str, data: Bytes) -> StoreResult<()> {
        let len = data.len() as u64;
        let result = self.track(self.inner.put(path, data).await);
        if result.is_ok() {
            self.counters.puts.fetch_add(1, Ordering::Relaxed);
            self.counters.bytes_in.fetch_add(len, Ordering::Relaxed);
        }
        result
    }

    async fn get(&self, path: &str) -> StoreResult<Option<Bytes>> {
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        let result = self.track(self.inner.get(path).await);
        if let Ok(Some(data)) = &result {
            self.counters
                .bytes_out
                .fetch_add(data.len() as u64, Ordering::Relaxed);
        }
        result
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.counters.lists.fetch_add(1, Ordering::Relaxed);
        self.track(self.inner.list(prefix).await)
    }

    async fn delete(&self, path: &str) -> StoreResult<bool> {
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.track(self.inner.delete(path).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryObjectStore;

    #[tokio::test]
    async fn test_counts_traffic() {
        let inner = Arc::new(InMemoryObjectStore::new());
        let store = ListeningObjectStore::new(inner.clone());

        store.put("a", Bytes::from_static(b"12345")).await.unwrap();
        store.get("a").await.unwrap();
        store.get("missing").await.unwrap();
        store.list("").await.unwrap();
        store.delete("a").await.unwrap();

        let stats = store.stats();
        assert_eq!(stats.puts, 1);
        assert_eq!(stats.gets, 2);
        assert_eq!(stats.bytes_in, 5);
        assert_eq!(stats.bytes_out, 5);
        assert_eq!(stats.query_ops(), 2);
        assert_eq!(stats.data_ops(), 3);
        assert_eq!(stats.failures, 0);
    }

    #[tokio::test]
    async fn test_counts_failures_and_resets() {
        let inner = Arc::new(InMemoryObjectStore::new());
        let store = ListeningObjectStore::new(inner.clone());
        inner.set_available(false);
        assert!(store.put("a", Bytes::new()).await.is_err());
        assert_eq!(store.stats().failures, 1);
        assert_eq!(store.stats().puts, 0);

        store.reset();
        assert_eq!(store.stats(), StoreStats::default());
        assert!(store.summary_name().contains("in-memory"));
    }
}
