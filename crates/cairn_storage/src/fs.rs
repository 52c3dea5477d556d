//! Filesystem-backed object store.
//!
//! Each path maps to a file under the base directory. Writes go to a hidden
//! temp file in the same directory and are renamed into place, so a reader
//! sees either the old record or the new one. Hidden files are never listed.

use crate::store::{ObjectStore, StoreError, StoreResult, validate_path};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Object store over a local directory
#[derive(Debug)]
pub struct FsObjectStore {
    base: PathBuf,
    temp_counter: AtomicU64,
}

impl FsObjectStore {
    /// Open a store rooted at `base`, creating the directory if needed
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created
    pub async fn open(base: impl Into<PathBuf>) -> StoreResult<Self> {
        let base = base.into();
        tokio::fs::create_dir_all(&base)
            .await
            .map_err(|e| io_error(&base, &e))?;
        Ok(Self {
            base,
            temp_counter: AtomicU64::new(0),
        })
    }

    /// Base directory
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    fn file_for(&self, path: &str) -> StoreResult<PathBuf> {
        validate_path(path)?;
        Ok(path.split('/').fold(self.base.clone(), |acc, seg| acc.join(seg)))
    }
}

fn io_error(path: &Path, err: &std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    fn summary_name(&self) -> String {
        format!("fs:{}", self.base.display())
    }

    async fn put(&self, path: &str, data: Bytes) -> StoreResult<()> {
        let file = self.file_for(path)?;
        let dir = file.parent().unwrap_or(&self.base).to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error(&dir, &e))?;

        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let temp = dir.join(format!(".{}.{}.{}.tmp", name, std::process::id(), n));

        tokio::fs::write(&temp, &data)
            .await
            .map_err(|e| io_error(&temp, &e))?;
        if let Err(e) = tokio::fs::rename(&temp, &file).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(io_error(&file, &e));
        }
        debug!(path, bytes = data.len(), "wrote record");
        Ok(())
    }

    async fn get(&self, path: &str) -> StoreResult<Option<Bytes>> {
        let file = self.file_for(path)?;
        match tokio::fs::read(&file).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&file, &e)),
        }
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut out = Vec::new();
        let mut pending: Vec<(PathBuf, String)> = vec![(self.base.clone(), String::new())];

        while let Some((dir, rel)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(&dir, &e)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, &e))? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let child = if rel.is_empty() {
                    name
                } else {
                    format!("{}/{}", rel, name)
                };
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| io_error(&entry.path(), &e))?;
                if file_type.is_dir() {
                    // Only descend where the prefix can still match.
                    if prefix.starts_with(&child) || child.starts_with(prefix) {
                        pending.push((entry.path(), child));
                    }
                } else if child.starts_with(prefix) {
                    out.push(child);
                }
            }
        }

        out.sort();
        Ok(out)
    }

    async fn delete(&self, path: &str) -> StoreResult<bool> {
        let file = self.file_for(path)?;
        match tokio::fs::remove_file(&file).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(&file, &e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::open(dir.path()).await.unwrap();

        store.put("mementos/web", Bytes::from_static(b"v1")).await.unwrap();
        store.put("mementos/web", Bytes::from_static(b"v2")).await.unwrap();
        assert_eq!(
            store.get("mementos/web").await.unwrap(),
            Some(Bytes::from_static(b"v2"))
        );
        assert_eq!(store.get("mementos/missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_recursive_list_skips_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::open(dir.path()).await.unwrap();
        store.put("mementos/a", Bytes::new()).await.unwrap();
        store.put("plane/nodes/n1", Bytes::new()).await.unwrap();
        store.put("plane/master", Bytes::new()).await.unwrap();
        std::fs::write(dir.path().join("mementos").join(".a.tmp"), b"x").unwrap();

        assert_eq!(store.list("mementos/").await.unwrap(), vec!["mementos/a"]);
        assert_eq!(
            store.list("plane/").await.unwrap(),
            vec!["plane/master", "plane/nodes/n1"]
        );
        assert_eq!(store.list("").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::open(dir.path()).await.unwrap();
        store.put("a", Bytes::new()).await.unwrap();
        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::open(dir.path()).await.unwrap();
        let err = store.put("../escape", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidPath { .. }));
    }

    #[tokio::test]
    async fn test_reopen_sees_records() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FsObjectStore::open(dir.path()).await.unwrap();
            store.put("mementos/x", Bytes::from_static(b"x")).await.unwrap();
        }
        let store = FsObjectStore::open(dir.path()).await.unwrap();
        assert_eq!(store.list("mementos/").await.unwrap(), vec!["mementos/x"]);
    }
}
