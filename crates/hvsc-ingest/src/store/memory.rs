//! In-memory store
//!
//! Used for tests and for hosts that keep the library in a virtual
//! filesystem. Directories are implicit (any path prefix of a file) or
//! explicit (created with `mkdir`).

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};

use super::{DirEntry, FileStat, FileStore, StoreResult, normalize_path, parent_path};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct Inner {
    files: BTreeMap<String, Bytes>,
    dirs: BTreeSet<String>,
    failing_writes: Vec<String>,
    failing_deletes: Vec<String>,
}

impl Inner {
    fn is_dir(&self, path: &str) -> bool {
        if path.is_empty() || self.dirs.contains(path) {
            return true;
        }
        let prefix = format!("{path}/");
        self.files.keys().any(|k| k.starts_with(&prefix))
            || self.dirs.iter().any(|d| d.starts_with(&prefix))
    }

    fn add_parents(&mut self, path: &str) {
        let mut current = parent_path(path);
        while let Some(dir) = current {
            self.dirs.insert(dir.to_string());
            current = parent_path(dir);
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

fn injected_failure(path: &str, op: &str) -> StoreError {
    StoreError::Io {
        path: path.to_string(),
        source: std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            format!("injected {op} failure"),
        ),
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write to a path containing `fragment` fail.
    pub fn fail_writes_containing(&self, fragment: impl Into<String>) {
        self.inner.write().failing_writes.push(fragment.into());
    }

    /// Make every delete of a path containing `fragment` fail.
    pub fn fail_deletes_containing(&self, fragment: impl Into<String>) {
        self.inner.write().failing_deletes.push(fragment.into());
    }

    /// All file paths currently stored.
    pub fn paths(&self) -> Vec<String> {
        self.inner.read().files.keys().cloned().collect()
    }

    pub fn file_count(&self) -> usize {
        self.inner.read().files.len()
    }
}

#[async_trait]
impl FileStore for MemoryStore {
    async fn stat(&self, path: &str) -> StoreResult<Option<FileStat>> {
        let path = normalize_path(path)?;
        let inner = self.inner.read();
        if let Some(data) = inner.files.get(&path) {
            return Ok(Some(FileStat {
                size: data.len() as u64,
                is_dir: false,
            }));
        }
        if inner.is_dir(&path) {
            return Ok(Some(FileStat {
                size: 0,
                is_dir: true,
            }));
        }
        Ok(None)
    }

    async fn read(&self, path: &str) -> StoreResult<Bytes> {
        let normalized = normalize_path(path)?;
        self.inner
            .read()
            .files
            .get(&normalized)
            .cloned()
            .ok_or_else(|| StoreError::not_found(path))
    }

    async fn write(&self, path: &str, data: Bytes) -> StoreResult<()> {
        let normalized = normalize_path(path)?;
        let mut inner = self.inner.write();
        if inner
            .failing_writes
            .iter()
            .any(|f| normalized.contains(f.as_str()))
        {
            return Err(injected_failure(path, "write"));
        }
        inner.add_parents(&normalized);
        inner.files.insert(normalized, data);
        Ok(())
    }

    async fn delete(&self, path: &str) -> StoreResult<bool> {
        let normalized = normalize_path(path)?;
        let mut inner = self.inner.write();
        if inner
            .failing_deletes
            .iter()
            .any(|f| normalized.contains(f.as_str()))
        {
            return Err(injected_failure(path, "delete"));
        }
        Ok(inner.files.remove(&normalized).is_some())
    }

    async fn mkdir(&self, path: &str) -> StoreResult<()> {
        let normalized = normalize_path(path)?;
        let mut inner = self.inner.write();
        inner.add_parents(&normalized);
        if !normalized.is_empty() {
            inner.dirs.insert(normalized);
        }
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> StoreResult<()> {
        let normalized = normalize_path(path)?;
        let mut inner = self.inner.write();
        if normalized.is_empty() {
            inner.files.clear();
            inner.dirs.clear();
            return Ok(());
        }
        let prefix = format!("{normalized}/");
        inner.files.retain(|k, _| !k.starts_with(&prefix));
        inner
            .dirs
            .retain(|d| d != &normalized && !d.starts_with(&prefix));
        Ok(())
    }

    async fn list(&self, path: &str) -> StoreResult<Vec<DirEntry>> {
        let normalized = normalize_path(path)?;
        let inner = self.inner.read();
        let prefix = if normalized.is_empty() {
            String::new()
        } else {
            format!("{normalized}/")
        };

        let mut children: BTreeMap<String, bool> = BTreeMap::new();
        for key in inner.files.keys() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                match rest.split_once('/') {
                    Some((dir, _)) => {
                        children.insert(dir.to_string(), true);
                    }
                    None => {
                        children.entry(rest.to_string()).or_insert(false);
                    }
                }
            }
        }
        for dir in &inner.dirs {
            if let Some(rest) = dir.strip_prefix(&prefix) {
                let name = rest.split('/').next().unwrap_or(rest);
                if !name.is_empty() {
                    children.insert(name.to_string(), true);
                }
            }
        }

        Ok(children
            .into_iter()
            .map(|(name, is_dir)| DirEntry { name, is_dir })
            .collect())
    }

    async fn rename(&self, from: &str, to: &str) -> StoreResult<()> {
        let source = normalize_path(from)?;
        let target = normalize_path(to)?;
        let mut inner = self.inner.write();
        let data = inner
            .files
            .remove(&source)
            .ok_or_else(|| StoreError::not_found(from))?;
        inner.add_parents(&target);
        inner.files.insert(target, data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_implicit_directories() {
        let store = MemoryStore::new();
        store
            .write("library/MUSICIANS/H/a.sid", Bytes::from_static(b"a"))
            .await
            .unwrap();
        store
            .write("library/DOCUMENTS/Songlengths.md5", Bytes::from_static(b"m"))
            .await
            .unwrap();

        let root = store.list("library").await.unwrap();
        assert_eq!(
            root,
            vec![
                DirEntry {
                    name: "DOCUMENTS".to_string(),
                    is_dir: true
                },
                DirEntry {
                    name: "MUSICIANS".to_string(),
                    is_dir: true
                },
            ]
        );

        assert!(store.stat("library/MUSICIANS").await.unwrap().unwrap().is_dir);
        assert!(store.stat("library/MUSIC").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rmdir_scoped_to_prefix() {
        let store = MemoryStore::new();
        store.write("library/a", Bytes::from_static(b"a")).await.unwrap();
        store.write("library2/b", Bytes::from_static(b"b")).await.unwrap();
        store.rmdir("library").await.unwrap();
        assert_eq!(store.paths(), vec!["library2/b".to_string()]);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryStore::new();
        store.fail_writes_containing("blocked");
        store.fail_deletes_containing("sticky");

        assert!(store
            .write("blocked/a", Bytes::from_static(b"a"))
            .await
            .is_err());

        store.write("sticky.sid", Bytes::from_static(b"s")).await.unwrap();
        assert!(store.delete("sticky.sid").await.is_err());
        assert!(!store.delete("absent.sid").await.unwrap());
    }

    #[tokio::test]
    async fn test_mkdir_visible_when_empty() {
        let store = MemoryStore::new();
        store.mkdir("library/empty").await.unwrap();
        assert!(store.stat("library/empty").await.unwrap().unwrap().is_dir);
        assert_eq!(store.list("library").await.unwrap().len(), 1);
    }
}
