//! Filesystem-backed store rooted at a directory

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{DirEntry, FileStat, FileStore, StoreResult, normalize_path};
use crate::error::StoreError;

#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> StoreResult<PathBuf> {
        let normalized = normalize_path(path)?;
        let mut resolved = self.root.clone();
        for segment in normalized.split('/').filter(|s| !s.is_empty()) {
            resolved.push(segment);
        }
        Ok(resolved)
    }
}

#[async_trait]
impl FileStore for FsStore {
    async fn stat(&self, path: &str) -> StoreResult<Option<FileStat>> {
        let resolved = self.resolve(path)?;
        match fs::metadata(&resolved).await {
            Ok(metadata) => Ok(Some(FileStat {
                size: metadata.len(),
                is_dir: metadata.is_dir(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    async fn read(&self, path: &str) -> StoreResult<Bytes> {
        let resolved = self.resolve(path)?;
        let data = fs::read(&resolved)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        Ok(Bytes::from(data))
    }

    async fn write(&self, path: &str, data: Bytes) -> StoreResult<()> {
        let resolved = self.resolve(path)?;

        // Ensure parent directory exists
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(path, e))?;
        }

        // Write to temporary file first for atomicity
        let mut temp_name = resolved.file_name().unwrap_or_default().to_os_string();
        temp_name.push(".tmp");
        let temp_path = resolved.with_file_name(temp_name);

        {
            let mut file = fs::File::create(&temp_path)
                .await
                .map_err(|e| StoreError::io(path, e))?;
            file.write_all(&data)
                .await
                .map_err(|e| StoreError::io(path, e))?;
            file.flush().await.map_err(|e| StoreError::io(path, e))?;
            file.sync_all().await.map_err(|e| StoreError::io(path, e))?;
        }

        // Atomic rename
        fs::rename(&temp_path, &resolved)
            .await
            .map_err(|e| StoreError::io(path, e))
    }

    async fn delete(&self, path: &str) -> StoreResult<bool> {
        let resolved = self.resolve(path)?;
        match fs::remove_file(&resolved).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    async fn mkdir(&self, path: &str) -> StoreResult<()> {
        let resolved = self.resolve(path)?;
        fs::create_dir_all(&resolved)
            .await
            .map_err(|e| StoreError::io(path, e))
    }

    async fn rmdir(&self, path: &str) -> StoreResult<()> {
        let resolved = self.resolve(path)?;
        match fs::remove_dir_all(&resolved).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    async fn list(&self, path: &str) -> StoreResult<Vec<DirEntry>> {
        let resolved = self.resolve(path)?;
        let mut entries = Vec::new();

        let mut dir = match fs::read_dir(&resolved).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(StoreError::io(path, e)),
        };

        while let Some(entry) = dir.next_entry().await.map_err(|e| StoreError::io(path, e))? {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| StoreError::io(path, e))?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: file_type.is_dir(),
            });
        }

        entries.sort();
        Ok(entries)
    }

    async fn rename(&self, from: &str, to: &str) -> StoreResult<()> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(to, e))?;
        }
        fs::rename(&source, &target)
            .await
            .map_err(|e| StoreError::io(from, e))
    }

    fn local_path(&self, path: &str) -> Option<PathBuf> {
        self.resolve(path).ok()
    }
}
