//! Byte-level persistence used by the pipeline
//!
//! The archive cache and the materialised library are both [`FileStore`]s:
//! a small async interface with directory semantics over `/`-separated
//! relative paths. Small JSON documents (ingestion state, status summary)
//! live in a [`KvStore`].
//!
//! All mutations are tolerant: writes overwrite, deleting an absent file
//! reports `false` instead of failing, and removing an absent directory is a
//! no-op. This is what makes re-applying an archive idempotent.

mod fs;
mod kv;
mod memory;

pub use fs::FsStore;
pub use kv::{FileKvStore, KvStore, MemoryKvStore};
pub use memory::MemoryStore;

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;

use crate::error::StoreError;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub is_dir: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

#[async_trait]
pub trait FileStore: Send + Sync {
    /// `None` when nothing exists at `path`.
    async fn stat(&self, path: &str) -> StoreResult<Option<FileStat>>;

    async fn read(&self, path: &str) -> StoreResult<Bytes>;

    /// Creates missing parent directories and overwrites existing files.
    async fn write(&self, path: &str, data: Bytes) -> StoreResult<()>;

    /// Returns true if a file was removed.
    async fn delete(&self, path: &str) -> StoreResult<bool>;

    async fn mkdir(&self, path: &str) -> StoreResult<()>;

    /// Recursive; absent directories are ignored.
    async fn rmdir(&self, path: &str) -> StoreResult<()>;

    /// Immediate children, sorted by name. Empty for absent directories.
    async fn list(&self, path: &str) -> StoreResult<Vec<DirEntry>>;

    /// Replaces `to` if it exists.
    async fn rename(&self, from: &str, to: &str) -> StoreResult<()>;

    /// Filesystem location backing `path`, for stores that have one.
    fn local_path(&self, _path: &str) -> Option<PathBuf> {
        None
    }
}

/// Normalise a store path: `\` becomes `/`, empty and `.` segments are
/// dropped and `..` is rejected. The root is the empty string.
pub fn normalize_path(path: &str) -> StoreResult<String> {
    let mut segments = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => return Err(StoreError::invalid_path(path)),
            other => segments.push(other),
        }
    }
    Ok(segments.join("/"))
}

/// Join two store paths.
pub fn join_path(base: &str, child: &str) -> String {
    let base = base.trim_end_matches('/');
    let child = child.trim_start_matches('/');
    match (base.is_empty(), child.is_empty()) {
        (true, _) => child.to_string(),
        (_, true) => base.to_string(),
        _ => format!("{base}/{child}"),
    }
}

/// Parent directory of a normalised path, `None` at the root level.
pub(crate) fn parent_path(path: &str) -> Option<&str> {
    path.rfind('/').map(|idx| &path[..idx])
}
