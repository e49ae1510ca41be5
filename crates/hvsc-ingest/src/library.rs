//! Materialised song library
//!
//! The library is a directory tree under `library_root` addressed by
//! virtual paths (`/MUSICIANS/H/Hubbard_Rob/Commando.sid`). Archives are
//! applied through an [`ArchiveApplier`], which writes entries as they are
//! extracted and holds deletions back until the archive is exhausted.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::classify::{EntryKind, classify_entry, parse_deletion_list};
use crate::error::Result;
use crate::extract::ArchiveEntry;
use crate::plan::ArchiveKind;
use crate::store::{FileStat, FileStore, StoreResult, join_path};

#[derive(Clone)]
pub struct LibraryStore {
    store: Arc<dyn FileStore>,
    root: String,
}

impl LibraryStore {
    pub fn new(store: Arc<dyn FileStore>, root: impl Into<String>) -> Self {
        Self {
            store,
            root: root.into(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn store(&self) -> &Arc<dyn FileStore> {
        &self.store
    }

    /// Store path backing a virtual path.
    pub fn store_path(&self, virtual_path: &str) -> String {
        join_path(&self.root, virtual_path)
    }

    /// Remove every library entry and recreate the empty root.
    pub async fn reset(&self) -> StoreResult<()> {
        info!(root = %self.root, "Resetting library");
        self.store.rmdir(&self.root).await?;
        self.store.mkdir(&self.root).await
    }

    pub async fn write(&self, virtual_path: &str, data: Bytes) -> StoreResult<()> {
        self.store.write(&self.store_path(virtual_path), data).await
    }

    pub async fn read(&self, virtual_path: &str) -> StoreResult<Bytes> {
        self.store.read(&self.store_path(virtual_path)).await
    }

    pub async fn stat(&self, virtual_path: &str) -> StoreResult<Option<FileStat>> {
        self.store.stat(&self.store_path(virtual_path)).await
    }

    pub async fn delete(&self, virtual_path: &str) -> StoreResult<bool> {
        self.store.delete(&self.store_path(virtual_path)).await
    }
}

impl fmt::Debug for LibraryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryStore")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

/// Counters for one applied archive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub songs_written: usize,
    pub songlength_files_written: usize,
    pub deletion_lists: usize,
    pub deletions_applied: usize,
    pub deletions_missing: usize,
    pub deletions_failed: usize,
    pub ignored: usize,
}

impl ApplyStats {
    pub fn wrote_metadata(&self) -> bool {
        self.songlength_files_written > 0
    }
}

/// Applies the entries of a single archive to the library.
#[derive(Debug)]
pub struct ArchiveApplier<'a> {
    library: &'a LibraryStore,
    kind: ArchiveKind,
    pending_deletions: Vec<String>,
    stats: ApplyStats,
}

impl<'a> ArchiveApplier<'a> {
    pub fn new(library: &'a LibraryStore, kind: ArchiveKind) -> Self {
        Self {
            library,
            kind,
            pending_deletions: Vec::new(),
            stats: ApplyStats::default(),
        }
    }

    pub fn stats(&self) -> &ApplyStats {
        &self.stats
    }

    /// Classify and apply one entry. Deletion lists are queued, not written.
    pub async fn apply(&mut self, entry: &ArchiveEntry) -> Result<EntryKind> {
        let classified = classify_entry(&entry.path, self.kind);
        match (classified.kind, classified.virtual_path) {
            (EntryKind::DeletionList, _) => {
                let content = String::from_utf8_lossy(&entry.data);
                let paths = parse_deletion_list(&content);
                debug!(list = %entry.path, count = paths.len(), "Queued deletion list");
                self.pending_deletions.extend(paths);
                self.stats.deletion_lists += 1;
            }
            (EntryKind::Song, Some(path)) => {
                self.library.write(&path, entry.data.clone()).await?;
                self.stats.songs_written += 1;
            }
            (EntryKind::SonglengthsMd5 | EntryKind::SonglengthsTxt, Some(path)) => {
                self.library.write(&path, entry.data.clone()).await?;
                debug!(path = %path, "Wrote songlength file");
                self.stats.songlength_files_written += 1;
            }
            _ => self.stats.ignored += 1,
        }
        Ok(classified.kind)
    }

    /// Apply queued deletions, one at a time. Individual failures are logged
    /// and counted but never abort the batch.
    pub async fn finish(mut self) -> ApplyStats {
        for path in std::mem::take(&mut self.pending_deletions) {
            match self.library.delete(&path).await {
                Ok(true) => self.stats.deletions_applied += 1,
                Ok(false) => self.stats.deletions_missing += 1,
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to delete library entry");
                    self.stats.deletions_failed += 1;
                }
            }
        }
        self.stats
    }
}
