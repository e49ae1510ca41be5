//! Local archive cache
//!
//! Archives are cached under `<archive_dir>/<name>` next to a
//! `<name>.complete.json` marker. The marker is the only proof that a blob
//! was downloaded completely: a blob without a valid marker is deleted
//! rather than reused.
//!
//! New blobs are always written under the canonical name
//! `<prefix>-<kind>-<version>.<ext>`. Resolution also accepts the bare
//! canonical stem and the kind-less `<prefix>-<version>[.<ext>]` layout, in
//! which case the marker's `kind` decides whether the blob fits the plan.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::extract::ArchiveFormat;
use crate::plan::{ArchiveKind, ArchivePlan};
use crate::state::now_ms;
use crate::store::{FileStore, join_path};

pub const MARKER_SUFFIX: &str = ".complete.json";
pub const PARTIAL_SUFFIX: &str = ".part";

/// Completion record persisted beside a cached archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMarker {
    pub version: u32,
    pub kind: ArchiveKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    pub completed_at: u64,
}

impl CacheMarker {
    pub fn new(plan: ArchivePlan, size_bytes: u64) -> Self {
        Self {
            version: plan.version,
            kind: plan.kind,
            size_bytes: Some(size_bytes),
            completed_at: now_ms(),
        }
    }

    fn matches(&self, plan: ArchivePlan, blob_size: u64) -> bool {
        self.version == plan.version
            && self.kind == plan.kind
            && self.size_bytes.is_none_or(|size| size == blob_size)
    }
}

/// A cached archive whose marker was validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedArchive {
    pub plan: ArchivePlan,
    /// File name inside the cache directory
    pub name: String,
    /// Full store path
    pub path: String,
    pub size: u64,
}

pub struct ArchiveStore {
    store: Arc<dyn FileStore>,
    dir: String,
    prefix: String,
}

impl ArchiveStore {
    pub fn new(store: Arc<dyn FileStore>, dir: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn FileStore> {
        &self.store
    }

    pub fn dir(&self) -> &str {
        &self.dir
    }

    /// Canonical cache file name for a new download.
    pub fn canonical_name(&self, plan: ArchivePlan, format: ArchiveFormat) -> String {
        format!("{}.{}", plan.cache_stem(&self.prefix), format.extension())
    }

    pub fn path_of(&self, name: &str) -> String {
        join_path(&self.dir, name)
    }

    pub fn marker_path(&self, name: &str) -> String {
        join_path(&self.dir, &format!("{name}{MARKER_SUFFIX}"))
    }

    pub fn partial_path(&self, name: &str) -> String {
        join_path(&self.dir, &format!("{name}{PARTIAL_SUFFIX}"))
    }

    /// Kind (if named) and version encoded in a cache file name.
    fn parse_name(&self, name: &str) -> Option<(Option<ArchiveKind>, u32)> {
        let rest = name.strip_prefix(&self.prefix)?.strip_prefix('-')?;
        let (kind, rest) = if let Some(rest) = rest.strip_prefix("baseline-") {
            (Some(ArchiveKind::Baseline), rest)
        } else if let Some(rest) = rest.strip_prefix("update-") {
            (Some(ArchiveKind::Update), rest)
        } else {
            (None, rest)
        };
        let digits = match rest.split_once('.') {
            Some((digits, ext)) if ArchiveFormat::from_extension(ext).is_some() => digits,
            Some(_) => return None,
            None => rest,
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some((kind, digits.parse().ok()?))
    }

    /// Every name a cached copy of `plan` may live under, canonical first.
    pub fn candidate_names(&self, plan: ArchivePlan) -> Vec<String> {
        let stems = [
            plan.cache_stem(&self.prefix),
            format!("{}-{}", self.prefix, plan.version),
        ];
        let mut names = Vec::new();
        for stem in &stems {
            for format in ArchiveFormat::ALL {
                names.push(format!("{stem}.{}", format.extension()));
            }
            names.push(stem.clone());
        }
        names
    }

    /// Find a trustworthy cached copy of `plan`.
    ///
    /// Blobs without a valid marker are deleted on the way.
    pub async fn resolve(&self, plan: ArchivePlan) -> Result<Option<CachedArchive>> {
        for name in self.candidate_names(plan) {
            let path = self.path_of(&name);
            let Some(stat) = self.store.stat(&path).await? else {
                continue;
            };
            if stat.is_dir {
                continue;
            }

            match self.read_marker(&name).await {
                Some(marker) if marker.matches(plan, stat.size) => {
                    debug!(archive = %name, size = stat.size, "Using cached archive");
                    return Ok(Some(CachedArchive {
                        plan,
                        name,
                        path,
                        size: stat.size,
                    }));
                }
                Some(marker) if marker.version != plan.version || marker.kind != plan.kind => {
                    // Kind-less legacy name belonging to the other archive kind
                    debug!(archive = %name, "Cached archive belongs to a different plan");
                }
                _ => {
                    warn!(archive = %name, "Cached archive has no valid completion marker, deleting");
                    self.remove(&name).await?;
                }
            }
        }
        Ok(None)
    }

    /// Parsed marker for `name`, `None` if absent or unreadable.
    pub async fn read_marker(&self, name: &str) -> Option<CacheMarker> {
        let data = self.store.read(&self.marker_path(name)).await.ok()?;
        match serde_json::from_slice(&data) {
            Ok(marker) => Some(marker),
            Err(e) => {
                warn!(archive = %name, error = %e, "Malformed cache marker");
                None
            }
        }
    }

    pub async fn write_marker(&self, name: &str, marker: &CacheMarker) -> Result<()> {
        let json = serde_json::to_vec(marker)?;
        self.store
            .write(&self.marker_path(name), Bytes::from(json))
            .await?;
        Ok(())
    }

    pub async fn read(&self, cached: &CachedArchive) -> Result<Bytes> {
        Ok(self.store.read(&cached.path).await?)
    }

    /// Delete a blob together with its marker and partial download.
    pub async fn remove(&self, name: &str) -> Result<()> {
        self.store.delete(&self.marker_path(name)).await?;
        self.store.delete(&self.path_of(name)).await?;
        self.store.delete(&self.partial_path(name)).await?;
        Ok(())
    }

    /// Delete every cached variant of `plan`.
    pub async fn purge(&self, plan: ArchivePlan) -> Result<()> {
        for name in self.candidate_names(plan) {
            if let Some(marker) = self.read_marker(&name).await
                && (marker.version != plan.version || marker.kind != plan.kind)
            {
                continue;
            }
            self.remove(&name).await?;
        }
        info!(archive = %plan, "Purged cached archive");
        Ok(())
    }

    /// All marker-validated archives in the cache directory, ordered by
    /// kind (baselines first) then version.
    pub async fn list_cached(&self) -> Result<Vec<CachedArchive>> {
        let mut cached = Vec::new();

        for entry in self.store.list(&self.dir).await? {
            if entry.is_dir
                || entry.name.ends_with(MARKER_SUFFIX)
                || entry.name.ends_with(PARTIAL_SUFFIX)
            {
                continue;
            }
            let Some((named_kind, version)) = self.parse_name(&entry.name) else {
                continue;
            };

            let Some(marker) = self.read_marker(&entry.name).await else {
                continue;
            };
            let plan = ArchivePlan {
                kind: named_kind.unwrap_or(marker.kind),
                version,
            };

            let path = self.path_of(&entry.name);
            let Some(stat) = self.store.stat(&path).await? else {
                continue;
            };
            if marker.matches(plan, stat.size) {
                cached.push(CachedArchive {
                    plan,
                    name: entry.name,
                    path,
                    size: stat.size,
                });
            }
        }

        cached.sort_by_key(|c| (c.plan.kind, c.plan.version));
        cached.dedup_by_key(|c| c.plan);
        Ok(cached)
    }
}

impl fmt::Debug for ArchiveStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveStore")
            .field("dir", &self.dir)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn archive_store() -> (Arc<MemoryStore>, ArchiveStore) {
        let memory = Arc::new(MemoryStore::new());
        let store = ArchiveStore::new(memory.clone(), "archives", "hvsc");
        (memory, store)
    }

    async fn put(store: &ArchiveStore, name: &str, data: &'static [u8]) {
        store
            .store()
            .write(&store.path_of(name), Bytes::from_static(data))
            .await
            .unwrap();
    }

    #[test]
    fn test_parse_name() {
        let (_, store) = archive_store();
        assert_eq!(
            store.parse_name("hvsc-baseline-80.7z"),
            Some((Some(ArchiveKind::Baseline), 80))
        );
        assert_eq!(
            store.parse_name("hvsc-update-81"),
            Some((Some(ArchiveKind::Update), 81))
        );
        assert_eq!(store.parse_name("hvsc-82.zip"), Some((None, 82)));
        assert_eq!(store.parse_name("hvsc-82.rar"), None);
        assert_eq!(store.parse_name("other-82.7z"), None);
        assert_eq!(store.parse_name("hvsc-update-x.7z"), None);
    }

    #[test]
    fn test_candidate_names() {
        let (_, store) = archive_store();
        assert_eq!(
            store.candidate_names(ArchivePlan::baseline(80)),
            vec![
                "hvsc-baseline-80.7z",
                "hvsc-baseline-80.zip",
                "hvsc-baseline-80",
                "hvsc-80.7z",
                "hvsc-80.zip",
                "hvsc-80",
            ]
        );
    }

    #[tokio::test]
    async fn test_resolve_requires_marker() {
        let (memory, store) = archive_store();
        let plan = ArchivePlan::baseline(80);
        put(&store, "hvsc-baseline-80.7z", b"blob").await;

        assert!(store.resolve(plan).await.unwrap().is_none());
        // The unmarked blob is not kept around
        assert!(memory.paths().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_with_valid_marker() {
        let (_, store) = archive_store();
        let plan = ArchivePlan::baseline(80);
        put(&store, "hvsc-baseline-80.7z", b"blob").await;
        store
            .write_marker("hvsc-baseline-80.7z", &CacheMarker::new(plan, 4))
            .await
            .unwrap();

        let cached = store.resolve(plan).await.unwrap().unwrap();
        assert_eq!(cached.name, "hvsc-baseline-80.7z");
        assert_eq!(cached.path, "archives/hvsc-baseline-80.7z");
        assert_eq!(cached.size, 4);
        assert_eq!(&store.read(&cached).await.unwrap()[..], b"blob");
    }

    #[tokio::test]
    async fn test_resolve_rejects_size_mismatch() {
        let (memory, store) = archive_store();
        let plan = ArchivePlan::update(81);
        put(&store, "hvsc-update-81.zip", b"short").await;
        store
            .write_marker("hvsc-update-81.zip", &CacheMarker::new(plan, 999))
            .await
            .unwrap();

        assert!(store.resolve(plan).await.unwrap().is_none());
        assert!(memory.paths().is_empty());
    }

    #[tokio::test]
    async fn test_legacy_name_uses_marker_kind() {
        let (_, store) = archive_store();
        put(&store, "hvsc-81.7z", b"update").await;
        store
            .write_marker("hvsc-81.7z", &CacheMarker::new(ArchivePlan::update(81), 6))
            .await
            .unwrap();

        // Not a baseline: left alone
        assert!(store.resolve(ArchivePlan::baseline(81)).await.unwrap().is_none());
        let cached = store.resolve(ArchivePlan::update(81)).await.unwrap().unwrap();
        assert_eq!(cached.name, "hvsc-81.7z");
    }

    #[tokio::test]
    async fn test_malformed_marker_is_ignored() {
        let (_, store) = archive_store();
        put(&store, "hvsc-update-82.7z", b"x").await;
        store
            .store()
            .write(
                &store.marker_path("hvsc-update-82.7z"),
                Bytes::from_static(b"{not json"),
            )
            .await
            .unwrap();
        assert!(store.read_marker("hvsc-update-82.7z").await.is_none());
        assert!(store.resolve(ArchivePlan::update(82)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_cached_only_marked() {
        let (_, store) = archive_store();
        put(&store, "hvsc-baseline-80.7z", b"base").await;
        store
            .write_marker("hvsc-baseline-80.7z", &CacheMarker::new(ArchivePlan::baseline(80), 4))
            .await
            .unwrap();
        put(&store, "hvsc-update-81.7z", b"u81").await;
        store
            .write_marker("hvsc-update-81.7z", &CacheMarker::new(ArchivePlan::update(81), 3))
            .await
            .unwrap();
        put(&store, "hvsc-update-82.7z", b"unmarked").await;
        put(&store, "hvsc-update-83.7z.part", b"partial").await;
        put(&store, "unrelated.txt", b"?").await;

        let cached = store.list_cached().await.unwrap();
        let plans: Vec<_> = cached.iter().map(|c| c.plan).collect();
        assert_eq!(plans, vec![ArchivePlan::baseline(80), ArchivePlan::update(81)]);
    }

    #[tokio::test]
    async fn test_purge_removes_all_variants() {
        let (memory, store) = archive_store();
        let plan = ArchivePlan::update(84);
        put(&store, "hvsc-update-84.7z", b"a").await;
        put(&store, "hvsc-update-84.7z.part", b"b").await;
        store
            .write_marker("hvsc-update-84.7z", &CacheMarker::new(plan, 1))
            .await
            .unwrap();

        store.purge(plan).await.unwrap();
        assert!(memory.paths().is_empty());
    }

    #[test]
    fn test_marker_json_shape() {
        let marker = CacheMarker {
            version: 80,
            kind: ArchiveKind::Baseline,
            size_bytes: Some(123),
            completed_at: 1_700_000_000_000,
        };
        assert_eq!(
            serde_json::to_string(&marker).unwrap(),
            r#"{"version":80,"kind":"baseline","sizeBytes":123,"completedAt":1700000000000}"#
        );
    }
}
