use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::parser::{RejectedLine, SonglengthFormat, SonglengthTable, parse_songlengths};
use crate::error::StoreError;
use crate::library::LibraryStore;
use crate::store::join_path;

/// Library directories searched for songlength files, in priority order.
pub const SONGLENGTH_LOCATIONS: &[&str] = &["/DOCUMENTS", "/C64Music/DOCUMENTS", "/"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SonglengthQuery {
    /// Full virtual path, e.g. `/MUSICIANS/H/Hubbard_Rob/Commando.sid`
    Path(String),
    /// Bare file name, matched case-insensitively
    FileName(String),
    /// Hex MD5 of the song file
    Md5(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SonglengthWarning {
    RejectedLine(RejectedLine),
    Ambiguous {
        file_name: String,
        candidates: Vec<String>,
    },
    LoadFailed {
        source: String,
        message: String,
    },
}

pub type WarningHandler = Arc<dyn Fn(&SonglengthWarning) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SonglengthStats {
    pub paths: usize,
    pub hashes: usize,
    pub sources: usize,
}

/// Merged view over every discovered songlength file.
#[derive(Debug, Default)]
pub struct SonglengthIndex {
    by_path: HashMap<String, Vec<Duration>>,
    by_md5: HashMap<String, Vec<Duration>>,
    /// Lowercased file name to sorted candidate paths
    by_name: HashMap<String, Vec<String>>,
    sources: Vec<String>,
}

impl SonglengthIndex {
    /// Merge `table` in; entries already present win.
    fn merge(&mut self, source: String, table: SonglengthTable) {
        for (path, durations) in table.by_path {
            self.by_path.entry(path).or_insert(durations);
        }
        for (hash, durations) in table.by_md5 {
            self.by_md5.entry(hash).or_insert(durations);
        }
        self.sources.push(source);
    }

    fn build_name_index(&mut self) {
        self.by_name.clear();
        for path in self.by_path.keys() {
            let name = path.rsplit('/').next().unwrap_or(path).to_ascii_lowercase();
            self.by_name.entry(name).or_default().push(path.clone());
        }
        for candidates in self.by_name.values_mut() {
            candidates.sort();
        }
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn stats(&self) -> SonglengthStats {
        SonglengthStats {
            paths: self.by_path.len(),
            hashes: self.by_md5.len(),
            sources: self.sources.len(),
        }
    }
}

/// Lazily loaded, cached songlength resolver.
///
/// The index is built on first use and kept until [`invalidate`] or
/// [`reload`] is called, which must happen after any ingestion run that
/// wrote songlength files.
///
/// [`invalidate`]: SonglengthFacade::invalidate
/// [`reload`]: SonglengthFacade::reload
pub struct SonglengthFacade {
    library: LibraryStore,
    read_timeout: Duration,
    index: RwLock<Option<Arc<SonglengthIndex>>>,
    on_warning: Option<WarningHandler>,
}

impl SonglengthFacade {
    pub fn new(library: LibraryStore, read_timeout: Duration) -> Self {
        Self {
            library,
            read_timeout,
            index: RwLock::new(None),
            on_warning: None,
        }
    }

    #[must_use]
    pub fn with_warning_handler(mut self, handler: WarningHandler) -> Self {
        self.on_warning = Some(handler);
        self
    }

    fn emit(&self, warning: &SonglengthWarning) {
        match warning {
            SonglengthWarning::RejectedLine(line) => warn!(
                source = %line.source,
                line = line.line_number,
                raw = %line.raw,
                reason = %line.reason,
                "Rejected songlength line"
            ),
            SonglengthWarning::Ambiguous {
                file_name,
                candidates,
            } => warn!(
                file_name = %file_name,
                candidates = candidates.len(),
                "Ambiguous songlength lookup, using first match"
            ),
            SonglengthWarning::LoadFailed { source, message } => {
                warn!(source = %source, error = %message, "Failed to load songlength file");
            }
        }
        if let Some(handler) = &self.on_warning {
            handler(warning);
        }
    }

    /// Loaded index, loading it on first use.
    pub async fn index(&self) -> Arc<SonglengthIndex> {
        if let Some(index) = self.index.read().await.as_ref() {
            return Arc::clone(index);
        }

        let mut slot = self.index.write().await;
        if let Some(index) = slot.as_ref() {
            return Arc::clone(index);
        }
        let index = Arc::new(self.load().await);
        *slot = Some(Arc::clone(&index));
        index
    }

    /// Drop the cached index and load it again.
    pub async fn reload(&self) -> Arc<SonglengthIndex> {
        let mut slot = self.index.write().await;
        let index = Arc::new(self.load().await);
        *slot = Some(Arc::clone(&index));
        index
    }

    /// Drop the cached index; the next query loads it again.
    pub async fn invalidate(&self) {
        *self.index.write().await = None;
    }

    pub async fn is_loaded(&self) -> bool {
        self.index.read().await.is_some()
    }

    pub async fn stats(&self) -> SonglengthStats {
        self.index().await.stats()
    }

    /// Durations for `query`; empty when nothing matches.
    pub async fn resolve(&self, query: &SonglengthQuery) -> Vec<Duration> {
        let index = self.index().await;
        match query {
            SonglengthQuery::Path(path) => {
                let path = if path.starts_with('/') {
                    path.clone()
                } else {
                    format!("/{path}")
                };
                index.by_path.get(&path).cloned().unwrap_or_default()
            }
            SonglengthQuery::Md5(hash) => index
                .by_md5
                .get(&hash.to_ascii_lowercase())
                .cloned()
                .unwrap_or_default(),
            SonglengthQuery::FileName(name) => {
                let Some(candidates) = index.by_name.get(&name.to_ascii_lowercase()) else {
                    return Vec::new();
                };
                if candidates.len() > 1 {
                    self.emit(&SonglengthWarning::Ambiguous {
                        file_name: name.clone(),
                        candidates: candidates.clone(),
                    });
                }
                candidates
                    .first()
                    .and_then(|path| index.by_path.get(path))
                    .cloned()
                    .unwrap_or_default()
            }
        }
    }

    /// Durations for a song by the MD5 of its contents.
    pub async fn resolve_content(&self, data: &[u8]) -> Vec<Duration> {
        let hash = format!("{:x}", md5::compute(data));
        self.resolve(&SonglengthQuery::Md5(hash)).await
    }

    async fn discover(&self) -> Vec<(String, SonglengthFormat)> {
        let mut md5_files = Vec::new();
        let mut txt_files = Vec::new();

        for location in SONGLENGTH_LOCATIONS {
            let entries = match self.library.store().list(&self.library.store_path(location)).await
            {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(location, error = %e, "Skipping songlength location");
                    continue;
                }
            };
            for entry in entries.into_iter().filter(|e| !e.is_dir) {
                let virtual_path = join_path(location, &entry.name);
                let virtual_path = if virtual_path.starts_with('/') {
                    virtual_path
                } else {
                    format!("/{virtual_path}")
                };
                match SonglengthFormat::from_file_name(&entry.name) {
                    Some(SonglengthFormat::Md5) => md5_files.push((virtual_path, SonglengthFormat::Md5)),
                    Some(SonglengthFormat::Txt) => txt_files.push((virtual_path, SonglengthFormat::Txt)),
                    None => {}
                }
            }
        }

        md5_files.extend(txt_files);
        md5_files
    }

    async fn read_with_timeout(&self, virtual_path: &str) -> Result<String, StoreError> {
        let read = tokio::time::timeout(self.read_timeout, self.library.read(virtual_path)).await;
        match read {
            Ok(Ok(data)) => Ok(String::from_utf8_lossy(&data).into_owned()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(StoreError::Timeout {
                path: virtual_path.to_string(),
                after: self.read_timeout,
            }),
        }
    }

    async fn load(&self) -> SonglengthIndex {
        let mut index = SonglengthIndex::default();

        for (path, format) in self.discover().await {
            let content = match self.read_with_timeout(&path).await {
                Ok(content) => content,
                Err(e) => {
                    self.emit(&SonglengthWarning::LoadFailed {
                        source: path,
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            let mut rejected = Vec::new();
            let table = parse_songlengths(&path, format, &content, &mut |line| rejected.push(line));
            for line in rejected {
                self.emit(&SonglengthWarning::RejectedLine(line));
            }
            index.merge(path, table);
        }

        index.build_name_index();
        let stats = index.stats();
        info!(
            sources = stats.sources,
            paths = stats.paths,
            hashes = stats.hashes,
            "Loaded songlength index"
        );
        index
    }
}

impl fmt::Debug for SonglengthFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SonglengthFacade")
            .field("library", &self.library)
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}
