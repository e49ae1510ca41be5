//! Shared fixtures for the ingestion integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use hvsc_ingest::fetch::FetchResponse;
use hvsc_ingest::{
    CancelRegistry, HttpFetch, IngestConfig, IngestError, MemoryKvStore, MemoryStore,
    Orchestrator, OrchestratorParts, Result,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::Notify;

pub const BASE_URL: &str = "https://hvsc.test/HVSC/";

/// Build an in-memory zip archive.
pub fn build_zip(entries: &[(&str, &[u8])]) -> Bytes {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for (name, data) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    Bytes::from(writer.finish().unwrap().into_inner())
}

/// Build an in-memory 7z archive.
pub fn build_7z(entries: &[(&str, &[u8])]) -> Bytes {
    let mut writer = sevenz_rust::SevenZWriter::new(std::io::Cursor::new(Vec::new())).unwrap();
    for (name, data) in entries {
        let mut entry = sevenz_rust::SevenZArchiveEntry::new();
        entry.name = (*name).to_string();
        writer.push_archive_entry(entry, Some(*data)).unwrap();
    }
    Bytes::from(writer.finish().unwrap().into_inner())
}

/// Split `data` into `count` roughly equal chunks.
pub fn chunked(data: &Bytes, count: usize) -> Vec<Bytes> {
    let size = data.len().div_ceil(count).max(1);
    (0..data.len())
        .step_by(size)
        .map(|start| data.slice(start..(start + size).min(data.len())))
        .collect()
}

struct CancelTrigger {
    after_chunks: usize,
    registry: Arc<CancelRegistry>,
    key: String,
}

/// Scripted [`HttpFetch`]: a fixed listing plus archives served in chunks.
#[derive(Default)]
pub struct ScriptedFetch {
    listing: Mutex<String>,
    archives: Mutex<HashMap<String, Vec<Bytes>>>,
    requests: Mutex<Vec<String>>,
    cancel: Mutex<Option<CancelTrigger>>,
    listing_gate: Mutex<Option<Arc<Notify>>>,
}

impl ScriptedFetch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publish `names` in the release listing.
    pub fn set_listing(&self, names: &[&str]) {
        let links: String = names
            .iter()
            .map(|name| format!("<a href=\"{name}\">{name}</a>\n"))
            .collect();
        *self.listing.lock() = format!("<html><body>\n{links}</body></html>");
    }

    pub fn serve(&self, name: &str, data: Bytes) {
        self.serve_chunks(name, vec![data]);
    }

    pub fn serve_chunks(&self, name: &str, chunks: Vec<Bytes>) {
        self.archives.lock().insert(name.to_string(), chunks);
    }

    /// Cancel `key` while handing out the `after_chunks`-th chunk.
    pub fn cancel_after(&self, after_chunks: usize, registry: Arc<CancelRegistry>, key: &str) {
        *self.cancel.lock() = Some(CancelTrigger {
            after_chunks,
            registry,
            key: key.to_string(),
        });
    }

    /// Hold the listing request until the returned notify fires.
    pub fn gate_listing(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.listing_gate.lock() = Some(gate.clone());
        gate
    }

    /// Requests seen so far, as `"<METHOD> <file name>"`.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    pub fn archive_requests(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|r| r.as_str() != "GET ")
            .collect()
    }

    fn record(&self, method: &str, url: &str) -> String {
        let name = url.rsplit('/').next().unwrap_or(url).to_string();
        self.requests.lock().push(format!("{method} {name}"));
        name
    }

    fn chunks(&self, url: &str, name: &str) -> Result<Vec<Bytes>> {
        self.archives
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| IngestError::HttpStatus {
                url: url.to_string(),
                status: 404,
            })
    }
}

#[async_trait]
impl HttpFetch for ScriptedFetch {
    async fn head(&self, url: &str) -> Result<Option<u64>> {
        let name = self.record("HEAD", url);
        let chunks = self.chunks(url, &name)?;
        Ok(Some(chunks.iter().map(|c| c.len() as u64).sum()))
    }

    async fn get_stream(&self, url: &str) -> Result<FetchResponse> {
        let name = self.record("GET", url);
        let chunks = self.chunks(url, &name)?;
        let content_length = Some(chunks.iter().map(|c| c.len() as u64).sum());

        let trigger = self
            .cancel
            .lock()
            .as_ref()
            .map(|t| (t.after_chunks, t.registry.clone(), t.key.clone()));
        let body = futures::stream::iter(chunks.into_iter().enumerate())
            .map(move |(index, chunk)| {
                if let Some((after, registry, key)) = &trigger
                    && index + 1 == *after
                {
                    registry.cancel(key);
                }
                Ok(chunk)
            })
            .boxed();

        Ok(FetchResponse {
            content_length,
            body,
        })
    }

    async fn get_text(&self, url: &str) -> Result<String> {
        self.record("GET", url);
        let gate = self.listing_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(self.listing.lock().clone())
    }
}

/// Orchestrator over in-memory stores and a scripted network.
pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub fetch: Arc<ScriptedFetch>,
    pub archive_store: Arc<MemoryStore>,
    pub library_store: Arc<MemoryStore>,
    pub kv: Arc<MemoryKvStore>,
    pub cancels: Arc<CancelRegistry>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_kv(Arc::new(MemoryKvStore::new()), Arc::new(MemoryStore::new()))
    }

    /// Reuse persisted state and cache, as after a process restart.
    pub fn with_kv(kv: Arc<MemoryKvStore>, archive_store: Arc<MemoryStore>) -> Self {
        let fetch = ScriptedFetch::new();
        let library_store = Arc::new(MemoryStore::new());
        let cancels = Arc::new(CancelRegistry::new());
        let config = IngestConfig {
            release_base_url: BASE_URL.to_string(),
            extraction_batch_size: 2,
            progress_interval_bytes: 64,
            ..IngestConfig::default()
        };
        let orchestrator = Orchestrator::new(
            config,
            OrchestratorParts {
                archive_store: archive_store.clone(),
                library_store: library_store.clone(),
                kv: kv.clone(),
                fetch: fetch.clone(),
                songlength_warnings: None,
            },
        )
        .unwrap()
        .with_cancel_registry(cancels.clone());

        Self {
            orchestrator: Arc::new(orchestrator),
            fetch,
            archive_store,
            library_store,
            kv,
            cancels,
        }
    }
}
