//! Streaming archive downloads into the archive cache
//!
//! Two strategies share one loop:
//!
//! - **Direct**: when the archive store is filesystem-backed, chunks are
//!   appended to `<name>.part` and the file is renamed into place once the
//!   byte count checks out. Progress is taken from the file size on disk.
//! - **Buffered**: chunks accumulate in memory and the blob is written with a
//!   single store write.
//!
//! The completion marker is written last; an archive without one is never
//! reused.

use bytes::BytesMut;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive_store::{ArchiveStore, CacheMarker, CachedArchive};
use crate::cancel::checkpoint;
use crate::config::IngestConfig;
use crate::error::{IngestError, Result, StoreError};
use crate::fetch::{ByteStream, HttpFetch};
use crate::plan::ArchivePlan;
use crate::progress::{ProgressEvent, ProgressReporter, Stage};

/// Where download chunks go while they arrive.
enum Sink {
    Direct { file: File, local: PathBuf },
    Buffered(BytesMut),
}

pub struct Downloader {
    fetch: Arc<dyn HttpFetch>,
    archives: Arc<ArchiveStore>,
    progress_interval: u64,
    direct: bool,
}

impl Downloader {
    pub fn new(fetch: Arc<dyn HttpFetch>, archives: Arc<ArchiveStore>, config: &IngestConfig) -> Self {
        Self {
            fetch,
            archives,
            progress_interval: config.progress_interval_bytes.max(1),
            direct: config.direct_download,
        }
    }

    /// Download `url` into the cache as `name` and mark it complete.
    ///
    /// On error or cancellation the partial blob is removed.
    pub async fn download(
        &self,
        plan: ArchivePlan,
        url: &str,
        name: &str,
        token: &CancellationToken,
        reporter: &ProgressReporter,
    ) -> Result<CachedArchive> {
        checkpoint(token)?;

        // Best effort; the GET's own length is the fallback
        let head_length = match self.fetch.head(url).await {
            Ok(length) => length,
            Err(e) => {
                debug!(url, error = %e, "HEAD failed, relying on GET content length");
                None
            }
        };

        checkpoint(token)?;
        let response = self.fetch.get_stream(url).await?;
        let expected = head_length.or(response.content_length);

        info!(archive = %name, url, ?expected, "Downloading archive");
        reporter
            .emit(
                ProgressEvent::new(Stage::Download, format!("Downloading {name}"))
                    .archive(name)
                    .bytes(0, expected),
            )
            .await;

        let result = self
            .receive(name, response.body, expected, token, reporter)
            .await;
        let size = match result {
            Ok(size) => size,
            Err(e) => {
                self.discard_partial(name).await;
                return Err(e);
            }
        };

        let cached = CachedArchive {
            plan,
            name: name.to_string(),
            path: self.archives.path_of(name),
            size,
        };

        if let Err(e) = self
            .archives
            .write_marker(name, &CacheMarker::new(plan, size))
            .await
        {
            // The archive is still usable for this run
            warn!(archive = %name, error = %e, "Failed to write cache marker");
        }

        info!(archive = %name, size, "Download complete");
        Ok(cached)
    }

    async fn open_sink(&self, name: &str) -> Result<Sink> {
        let partial = self.archives.partial_path(name);
        let local = self
            .direct
            .then(|| self.archives.store().local_path(&partial))
            .flatten();

        let Some(local) = local else {
            return Ok(Sink::Buffered(BytesMut::new()));
        };
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(&partial, e))?;
        }
        let file = File::create(&local)
            .await
            .map_err(|e| StoreError::io(&partial, e))?;
        debug!(archive = %name, path = %local.display(), "Streaming download to disk");
        Ok(Sink::Direct { file, local })
    }

    async fn receive(
        &self,
        name: &str,
        mut body: ByteStream,
        expected: Option<u64>,
        token: &CancellationToken,
        reporter: &ProgressReporter,
    ) -> Result<u64> {
        let partial = self.archives.partial_path(name);
        let mut sink = self.open_sink(name).await?;
        let mut received = 0u64;
        let mut next_report = self.progress_interval;

        loop {
            checkpoint(token)?;
            let Some(chunk) = body.next().await else {
                break;
            };
            let chunk = chunk?;
            received += chunk.len() as u64;

            match &mut sink {
                Sink::Direct { file, .. } => file
                    .write_all(&chunk)
                    .await
                    .map_err(|e| StoreError::io(&partial, e))?,
                Sink::Buffered(buffer) => buffer.extend_from_slice(&chunk),
            }

            if received >= next_report {
                next_report = received + self.progress_interval;
                let reported = match &mut sink {
                    Sink::Direct { file, .. } => {
                        file.flush()
                            .await
                            .map_err(|e| StoreError::io(&partial, e))?;
                        file.metadata()
                            .await
                            .map_err(|e| StoreError::io(&partial, e))?
                            .len()
                    }
                    Sink::Buffered(buffer) => buffer.len() as u64,
                };
                reporter
                    .emit(
                        ProgressEvent::new(Stage::Download, format!("Downloading {name}"))
                            .archive(name)
                            .bytes(reported, expected),
                    )
                    .await;
            }
        }

        if let Some(expected) = expected
            && expected != received
        {
            return Err(IngestError::IncompleteDownload {
                archive: name.to_string(),
                expected,
                actual: received,
            });
        }

        let target = self.archives.path_of(name);
        match sink {
            Sink::Direct { mut file, local } => {
                file.flush()
                    .await
                    .map_err(|e| StoreError::io(&partial, e))?;
                file.sync_all()
                    .await
                    .map_err(|e| StoreError::io(&partial, e))?;
                drop(file);
                debug!(path = %local.display(), "Moving completed download into place");
                self.archives.store().rename(&partial, &target).await?;
            }
            Sink::Buffered(buffer) => {
                self.archives
                    .store()
                    .write(&target, buffer.freeze())
                    .await?;
            }
        }

        reporter
            .emit(
                ProgressEvent::new(Stage::Download, format!("Downloaded {name}"))
                    .archive(name)
                    .bytes(received, Some(received)),
            )
            .await;
        Ok(received)
    }

    async fn discard_partial(&self, name: &str) {
        let store = self.archives.store();
        for path in [self.archives.partial_path(name), self.archives.path_of(name)] {
            if let Err(e) = store.delete(&path).await {
                warn!(path = %path, error = %e, "Failed to remove partial download");
            }
        }
    }
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("progress_interval", &self.progress_interval)
            .field("direct", &self.direct)
            .finish_non_exhaustive()
    }
}
