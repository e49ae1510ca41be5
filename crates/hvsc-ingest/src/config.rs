//! Configuration for the ingestion pipeline

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{IngestError, Result};

pub const DEFAULT_RELEASE_BASE_URL: &str = "https://hvsc.brona.dk/HVSC/";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Directory listing that publishes baseline and update archives
    pub release_base_url: String,

    /// File name prefix used by the remote archives (`HVSC_Update_81.7z`)
    pub remote_prefix: String,

    /// File name prefix used in the local archive cache (`hvsc-update-81.7z`)
    pub cache_prefix: String,

    /// Archive cache directory inside the archive store
    pub archive_dir: String,

    /// Library root inside the library store
    pub library_root: String,

    /// Entries between progress events and cooperative yields during extraction
    pub extraction_batch_size: usize,

    /// Bytes between download progress events
    pub progress_interval_bytes: u64,

    /// Stream downloads straight into the cache file when the store is
    /// filesystem-backed
    pub direct_download: bool,

    /// Timeout for local metadata reads (songlength files)
    pub local_read_timeout: Duration,

    /// Connection timeout for HTTP requests
    pub connect_timeout: Duration,

    /// Buffered progress events per subscriber
    pub progress_capacity: usize,

    /// User agent sent with HTTP requests
    pub user_agent: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            release_base_url: DEFAULT_RELEASE_BASE_URL.to_string(),
            remote_prefix: "HVSC".to_string(),
            cache_prefix: "hvsc".to_string(),
            archive_dir: "archives".to_string(),
            library_root: "library".to_string(),
            extraction_batch_size: 50,
            progress_interval_bytes: 1024 * 1024, // 1MB
            direct_download: true,
            local_read_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(15),
            progress_capacity: 256,
            user_agent: format!("hvsc-ingest/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl IngestConfig {
    /// Create configuration from environment variables
    ///
    /// Unset or unparsable variables fall back to the defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            release_base_url: std::env::var("HVSC_RELEASE_BASE_URL")
                .unwrap_or(defaults.release_base_url),
            remote_prefix: std::env::var("HVSC_REMOTE_PREFIX").unwrap_or(defaults.remote_prefix),
            cache_prefix: std::env::var("HVSC_CACHE_PREFIX").unwrap_or(defaults.cache_prefix),
            archive_dir: std::env::var("HVSC_ARCHIVE_DIR").unwrap_or(defaults.archive_dir),
            library_root: std::env::var("HVSC_LIBRARY_ROOT").unwrap_or(defaults.library_root),
            extraction_batch_size: env_parse(
                "HVSC_EXTRACTION_BATCH_SIZE",
                defaults.extraction_batch_size,
            ),
            progress_interval_bytes: env_parse(
                "HVSC_PROGRESS_INTERVAL_BYTES",
                defaults.progress_interval_bytes,
            ),
            direct_download: env_parse("HVSC_DIRECT_DOWNLOAD", defaults.direct_download),
            local_read_timeout: Duration::from_secs(env_parse(
                "HVSC_LOCAL_READ_TIMEOUT",
                defaults.local_read_timeout.as_secs(),
            )),
            connect_timeout: Duration::from_secs(env_parse(
                "HVSC_CONNECT_TIMEOUT",
                defaults.connect_timeout.as_secs(),
            )),
            progress_capacity: env_parse("HVSC_PROGRESS_CAPACITY", defaults.progress_capacity),
            user_agent: std::env::var("HVSC_USER_AGENT").unwrap_or(defaults.user_agent),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.release_base_url)
            .map_err(|e| IngestError::config(format!("release_base_url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(IngestError::config(format!(
                "release_base_url must be http(s), got {}",
                url.scheme()
            )));
        }
        if self.remote_prefix.is_empty() || self.cache_prefix.is_empty() {
            return Err(IngestError::config("archive prefixes must not be empty"));
        }
        let library_root = normalize_dir(&self.library_root);
        let archive_dir = normalize_dir(&self.archive_dir);
        if library_root.is_empty() {
            return Err(IngestError::config(
                "library_root must name a directory below the store root",
            ));
        }
        // A baseline resets the whole library directory
        if nested_or_equal(archive_dir, library_root)
            || nested_or_equal(library_root, archive_dir)
        {
            return Err(IngestError::config(format!(
                "library_root {:?} and archive_dir {:?} must not overlap",
                self.library_root, self.archive_dir
            )));
        }
        if self.extraction_batch_size == 0 {
            return Err(IngestError::config("extraction_batch_size must be > 0"));
        }
        if self.progress_interval_bytes == 0 {
            return Err(IngestError::config("progress_interval_bytes must be > 0"));
        }
        if self.progress_capacity == 0 {
            return Err(IngestError::config("progress_capacity must be > 0"));
        }
        Ok(())
    }

    /// Release base URL with a guaranteed trailing slash, so relative
    /// archive names join underneath it.
    pub fn release_base(&self) -> String {
        if self.release_base_url.ends_with('/') {
            self.release_base_url.clone()
        } else {
            format!("{}/", self.release_base_url)
        }
    }
}

fn normalize_dir(dir: &str) -> &str {
    match dir.trim_matches('/') {
        "." => "",
        dir => dir,
    }
}

/// True when `inner` is `outer` or lies below it.
fn nested_or_equal(inner: &str, outer: &str) -> bool {
    outer.is_empty()
        || inner == outer
        || inner
            .strip_prefix(outer)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
