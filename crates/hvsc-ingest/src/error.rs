//! Error types for the ingestion pipeline

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::pipeline::PipelineState;

/// Errors raised by the byte-level stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage entry not found: {path}")]
    NotFound { path: String },

    #[error("Invalid storage path: {path}")]
    InvalidPath { path: String },

    #[error("Storage I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage read of {path} timed out after {after:?}")]
    Timeout { path: String, after: Duration },
}

impl StoreError {
    /// Create an I/O error bound to a store path, mapping `NotFound` I/O
    /// errors onto [`StoreError::NotFound`].
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound { path }
        } else {
            Self::Io { path, source }
        }
    }

    /// Create a not found error
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Create an invalid path error
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath { path: path.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    // Orchestration errors
    #[error(
        "Illegal pipeline transition for {archive}: {from} -> {to} ({detail})"
    )]
    IllegalTransition {
        archive: String,
        from: PipelineState,
        to: PipelineState,
        detail: String,
    },

    #[error("Cancelled")]
    Cancelled,

    #[error("An ingestion run is already in progress")]
    AlreadyRunning,

    // Network errors
    #[error("Network error fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("HTTP status {status} fetching {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Download incomplete for {archive}: expected {expected} bytes, received {actual}")]
    IncompleteDownload {
        archive: String,
        expected: u64,
        actual: u64,
    },

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Cached archive not available: {archive}")]
    MissingCachedArchive { archive: String },

    // Archive errors
    #[error("Unsupported archive format: {archive}")]
    UnsupportedFormat { archive: String },

    #[error("Corrupt archive {archive}: {message}")]
    CorruptArchive { archive: String, message: String },

    #[error("Extraction of {archive} failed: {message}")]
    Extraction { archive: String, message: String },

    // Release discovery errors
    #[error("Release index error: {0}")]
    Release(String),

    // Persistence errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    Config(String),
}

// Helper methods for common error construction
impl IngestError {
    /// Create a network error for a URL
    pub fn network(url: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Network {
            url: url.into(),
            message: message.to_string(),
        }
    }

    /// Create a corrupt archive error
    pub fn corrupt(archive: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::CorruptArchive {
            archive: archive.into(),
            message: message.to_string(),
        }
    }

    /// Create an extraction error
    pub fn extraction(archive: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Extraction {
            archive: archive.into(),
            message: message.to_string(),
        }
    }

    /// Create a release index error
    pub fn release(message: impl Into<String>) -> Self {
        Self::Release(message.into())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Cancellation is expected and resets the run to idle rather than error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

/// Coarse failure category shown to users.
///
/// Derived from free text by [`classify_failure`]; never used for control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCategory {
    Network,
    Storage,
    Download,
    Extraction,
    CorruptArchive,
    UnsupportedFormat,
    Unknown,
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Network => "network",
            Self::Storage => "storage",
            Self::Download => "download",
            Self::Extraction => "extraction",
            Self::CorruptArchive => "corrupt-archive",
            Self::UnsupportedFormat => "unsupported-format",
            Self::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

const UNSUPPORTED_KEYWORDS: &[&str] = &["unsupported archive", "unsupported format"];
const CORRUPT_KEYWORDS: &[&str] = &["corrupt", "invalid archive", "bad crc", "checksum"];
const STORAGE_KEYWORDS: &[&str] = &[
    "storage",
    "no space",
    "disk full",
    "quota",
    "permission denied",
    "read-only",
];
const NETWORK_KEYWORDS: &[&str] = &[
    "network",
    "http status",
    "connection",
    "timed out",
    "dns",
    "fetch",
];
const DOWNLOAD_KEYWORDS: &[&str] = &["download"];
const EXTRACTION_KEYWORDS: &[&str] = &["extract", "decompress"];

/// Best-effort classification of a failure message.
///
/// This is a substring heuristic over the lowercased message. Keyword groups
/// are checked from most to least specific, so "download incomplete" lands in
/// `Download` while "network error fetching" lands in `Network`.
pub fn classify_failure(message: &str) -> FailureCategory {
    let text = message.to_ascii_lowercase();
    let has = |keywords: &[&str]| keywords.iter().any(|k| text.contains(k));

    if has(UNSUPPORTED_KEYWORDS) {
        FailureCategory::UnsupportedFormat
    } else if has(CORRUPT_KEYWORDS) {
        FailureCategory::CorruptArchive
    } else if has(STORAGE_KEYWORDS) {
        FailureCategory::Storage
    } else if has(DOWNLOAD_KEYWORDS) {
        FailureCategory::Download
    } else if has(NETWORK_KEYWORDS) {
        FailureCategory::Network
    } else if has(EXTRACTION_KEYWORDS) {
        FailureCategory::Extraction
    } else {
        FailureCategory::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_error_messages() {
        let network = IngestError::network("https://example.com/a.7z", "connection reset");
        assert_eq!(
            classify_failure(&network.to_string()),
            FailureCategory::Network
        );

        let status = IngestError::HttpStatus {
            url: "https://example.com".to_string(),
            status: 503,
        };
        assert_eq!(
            classify_failure(&status.to_string()),
            FailureCategory::Network
        );

        let incomplete = IngestError::IncompleteDownload {
            archive: "hvsc-baseline-80.7z".to_string(),
            expected: 10,
            actual: 3,
        };
        assert_eq!(
            classify_failure(&incomplete.to_string()),
            FailureCategory::Download
        );

        let storage = IngestError::from(StoreError::Io {
            path: "archives/x".to_string(),
            source: std::io::Error::other("boom"),
        });
        assert_eq!(
            classify_failure(&storage.to_string()),
            FailureCategory::Storage
        );

        let unsupported = IngestError::UnsupportedFormat {
            archive: "hvsc.rar".to_string(),
        };
        assert_eq!(
            classify_failure(&unsupported.to_string()),
            FailureCategory::UnsupportedFormat
        );

        let corrupt = IngestError::corrupt("hvsc.zip", "invalid Zip archive");
        assert_eq!(
            classify_failure(&corrupt.to_string()),
            FailureCategory::CorruptArchive
        );

        let extraction = IngestError::extraction("hvsc.7z", "worker stopped");
        assert_eq!(
            classify_failure(&extraction.to_string()),
            FailureCategory::Extraction
        );

        assert_eq!(classify_failure("something odd"), FailureCategory::Unknown);
    }

    #[test]
    fn test_store_error_not_found_mapping() {
        let err = StoreError::io(
            "library/a.sid",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(err.is_not_found());

        let err = StoreError::io("library/a.sid", std::io::Error::other("denied"));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_failure_category_serde() {
        let json = serde_json::to_string(&FailureCategory::CorruptArchive).unwrap();
        assert_eq!(json, "\"corrupt-archive\"");
        assert_eq!(FailureCategory::UnsupportedFormat.to_string(), "unsupported-format");
    }

    #[test]
    fn test_cancelled_is_flagged() {
        assert!(IngestError::Cancelled.is_cancelled());
        assert!(!IngestError::AlreadyRunning.is_cancelled());
        assert_eq!(IngestError::Cancelled.to_string(), "Cancelled");
    }
}
