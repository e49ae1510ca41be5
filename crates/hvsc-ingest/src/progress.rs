//! Progress events
//!
//! Every run publishes [`ProgressEvent`]s on a broadcast [`ProgressBus`].
//! Subscribers that fall behind lose the oldest events rather than slowing
//! the pipeline down.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::status::StatusTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Start,
    ArchiveDiscovery,
    Download,
    ArchiveValidation,
    ArchiveExtraction,
    SidEnumeration,
    Songlengths,
    SidMetadataParsing,
    Complete,
    Error,
}

impl Stage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::ArchiveDiscovery => "archive_discovery",
            Self::Download => "download",
            Self::ArchiveValidation => "archive_validation",
            Self::ArchiveExtraction => "archive_extraction",
            Self::SidEnumeration => "sid_enumeration",
            Self::Songlengths => "songlengths",
            Self::SidMetadataParsing => "sid_metadata_parsing",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub stage: Stage,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    pub elapsed_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_cause: Option<String>,
}

fn percent_of(done: u64, total: u64) -> Option<f64> {
    #[allow(clippy::cast_precision_loss)]
    (total > 0).then(|| (done as f64 / total as f64 * 100.0).min(100.0))
}

impl ProgressEvent {
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            archive_name: None,
            processed_count: None,
            total_count: None,
            percent: None,
            downloaded_bytes: None,
            total_bytes: None,
            current_file: None,
            elapsed_time_ms: 0,
            error_cause: None,
        }
    }

    #[must_use]
    pub fn archive(mut self, name: impl Into<String>) -> Self {
        self.archive_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn counts(mut self, processed: u64, total: u64) -> Self {
        self.processed_count = Some(processed);
        self.total_count = Some(total);
        self.percent = percent_of(processed, total);
        self
    }

    #[must_use]
    pub fn bytes(mut self, downloaded: u64, total: Option<u64>) -> Self {
        self.downloaded_bytes = Some(downloaded);
        self.total_bytes = total;
        self.percent = total.and_then(|total| percent_of(downloaded, total));
        self
    }

    #[must_use]
    pub fn file(mut self, path: impl Into<String>) -> Self {
        self.current_file = Some(path.into());
        self
    }

    #[must_use]
    pub fn error(mut self, cause: impl Into<String>) -> Self {
        self.error_cause = Some(cause.into());
        self
    }
}

/// Broadcast fan-out of progress events.
#[derive(Debug, Clone)]
pub struct ProgressBus {
    tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ProgressEvent) {
        // No subscribers is fine
        if self.tx.send(event).is_err() {
            trace!("Progress event dropped, no subscribers");
        }
    }
}

/// Per-run progress emitter: stamps elapsed time, folds events into the
/// status summary and publishes them.
#[derive(Debug)]
pub struct ProgressReporter {
    bus: ProgressBus,
    status: Option<Arc<StatusTracker>>,
    started: Instant,
}

impl ProgressReporter {
    pub fn new(bus: ProgressBus, status: Option<Arc<StatusTracker>>) -> Self {
        Self {
            bus,
            status,
            started: Instant::now(),
        }
    }

    pub async fn emit(&self, mut event: ProgressEvent) {
        event.elapsed_time_ms = self.started.elapsed().as_millis() as u64;
        debug!(stage = %event.stage, message = %event.message, "Progress");
        if let Some(status) = &self.status {
            status.observe(&event).await;
        }
        self.bus.publish(event);
    }
}
