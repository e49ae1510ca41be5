//! UI-facing status summary derived from progress events
//!
//! The summary is a projection for display and survives reloads, but it is
//! never consulted for correctness: [`IngestionState`] is authoritative.
//!
//! [`IngestionState`]: crate::state::IngestionState

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{FailureCategory, Result, classify_failure};
use crate::progress::{ProgressEvent, Stage};
use crate::state::now_ms;
use crate::store::KvStore;

pub const STATUS_SUMMARY_KEY: &str = "hvsc.status-summary.v1";
pub const INTERRUPTED_MESSAGE: &str = "Ingestion interrupted by application restart";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepState {
    #[default]
    Idle,
    InProgress,
    Success,
    Failure,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StepStatus {
    pub status: StepState,
    pub archive_name: Option<String>,
    pub started_at_ms: Option<u64>,
    pub finished_at_ms: Option<u64>,
    pub processed: Option<u64>,
    pub total: Option<u64>,
    pub error_cause: Option<String>,
}

impl StepStatus {
    fn start(&mut self, archive: Option<&String>, now: u64) -> bool {
        if self.status == StepState::InProgress && self.archive_name.as_ref() == archive {
            return false;
        }
        *self = Self {
            status: StepState::InProgress,
            archive_name: archive.cloned(),
            started_at_ms: Some(now),
            ..Self::default()
        };
        true
    }

    fn finish(&mut self, status: StepState, cause: Option<&str>, now: u64) -> bool {
        if self.status != StepState::InProgress {
            return false;
        }
        self.status = status;
        self.finished_at_ms = Some(now);
        self.error_cause = cause.map(str::to_string);
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusSummary {
    pub download: StepStatus,
    pub extraction: StepStatus,
    pub last_stage: Option<Stage>,
    pub last_message: Option<String>,
    pub error_cause: Option<String>,
    pub failure_category: Option<FailureCategory>,
    pub updated_at_ms: Option<u64>,
}

impl StatusSummary {
    /// Fold `event` in. Returns true when a step status changed, which is
    /// when the summary is worth persisting.
    pub fn apply(&mut self, event: &ProgressEvent, now: u64) -> bool {
        self.last_stage = Some(event.stage);
        self.last_message = Some(event.message.clone());
        self.updated_at_ms = Some(now);
        let archive = event.archive_name.as_ref();

        match event.stage {
            Stage::Start | Stage::ArchiveDiscovery => false,
            Stage::Download => {
                let changed = self.download.start(archive, now);
                if changed {
                    self.extraction = StepStatus::default();
                    self.error_cause = None;
                    self.failure_category = None;
                }
                if event.downloaded_bytes.is_some() {
                    self.download.processed = event.downloaded_bytes;
                    self.download.total = event.total_bytes;
                }
                changed
            }
            Stage::ArchiveValidation => {
                // Cache hits go straight to validation
                let started = self.download.start(archive, now);
                self.download.finish(StepState::Success, None, now) || started
            }
            Stage::ArchiveExtraction
            | Stage::SidEnumeration
            | Stage::Songlengths
            | Stage::SidMetadataParsing => {
                let changed = self.extraction.start(archive, now);
                if event.processed_count.is_some() {
                    self.extraction.processed = event.processed_count;
                    self.extraction.total = event.total_count;
                }
                changed
            }
            Stage::Complete => {
                let download = self.download.finish(StepState::Success, None, now);
                let extraction = self.extraction.finish(StepState::Success, None, now);
                download || extraction
            }
            Stage::Error => {
                let cause = event
                    .error_cause
                    .clone()
                    .unwrap_or_else(|| event.message.clone());
                self.failure_category = Some(classify_failure(&cause));
                let changed = if self.extraction.status == StepState::InProgress {
                    self.extraction.finish(StepState::Failure, Some(&cause), now)
                } else if self.download.status == StepState::InProgress {
                    self.download.finish(StepState::Failure, Some(&cause), now)
                } else {
                    // Failed before anything was downloaded
                    self.download = StepStatus {
                        status: StepState::Failure,
                        archive_name: archive.cloned(),
                        finished_at_ms: Some(now),
                        error_cause: Some(cause.clone()),
                        ..StepStatus::default()
                    };
                    true
                };
                self.error_cause = Some(cause);
                changed
            }
        }
    }

    /// Close steps left in progress by a run that no longer exists.
    pub fn close_interrupted(&mut self, now: u64) -> bool {
        let download = self
            .download
            .finish(StepState::Failure, Some(INTERRUPTED_MESSAGE), now);
        let extraction = self
            .extraction
            .finish(StepState::Failure, Some(INTERRUPTED_MESSAGE), now);
        if download || extraction {
            self.error_cause = Some(INTERRUPTED_MESSAGE.to_string());
            self.failure_category = Some(FailureCategory::Unknown);
            self.updated_at_ms = Some(now);
        }
        download || extraction
    }

    pub fn has_step_in_progress(&self) -> bool {
        self.download.status == StepState::InProgress
            || self.extraction.status == StepState::InProgress
    }
}

/// Keeps the persisted [`StatusSummary`] in step with progress events.
pub struct StatusTracker {
    kv: Arc<dyn KvStore>,
    summary: Mutex<Option<StatusSummary>>,
}

impl StatusTracker {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            summary: Mutex::new(None),
        }
    }

    async fn load(&self) -> StatusSummary {
        match self.kv.get(STATUS_SUMMARY_KEY).await {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!(error = %e, "Discarding unreadable status summary");
                StatusSummary::default()
            }),
            Ok(None) => StatusSummary::default(),
            Err(e) => {
                warn!(error = %e, "Failed to read status summary");
                StatusSummary::default()
            }
        }
    }

    async fn save(&self, summary: &StatusSummary) -> Result<()> {
        let json = serde_json::to_string(summary)?;
        self.kv.set(STATUS_SUMMARY_KEY, &json).await?;
        Ok(())
    }

    pub async fn snapshot(&self) -> StatusSummary {
        let mut slot = self.summary.lock().await;
        if slot.is_none() {
            *slot = Some(self.load().await);
        }
        slot.clone().unwrap_or_default()
    }

    /// Fold a progress event in, persisting on step status changes.
    /// Persistence failures are logged; the summary is best-effort.
    pub async fn observe(&self, event: &ProgressEvent) {
        let mut slot = self.summary.lock().await;
        if slot.is_none() {
            *slot = Some(self.load().await);
        }
        let Some(summary) = slot.as_mut() else {
            return;
        };
        if summary.apply(event, now_ms())
            && let Err(e) = self.save(summary).await
        {
            warn!(error = %e, "Failed to persist status summary");
        }
    }

    /// Close interrupted steps and persist. Returns true if anything changed.
    pub async fn close_interrupted(&self) -> Result<bool> {
        let mut slot = self.summary.lock().await;
        if slot.is_none() {
            *slot = Some(self.load().await);
        }
        let Some(summary) = slot.as_mut() else {
            return Ok(false);
        };
        if summary.close_interrupted(now_ms()) {
            self.save(summary).await?;
            return Ok(true);
        }
        Ok(false)
    }
}

impl std::fmt::Debug for StatusTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusTracker").finish_non_exhaustive()
    }
}
