//! Per-archive processing state machine
//!
//! Every archive moves through the same strictly linear lifecycle:
//!
//! ```text
//! Idle → Downloading → Downloaded → Extracting → Extracted → Ingesting → Ready
//! ```
//!
//! There are no branches and no skips. A rejected transition is an
//! orchestration bug, so it is logged at error level with full context and
//! returned as [`IngestError::IllegalTransition`].

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error};

use crate::error::{IngestError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Downloading,
    Downloaded,
    Extracting,
    Extracted,
    Ingesting,
    Ready,
}

impl PipelineState {
    /// The only state reachable from `self`, or `None` for `Ready`.
    pub const fn successor(self) -> Option<Self> {
        match self {
            Self::Idle => Some(Self::Downloading),
            Self::Downloading => Some(Self::Downloaded),
            Self::Downloaded => Some(Self::Extracting),
            Self::Extracting => Some(Self::Extracted),
            Self::Extracted => Some(Self::Ingesting),
            Self::Ingesting => Some(Self::Ready),
            Self::Ready => None,
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        self.successor() == Some(next)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Extracting => "extracting",
            Self::Extracted => "extracted",
            Self::Ingesting => "ingesting",
            Self::Ready => "ready",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State machine for a single archive.
#[derive(Debug, Clone)]
pub struct ArchivePipeline {
    archive: String,
    state: PipelineState,
}

impl ArchivePipeline {
    pub fn new(archive: impl Into<String>) -> Self {
        Self {
            archive: archive.into(),
            state: PipelineState::Idle,
        }
    }

    pub fn archive(&self) -> &str {
        &self.archive
    }

    pub fn current(&self) -> PipelineState {
        self.state
    }

    /// Move to `next`, where `detail` describes why (e.g. "cache-hit").
    pub fn transition(&mut self, next: PipelineState, detail: &str) -> Result<()> {
        if !self.state.can_transition_to(next) {
            error!(
                archive = %self.archive,
                from = %self.state,
                to = %next,
                detail,
                "Illegal pipeline transition"
            );
            return Err(IngestError::IllegalTransition {
                archive: self.archive.clone(),
                from: self.state,
                to: next,
                detail: detail.to_string(),
            });
        }

        debug!(archive = %self.archive, from = %self.state, to = %next, detail, "Pipeline transition");
        self.state = next;
        Ok(())
    }
}
