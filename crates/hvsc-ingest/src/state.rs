//! Persisted, process-wide ingestion state

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

use crate::error::Result;
use crate::store::KvStore;

pub const INGESTION_STATE_KEY: &str = "hvsc.ingestion-state.v1";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestionPhase {
    #[default]
    Idle,
    Installing,
    Updating,
    Ready,
    Error,
}

impl IngestionPhase {
    /// Phases that mean a run was in progress when the state was written.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Installing | Self::Updating)
    }
}

impl fmt::Display for IngestionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Installing => "installing",
            Self::Updating => "updating",
            Self::Ready => "ready",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateOutcome {
    Success,
    Failed,
}

/// Authoritative record of what is installed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IngestionState {
    pub installed_baseline_version: u32,
    pub installed_version: u32,
    pub ingestion_state: IngestionPhase,
    pub last_update_check_utc_ms: Option<u64>,
    pub ingestion_error: Option<String>,
    pub per_update_applied: BTreeMap<u32, UpdateOutcome>,
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Loads and saves [`IngestionState`] as a JSON document.
#[derive(Clone)]
pub struct StateRepository {
    kv: Arc<dyn KvStore>,
}

impl StateRepository {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Current state, or defaults when nothing (or nothing readable) is stored.
    pub async fn load(&self) -> Result<IngestionState> {
        match self.kv.get(INGESTION_STATE_KEY).await? {
            Some(json) => match serde_json::from_str(&json) {
                Ok(state) => Ok(state),
                Err(e) => {
                    warn!(error = %e, "Discarding unreadable ingestion state");
                    Ok(IngestionState::default())
                }
            },
            None => Ok(IngestionState::default()),
        }
    }

    pub async fn save(&self, state: &IngestionState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        self.kv.set(INGESTION_STATE_KEY, &json).await?;
        Ok(())
    }

    /// Load, apply `f`, save, and return the saved state.
    pub async fn update<F>(&self, f: F) -> Result<IngestionState>
    where
        F: FnOnce(&mut IngestionState) + Send,
    {
        let mut state = self.load().await?;
        f(&mut state);
        self.save(&state).await?;
        Ok(state)
    }
}

impl fmt::Debug for StateRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateRepository").finish_non_exhaustive()
    }
}
