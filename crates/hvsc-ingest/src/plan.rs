//! Archive plan computation
//!
//! A plan is the ordered list of archives needed to bring the library from
//! the installed version to the latest known version.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::info;

use crate::state::UpdateOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveKind {
    Baseline,
    Update,
}

impl ArchiveKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Update => "update",
        }
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArchivePlan {
    pub kind: ArchiveKind,
    pub version: u32,
}

impl ArchivePlan {
    pub const fn baseline(version: u32) -> Self {
        Self {
            kind: ArchiveKind::Baseline,
            version,
        }
    }

    pub const fn update(version: u32) -> Self {
        Self {
            kind: ArchiveKind::Update,
            version,
        }
    }

    pub fn is_baseline(&self) -> bool {
        self.kind == ArchiveKind::Baseline
    }

    /// Cache stem shared by every name variant, e.g. `hvsc-baseline-80`.
    pub fn cache_stem(&self, cache_prefix: &str) -> String {
        format!("{cache_prefix}-{}-{}", self.kind, self.version)
    }
}

impl fmt::Display for ArchivePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.version)
    }
}

/// Compute the ordered plan.
///
/// With nothing installed the plan starts with the baseline at
/// `latest_baseline`; then one update per version in `(start, latest]`, where
/// `start` is the baseline (fresh install) or `installed_version`. Updates
/// already recorded as [`UpdateOutcome::Success`] are skipped.
pub fn compute_plan(
    installed_version: u32,
    latest_baseline: u32,
    latest_version: u32,
    applied: &BTreeMap<u32, UpdateOutcome>,
) -> Vec<ArchivePlan> {
    let mut plans = Vec::new();

    let start = if installed_version == 0 {
        if latest_baseline == 0 {
            return plans;
        }
        plans.push(ArchivePlan::baseline(latest_baseline));
        latest_baseline
    } else {
        installed_version
    };

    for version in start.saturating_add(1)..=latest_version {
        if applied.get(&version) == Some(&UpdateOutcome::Success) {
            info!(version, "Update already applied, skipping");
            continue;
        }
        plans.push(ArchivePlan::update(version));
    }

    plans
}
