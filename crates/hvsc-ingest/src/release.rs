//! Release discovery from the HVSC directory listing
//!
//! The listing links baselines as `HVSC_<v>-all-of-them.<ext>` and updates as
//! `HVSC_Update_<v>.<ext>`, with `<ext>` either `7z` or `zip`.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use crate::extract::ArchiveFormat;
use crate::fetch::HttpFetch;
use crate::plan::{ArchiveKind, ArchivePlan};

/// Archives published in the release listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub baselines: BTreeMap<u32, ArchiveFormat>,
    pub updates: BTreeMap<u32, ArchiveFormat>,
}

impl ReleaseInfo {
    pub fn latest_baseline(&self) -> Option<u32> {
        self.baselines.keys().next_back().copied()
    }

    pub fn latest_update(&self) -> Option<u32> {
        self.updates.keys().next_back().copied()
    }

    /// Newest version reachable through the listing.
    pub fn latest_version(&self) -> u32 {
        self.latest_baseline()
            .unwrap_or(0)
            .max(self.latest_update().unwrap_or(0))
    }

    /// Published format for `plan`, 7z when unlisted.
    pub fn format_for(&self, plan: ArchivePlan) -> ArchiveFormat {
        let listed = match plan.kind {
            ArchiveKind::Baseline => self.baselines.get(&plan.version),
            ArchiveKind::Update => self.updates.get(&plan.version),
        };
        listed.copied().unwrap_or(ArchiveFormat::SevenZip)
    }
}

fn record(map: &mut BTreeMap<u32, ArchiveFormat>, version: u32, format: ArchiveFormat) {
    // 7z wins when both are published
    map.entry(version)
        .and_modify(|existing| {
            if format == ArchiveFormat::SevenZip {
                *existing = format;
            }
        })
        .or_insert(format);
}

pub struct ReleaseDiscovery {
    fetch: Arc<dyn HttpFetch>,
    base: Url,
    remote_prefix: String,
    baseline_pattern: Regex,
    update_pattern: Regex,
}

impl ReleaseDiscovery {
    pub fn new(fetch: Arc<dyn HttpFetch>, config: &IngestConfig) -> Result<Self> {
        let base = Url::parse(&config.release_base())
            .map_err(|e| IngestError::config(format!("release_base_url: {e}")))?;
        let prefix = regex::escape(&config.remote_prefix);
        let baseline_pattern = Regex::new(&format!(r"(?i){prefix}_(\d+)-all-of-them\.(7z|zip)"))
            .map_err(|e| IngestError::config(format!("baseline pattern: {e}")))?;
        let update_pattern = Regex::new(&format!(r"(?i){prefix}_Update_(\d+)\.(7z|zip)"))
            .map_err(|e| IngestError::config(format!("update pattern: {e}")))?;

        Ok(Self {
            fetch,
            base,
            remote_prefix: config.remote_prefix.clone(),
            baseline_pattern,
            update_pattern,
        })
    }

    /// Remote file name of `plan` in `format`.
    pub fn remote_name(&self, plan: ArchivePlan, format: ArchiveFormat) -> String {
        match plan.kind {
            ArchiveKind::Baseline => format!(
                "{}_{}-all-of-them.{}",
                self.remote_prefix,
                plan.version,
                format.extension()
            ),
            ArchiveKind::Update => format!(
                "{}_Update_{}.{}",
                self.remote_prefix,
                plan.version,
                format.extension()
            ),
        }
    }

    pub fn archive_url(&self, plan: ArchivePlan, format: ArchiveFormat) -> Result<String> {
        let name = self.remote_name(plan, format);
        self.base
            .join(&name)
            .map(String::from)
            .map_err(|e| IngestError::release(format!("cannot build URL for {name}: {e}")))
    }

    /// Extract published archives from a listing page.
    pub fn parse_listing(&self, listing: &str) -> Result<ReleaseInfo> {
        let mut info = ReleaseInfo::default();

        for (pattern, target) in [
            (&self.baseline_pattern, &mut info.baselines),
            (&self.update_pattern, &mut info.updates),
        ] {
            for captures in pattern.captures_iter(listing) {
                let Some(version) = captures.get(1).and_then(|m| m.as_str().parse().ok()) else {
                    continue;
                };
                let Some(format) = captures
                    .get(2)
                    .and_then(|m| ArchiveFormat::from_extension(m.as_str()))
                else {
                    continue;
                };
                record(target, version, format);
            }
        }

        if info.baselines.is_empty() {
            return Err(IngestError::release(format!(
                "no {}_<version>-all-of-them archive listed at {}",
                self.remote_prefix, self.base
            )));
        }
        debug!(
            baselines = info.baselines.len(),
            updates = info.updates.len(),
            "Parsed release listing"
        );
        Ok(info)
    }

    /// Fetch and parse the release listing.
    pub async fn latest(&self) -> Result<ReleaseInfo> {
        let listing = self.fetch.get_text(self.base.as_str()).await?;
        let info = self.parse_listing(&listing)?;
        info!(
            baseline = ?info.latest_baseline(),
            update = ?info.latest_update(),
            "Discovered HVSC releases"
        );
        Ok(info)
    }
}

impl std::fmt::Debug for ReleaseDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseDiscovery")
            .field("base", &self.base.as_str())
            .field("remote_prefix", &self.remote_prefix)
            .finish_non_exhaustive()
    }
}
