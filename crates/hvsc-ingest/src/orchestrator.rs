//! Ingestion orchestrator
//!
//! Drives install-or-update runs: plan computation, archive acquisition
//! (cache or download), streaming extraction into the library, deferred
//! deletions and state persistence. At most one run is active per
//! orchestrator; further runs are rejected with
//! [`IngestError::AlreadyRunning`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::archive_store::{ArchiveStore, CachedArchive};
use crate::cancel::{CancelRegistry, checkpoint};
use crate::classify::EntryKind;
use crate::config::IngestConfig;
use crate::download::Downloader;
use crate::error::{IngestError, Result, classify_failure};
use crate::extract::{ArchiveFormat, ExtractEvent, extract};
use crate::fetch::HttpFetch;
use crate::library::{ApplyStats, ArchiveApplier, LibraryStore};
use crate::pipeline::{ArchivePipeline, PipelineState};
use crate::plan::{ArchiveKind, ArchivePlan, compute_plan};
use crate::progress::{ProgressBus, ProgressEvent, ProgressReporter, Stage};
use crate::release::{ReleaseDiscovery, ReleaseInfo};
use crate::songlength::{SonglengthFacade, WarningHandler};
use crate::state::{IngestionPhase, IngestionState, StateRepository, UpdateOutcome, now_ms};
use crate::status::{INTERRUPTED_MESSAGE, StatusSummary, StatusTracker};
use crate::store::{FileStore, KvStore};

pub const CANCELLED_MESSAGE: &str = "Cancelled";

/// Backends an [`Orchestrator`] runs against.
pub struct OrchestratorParts {
    pub archive_store: Arc<dyn FileStore>,
    pub library_store: Arc<dyn FileStore>,
    pub kv: Arc<dyn KvStore>,
    pub fetch: Arc<dyn HttpFetch>,
    pub songlength_warnings: Option<WarningHandler>,
}

/// One archive applied during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedArchive {
    pub plan: ArchivePlan,
    pub archive: String,
    pub from_cache: bool,
    pub stats: ApplyStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub applied: Vec<AppliedArchive>,
    pub installed_version: u32,
}

impl RunReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Where archives missing from the cache come from.
enum Source {
    Remote(ReleaseInfo),
    CacheOnly,
}

/// Clears the single-flight flag when the run ends, however it ends.
struct ActiveGuard<'a>(&'a AtomicBool);

impl<'a> ActiveGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| IngestError::AlreadyRunning)?;
        Ok(Self(flag))
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Orchestrator {
    config: IngestConfig,
    archives: Arc<ArchiveStore>,
    library: LibraryStore,
    downloader: Downloader,
    discovery: ReleaseDiscovery,
    state: StateRepository,
    status: Arc<StatusTracker>,
    bus: ProgressBus,
    songlengths: Arc<SonglengthFacade>,
    cancels: Arc<CancelRegistry>,
    active: AtomicBool,
}

impl Orchestrator {
    pub fn new(config: IngestConfig, parts: OrchestratorParts) -> Result<Self> {
        config.validate()?;

        let archives = Arc::new(ArchiveStore::new(
            parts.archive_store,
            config.archive_dir.clone(),
            config.cache_prefix.clone(),
        ));
        let library = LibraryStore::new(parts.library_store, config.library_root.clone());
        let downloader = Downloader::new(parts.fetch.clone(), archives.clone(), &config);
        let discovery = ReleaseDiscovery::new(parts.fetch, &config)?;

        let mut songlengths = SonglengthFacade::new(library.clone(), config.local_read_timeout);
        if let Some(handler) = parts.songlength_warnings {
            songlengths = songlengths.with_warning_handler(handler);
        }

        Ok(Self {
            bus: ProgressBus::new(config.progress_capacity),
            state: StateRepository::new(parts.kv.clone()),
            status: Arc::new(StatusTracker::new(parts.kv)),
            songlengths: Arc::new(songlengths),
            cancels: Arc::new(CancelRegistry::new()),
            active: AtomicBool::new(false),
            config,
            archives,
            library,
            downloader,
            discovery,
        })
    }

    /// Share a cancellation registry with the caller.
    #[must_use]
    pub fn with_cancel_registry(mut self, cancels: Arc<CancelRegistry>) -> Self {
        self.cancels = cancels;
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn archives(&self) -> &ArchiveStore {
        &self.archives
    }

    pub fn library(&self) -> &LibraryStore {
        &self.library
    }

    pub fn discovery(&self) -> &ReleaseDiscovery {
        &self.discovery
    }

    pub fn songlengths(&self) -> &Arc<SonglengthFacade> {
        &self.songlengths
    }

    pub fn cancel_registry(&self) -> &Arc<CancelRegistry> {
        &self.cancels
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.bus.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub async fn state(&self) -> Result<IngestionState> {
        self.state.load().await
    }

    pub async fn status_summary(&self) -> StatusSummary {
        self.status.snapshot().await
    }

    /// Request cancellation of the run registered under `key`.
    pub fn cancel(&self, key: &str) -> bool {
        self.cancels.cancel(key)
    }

    /// Cancel everything in flight and drop cached songlength data.
    pub async fn reset(&self) {
        self.cancels.cancel_all();
        self.songlengths.invalidate().await;
        debug!("Orchestrator reset");
    }

    /// Install or update from the remote release listing.
    pub async fn plan_and_run(&self, key: &str) -> Result<RunReport> {
        let _guard = ActiveGuard::acquire(&self.active)?;
        let token = self.cancels.register(key);
        let reporter = ProgressReporter::new(self.bus.clone(), Some(self.status.clone()));

        let result = async {
            reporter
                .emit(ProgressEvent::new(Stage::Start, "Starting HVSC update check"))
                .await;
            let state = self.state.load().await?;

            reporter
                .emit(ProgressEvent::new(
                    Stage::ArchiveDiscovery,
                    "Checking for HVSC releases",
                ))
                .await;
            checkpoint(&token)?;
            let release = self.discovery.latest().await?;
            let plans = compute_plan(
                state.installed_version,
                release.latest_baseline().unwrap_or(0),
                release.latest_version(),
                &state.per_update_applied,
            );
            self.run_plans(plans, &Source::Remote(release), state, &token, &reporter)
                .await
        }
        .await;

        self.cancels.release(key);
        self.conclude(result, &reporter).await
    }

    /// Same processing as [`plan_and_run`](Self::plan_and_run) using only
    /// archives already in the local cache.
    pub async fn run_from_cache(&self, key: &str) -> Result<RunReport> {
        let _guard = ActiveGuard::acquire(&self.active)?;
        let token = self.cancels.register(key);
        let reporter = ProgressReporter::new(self.bus.clone(), Some(self.status.clone()));

        let result = async {
            reporter
                .emit(ProgressEvent::new(
                    Stage::Start,
                    "Starting ingestion from cached archives",
                ))
                .await;
            let state = self.state.load().await?;

            reporter
                .emit(ProgressEvent::new(
                    Stage::ArchiveDiscovery,
                    "Scanning archive cache",
                ))
                .await;
            let cached = self.archives.list_cached().await?;
            let latest_baseline = cached
                .iter()
                .filter(|c| c.plan.kind == ArchiveKind::Baseline)
                .map(|c| c.plan.version)
                .max()
                .unwrap_or(0);
            let latest_version = cached
                .iter()
                .map(|c| c.plan.version)
                .max()
                .unwrap_or(0)
                .max(latest_baseline);
            debug!(latest_baseline, latest_version, cached = cached.len(), "Scanned archive cache");

            let plans = compute_plan(
                state.installed_version,
                latest_baseline,
                latest_version,
                &state.per_update_applied,
            );
            self.run_plans(plans, &Source::CacheOnly, state, &token, &reporter)
                .await
        }
        .await;

        self.cancels.release(key);
        self.conclude(result, &reporter).await
    }

    /// Reset state left behind by a run that died with the process.
    ///
    /// Returns true if the persisted phase was rewritten.
    pub async fn recover_stale_state(&self) -> Result<bool> {
        if self.is_active() {
            return Ok(false);
        }

        let state = self.state.load().await?;
        let recovered = if state.ingestion_state.is_running() {
            warn!(
                phase = %state.ingestion_state,
                installed_version = state.installed_version,
                "Ingestion interrupted by restart, marking as failed"
            );
            self.state
                .update(|state| {
                    state.ingestion_state = IngestionPhase::Error;
                    state.ingestion_error = Some(INTERRUPTED_MESSAGE.to_string());
                })
                .await?;
            true
        } else {
            false
        };

        if self.status.close_interrupted().await? {
            info!("Closed status steps left in progress");
        }
        Ok(recovered)
    }

    async fn run_plans(
        &self,
        plans: Vec<ArchivePlan>,
        source: &Source,
        state: IngestionState,
        token: &CancellationToken,
        reporter: &ProgressReporter,
    ) -> Result<RunReport> {
        if plans.is_empty() {
            info!(installed_version = state.installed_version, "HVSC library is up to date");
            reporter
                .emit(ProgressEvent::new(Stage::Complete, "No updates available"))
                .await;
            return Ok(RunReport {
                applied: Vec::new(),
                installed_version: state.installed_version,
            });
        }

        info!(
            plans = ?plans.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "Planned HVSC ingestion"
        );
        let phase = if state.installed_version == 0 {
            IngestionPhase::Installing
        } else {
            IngestionPhase::Updating
        };
        let checked = matches!(source, Source::Remote(_));
        self.state
            .update(move |state| {
                state.ingestion_state = phase;
                state.ingestion_error = None;
                if checked {
                    state.last_update_check_utc_ms = Some(now_ms());
                }
            })
            .await?;

        let mut applied = Vec::with_capacity(plans.len());
        for plan in plans {
            let mut pipeline = ArchivePipeline::new(plan.cache_stem(&self.config.cache_prefix));
            match self
                .process_plan(plan, source, &mut pipeline, token, reporter)
                .await
            {
                Ok(archive) => {
                    if archive.stats.wrote_metadata() {
                        self.songlengths.invalidate().await;
                    }
                    applied.push(archive);
                }
                Err(e) => {
                    self.abandon_plan(plan, &pipeline, &e).await;
                    return Err(e);
                }
            }
        }

        let state = self
            .state
            .update(|state| {
                state.ingestion_state = IngestionPhase::Ready;
                state.ingestion_error = None;
            })
            .await?;
        info!(installed_version = state.installed_version, "HVSC ingestion complete");
        reporter
            .emit(ProgressEvent::new(
                Stage::Complete,
                format!("HVSC version {} installed", state.installed_version),
            ))
            .await;

        Ok(RunReport {
            applied,
            installed_version: state.installed_version,
        })
    }

    async fn acquire(
        &self,
        plan: ArchivePlan,
        source: &Source,
        token: &CancellationToken,
        reporter: &ProgressReporter,
    ) -> Result<(CachedArchive, bool)> {
        if let Some(cached) = self.archives.resolve(plan).await? {
            info!(archive = %cached.name, "Using cached archive");
            return Ok((cached, true));
        }

        match source {
            Source::Remote(release) => {
                let format = release.format_for(plan);
                let url = self.discovery.archive_url(plan, format)?;
                let name = self.archives.canonical_name(plan, format);
                let cached = self
                    .downloader
                    .download(plan, &url, &name, token, reporter)
                    .await?;
                Ok((cached, false))
            }
            Source::CacheOnly => Err(IngestError::MissingCachedArchive {
                archive: plan.cache_stem(&self.config.cache_prefix),
            }),
        }
    }

    async fn process_plan(
        &self,
        plan: ArchivePlan,
        source: &Source,
        pipeline: &mut ArchivePipeline,
        token: &CancellationToken,
        reporter: &ProgressReporter,
    ) -> Result<AppliedArchive> {
        checkpoint(token)?;
        info!(archive = %plan, "Processing archive");

        pipeline.transition(PipelineState::Downloading, "acquire archive")?;
        let (cached, from_cache) = self.acquire(plan, source, token, reporter).await?;
        reporter
            .emit(
                ProgressEvent::new(
                    Stage::ArchiveValidation,
                    if from_cache {
                        format!("Using cached {}", cached.name)
                    } else {
                        format!("Downloaded {}", cached.name)
                    },
                )
                .archive(&cached.name)
                .bytes(cached.size, Some(cached.size)),
            )
            .await;
        pipeline.transition(
            PipelineState::Downloaded,
            if from_cache { "cache hit" } else { "downloaded" },
        )?;

        // Always round-trip through the store
        let data = self.archives.read(&cached).await?;
        let format = ArchiveFormat::detect(&cached.name, &data)?;

        checkpoint(token)?;
        pipeline.transition(PipelineState::Extracting, format.extension())?;
        reporter
            .emit(
                ProgressEvent::new(
                    Stage::ArchiveExtraction,
                    format!("Opening {} archive {}", format, cached.name),
                )
                .archive(&cached.name),
            )
            .await;
        if plan.is_baseline() {
            self.library.reset().await?;
        }

        let mut stream = extract(
            &cached.name,
            format,
            data,
            self.config.extraction_batch_size,
        );
        let mut applier = ArchiveApplier::new(&self.library, plan.kind);
        while let Some(event) = stream.next().await {
            match event? {
                ExtractEvent::Enumerated { total } => {
                    reporter
                        .emit(
                            ProgressEvent::new(
                                Stage::ArchiveExtraction,
                                format!("Extracting {}", cached.name),
                            )
                            .archive(&cached.name)
                            .counts(0, total as u64),
                        )
                        .await;
                }
                ExtractEvent::Entry(entry) => {
                    checkpoint(token)?;
                    let kind = applier.apply(&entry).await?;
                    if matches!(kind, EntryKind::SonglengthsMd5 | EntryKind::SonglengthsTxt) {
                        reporter
                            .emit(
                                ProgressEvent::new(Stage::Songlengths, "Installed songlength file")
                                    .archive(&cached.name)
                                    .file(&entry.path),
                            )
                            .await;
                    }
                }
                ExtractEvent::Progress { processed, total } => {
                    reporter
                        .emit(
                            ProgressEvent::new(
                                Stage::ArchiveExtraction,
                                format!("Extracting {}", cached.name),
                            )
                            .archive(&cached.name)
                            .counts(processed as u64, total as u64),
                        )
                        .await;
                    tokio::task::yield_now().await;
                }
            }
        }

        let written = applier.stats().songs_written;
        pipeline.transition(PipelineState::Extracted, "entries applied")?;
        reporter
            .emit(
                ProgressEvent::new(Stage::SidEnumeration, format!("Wrote {written} songs"))
                    .archive(&cached.name)
                    .counts(written as u64, written as u64),
            )
            .await;

        checkpoint(token)?;
        pipeline.transition(PipelineState::Ingesting, "deferred deletions")?;
        let stats = applier.finish().await;
        reporter
            .emit(
                ProgressEvent::new(
                    Stage::ArchiveExtraction,
                    format!(
                        "Applied {} deletions ({} already absent, {} failed)",
                        stats.deletions_applied, stats.deletions_missing, stats.deletions_failed
                    ),
                )
                .archive(&cached.name),
            )
            .await;
        pipeline.transition(PipelineState::Ready, "archive applied")?;

        self.state
            .update(move |state| {
                state.installed_version = plan.version;
                match plan.kind {
                    ArchiveKind::Baseline => {
                        state.installed_baseline_version = plan.version;
                        // A baseline replaces the library wholesale
                        state.per_update_applied.clear();
                    }
                    ArchiveKind::Update => {
                        state
                            .per_update_applied
                            .insert(plan.version, UpdateOutcome::Success);
                    }
                }
            })
            .await?;
        info!(archive = %plan, ?stats, "Archive applied");

        Ok(AppliedArchive {
            plan,
            archive: cached.name,
            from_cache,
            stats,
        })
    }

    /// Clean up after a plan that did not complete.
    async fn abandon_plan(&self, plan: ArchivePlan, pipeline: &ArchivePipeline, err: &IngestError) {
        let incomplete = matches!(
            pipeline.current(),
            PipelineState::Idle | PipelineState::Downloading
        );
        let unusable = matches!(
            err,
            IngestError::CorruptArchive { .. } | IngestError::UnsupportedFormat { .. }
        );
        if (incomplete || unusable)
            && let Err(e) = self.archives.purge(plan).await
        {
            warn!(archive = %plan, error = %e, "Failed to purge abandoned archive");
        }

        if matches!(
            pipeline.current(),
            PipelineState::Extracting | PipelineState::Extracted | PipelineState::Ingesting
        ) {
            // Metadata files may have been rewritten before the failure
            self.songlengths.invalidate().await;
        }

        if plan.kind == ArchiveKind::Update && !err.is_cancelled() {
            let version = plan.version;
            if let Err(e) = self
                .state
                .update(move |state| {
                    state
                        .per_update_applied
                        .insert(version, UpdateOutcome::Failed);
                })
                .await
            {
                warn!(archive = %plan, error = %e, "Failed to record update failure");
            }
        }
    }

    /// Persist the outcome of a failed or cancelled run and pass the error on.
    async fn conclude(
        &self,
        result: Result<RunReport>,
        reporter: &ProgressReporter,
    ) -> Result<RunReport> {
        let err = match result {
            Ok(report) => return Ok(report),
            Err(e) => e,
        };

        let (phase, message, event) = if err.is_cancelled() {
            info!("Ingestion cancelled");
            (
                IngestionPhase::Idle,
                CANCELLED_MESSAGE.to_string(),
                ProgressEvent::new(Stage::Error, "Ingestion cancelled").error(CANCELLED_MESSAGE),
            )
        } else {
            let message = err.to_string();
            let category = classify_failure(&message);
            error!(error = %message, %category, "Ingestion failed");
            (
                IngestionPhase::Error,
                message.clone(),
                ProgressEvent::new(Stage::Error, format!("Ingestion failed: {message}"))
                    .error(message.clone()),
            )
        };

        if let Err(e) = self
            .state
            .update(move |state| {
                state.ingestion_state = phase;
                state.ingestion_error = Some(message);
            })
            .await
        {
            warn!(error = %e, "Failed to persist ingestion failure");
        }
        reporter.emit(event).await;
        Err(err)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::test_support::build_zip;
    use crate::fetch::FetchResponse;
    use crate::store::{MemoryKvStore, MemoryStore};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;

    /// Serves a fixed listing and refuses archive downloads.
    struct ListingOnly(String);

    #[async_trait]
    impl HttpFetch for ListingOnly {
        async fn head(&self, url: &str) -> Result<Option<u64>> {
            Err(IngestError::network(url, "offline"))
        }

        async fn get_stream(&self, url: &str) -> Result<FetchResponse> {
            Err(IngestError::network(url, "offline"))
        }

        async fn get_text(&self, _url: &str) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    fn orchestrator(listing: &str) -> (Orchestrator, Arc<MemoryStore>, Arc<MemoryKvStore>) {
        let archive_store = Arc::new(MemoryStore::new());
        let kv = Arc::new(MemoryKvStore::new());
        let orchestrator = Orchestrator::new(
            IngestConfig::default(),
            OrchestratorParts {
                archive_store: archive_store.clone(),
                library_store: Arc::new(MemoryStore::new()),
                kv: kv.clone(),
                fetch: Arc::new(ListingOnly(listing.to_string())),
                songlength_warnings: None,
            },
        )
        .unwrap();
        (orchestrator, archive_store, kv)
    }

    async fn seed(orchestrator: &Orchestrator, plan: ArchivePlan, files: &[(&str, &[u8])]) {
        let archives = orchestrator.archives();
        let name = archives.canonical_name(plan, ArchiveFormat::Zip);
        let data = Bytes::from(build_zip(files));
        let size = data.len() as u64;
        archives
            .store()
            .write(&archives.path_of(&name), data)
            .await
            .unwrap();
        archives
            .write_marker(&name, &crate::archive_store::CacheMarker::new(plan, size))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_install_from_cache_only() {
        let (orchestrator, _, _) = orchestrator("");
        seed(
            &orchestrator,
            ArchivePlan::baseline(80),
            &[("C64Music/MUSICIANS/A/a.sid", b"a")],
        )
        .await;

        let report = orchestrator.run_from_cache("run").await.unwrap();
        assert_eq!(report.installed_version, 80);
        assert!(report.applied[0].from_cache);

        let state = orchestrator.state().await.unwrap();
        assert_eq!(state.ingestion_state, IngestionPhase::Ready);
        assert_eq!(state.installed_baseline_version, 80);
        assert!(state.last_update_check_utc_ms.is_none());
        assert_eq!(
            orchestrator.library().read("/MUSICIANS/A/a.sid").await.unwrap(),
            Bytes::from_static(b"a")
        );
        assert!(!orchestrator.is_active());
    }

    #[tokio::test]
    async fn test_missing_update_in_cache_fails_run() {
        let (orchestrator, _, _) = orchestrator("");
        seed(&orchestrator, ArchivePlan::baseline(80), &[("a.sid", b"a")]).await;
        seed(&orchestrator, ArchivePlan::update(82), &[("b.sid", b"b")]).await;

        let err = orchestrator.run_from_cache("run").await.unwrap_err();
        assert!(matches!(err, IngestError::MissingCachedArchive { .. }));

        let state = orchestrator.state().await.unwrap();
        assert_eq!(state.installed_version, 80);
        assert_eq!(state.ingestion_state, IngestionPhase::Error);
        assert_eq!(
            state.per_update_applied.get(&81),
            Some(&UpdateOutcome::Failed)
        );
    }

    #[tokio::test]
    async fn test_release_listing_failure_sets_error() {
        let (orchestrator, _, _) = orchestrator("<html>nothing here</html>");
        let mut events = orchestrator.subscribe();

        let err = orchestrator.plan_and_run("run").await.unwrap_err();
        assert!(matches!(err, IngestError::Release(_)));

        let state = orchestrator.state().await.unwrap();
        assert_eq!(state.ingestion_state, IngestionPhase::Error);

        let mut stages = Vec::new();
        while let Ok(event) = events.try_recv() {
            stages.push(event.stage);
        }
        assert_eq!(
            stages,
            vec![Stage::Start, Stage::ArchiveDiscovery, Stage::Error]
        );
    }

    #[tokio::test]
    async fn test_download_failure_purges_partial_state() {
        let (orchestrator, archive_store, _) =
            orchestrator(r#"<a href="HVSC_80-all-of-them.7z">x</a>"#);

        let err = orchestrator.plan_and_run("run").await.unwrap_err();
        assert!(matches!(err, IngestError::Network { .. }));
        assert_eq!(archive_store.file_count(), 0);

        let summary = orchestrator.status_summary().await;
        assert_eq!(
            summary.failure_category,
            Some(crate::error::FailureCategory::Network)
        );
    }

    #[tokio::test]
    async fn test_single_flight_guard_releases() {
        let (orchestrator, _, _) = orchestrator("");
        {
            let _guard = ActiveGuard::acquire(&orchestrator.active).unwrap();
            assert!(orchestrator.is_active());
            let err = orchestrator.run_from_cache("other").await.unwrap_err();
            assert!(matches!(err, IngestError::AlreadyRunning));
        }
        assert!(!orchestrator.is_active());

        // Empty cache with nothing installed: nothing to do
        let report = orchestrator.run_from_cache("run").await.unwrap();
        assert!(report.is_noop());
    }

    #[tokio::test]
    async fn test_reset_cancels_registered_runs() {
        let (orchestrator, _, _) = orchestrator("");
        let token = orchestrator.cancel_registry().register("run");
        orchestrator.reset().await;
        assert!(token.is_cancelled());
        assert!(!orchestrator.songlengths().is_loaded().await);
    }

    #[tokio::test]
    async fn test_progress_events_stream() {
        let (orchestrator, _, _) = orchestrator("");
        seed(&orchestrator, ArchivePlan::baseline(80), &[("a.sid", b"a")]).await;
        let events = tokio_stream_from(orchestrator.subscribe());

        orchestrator.run_from_cache("run").await.unwrap();
        drop(orchestrator);

        let stages: Vec<Stage> = events.map(|event| event.stage).collect().await;
        assert_eq!(stages.first(), Some(&Stage::Start));
        assert_eq!(stages.last(), Some(&Stage::Complete));
        assert!(stages.contains(&Stage::ArchiveValidation));
        assert!(stages.contains(&Stage::ArchiveExtraction));
    }

    #[tokio::test]
    async fn test_deletions_reported_as_extraction_progress() {
        let (orchestrator, _, _) = orchestrator("");
        seed(
            &orchestrator,
            ArchivePlan::baseline(80),
            &[("C64Music/GAMES/A/a.sid", b"a")],
        )
        .await;
        seed(
            &orchestrator,
            ArchivePlan::update(81),
            &[("delete_files.txt", b"/GAMES/A/a.sid\n")],
        )
        .await;
        let mut events = orchestrator.subscribe();

        let report = orchestrator.run_from_cache("run").await.unwrap();
        assert_eq!(report.applied[1].stats.deletions_applied, 1);

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        let deletions: Vec<_> = received
            .iter()
            .filter(|event| event.message.starts_with("Applied 1 deletions"))
            .collect();
        assert_eq!(deletions.len(), 1);
        assert_eq!(deletions[0].stage, Stage::ArchiveExtraction);
        assert_eq!(
            deletions[0].archive_name.as_deref(),
            Some("hvsc-update-81.zip")
        );
        assert!(
            received
                .iter()
                .all(|event| event.stage != Stage::SidMetadataParsing)
        );
    }

    fn tokio_stream_from(
        rx: broadcast::Receiver<ProgressEvent>,
    ) -> futures::stream::BoxStream<'static, ProgressEvent> {
        futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}
