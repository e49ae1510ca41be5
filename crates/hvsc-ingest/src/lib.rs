//! # hvsc-ingest
//!
//! Installs and updates a local copy of the High Voltage SID Collection from
//! its published baseline and update archives.
//!
//! ## Pipeline
//!
//! 1. [`ReleaseDiscovery`] reads the release listing and
//!    [`compute_plan`] turns it into an ordered list of [`ArchivePlan`]s.
//! 2. Each archive is taken from the [`ArchiveStore`] when a valid
//!    completion marker vouches for it, otherwise the [`Downloader`] streams
//!    it into the cache.
//! 3. [`extract`] yields the archive's entries lazily; [`ArchiveApplier`]
//!    writes songs and songlength files into the [`LibraryStore`] and applies
//!    deletion lists once every entry is written.
//! 4. [`IngestionState`] records the installed version after each archive,
//!    so an interrupted run resumes with the next one.
//!
//! The [`Orchestrator`] ties these together with single-flight protection,
//! cooperative cancellation and restart recovery, and publishes
//! [`ProgressEvent`]s for user interfaces. [`SonglengthFacade`] answers
//! duration queries from the installed metadata files.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hvsc_ingest::{
//!     FileKvStore, FsStore, IngestConfig, Orchestrator, OrchestratorParts, ReqwestFetch,
//! };
//!
//! # async fn example() -> hvsc_ingest::Result<()> {
//! let config = IngestConfig::from_env()?;
//! let store = Arc::new(FsStore::new("/var/lib/hvsc"));
//! let orchestrator = Orchestrator::new(
//!     config.clone(),
//!     OrchestratorParts {
//!         archive_store: store.clone(),
//!         library_store: store,
//!         kv: Arc::new(FileKvStore::new("/var/lib/hvsc/state")),
//!         fetch: Arc::new(ReqwestFetch::new(&config)?),
//!         songlength_warnings: None,
//!     },
//! )?;
//!
//! orchestrator.recover_stale_state().await?;
//! let report = orchestrator.plan_and_run("update").await?;
//! println!("HVSC version {} installed", report.installed_version);
//! # Ok(())
//! # }
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod archive_store;
pub mod cancel;
pub mod classify;
pub mod config;
pub mod download;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod library;
pub mod orchestrator;
pub mod pipeline;
pub mod plan;
pub mod progress;
pub mod release;
pub mod songlength;
pub mod state;
pub mod status;
pub mod store;

pub use archive_store::{ArchiveStore, CacheMarker, CachedArchive};
pub use cancel::CancelRegistry;
pub use classify::{EntryKind, classify_entry};
pub use config::IngestConfig;
pub use download::Downloader;
pub use error::{FailureCategory, IngestError, Result, StoreError, classify_failure};
pub use extract::{ArchiveEntry, ArchiveFormat, EntryStream, ExtractEvent, extract};
pub use fetch::{HttpFetch, ReqwestFetch};
pub use library::{ApplyStats, ArchiveApplier, LibraryStore};
pub use orchestrator::{AppliedArchive, Orchestrator, OrchestratorParts, RunReport};
pub use pipeline::{ArchivePipeline, PipelineState};
pub use plan::{ArchiveKind, ArchivePlan, compute_plan};
pub use progress::{ProgressBus, ProgressEvent, ProgressReporter, Stage};
pub use release::{ReleaseDiscovery, ReleaseInfo};
pub use songlength::{SonglengthFacade, SonglengthQuery, SonglengthWarning};
pub use state::{IngestionPhase, IngestionState, StateRepository, UpdateOutcome};
pub use status::{StatusSummary, StatusTracker, StepState, StepStatus};
pub use store::{FileKvStore, FileStore, FsStore, KvStore, MemoryKvStore, MemoryStore};
