//! `hvsc` binary entry point.
//!
//! Thin wrapper around the hvsc-ingest library that:
//! 1. Parses command-line arguments
//! 2. Initializes logging
//! 3. Builds an orchestrator over a data directory
//! 4. Runs the requested command, cancelling on Ctrl-C

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use hvsc_ingest::songlength::SonglengthQuery;
use hvsc_ingest::{
    FileKvStore, FsStore, IngestConfig, IngestError, Orchestrator, OrchestratorParts,
    ProgressEvent, ReqwestFetch, RunReport, Stage,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Cancellation key of the run started by this process.
const RUN_KEY: &str = "cli";

#[derive(Parser)]
#[command(
    name = "hvsc",
    about = "Install and update a local copy of the High Voltage SID Collection",
    version,
    author
)]
struct Cli {
    /// Set the logging level (RUST_LOG takes precedence)
    #[arg(short, long, value_enum, default_value = "info")]
    log_level: LogLevel,

    /// Directory holding the archive cache, library and state
    #[arg(
        short,
        long,
        global = true,
        env = "HVSC_DATA_DIR",
        default_value = "hvsc-data"
    )]
    data_dir: PathBuf,

    /// Release listing URL
    #[arg(long, global = true, env = "HVSC_RELEASE_BASE_URL")]
    base_url: Option<String>,

    /// Output format
    #[arg(short = 'o', long, value_enum, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LookupKind {
    /// Virtual library path, e.g. /MUSICIANS/H/Hubbard_Rob/Commando.sid
    Path,
    /// Bare file name
    Name,
    /// Hex MD5 of the song file
    Md5,
    /// Local song file, hashed before lookup
    File,
}

#[derive(Subcommand)]
enum Commands {
    /// Check for new releases and install or update the library
    Update,

    /// Install or update using only archives already in the cache
    IngestCached,

    /// Show the persisted ingestion state and status summary
    Status,

    /// Reset state left behind by an interrupted run
    Recover,

    /// List the published baseline and update archives
    Releases,

    /// Look up song durations
    Songlength {
        /// Path, file name, hash or local file, depending on --by
        query: String,

        #[arg(long, value_enum, default_value = "path")]
        by: LookupKind,
    },
}

fn init_tracing(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(Level::from(level).as_str().to_ascii_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn build_orchestrator(cli: &Cli) -> Result<Orchestrator> {
    let mut config = IngestConfig::from_env()?;
    if let Some(base_url) = &cli.base_url {
        config.release_base_url.clone_from(base_url);
    }

    let store = Arc::new(FsStore::new(&cli.data_dir));
    let kv = Arc::new(FileKvStore::new(cli.data_dir.join("state")));
    let fetch = Arc::new(ReqwestFetch::new(&config)?);

    let orchestrator = Orchestrator::new(
        config,
        OrchestratorParts {
            archive_store: store.clone(),
            library_store: store,
            kv,
            fetch,
            songlength_warnings: None,
        },
    )?;
    Ok(orchestrator)
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn print_progress(mut rx: broadcast::Receiver<ProgressEvent>, format: OutputFormat) {
    loop {
        match rx.recv().await {
            Ok(event) if format == OutputFormat::Json => {
                if let Ok(line) = serde_json::to_string(&event) {
                    println!("{line}");
                }
            }
            Ok(event) => match (event.stage, event.percent) {
                (Stage::Error, _) => eprintln!("[{}] {}", event.stage, event.message),
                (_, Some(percent)) => {
                    println!("[{}] {} ({percent:.0}%)", event.stage, event.message);
                }
                _ => println!("[{}] {}", event.stage, event.message),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Progress printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run_ingestion(
    orchestrator: Arc<Orchestrator>,
    cached: bool,
    format: OutputFormat,
) -> Result<()> {
    if orchestrator.recover_stale_state().await? {
        tracing::warn!("Previous run was interrupted; its state has been reset");
    }

    let printer = tokio::spawn(print_progress(orchestrator.subscribe(), format));

    let ctrl_c = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Cancelling after the current step...");
                orchestrator.cancel(RUN_KEY);
            }
        })
    };

    let result = if cached {
        orchestrator.run_from_cache(RUN_KEY).await
    } else {
        orchestrator.plan_and_run(RUN_KEY).await
    };
    ctrl_c.abort();

    // Let the printer drain what is already queued
    tokio::time::sleep(Duration::from_millis(50)).await;
    printer.abort();

    match result {
        Ok(report) => {
            report_summary(&report, format)?;
            Ok(())
        }
        Err(IngestError::Cancelled) => {
            eprintln!("Cancelled");
            Ok(())
        }
        Err(e) => Err(e).context("HVSC ingestion failed"),
    }
}

fn report_summary(report: &RunReport, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        let applied: Vec<_> = report
            .applied
            .iter()
            .map(|a| {
                serde_json::json!({
                    "kind": a.plan.kind,
                    "version": a.plan.version,
                    "archive": a.archive,
                    "fromCache": a.from_cache,
                    "songsWritten": a.stats.songs_written,
                    "deletionsApplied": a.stats.deletions_applied,
                })
            })
            .collect();
        return print_json(&serde_json::json!({
            "installedVersion": report.installed_version,
            "applied": applied,
        }));
    }

    if report.is_noop() {
        println!("HVSC version {} is up to date", report.installed_version);
        return Ok(());
    }
    for applied in &report.applied {
        println!(
            "{:<24} {:>6} songs, {:>4} deletions{}",
            applied.archive,
            applied.stats.songs_written,
            applied.stats.deletions_applied,
            if applied.from_cache { " (cached)" } else { "" }
        );
    }
    println!("HVSC version {} installed", report.installed_version);
    Ok(())
}

async fn show_status(orchestrator: &Orchestrator, format: OutputFormat) -> Result<()> {
    let state = orchestrator.state().await?;
    let summary = orchestrator.status_summary().await;

    if format == OutputFormat::Json {
        return print_json(&serde_json::json!({ "state": state, "summary": summary }));
    }

    println!("State:             {}", state.ingestion_state);
    println!("Installed version: {}", state.installed_version);
    println!("Baseline version:  {}", state.installed_baseline_version);
    if let Some(error) = &state.ingestion_error {
        println!("Last error:        {error}");
    }
    if let Some(category) = summary.failure_category {
        println!("Failure category:  {category}");
    }
    for (step, status) in [
        ("Download", &summary.download),
        ("Extraction", &summary.extraction),
    ] {
        println!(
            "{step:<19}{:?}{}",
            status.status,
            status
                .archive_name
                .as_deref()
                .map(|name| format!(" ({name})"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn show_releases(orchestrator: &Orchestrator, format: OutputFormat) -> Result<()> {
    let info = orchestrator.discovery().latest().await?;

    if format == OutputFormat::Json {
        let describe = |map: &std::collections::BTreeMap<u32, hvsc_ingest::ArchiveFormat>| {
            map.iter()
                .map(|(version, format)| {
                    serde_json::json!({ "version": version, "format": format.extension() })
                })
                .collect::<Vec<_>>()
        };
        return print_json(&serde_json::json!({
            "baselines": describe(&info.baselines),
            "updates": describe(&info.updates),
            "latestVersion": info.latest_version(),
        }));
    }

    for (version, format) in &info.baselines {
        println!("baseline {version:>4}  .{format}");
    }
    for (version, format) in &info.updates {
        println!("update   {version:>4}  .{format}");
    }
    println!("Latest version: {}", info.latest_version());
    Ok(())
}

async fn lookup_songlength(
    orchestrator: &Orchestrator,
    query: String,
    by: LookupKind,
    format: OutputFormat,
) -> Result<()> {
    let songlengths = orchestrator.songlengths();
    let durations = match by {
        LookupKind::Path => songlengths.resolve(&SonglengthQuery::Path(query)).await,
        LookupKind::Name => songlengths.resolve(&SonglengthQuery::FileName(query)).await,
        LookupKind::Md5 => songlengths.resolve(&SonglengthQuery::Md5(query)).await,
        LookupKind::File => {
            let data = tokio::fs::read(&query)
                .await
                .with_context(|| format!("reading {query}"))?;
            songlengths.resolve_content(&data).await
        }
    };

    if format == OutputFormat::Json {
        let millis: Vec<u128> = durations.iter().map(Duration::as_millis).collect();
        return print_json(&millis);
    }

    if durations.is_empty() {
        println!("No songlength entry found");
    }
    for (index, duration) in durations.iter().enumerate() {
        let total = duration.as_millis();
        println!(
            "subtune {:>2}: {}:{:02}.{:03}",
            index + 1,
            total / 60_000,
            (total / 1000) % 60,
            total % 1000
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level);

    // reqwest is built without a bundled crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    let orchestrator = Arc::new(build_orchestrator(&cli)?);
    tracing::debug!(data_dir = %cli.data_dir.display(), "Orchestrator ready");

    match cli.command {
        Commands::Update => run_ingestion(orchestrator, false, cli.format).await?,
        Commands::IngestCached => run_ingestion(orchestrator, true, cli.format).await?,
        Commands::Status => show_status(&orchestrator, cli.format).await?,
        Commands::Recover => {
            if orchestrator.recover_stale_state().await? {
                println!("Interrupted run recovered");
            } else {
                println!("Nothing to recover");
            }
        }
        Commands::Releases => show_releases(&orchestrator, cli.format).await?,
        Commands::Songlength { query, by } => {
            lookup_songlength(&orchestrator, query, by, cli.format).await?;
        }
    }

    Ok(())
}
