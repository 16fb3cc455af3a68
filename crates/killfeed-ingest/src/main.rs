//! Kill-feed ingestion daemon.
//!
//! Polls every configured game server for new kill-feed lines and applies
//! them to player statistics.
//!
//! # Usage
//!
//! ```bash
//! # Run the daemon against a local mirror of the servers' files
//! killfeed-ingest --servers servers.json --local-root /srv/mirror run
//!
//! # Run over SFTP (built with `--features sftp`)
//! killfeed-ingest --servers servers.json --source sftp run
//!
//! # Reprocess the last 15 minutes of one server, then exit
//! killfeed-ingest process --server-id 7020 --lookback-minutes 15
//! ```
//!
//! Scheduler tuning is read from `KILLFEED_*` environment variables; see
//! `IngestConfig::from_env`.
//!
//! # Graceful Shutdown
//!
//! On SIGINT (Ctrl+C) the daemon stops starting ticks; servers in progress
//! finish their current file, commit their cursor and disconnect.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use killfeed_core::metrics::{init_metrics, set_gauge, start_metrics_server};
use killfeed_ingest::{
    Database, DedupeCoordinator, EffectsPipeline, IngestConfig, JsonTargetsFile, LocalDirFactory,
    Scheduler, SourceFactory, SqliteOffsetStore, TargetProvider, TickOutcome,
};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

/// Kill-feed ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "killfeed-ingest")]
#[command(about = "Polls game servers' kill feeds into player statistics")]
#[command(version)]
struct Args {
    /// SQLite database for cursors and statistics
    #[arg(long, default_value = "./data/killfeed.db")]
    db_path: PathBuf,

    /// JSON file listing the servers, re-read every tick
    #[arg(long, default_value = "./servers.json")]
    servers: PathBuf,

    /// Where server files are read from
    #[arg(long, value_enum, default_value_t = SourceKind::Local)]
    source: SourceKind,

    /// Root directory standing in for the servers' filesystems (local source)
    #[arg(long, default_value = "./remote")]
    local_root: PathBuf,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "9091")]
    metrics_port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll all servers until interrupted
    Run,
    /// Process one server now and exit
    Process {
        /// Server id from the servers file
        #[arg(long)]
        server_id: String,

        /// Re-read files modified within this many minutes
        #[arg(long, default_value = "15")]
        lookback_minutes: u64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum SourceKind {
    Local,
    Sftp,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("killfeed_ingest=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = IngestConfig::from_env().context("Invalid KILLFEED_* configuration")?;

    tracing::info!("Configuration:");
    tracing::info!("  Database: {}", args.db_path.display());
    tracing::info!("  Servers: {}", args.servers.display());
    tracing::info!("  Source: {:?}", args.source);

    let scheduler = Arc::new(build_scheduler(&args, config)?);

    match &args.command {
        Command::Run => run(&args, scheduler).await,
        Command::Process {
            server_id,
            lookback_minutes,
        } => process(&scheduler, server_id, *lookback_minutes).await,
    }
}

fn build_scheduler(args: &Args, config: IngestConfig) -> Result<Scheduler> {
    tracing::info!("Opening database at {}", args.db_path.display());
    let db = Arc::new(
        Database::open(&args.db_path)
            .with_context(|| format!("Failed to open database at {:?}", args.db_path))?,
    );

    let targets = JsonTargetsFile::new(&args.servers);
    let servers = targets
        .targets()
        .with_context(|| format!("Failed to load servers from {:?}", args.servers))?;
    tracing::info!("Loaded {} servers", servers.len());

    let sources: Arc<dyn SourceFactory> = match args.source {
        SourceKind::Local => {
            tracing::info!("Reading server files under {}", args.local_root.display());
            Arc::new(LocalDirFactory::new(&args.local_root))
        }
        SourceKind::Sftp => sftp_factory(config.scheduler.remote_timeout)?,
    };

    Ok(Scheduler::new(
        config.scheduler,
        Arc::new(targets),
        sources,
        Arc::new(SqliteOffsetStore::new(Arc::clone(&db))),
        Arc::new(DedupeCoordinator::new(config.dedupe)),
        Arc::new(EffectsPipeline::new(db)),
    ))
}

#[cfg(feature = "sftp")]
fn sftp_factory(timeout: Duration) -> Result<Arc<dyn SourceFactory>> {
    Ok(Arc::new(killfeed_ingest::source::SftpFactory::new(timeout)))
}

#[cfg(not(feature = "sftp"))]
fn sftp_factory(_timeout: Duration) -> Result<Arc<dyn SourceFactory>> {
    bail!("SFTP support not compiled in; rebuild with --features sftp")
}

async fn run(args: &Args, scheduler: Arc<Scheduler>) -> Result<()> {
    tracing::info!("Kill-feed ingestion daemon starting...");

    // Initialize metrics
    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle).await?;
        set_gauge("scheduler_running", 1.0);
    }

    // Set up graceful shutdown
    let running = scheduler.shutdown_flag();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        running.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    spawn_report_logger(&scheduler);
    spawn_feed_logger(&scheduler);

    Arc::clone(&scheduler).run_periodic().await?;

    set_gauge("scheduler_running", 0.0);
    let dedupe = scheduler.dedupe().stats();
    tracing::info!(
        "Shutdown complete ({} fingerprints retained across {} servers, {} duplicates suppressed)",
        dedupe.fingerprints,
        dedupe.partitions,
        dedupe.hits
    );
    Ok(())
}

async fn process(scheduler: &Scheduler, server_id: &str, lookback_minutes: u64) -> Result<()> {
    let lookback = Duration::from_secs(lookback_minutes.saturating_mul(60));
    let report = scheduler
        .process_now(server_id, lookback)
        .await
        .with_context(|| format!("Cannot process server {}", server_id))?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    match &report.outcome {
        TickOutcome::Completed => {
            tracing::info!("Server {}: {}", server_id, report.summary());
            Ok(())
        }
        TickOutcome::Skipped { reason } => {
            bail!("server {} skipped: {}", server_id, reason.as_str())
        }
        TickOutcome::Failed { message, .. } => bail!("server {} failed: {}", server_id, message),
    }
}

/// Log a line per failed or skipped server tick.
fn spawn_report_logger(scheduler: &Scheduler) {
    let mut reports = scheduler.subscribe();
    tokio::spawn(async move {
        loop {
            match reports.recv().await {
                Ok(report) => match &report.outcome {
                    TickOutcome::Completed => {}
                    TickOutcome::Skipped { reason } => {
                        tracing::debug!("Server {} skipped: {}", report.server_id, reason.as_str())
                    }
                    TickOutcome::Failed { kind, message } => tracing::warn!(
                        "Server {} tick failed ({}): {}",
                        report.server_id,
                        kind.as_str(),
                        message
                    ),
                },
                Err(RecvError::Lagged(n)) => tracing::warn!("Report logger lagged by {}", n),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Log applied kills and suicides as they happen.
fn spawn_feed_logger(scheduler: &Scheduler) {
    let mut feed = scheduler.effects().subscribe();
    tokio::spawn(async move {
        loop {
            match feed.recv().await {
                Ok(kill) => match &kill.killer {
                    Some(killer) => tracing::info!(
                        "[{}] {} killed {} with {} ({:.0}m)",
                        kill.server_id,
                        killer.name,
                        kill.victim.name,
                        kill.weapon,
                        kill.distance
                    ),
                    None => tracing::info!(
                        "[{}] {} died ({})",
                        kill.server_id,
                        kill.victim.name,
                        kill.weapon
                    ),
                },
                Err(RecvError::Lagged(n)) => tracing::warn!("Kill feed logger lagged by {}", n),
                Err(RecvError::Closed) => break,
            }
        }
    });
}
