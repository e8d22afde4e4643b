//! coma-ingest - FITS observation ingest pipeline
//!
//! Scans the staging tree once, drives every discovered file through the
//! pipeline over a bounded worker pool and exits with a run summary.
//! Ctrl+C cancels the run; records still in flight are deferred to the
//! next run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use coma_common::events::EventBus;
use coma_ingest::config::IngestConfig;
use coma_ingest::models::FileOutcome;
use coma_ingest::services::{
    HttpJobService, HttpRecordWriter, IngestOrchestrator, PipelineDeps, SqliteDeadLetterSink,
    SqliteReferenceStore,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for coma-ingest
#[derive(Parser, Debug)]
#[command(name = "coma-ingest")]
#[command(about = "Ingest staged FITS observations into the COMA archive")]
#[command(version)]
struct Args {
    /// Configuration file (overrides COMA_CONFIG and the default locations)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Staging root to scan
    #[arg(short, long, env = "COMA_STAGING_ROOT")]
    staging: Option<PathBuf>,

    /// Number of files processed concurrently
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,

    /// List the files a run would pick up and exit
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = IngestConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(staging) = args.staging {
        config.paths.staging_root = staging;
    }
    if let Some(concurrency) = args.concurrency {
        config.pipeline.concurrency = concurrency.max(1);
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting coma-ingest {}", env!("CARGO_PKG_VERSION"));
    info!("Staging root: {}", config.paths.staging_root.display());
    info!("Database: {}", config.paths.database_path.display());

    let pool = coma_ingest::db::init_database_pool(&config.paths.database_path)
        .await
        .context("Failed to open database")?;

    let request_timeout = Duration::from_secs(config.services.request_timeout_secs);
    let jobs = HttpJobService::new(&config.services.sci_api_url, request_timeout)
        .context("Failed to build science API client")?;
    let writer = HttpRecordWriter::new(
        &config.services.write_api_url,
        &config.services.write_token,
        request_timeout,
    )
    .context("Failed to build write API client")?;

    let deps = PipelineDeps {
        jobs: Arc::new(jobs),
        references: Arc::new(SqliteReferenceStore::new(pool.clone())),
        writer: Arc::new(writer),
        dead_letters: Arc::new(SqliteDeadLetterSink::new(pool, &config.paths.dead_letter_dir)),
    };

    let orchestrator = IngestOrchestrator::new(&config, deps, EventBus::new(100));

    if args.dry_run {
        let files = orchestrator.discover()?;
        for file in &files {
            println!("{}", file.display());
        }
        info!("Dry run: {} file(s) would be ingested", files.len());
        return Ok(());
    }

    let cancel_token = CancellationToken::new();
    let signal_token = cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling run");
            signal_token.cancel();
        }
    });

    let summary = orchestrator.run(&cancel_token).await?;

    for outcome in &summary.outcomes {
        match &outcome.outcome {
            FileOutcome::Persisted { archive_path, receipt } => println!(
                "persisted     {} -> {} (image {})",
                outcome.source.display(),
                archive_path.display(),
                receipt.image_id
            ),
            FileOutcome::DeadLettered { stage, reason } => {
                println!("dead-lettered {} at {}: {}", outcome.source.display(), stage, reason)
            }
            FileOutcome::Deferred { reason } => {
                println!("deferred      {}: {}", outcome.source.display(), reason)
            }
        }
    }
    println!(
        "run {}: {} discovered, {} persisted, {} dead-lettered, {} deferred",
        summary.run_id, summary.discovered, summary.persisted, summary.dead_lettered, summary.deferred
    );

    Ok(())
}
