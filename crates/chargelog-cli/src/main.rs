use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chargelog_adapters::FixtureSource;
use chargelog_sync::{IngestConfig, IngestPipeline, IngestSummary};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "chargelog")]
#[command(about = "Charging station status history ingester")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one poll cycle against OpenChargeMap, or a local snapshot file.
    Ingest {
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Create the database and schema without polling.
    InitDb,
    /// Poll on the configured cron schedule until interrupted.
    Schedule,
    /// Print a station's current facility row and full history as JSON.
    Status { station_id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = IngestConfig::from_env();

    match cli.command.unwrap_or(Commands::Ingest { fixture: None }) {
        Commands::Ingest { fixture } => {
            let pipeline = match fixture {
                Some(path) => IngestPipeline::with_source(config, Box::new(FixtureSource::new(path))),
                None => IngestPipeline::new(config)?,
            };
            let summary = pipeline.run_once().await?;
            print_summary(&summary);
        }
        Commands::InitDb => {
            chargelog_sync::bootstrap_store(&config).await?;
            println!("database ready: {}", config.database_url);
        }
        Commands::Schedule => {
            let config = IngestConfig {
                scheduler_enabled: true,
                ..config
            };
            let pipeline = Arc::new(IngestPipeline::new(config)?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler was not built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().poll_cron, "scheduler started; press Ctrl-C to stop");

            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            if let Err(err) = sched.shutdown().await {
                warn!(error = %err, "scheduler did not shut down cleanly");
            }
        }
        Commands::Status { station_id } => {
            let Some(report) = chargelog_sync::station_report(&config, station_id).await? else {
                bail!("station {station_id} has never been ingested");
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

fn print_summary(summary: &IngestSummary) {
    let counts = &summary.run.counts;
    println!(
        "ingest complete: run_id={} records={} ingested={} skipped={} failed={} status_events={} comments_inserted={}",
        summary.run.run_id,
        counts.records_seen,
        counts.records_ingested,
        counts.records_skipped,
        counts.records_failed,
        counts.status_events_written,
        counts.comments_inserted,
    );
    for issue in &summary.issues {
        eprintln!("  issue: {issue}");
    }
}
