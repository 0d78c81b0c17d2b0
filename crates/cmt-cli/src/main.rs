use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cmt_core::{Growth, ItemId};
use cmt_sync::{maybe_build_scheduler, open_pipeline, PipelineConfig};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Creator metrics tracker: credential-pooled ingestion with offline-first sync.
#[derive(Debug, Parser)]
#[command(name = "cmt-cli")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion cycle over the watchlist
    Run,
    /// Deliver queued records to the sync target
    Flush {
        /// Re-queue records that already ran out of retries first
        #[arg(long)]
        retry_failed: bool,
    },
    /// Probe every credential now
    HealthCheck,
    /// Show credential pool status (secrets are never printed)
    Credentials,
    /// Re-enable a credential and clear its failure count
    ResetCredential { name: String },
    /// Show growth for one item
    Growth {
        item_id: String,
        /// Earlier snapshot label, e.g. T1 (requires --to)
        #[arg(long, requires = "to")]
        from: Option<String>,
        /// Later snapshot label, e.g. T2
        #[arg(long, requires = "from")]
        to: Option<String>,
    },
    /// Run cycles on CMT_SYNC_CRON until interrupted
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = cmt_sync::run_cycle_once_from_env().await?;
            println!(
                "cycle complete: run_id={} processed={} skipped={} new={} synced={} backlog={} disabled={:?}",
                summary.run_id,
                summary.items_processed,
                summary.items_skipped,
                summary.new_items,
                summary.records_synced,
                summary.sync_backlog,
                summary.credentials_disabled
            );
        }
        Commands::Flush { retry_failed } => {
            let mut pipeline = open_pipeline(config).await?;
            if retry_failed {
                let moved = pipeline.retry_failed().await?;
                info!(moved, "failed records re-queued");
            }
            let report = pipeline.flush(None).await;
            pipeline.close().await?;
            let report = report?;
            println!(
                "flush complete: synced={} retried={} failed={} backlog={}",
                report.synced, report.retried, report.failed, report.backlog
            );
        }
        Commands::HealthCheck => {
            let mut pipeline = open_pipeline(config).await?;
            let report = pipeline.health_check().await;
            pipeline.close().await?;
            println!("{}", serde_json::to_string_pretty(&report?)?);
        }
        Commands::Credentials => {
            let pipeline = open_pipeline(config).await?;
            let status = pipeline.pool_status();
            pipeline.close().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::ResetCredential { name } => {
            let mut pipeline = open_pipeline(config).await?;
            let reset = pipeline.reset_credential(&name).await;
            pipeline.close().await?;
            reset.with_context(|| format!("resetting credential {name}"))?;
            println!("credential '{name}' re-enabled");
        }
        Commands::Growth { item_id, from, to } => {
            let pipeline = open_pipeline(config).await?;
            let item_id = ItemId::new(item_id);
            let labels = from.as_deref().zip(to.as_deref());
            let growth = pipeline.growth(&item_id, labels).await;
            pipeline.close().await?;
            match growth? {
                Growth::Computed(metric) => println!("{}", serde_json::to_string_pretty(&metric)?),
                Growth::Insufficient { item_id, reason } => {
                    println!("growth for {item_id} unavailable: {}", reason.as_str())
                }
            }
        }
        Commands::Schedule => {
            let Some(mut sched) = maybe_build_scheduler(&config).await? else {
                eprintln!("scheduler disabled; set CMT_SCHEDULER_ENABLED=true to run cycles on a cron");
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| anyhow::anyhow!("invalid log level: {}", e))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}
