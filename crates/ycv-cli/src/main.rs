use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use ycv_sync::{
    today, DiscoverySelection, DiscoverySummary, ExtractionSummary, HarvestConfig, HarvestPipeline,
    HarvestPolicy,
};
use ycv_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "ycv")]
#[command(about = "YC directory harvester: discover company URLs, extract company and founder records")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct DatasetArgs {
    /// Dataset directory name under the data dir (defaults to today's date).
    #[arg(long)]
    date: Option<String>,
    /// Read and write the dataset files directly in the data dir.
    #[arg(long, conflicts_with = "date")]
    flat: bool,
}

impl DatasetArgs {
    fn resolve(&self) -> Option<String> {
        if self.flat {
            None
        } else {
            Some(self.date.clone().unwrap_or_else(today))
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect detail URLs for every batch and merge them into the URL ledger.
    Discover {
        #[command(flatten)]
        dataset: DatasetArgs,
        /// Skip batches that already have rows in the URL ledger.
        #[arg(long)]
        skip_discovered: bool,
        /// Only collect these batch codes (repeatable).
        #[arg(long = "batch")]
        batches: Vec<String>,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        max_retries: Option<usize>,
        #[arg(long)]
        tolerance: Option<u64>,
    },
    /// Extract companies and founders for every ledger row not yet completed.
    Extract {
        #[command(flatten)]
        dataset: DatasetArgs,
        /// Process rows previously rejected by validation again.
        #[arg(long)]
        retry_rejected: bool,
        /// Stop after this many rows.
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Discover, then extract.
    Run {
        #[command(flatten)]
        dataset: DatasetArgs,
    },
    /// Serve the read-only dataset API.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run harvests on the configured cron schedule until interrupted.
    Schedule,
}

fn print_discovery(summary: &DiscoverySummary) {
    println!(
        "discovery complete: run_id={} batches={} skipped={} retries={} mismatches={} empty={} new_urls={} ledger_rows={}",
        summary.run_id,
        summary.batches_collected,
        summary.batches_skipped,
        summary.retries,
        summary.mismatches,
        summary.empty_batches,
        summary.urls_added,
        summary.ledger_rows
    );
}

fn print_extraction(summary: &ExtractionSummary) {
    println!(
        "extraction complete: run_id={} mode={:?} skipped={} extracted={} rejected={} unavailable={} companies={} founders={}",
        summary.run_id,
        summary.resume_mode,
        summary.skipped,
        summary.extracted,
        summary.rejected,
        summary.unavailable,
        summary.companies_written,
        summary.founders_written
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = HarvestConfig::from_env();

    match cli.command {
        Commands::Discover {
            dataset,
            skip_discovered,
            batches,
            workers,
            max_retries,
            tolerance,
        } => {
            let mut policy = HarvestPolicy::load(config.policy_path())?;
            if let Some(workers) = workers {
                policy.discovery_workers = workers;
            }
            if let Some(max_retries) = max_retries {
                policy.max_retries = max_retries;
            }
            if let Some(tolerance) = tolerance {
                policy.count_tolerance = tolerance;
            }
            let pipeline = HarvestPipeline::with_policy(config, policy)?;
            let selection = DiscoverySelection {
                skip_discovered,
                batches,
            };
            let summary = pipeline
                .discover(dataset.resolve().as_deref(), selection)
                .await?;
            print_discovery(&summary);
        }
        Commands::Extract {
            dataset,
            retry_rejected,
            limit,
            workers,
        } => {
            let mut policy = HarvestPolicy::load(config.policy_path())?;
            if let Some(workers) = workers {
                policy.extraction_workers = workers;
            }
            let pipeline = HarvestPipeline::with_policy(config, policy)?;
            let summary = pipeline
                .extract(dataset.resolve().as_deref(), retry_rejected, limit)
                .await?;
            print_extraction(&summary);
        }
        Commands::Run { dataset } => {
            let pipeline = HarvestPipeline::new(config)?;
            let summary = pipeline.run_once(dataset.resolve().as_deref()).await?;
            print_discovery(&summary.discovery);
            print_extraction(&summary.extraction);
        }
        Commands::Serve { port } => {
            let port = port.unwrap_or(config.web_port);
            ycv_web::serve(AppState::new(config.data_dir.clone()), port).await?;
        }
        Commands::Schedule => {
            let cron = config.harvest_cron.clone();
            let pipeline = Arc::new(HarvestPipeline::new(config)?);
            let Some(scheduler) = pipeline.maybe_build_scheduler().await? else {
                anyhow::bail!("scheduler disabled; set YCV_SCHEDULER_ENABLED=true");
            };
            scheduler.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
    }

    Ok(())
}
