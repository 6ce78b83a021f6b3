use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lottospot_store::{DocumentStore, PgStore};
use lottospot_sync::{build_scheduler, IngestConfig, IngestPipeline, RunOutcome};
use lottospot_web::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "lottospot")]
#[command(about = "Lottery winning-store ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest the next unseen draw.
    Sync,
    /// Ingest an explicit draw range, best-effort per draw.
    Backfill {
        #[arg(long)]
        start: u32,
        #[arg(long)]
        end: u32,
    },
    /// Recompute store aggregates from persisted winner records.
    Refine {
        #[arg(long)]
        start: u32,
        #[arg(long)]
        end: u32,
    },
    /// Run database migrations.
    Migrate,
    /// Serve the ingestion trigger endpoint (plus the scheduler when
    /// enabled).
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = IngestConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = build_pipeline(&config).await?;
            match pipeline.run_incremental().await? {
                RunOutcome::Completed {
                    draw_no,
                    winner_count,
                } => println!("ingested draw {draw_no}: {winner_count} winners"),
                RunOutcome::NoDataYet { draw_no } => {
                    println!("draw {draw_no} not published yet")
                }
            }
        }
        Commands::Backfill { start, end } => {
            let pipeline = build_pipeline(&config).await?;
            let summary = pipeline.run_backfill(start, end).await?;
            println!(
                "backfill {start}..={end}: {} draws processed, {} skipped, {} winners",
                summary.processed.len(),
                summary.skipped.len(),
                summary.winner_count
            );
            for skipped in &summary.skipped {
                println!("  skipped draw {}: {}", skipped.draw_no, skipped.reason);
            }
        }
        Commands::Refine { start, end } => {
            let pipeline = build_pipeline(&config).await?;
            let summary = pipeline.run_refine(start, end).await?;
            println!(
                "refine {start}..={end}: {} winner records folded into {} stores",
                summary.winner_count, summary.store_count
            );
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let store = PgStore::connect(&config.database_url).await?;
            store.migrate().await?;
            let store: Arc<dyn DocumentStore> = Arc::new(store);
            let pipeline = Arc::new(IngestPipeline::from_config(&config, store)?);

            if config.scheduler_enabled {
                let sched = build_scheduler(pipeline.clone(), &config.sync_cron).await?;
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.sync_cron, "scheduler started");
            }

            let state = AppState::new(pipeline, config.admin_token.clone(), config.run_budget);
            lottospot_web::serve(state, config.web_port).await?;
        }
    }

    Ok(())
}

async fn build_pipeline(config: &IngestConfig) -> Result<IngestPipeline> {
    let store = PgStore::connect(&config.database_url).await?;
    let store: Arc<dyn DocumentStore> = Arc::new(store);
    Ok(IngestPipeline::from_config(config, store)?)
}
