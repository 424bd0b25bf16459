use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use repwatch_storage::{MemoryStore, PgStore, PlanStore};
use repwatch_sync::{Pipeline, PipelineScheduler, SyncConfig};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "repwatch")]
#[command(about = "Texas retail electricity plan watcher")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scrape-and-reconcile pass and exit.
    Sync,
    /// Serve the JSON API, with the daily scheduler when enabled.
    Serve,
    /// Run only the scheduler until interrupted.
    Schedule,
}

async fn build_store(config: &SyncConfig) -> Result<Arc<dyn PlanStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url).await?;
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; plans will only live in memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let store = build_store(&config).await?;
    let pipeline = Arc::new(Pipeline::new(store.clone(), &config)?);

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = pipeline.run().await;
            println!(
                "sync complete: run_id={} scraped={} added={} updated={} skipped={}",
                summary.run_id, summary.scraped, summary.added, summary.updated, summary.skipped
            );
        }
        Commands::Serve => {
            let mut scheduler = if config.scheduler_enabled {
                let mut scheduler =
                    PipelineScheduler::new(pipeline.clone(), config.scrape_cron.clone());
                scheduler.start().await?;
                Some(scheduler)
            } else {
                None
            };

            let state = repwatch_web::AppState::new(store, pipeline);
            repwatch_web::serve(state, &config.bind_addr).await?;

            if let Some(scheduler) = scheduler.as_mut() {
                scheduler.shutdown().await?;
            }
        }
        Commands::Schedule => {
            let mut scheduler = PipelineScheduler::new(pipeline, config.scrape_cron.clone());
            scheduler.start().await?;
            tokio::signal::ctrl_c().await?;
            scheduler.shutdown().await?;
        }
    }

    Ok(())
}
