use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tiersync_storage::{HierarchyStore, MemoryStore, PgStore};
use tiersync_sync::{CycleSummary, SyncConfig, SyncScheduler, UpsertEngine};
use tiersync_web::WebConfig;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "tiersync")]
#[command(about = "Sync a three-level hierarchy into Postgres and serve it read-only")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a single sync cycle and print its summary.
    Sync {
        /// Read parents/children/grandchildren JSON from this directory instead of HTTP.
        #[arg(long)]
        fixtures: Option<PathBuf>,
        /// Sync into a throwaway in-memory store.
        #[arg(long)]
        in_memory: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the read API with the hourly scheduler attached.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        fixtures: None,
        in_memory: false,
    }) {
        Commands::Sync {
            fixtures,
            in_memory,
        } => {
            if fixtures.is_some() {
                config.fixtures_dir = fixtures;
            }
            let store: Arc<dyn HierarchyStore> = if in_memory {
                Arc::new(MemoryStore::new())
            } else {
                Arc::new(connect(&config).await?)
            };
            let engine = UpsertEngine::from_config(&config, store)?;

            let cancel = CancellationToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        cancel.cancel();
                    }
                }
            });

            let summary = engine.run_cycle(&cancel).await?;
            print_summary(&summary);
        }
        Commands::Migrate => {
            connect(&config).await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let store: Arc<dyn HierarchyStore> = Arc::new(connect(&config).await?);

            let scheduler = if config.scheduler_enabled {
                let engine = Arc::new(UpsertEngine::from_config(&config, Arc::clone(&store))?);
                let scheduler = SyncScheduler::new(engine, config.sync_cron.clone());
                let handle = scheduler.start().await?;
                Some((scheduler, handle))
            } else {
                info!("sync scheduler disabled");
                None
            };

            tiersync_web::serve(WebConfig::from_env(), store, async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(error = %err, "failed to listen for ctrl-c");
                }
                info!("shutdown requested");
            })
            .await?;

            if let Some((scheduler, handle)) = scheduler {
                scheduler.shutdown(handle, SHUTDOWN_GRACE).await?;
            }
        }
    }

    Ok(())
}

/// Connect to Postgres and bring the schema up to date.
async fn connect(config: &SyncConfig) -> Result<PgStore> {
    let store = PgStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("failed to connect to postgres")?;
    store.migrate().await.context("failed to run migrations")?;
    Ok(store)
}

fn print_summary(summary: &CycleSummary) {
    println!(
        "sync complete: run_id={} source={} units={} parents={}/{} children={}/{} grandchildren={}/{} failures={}{}",
        summary.run_id,
        summary.source,
        summary.units_attempted,
        summary.parents.inserted,
        summary.parents.existing,
        summary.children.inserted,
        summary.children.existing,
        summary.grandchildren.inserted,
        summary.grandchildren.existing,
        summary.failures.len(),
        if summary.cancelled { " (cancelled)" } else { "" },
    );
}
