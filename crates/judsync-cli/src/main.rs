use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use judsync_core::SyncStatus;
use judsync_storage::{JudgmentStore, MemoryStore, PgStore};
use judsync_sync::{BackfillOptions, CompanyBackfillOptions, RunOutcome, SyncConfig, SyncScheduler, SyncService};
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "judsync")]
#[command(about = "Judgment synchronization and risk classification")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run today's sync to completion.
    Sync {
        /// Ignore the registry service window.
        #[arg(long)]
        force: bool,
    },
    /// Historical ingestion in batches or scoped to one company.
    Backfill {
        #[command(subcommand)]
        mode: BackfillMode,
    },
    /// Control surface plus the cron scheduler when enabled.
    Serve,
    /// Apply database migrations.
    Migrate,
}

#[derive(Debug, Subcommand)]
enum BackfillMode {
    Batch {
        #[arg(long, default_value_t = 50)]
        batch_size: usize,
        #[arg(long, default_value_t = 10)]
        max_batches: u32,
        #[arg(long, default_value_t = 5000)]
        batch_delay_ms: u64,
        #[arg(long, env = "JUDSYNC_ITEM_DELAY_MS", default_value_t = 1000)]
        item_delay_ms: u64,
        #[arg(long)]
        force: bool,
        /// Re-fetch judgments that are already stored.
        #[arg(long)]
        refresh_existing: bool,
    },
    Company {
        #[arg(long)]
        name: String,
        #[arg(long, default_value_t = 100)]
        max_records: usize,
        #[arg(long, env = "JUDSYNC_ITEM_DELAY_MS", default_value_t = 1000)]
        item_delay_ms: u64,
        #[arg(long)]
        force: bool,
    },
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
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { force: false }) {
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL is not set");
            };
            let store = PgStore::connect(url).await.context("connecting to database")?;
            store.migrate().await.context("applying migrations")?;
            info!("migrations applied");
        }
        Commands::Sync { force } => {
            let service = build_service(config).await?;
            match service.run_now(force).await? {
                RunOutcome::Finished(run) => {
                    println!("{}", serde_json::to_string_pretty(&run)?);
                    if run.status == SyncStatus::Failed {
                        bail!(
                            "sync run failed: {}",
                            run.error_message.unwrap_or_else(|| "unknown error".to_string())
                        );
                    }
                }
                RunOutcome::AlreadyRunning => println!("sync not started: a run is already in progress"),
                RunOutcome::ServiceWindowClosed => {
                    println!("sync not started: registry service window is closed (use --force to override)")
                }
            }
        }
        Commands::Backfill { mode } => {
            let service = build_service(config).await?;
            match mode {
                BackfillMode::Batch {
                    batch_size,
                    max_batches,
                    batch_delay_ms,
                    item_delay_ms,
                    force,
                    refresh_existing,
                } => {
                    let report = service
                        .backfill_batches(&BackfillOptions {
                            batch_size,
                            max_batches,
                            batch_delay: Duration::from_millis(batch_delay_ms),
                            item_delay: Duration::from_millis(item_delay_ms),
                            force,
                            refresh_existing,
                        })
                        .await?;
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                BackfillMode::Company {
                    name,
                    max_records,
                    item_delay_ms,
                    force,
                } => {
                    let report = service
                        .backfill_company(&CompanyBackfillOptions {
                            company_name: name,
                            max_records,
                            item_delay: Duration::from_millis(item_delay_ms),
                            force,
                        })
                        .await?;
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
            }
        }
        Commands::Serve => {
            let port = config.web_port;
            let service = build_service(config).await?;
            let scheduler = SyncScheduler::maybe_start(Arc::clone(&service)).await?;
            judsync_web::serve(service, port, async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(error = %err, "could not listen for shutdown signal");
                }
            })
            .await?;
            if let Some(scheduler) = scheduler {
                scheduler.shutdown().await?;
            }
        }
    }

    Ok(())
}

async fn build_service(config: SyncConfig) -> Result<Arc<SyncService>> {
    let store: Arc<dyn JudgmentStore> = match config.database_url.as_deref() {
        Some(url) => {
            let store = PgStore::connect(url).await.context("connecting to database")?;
            store.migrate().await.context("applying migrations")?;
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set; judgments are kept in memory for this process only");
            Arc::new(MemoryStore::new())
        }
    };
    if !config.credentials().is_complete() {
        warn!("JUDICIAL_ACCOUNT / JUDICIAL_PASSWORD not set; registry calls will fail authentication");
    }
    let service = SyncService::from_config(config, store).context("building registry client")?;
    Ok(Arc::new(service))
}
