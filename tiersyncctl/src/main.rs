//! `tiersyncctl`: run tiers, drain the queue and inspect sync state.

mod output;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use chrono::Utc;
use clap::{Args as ClapArgs, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tiersync_config::{ConfigLoad, ConfigLoader, ConfigLoaderOptions, EngineConfig};
use tiersync_core::{
    database::{RunHistoryQuery, infrastructure::postgres::run_migrations},
    http::{HttpDetailFetcher, HttpScanFetcher},
    sync::{
        DrainOptions, QueueReason, Scheduler, StopSignal, SyncStores, TierOrchestrator,
    },
    types::{Tier, WorkerId},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::output::Output;

#[derive(Parser, Debug)]
#[command(name = "tiersyncctl")]
#[command(about = "Run listing sync tiers and inspect the sync queue")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug, Clone)]
struct GlobalArgs {
    /// Load environment variables from this file instead of ./.env
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Engine configuration file (TOML or JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Postgres connection string (overrides DATABASE_URL and friends)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Print read commands as JSON
    #[arg(long, global = true, default_value_t = false)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show which tiers are due and what is running
    Status,
    /// Run one tier (1-4 or its name)
    RunTier {
        tier: Tier,
        /// Run even if another tier is recorded as running
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Run every tier that is due
    RunScheduled,
    /// Run due tiers in a loop until Ctrl-C
    Daemon {
        /// Seconds between scheduling passes
        #[arg(long, default_value_t = 300)]
        interval: u64,
        /// Stop after this many passes
        #[arg(long)]
        max_iterations: Option<u64>,
    },
    /// Drain the full-fetch queue outside a tier run
    ProcessQueue {
        #[arg(long, default_value_t = 50)]
        batch_size: usize,
        /// Stop after this many claimed items
        #[arg(long)]
        max_items: Option<usize>,
        /// Seconds to wait between detail fetches
        #[arg(long, default_value = "1.0", value_parser = parse_delay_secs)]
        rate_limit: Duration,
    },
    /// Queue counts by status, priority and reason
    QueueStats,
    /// Manifest counts and staleness
    ManifestStats,
    /// Live record quality report
    Quality,
    /// Recent sync runs
    History {
        #[arg(long)]
        tier: Option<Tier>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Per-tier totals over recent days
    Summary {
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Request cancellation of the running tier
    Cancel,
    /// Return stale claims to pending
    Reclaim,
    /// Delete completed and cancelled items older than the retention window
    Purge {
        /// Retention in days (defaults to queue.retention_days)
        #[arg(long)]
        days: Option<u32>,
    },
    /// Move failed items back to pending
    RetryFailed {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Cancel pending items, optionally only those with one reason
    CancelPending {
        #[arg(long)]
        reason: Option<QueueReason>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tiersync_core=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let session = Session::connect(&cli.global).await?;
    session.execute(cli.command).await
}

struct Session {
    engine: Arc<EngineConfig>,
    scheduler: Scheduler,
    out: Output,
}

impl Session {
    async fn connect(args: &GlobalArgs) -> anyhow::Result<Self> {
        let ConfigLoad {
            engine,
            source,
            database_url,
            env_file_loaded,
        } = ConfigLoader::with_options(ConfigLoaderOptions {
            config_path: args.config.clone(),
            env_file: args.env_file.clone(),
        })
        .load()
        .context("failed to load configuration")?;

        if env_file_loaded {
            info!("loaded .env file");
        }
        info!(source = %source, "engine configuration resolved");

        let database_url = args
            .database_url
            .clone()
            .or(database_url)
            .context("no database configured; set DATABASE_URL or pass --database-url")?;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&database_url)
            .await
            .context("failed to connect to PostgreSQL")?;
        run_migrations(&pool)
            .await
            .context("database migration failed")?;

        let engine = Arc::new(engine);
        let sync = Arc::new(engine.sync.clone());
        let stores = SyncStores::postgres(pool, &sync)
            .await
            .context("failed to initialize stores")?;
        let scanner = HttpScanFetcher::new(
            &engine.http,
            sync.sources.clone(),
            sync.id_prefix.clone(),
        )?;
        let detail = HttpDetailFetcher::new(&engine.http)?;
        let orchestrator = TierOrchestrator::new(
            stores,
            Arc::new(scanner),
            Arc::new(detail),
            sync,
        )
        .with_worker(WorkerId::for_process());

        Ok(Self {
            engine,
            scheduler: Scheduler::new(Arc::new(orchestrator)),
            out: Output::new(args.json),
        })
    }

    async fn execute(&self, command: Command) -> anyhow::Result<()> {
        let orchestrator = self.scheduler.orchestrator();
        let stores = orchestrator.stores();
        let now = Utc::now();

        match command {
            Command::Status => self.out.status(&self.scheduler.status(now).await?),
            Command::RunTier { tier, force } => {
                let run = self.scheduler.run_tier(tier, force).await?;
                self.out.runs(std::slice::from_ref(&run))
            }
            Command::RunScheduled => {
                let runs = self.scheduler.run_scheduled(now).await?;
                if runs.is_empty() && !self.out.is_json() {
                    println!("no tiers due");
                    return Ok(());
                }
                self.out.runs(&runs)
            }
            Command::Daemon {
                interval,
                max_iterations,
            } => {
                let shutdown = shutdown_on_ctrl_c();
                let passes = self
                    .scheduler
                    .run_continuous(
                        Duration::from_secs(interval),
                        max_iterations,
                        shutdown,
                    )
                    .await?;
                info!(passes, "daemon stopped");
                Ok(())
            }
            Command::ProcessQueue {
                batch_size,
                max_items,
                rate_limit,
            } => {
                let shutdown = shutdown_on_ctrl_c();
                let report = orchestrator
                    .drainer()
                    .drain(
                        &DrainOptions {
                            batch_size: batch_size.max(1),
                            max_items,
                            max_priority: None,
                            item_delay: rate_limit,
                            stale_claim_timeout: self
                                .engine
                                .sync
                                .queue
                                .stale_claim_timeout(),
                        },
                        StopSignal::Token(&shutdown),
                    )
                    .await?;
                self.out.drain(&report)
            }
            Command::QueueStats => self.out.queue_stats(&stores.queue.stats().await?),
            Command::ManifestStats => {
                self.out.manifest_stats(&stores.manifest.stats(now).await?)
            }
            Command::Quality => {
                self.out.quality(&orchestrator.quality_report(now).await?)
            }
            Command::History { tier, limit } => {
                let runs = self
                    .scheduler
                    .history(RunHistoryQuery {
                        tier,
                        since: None,
                        limit,
                    })
                    .await?;
                self.out.runs(&runs)
            }
            Command::Summary { days } => {
                self.out.summary(&self.scheduler.summary(days, now).await?)
            }
            Command::Cancel => {
                let cancelled = self.scheduler.cancel_current().await?;
                self.out.message(
                    "cancelled",
                    match cancelled {
                        Some(run_id) => format!("cancellation requested for run {run_id}"),
                        None => "no run is in progress".to_string(),
                    },
                )
            }
            Command::Reclaim => {
                let count = stores
                    .queue
                    .reclaim_stale(self.engine.sync.queue.stale_claim_timeout())
                    .await?;
                self.out.count("reclaimed", count)
            }
            Command::Purge { days } => {
                let retention = match days {
                    Some(days) => Duration::from_secs(u64::from(days) * 86_400),
                    None => self.engine.sync.queue.retention(),
                };
                let count = stores.queue.purge(retention).await?;
                self.out.count("purged", count)
            }
            Command::RetryFailed { limit } => {
                let count = stores.queue.retry_failed(limit).await?;
                self.out.count("requeued", count)
            }
            Command::CancelPending { reason } => {
                let count = stores.queue.cancel_pending(reason).await?;
                self.out.count("cancelled", count)
            }
        }
    }
}

fn parse_delay_secs(raw: &str) -> anyhow::Result<Duration> {
    let secs: f64 = raw
        .trim()
        .parse()
        .with_context(|| format!("invalid number of seconds: {raw}"))?;
    Duration::try_from_secs_f64(secs)
        .context("--rate-limit must be a finite, non-negative number of seconds")
}

/// Token that fires on the first Ctrl-C.
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received; shutting down");
                trigger.cancel();
            }
            Err(err) => warn!(error = %err, "failed to listen for Ctrl-C"),
        }
    });
    token
}
