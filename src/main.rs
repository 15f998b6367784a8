//! # Marketplace Sync Entry Point
//!
//! `serve` runs the HTTP control surface; the other subcommands drive the engine
//! directly, which is how cron-style short-lived invocations run a batch.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use marketplace_sync::{
    config::ConfigLoader,
    db,
    migration::{Migrator, MigratorTrait},
    models::execution_log::TriggerType,
    server::run_server,
    sync::{ExecuteParams, InitializeParams, SyncController},
    telemetry,
};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "marketplace-sync", version, about = "Paginated marketplace sync engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API (default)
    Serve,
    /// Apply pending database migrations
    Migrate,
    /// Probe the marketplace and create a sync job
    Initialize {
        #[arg(long)]
        page_size: Option<u32>,
        #[arg(long)]
        batch_size: Option<u32>,
        #[arg(long)]
        account_id: Option<String>,
        #[arg(long)]
        job_type: Option<String>,
    },
    /// Process one batch of pages for a job
    Execute {
        job_id: Uuid,
        #[arg(long)]
        batch_size: Option<u32>,
        #[arg(long)]
        page_start: Option<u32>,
        #[arg(long, value_enum, default_value_t = Trigger::Manual)]
        trigger: Trigger,
    },
    /// Print job progress
    Status { job_id: Uuid },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Trigger {
    Manual,
    Scheduled,
}

impl From<Trigger> for TriggerType {
    fn from(trigger: Trigger) -> Self {
        match trigger {
            Trigger::Manual => TriggerType::Manual,
            Trigger::Scheduled => TriggerType::Scheduled,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration from layered env files and variables
    let config = ConfigLoader::new().load().context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing telemetry")?;

    if let Ok(redacted_json) = config.redacted_json() {
        tracing::debug!(config = %redacted_json, profile = %config.profile, "configuration loaded");
    }

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(config, db).await,
        Command::Migrate => {
            Migrator::up(&db, None).await.context("running migrations")?;
            tracing::info!("migrations applied");
            Ok(())
        }
        Command::Initialize {
            page_size,
            batch_size,
            account_id,
            job_type,
        } => {
            let controller = SyncController::from_config(db, &config)?;
            let result = controller
                .initialize(InitializeParams {
                    job_type,
                    account_id,
                    page_size,
                    batch_size,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Command::Execute {
            job_id,
            batch_size,
            page_start,
            trigger,
        } => {
            let controller = SyncController::from_config(db, &config)?;
            let result = controller
                .execute(ExecuteParams {
                    job_id,
                    batch_size,
                    page_start,
                    trigger: trigger.into(),
                    trigger_source: "cli".to_string(),
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Command::Status { job_id } => {
            let controller = SyncController::from_config(db, &config)?;
            let progress = controller.status(job_id).await?;
            println!("{}", serde_json::to_string_pretty(&progress)?);
            Ok(())
        }
    }
}
