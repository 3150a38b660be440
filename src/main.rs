//! Service entrypoint: a cron-invoked `run` command plus the §4.8 admin
//! surface (`repair watermark` / `repair backfill-creators`), both
//! dry-run-capable. Per spec §6 ("Cron surface: a single scheduled handler
//! invokes pollCycle") cadence is external — this binary does one pass per
//! invocation and exits, the way a process run from crontab or a k8s
//! CronJob is expected to behave, rather than looping internally.

use std::sync::Arc;

use clap::{Parser, Subcommand};

use ingestor_core::config::Config;
use ingestor_core::crypto::TokenVault;
use ingestor_core::db;
use ingestor_core::error::IngestError;
use ingestor_core::scheduler::Scheduler;
use ingestor_core::{admin, logging};

#[derive(Parser)]
#[command(name = "ingestor", version, about = "Multi-tenant content ingestion core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one poll cycle: select due subscriptions, fetch, ingest, advance watermarks.
    Run,
    /// Admin / repair operations (§4.8).
    Repair {
        #[command(subcommand)]
        op: RepairOp,
    },
}

#[derive(Subcommand)]
enum RepairOp {
    /// Find subscriptions whose watermark has drifted from reality and reset it.
    Watermark {
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Find items missing a creator and resolve/synthesize one.
    BackfillCreators {
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), IngestError> {
    logging::init();

    let config = Config::from_env()?;
    let pool = db::init_db(&config.database_path)?;

    match Cli::parse().command {
        Command::Run => {
            let vault = Arc::new(TokenVault::new(&config.encryption_key));
            let scheduler = Scheduler::with_defaults(pool, config, vault);
            let outcome = scheduler.poll_cycle(chrono::Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Repair { op } => match op {
            RepairOp::Watermark { dry_run } => {
                let report = admin::repair_watermarks(&pool, dry_run)?;
                tracing::info!(count = report.len(), dry_run, "watermark repair scan complete");
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            RepairOp::BackfillCreators { dry_run } => {
                let report = admin::backfill_creators(&pool, dry_run)?;
                tracing::info!(count = report.len(), dry_run, "creator backfill scan complete");
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        },
    }

    Ok(())
}
