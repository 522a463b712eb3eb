//! Out-of-band maintenance for the job table.
//!
//! ```text
//! steward-tool --config steward.json migrate
//! steward-tool --config steward.json reactivate --job-type ethTxPull --first-start-delay-ms 5000
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;

use steward_infra::config::{self, StewardConfig};
use steward_infra::jobs::{JobStore, PostgresJobStore};
use steward_observability::LogFormat;

#[derive(Parser, Debug)]
#[command(name = "steward-tool")]
#[command(version)]
#[command(about = "Maintenance commands for the steward job queue")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, short = 'c', default_value = "steward.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Create the job and channel tables if missing
    Migrate,

    /// Put failed jobs of a type back in the queue with a fresh try budget
    Reactivate {
        /// Job type to reactivate
        #[arg(long)]
        job_type: String,

        /// Also store this first-start delay for the type in the config file
        #[arg(long)]
        first_start_delay_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = StewardConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    steward_observability::init_with(LogFormat::from_json_flag(config.log.json));

    let pool = config.db.connect().await.context("connecting to database")?;
    let store = PostgresJobStore::new(pool);

    match args.command {
        Command::Migrate => {
            store.migrate().await.context("creating schema")?;
            tracing::info!("schema is up to date");
        }
        Command::Reactivate {
            job_type,
            first_start_delay_ms,
        } => {
            reactivate(&store, &args.config, &job_type, first_start_delay_ms).await?;
        }
    }

    Ok(())
}

/// Reset failed jobs of `job_type` and optionally persist a new first-start
/// delay for the type.
async fn reactivate<S: JobStore>(
    store: &S,
    config_path: &Path,
    job_type: &str,
    first_start_delay_ms: Option<u64>,
) -> anyhow::Result<u64> {
    let count = store
        .reactivate_failed(job_type)
        .await
        .with_context(|| format!("reactivating {job_type} jobs"))?;
    tracing::info!(job_type, count, "failed jobs reactivated");

    if let Some(delay_ms) = first_start_delay_ms {
        config::set_first_start_delay(config_path, job_type, delay_ms)
            .with_context(|| format!("updating {}", config_path.display()))?;
        tracing::info!(job_type, delay_ms, "first start delay updated");
    }

    Ok(count)
}
