use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use salary_core::ScrapeRequest;
use salary_sync::{load_request, maybe_build_scheduler, JobRegistry, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "salary-cli")]
#[command(about = "Salary scraper command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scraping job and commit or discard its batch.
    Run {
        /// YAML job file; defaults to sweeping every category.
        #[arg(long)]
        job: Option<PathBuf>,
        /// Print the job report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Run jobs on the configured cron until interrupted.
    Schedule {
        #[arg(long)]
        job: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    let json = std::env::var("SALARY_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn request_from(job: Option<PathBuf>) -> Result<ScrapeRequest> {
    match job {
        Some(path) => load_request(&path).await,
        None => Ok(ScrapeRequest::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run { job: None, json: false }) {
        Commands::Run { job, json } => {
            let report = salary_sync::run_once_from_env(job.as_deref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.message());
            }
            if !report.success() {
                std::process::exit(1);
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let pool =
                salary_storage::connect_pg_pool(&config.database_url, config.db_max_connections).await?;
            salary_storage::migrate(&pool).await?;
            println!("migrations applied");
        }
        Commands::Schedule { job } => {
            let config = SyncConfig::from_env();
            let request = request_from(job).await?;
            let orchestrator = Arc::new(salary_sync::build_orchestrator(&config).await?);
            let Some(mut sched) =
                maybe_build_scheduler(&config, orchestrator, JobRegistry::new(), request).await?
            else {
                bail!("scheduler disabled; set SALARY_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            tracing::info!(cron = %config.sync_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
