//! Job orchestration: expand a scrape request, fetch, stage, then promote or
//! roll back on the success ratio.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use salary_client::SalaryApiClient;
use salary_core::ScrapeRequest;
use salary_storage::{
    connect_pg_pool, InProcessStaging, PgReferenceCatalog, PgReportStore, PromotionEngine,
    SqliteStaging, StagingBuffer,
};
use tracing::info;

pub mod config;
pub mod orchestrator;
pub mod registry;
pub mod scheduler;

pub use config::{load_request, StagingStrategy, SyncConfig, DEFAULT_API_URL};
pub use orchestrator::{
    resolve_member, CommitPolicy, ExecutionMode, FetchTask, JobOutcome, JobPhase, JobReport,
    OrchestratorConfig, ScrapeOrchestrator, SyncError, Tally, TaskOutcome, DEFAULT_COMMIT_THRESHOLD,
    DEFAULT_CONCURRENCY,
};
pub use registry::{JobAlreadyRunning, JobGuard, JobRegistry, JobStatus};
pub use scheduler::{build_scheduler, maybe_build_scheduler, run_guarded};

pub const CRATE_NAME: &str = "salary-sync";

pub fn staging_for(config: &SyncConfig) -> Arc<dyn StagingBuffer> {
    match config.staging {
        StagingStrategy::InProcess => Arc::new(InProcessStaging::new()),
        StagingStrategy::Sqlite => Arc::new(SqliteStaging::new(config.staging_dir.clone())),
    }
}

/// Wires the Postgres catalog and store, the HTTP client and the configured
/// staging strategy into one orchestrator.
pub async fn build_orchestrator(config: &SyncConfig) -> Result<ScrapeOrchestrator> {
    let pool = connect_pg_pool(&config.database_url, config.db_max_connections).await?;
    let fetcher = SalaryApiClient::over_http(config.http_config(), config.client_config())?;
    let staging = staging_for(config);
    info!(
        staging = staging.kind(),
        concurrency = config.concurrency,
        api_url = %config.api_url,
        "salary orchestrator configured"
    );

    Ok(ScrapeOrchestrator::new(
        Arc::new(PgReferenceCatalog::new(pool.clone())),
        Arc::new(fetcher),
        PromotionEngine::new(staging, Arc::new(PgReportStore::new(pool))),
        config.orchestrator_config(),
    ))
}

/// One job from environment configuration; `job_file` overrides the default
/// all-category sweep.
pub async fn run_once_from_env(job_file: Option<&Path>) -> Result<JobReport> {
    let config = SyncConfig::from_env();
    let request = match job_file {
        Some(path) => load_request(path).await?,
        None => ScrapeRequest::default(),
    };
    let orchestrator = build_orchestrator(&config).await?;
    Ok(orchestrator.run_job(&request).await)
}
