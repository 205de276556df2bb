use std::sync::Arc;

use anyhow::{Context, Result};
use salary_core::{JobToken, ScrapeRequest};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::orchestrator::{JobReport, ScrapeOrchestrator};
use crate::registry::JobRegistry;

/// Runs `request` under the registry slot. Returns `None` when another job
/// already holds it.
pub async fn run_guarded(
    orchestrator: &ScrapeOrchestrator,
    registry: &JobRegistry,
    request: &ScrapeRequest,
) -> Option<JobReport> {
    let token = JobToken::generate();
    let guard = match registry.try_start(token.clone()) {
        Ok(guard) => guard,
        Err(busy) => {
            warn!(running = %busy.running, "scrape job skipped; another job is running");
            return None;
        }
    };
    let report = orchestrator
        .run_job_with(token, request, CancellationToken::new())
        .await;
    drop(guard);
    Some(report)
}

/// Cron scheduler that runs `request` on every tick of `cron` (six-field
/// syntax, seconds first).
pub async fn build_scheduler(
    orchestrator: Arc<ScrapeOrchestrator>,
    registry: JobRegistry,
    cron: &str,
    request: ScrapeRequest,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let request = Arc::new(request);
    let job = Job::new_async(cron, move |_uuid, _l| {
        let orchestrator = Arc::clone(&orchestrator);
        let registry = registry.clone();
        let request = Arc::clone(&request);
        Box::pin(async move {
            info!("scheduled scrape tick");
            if let Some(report) = run_guarded(&orchestrator, &registry, &request).await {
                if !report.success() {
                    warn!(token = %report.token, "scheduled scrape did not commit");
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    orchestrator: Arc<ScrapeOrchestrator>,
    registry: JobRegistry,
    request: ScrapeRequest,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(orchestrator, registry, &config.sync_cron, request)
        .await
        .map(Some)
}
