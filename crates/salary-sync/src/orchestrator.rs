use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use salary_client::{CategoryParams, FetchOutcome, SalaryFetcher, TransientFetchError};
use salary_core::{
    Category, Combination, CoreError, FetchedDocument, JobToken, ReferenceEntity, ScrapeRequest,
    DEFAULT_REFERENCE_LIMIT,
};
use salary_storage::{BatchStats, CatalogError, PromotionEngine, ReferenceCatalog, StagingError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

pub const DEFAULT_CONCURRENCY: usize = 10;
pub const DEFAULT_COMMIT_THRESHOLD: f64 = 0.6;

/// Sweep progress is logged every this many finished tasks.
const PROGRESS_EVERY: usize = 10;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid scrape request: {0}")]
    InvalidRequest(#[from] CoreError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("staging write failed: {0}")]
    Staging(#[from] StagingError),
    #[error("concurrency gate closed")]
    GateClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Sequential,
    Concurrent { limit: usize },
}

impl ExecutionMode {
    /// `1` (or `0`) means sequential; anything larger is a concurrency limit.
    pub fn from_concurrency(limit: usize) -> Self {
        if limit <= 1 {
            Self::Sequential
        } else {
            Self::Concurrent { limit }
        }
    }
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Sequential
    }
}

/// Promote-vs-discard gate on the share of attempts that produced data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommitPolicy {
    pub threshold: f64,
}

impl Default for CommitPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_COMMIT_THRESHOLD,
        }
    }
}

impl CommitPolicy {
    /// Nothing attempted counts as success; otherwise the ratio must reach
    /// the threshold (inclusive).
    pub fn should_commit(&self, attempted: usize, succeeded: usize) -> bool {
        if attempted == 0 {
            return true;
        }
        succeeded as f64 / attempted as f64 >= self.threshold
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub mode: ExecutionMode,
    pub policy: CommitPolicy,
    pub reference_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Sequential,
            policy: CommitPolicy::default(),
            reference_limit: DEFAULT_REFERENCE_LIMIT,
        }
    }
}

/// One upstream call to make.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchTask {
    Entity {
        category: Category,
        entity: ReferenceEntity,
    },
    Combination {
        members: Vec<(Category, ReferenceEntity)>,
    },
    /// A combination member that matched nothing in the catalog. Counted as
    /// a failed attempt without calling upstream.
    Unresolved {
        combination: Combination,
        category: Category,
        value: String,
    },
}

impl FetchTask {
    fn params(&self) -> CategoryParams {
        match self {
            FetchTask::Entity { category, entity } => CategoryParams::for_entity(*category, entity),
            FetchTask::Combination { members } => {
                let mut params = CategoryParams::default();
                for (category, entity) in members {
                    params.merge(CategoryParams::for_entity(*category, entity));
                }
                params
            }
            FetchTask::Unresolved { .. } => CategoryParams::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Stored { documents: usize },
    Empty,
    Failed(TransientFetchError),
    Unresolved { category: Category, value: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub attempted: usize,
    pub succeeded: usize,
    pub empty: usize,
    pub failed: usize,
    pub unresolved: usize,
}

impl Tally {
    pub fn record(&mut self, outcome: &TaskOutcome) {
        self.attempted += 1;
        match outcome {
            TaskOutcome::Stored { .. } => self.succeeded += 1,
            TaskOutcome::Empty => self.empty += 1,
            TaskOutcome::Failed(_) => self.failed += 1,
            TaskOutcome::Unresolved { .. } => self.unresolved += 1,
        }
    }

    pub fn success_ratio(&self) -> Option<f64> {
        (self.attempted > 0).then(|| self.succeeded as f64 / self.attempted as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Idle,
    Running,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Committed { rows: usize },
    /// Success ratio fell below the commit threshold.
    RolledBack { success_ratio: f64 },
    /// A structural error aborted the job.
    Failed { message: String },
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub token: JobToken,
    pub tally: Tally,
    pub outcome: JobOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobReport {
    pub fn success(&self) -> bool {
        matches!(self.outcome, JobOutcome::Committed { .. })
    }

    pub fn phase(&self) -> JobPhase {
        if self.success() {
            JobPhase::Committed
        } else {
            JobPhase::RolledBack
        }
    }

    /// Short human-readable status line.
    pub fn message(&self) -> String {
        match &self.outcome {
            JobOutcome::Committed { rows } => format!(
                "job {} committed {rows} reports ({}/{} successful)",
                self.token, self.tally.succeeded, self.tally.attempted
            ),
            JobOutcome::RolledBack { success_ratio } => format!(
                "job {} rolled back: success ratio {:.2} ({}/{})",
                self.token, success_ratio, self.tally.succeeded, self.tally.attempted
            ),
            JobOutcome::Failed { message } => format!("job {} failed: {message}", self.token),
            JobOutcome::Cancelled => format!("job {} cancelled", self.token),
        }
    }
}

enum Abort {
    Cancelled,
    Error(SyncError),
}

/// Drives one scraping job from request to commit or rollback. Holds no
/// per-job state between invocations.
pub struct ScrapeOrchestrator {
    catalog: Arc<dyn ReferenceCatalog>,
    fetcher: Arc<dyn SalaryFetcher>,
    promotion: PromotionEngine,
    config: OrchestratorConfig,
}

impl ScrapeOrchestrator {
    pub fn new(
        catalog: Arc<dyn ReferenceCatalog>,
        fetcher: Arc<dyn SalaryFetcher>,
        promotion: PromotionEngine,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            catalog,
            fetcher,
            promotion,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub async fn run_job(&self, request: &ScrapeRequest) -> JobReport {
        self.run_job_with(JobToken::generate(), request, CancellationToken::new())
            .await
    }

    /// Runs a job under a caller-chosen token. Cancelling `cancel` stops the
    /// fetch loop and rolls the staged batch back.
    pub async fn run_job_with(
        &self,
        token: JobToken,
        request: &ScrapeRequest,
        cancel: CancellationToken,
    ) -> JobReport {
        let span = info_span!("scrape_job", %token);
        self.run_job_inner(token, request, cancel)
            .instrument(span)
            .await
    }

    async fn run_job_inner(
        &self,
        token: JobToken,
        request: &ScrapeRequest,
        cancel: CancellationToken,
    ) -> JobReport {
        let started_at = Utc::now();
        info!(phase = ?JobPhase::Running, "scrape job started");

        let mut tally = Tally::default();
        let collected = match request.validate() {
            Ok(()) => self.collect(&token, request, &cancel, &mut tally).await,
            Err(err) => Err(Abort::Error(err.into())),
        };

        let outcome = match collected {
            Err(Abort::Cancelled) => {
                warn!("scrape job cancelled; rolling back");
                self.rollback(&token).await;
                JobOutcome::Cancelled
            }
            Err(Abort::Error(err)) => {
                error!(error = %err, "scrape job aborted; rolling back");
                self.rollback(&token).await;
                JobOutcome::Failed {
                    message: err.to_string(),
                }
            }
            Ok(()) => self.finalize(&token, &tally, started_at).await,
        };

        let report = JobReport {
            token,
            tally,
            outcome,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            phase = ?report.phase(),
            attempted = tally.attempted,
            succeeded = tally.succeeded,
            empty = tally.empty,
            failed = tally.failed,
            unresolved = tally.unresolved,
            "{}",
            report.message()
        );
        report
    }

    async fn finalize(&self, token: &JobToken, tally: &Tally, started_at: DateTime<Utc>) -> JobOutcome {
        if !self
            .config
            .policy
            .should_commit(tally.attempted, tally.succeeded)
        {
            self.rollback(token).await;
            return JobOutcome::RolledBack {
                success_ratio: tally.success_ratio().unwrap_or(0.0),
            };
        }

        let stats = BatchStats {
            total_attempted: tally.attempted,
            total_succeeded: tally.succeeded,
            started_at,
        };
        match self.promotion.promote(token, Some(stats)).await {
            Ok(rows) => JobOutcome::Committed { rows },
            Err(err) => {
                error!(error = %err, "promotion failed; rolling back");
                self.rollback(token).await;
                JobOutcome::Failed {
                    message: err.to_string(),
                }
            }
        }
    }

    async fn rollback(&self, token: &JobToken) {
        if let Err(err) = self.promotion.rollback(token).await {
            error!(error = %err, "rollback could not release staging buffer");
        }
    }

    async fn collect(
        &self,
        token: &JobToken,
        request: &ScrapeRequest,
        cancel: &CancellationToken,
        tally: &mut Tally,
    ) -> Result<(), Abort> {
        let tasks = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Abort::Cancelled),
            tasks = self.expand(request) => tasks.map_err(Abort::Error)?,
        };
        let total = tasks.len();
        info!(tasks = total, mode = ?self.config.mode, "expanded scrape request");

        match self.config.mode {
            ExecutionMode::Sequential => {
                for task in tasks {
                    let outcome = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Abort::Cancelled),
                        outcome = self.run_task(token, task) => outcome.map_err(Abort::Error)?,
                    };
                    self.record(tally, &outcome, total);
                }
            }
            ExecutionMode::Concurrent { limit } => {
                let gate = Semaphore::new(limit.max(1));
                let gate = &gate;
                let mut pending = tasks
                    .into_iter()
                    .map(|task| async move {
                        let _permit = gate.acquire().await.map_err(|_| SyncError::GateClosed)?;
                        self.run_task(token, task).await
                    })
                    .collect::<FuturesUnordered<_>>();

                // Every task is drained here before the caller may promote.
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Abort::Cancelled),
                        next = pending.next() => next,
                    };
                    match next {
                        Some(Ok(outcome)) => self.record(tally, &outcome, total),
                        Some(Err(err)) => return Err(Abort::Error(err)),
                        None => break,
                    }
                }
            }
        }
        Ok(())
    }

    fn record(&self, tally: &mut Tally, outcome: &TaskOutcome, total: usize) {
        match outcome {
            TaskOutcome::Failed(err) => warn!(error = %err, "fetch failed after retries"),
            TaskOutcome::Unresolved { category, value } => {
                warn!(%category, value = %value, "combination member not found in catalog; skipping tuple")
            }
            TaskOutcome::Stored { .. } | TaskOutcome::Empty => {}
        }
        tally.record(outcome);
        if tally.attempted % PROGRESS_EVERY == 0 {
            info!(
                progress = tally.attempted,
                total,
                succeeded = tally.succeeded,
                "scrape progress"
            );
        }
    }

    /// Turns a request into the flat task list, resolving combinations
    /// against the catalog.
    pub async fn expand(&self, request: &ScrapeRequest) -> Result<Vec<FetchTask>, SyncError> {
        let limit = self.config.reference_limit;
        let mut tasks = Vec::new();

        if let Some(combinations) = &request.combinations {
            let mut listings: HashMap<Category, Vec<ReferenceEntity>> = HashMap::new();
            for combination in combinations {
                let mut members = Vec::with_capacity(combination.pairs().len());
                let mut missing = None;
                for (category, value) in combination.pairs() {
                    if !listings.contains_key(category) {
                        let listed = self.catalog.list(*category, limit).await?;
                        listings.insert(*category, listed);
                    }
                    let listed = listings.get(category).map(Vec::as_slice).unwrap_or_default();
                    match resolve_member(listed, value) {
                        Some(entity) => members.push((*category, entity.clone())),
                        None => {
                            missing = Some((*category, value.clone()));
                            break;
                        }
                    }
                }
                tasks.push(match missing {
                    Some((category, value)) => FetchTask::Unresolved {
                        combination: combination.clone(),
                        category,
                        value,
                    },
                    None => FetchTask::Combination { members },
                });
            }
        } else {
            for category in request.sweep_categories() {
                let entities = self.catalog.list(category, limit).await?;
                info!(%category, entities = entities.len(), "listing reference entities");
                tasks.extend(
                    entities
                        .into_iter()
                        .map(|entity| FetchTask::Entity { category, entity }),
                );
            }
        }
        Ok(tasks)
    }

    async fn run_task(&self, token: &JobToken, task: FetchTask) -> Result<TaskOutcome, SyncError> {
        if let FetchTask::Unresolved { category, value, .. } = task {
            return Ok(TaskOutcome::Unresolved { category, value });
        }

        let payload = match self.fetcher.fetch(&task.params()).await {
            FetchOutcome::Data(payload) => payload,
            FetchOutcome::Empty => return Ok(TaskOutcome::Empty),
            FetchOutcome::Failed(err) => return Ok(TaskOutcome::Failed(err)),
        };

        let subjects = match task {
            FetchTask::Entity { category, entity } => vec![(category, entity)],
            FetchTask::Combination { members } => members,
            FetchTask::Unresolved { .. } => Vec::new(),
        };
        let staging = self.promotion.staging();
        for (category, entity) in &subjects {
            staging
                .write(
                    token,
                    FetchedDocument {
                        payload: payload.clone(),
                        subject_id: entity.id,
                        subject_category: *category,
                    },
                )
                .await?;
        }
        Ok(TaskOutcome::Stored {
            documents: subjects.len(),
        })
    }
}

/// Case-insensitive lookup by alias, falling back to title.
pub fn resolve_member<'a>(listed: &'a [ReferenceEntity], value: &str) -> Option<&'a ReferenceEntity> {
    listed
        .iter()
        .find(|e| e.matches_alias(value))
        .or_else(|| listed.iter().find(|e| e.matches_title(value)))
}
