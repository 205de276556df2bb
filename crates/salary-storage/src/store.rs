use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use salary_core::{JobLog, PermanentReport};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use tracing::info;

/// Rows per multi-row INSERT.
const INSERT_CHUNK: usize = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store rejected batch: {0}")]
    Rejected(String),
}

/// Permanent destination for promoted batches.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Inserts every row plus the audit entry in one transaction. Either all
    /// of it becomes visible or none of it does.
    async fn commit_batch(&self, rows: &[PermanentReport], log: &JobLog) -> Result<u64, StoreError>;
}

pub async fn connect_pg_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await
        .context("connecting to postgres")
}

/// Applies the bundled schema migrations.
pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("running salary schema migrations")
}

#[derive(Debug, Clone)]
pub struct PgReportStore {
    pool: PgPool,
}

impl PgReportStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ReportStore for PgReportStore {
    async fn commit_batch(&self, rows: &[PermanentReport], log: &JobLog) -> Result<u64, StoreError> {
        // Dropping `tx` on any early return rolls the transaction back.
        let mut tx = self.pool.begin().await?;

        let mut inserted = 0u64;
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO reports (specialization_id, skill_id, region_id, company_id, data, fetched_at) ",
            );
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.specialization_id)
                    .push_bind(row.skill_id)
                    .push_bind(row.region_id)
                    .push_bind(row.company_id)
                    .push_bind(row.payload.clone())
                    .push_bind(row.fetched_at);
            });
            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        sqlx::query(
            r#"
            INSERT INTO report_log
                (logged_at, operation_kind, total_attempted, total_succeeded, duration_seconds, outcome)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(log.logged_at)
        .bind(&log.operation_kind)
        .bind(log.total_attempted)
        .bind(log.total_succeeded)
        .bind(log.duration_seconds)
        .bind(log.outcome.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(rows = inserted, operation_kind = %log.operation_kind, "committed report batch");
        Ok(inserted)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    reports: Vec<PermanentReport>,
    logs: Vec<JobLog>,
    fail_next: Option<String>,
}

/// Process-local store with all-or-nothing commits. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryReportStore {
    state: Mutex<MemoryState>,
}

impl InMemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `commit_batch` fails with `reason` and leaves the store untouched.
    pub fn fail_next_commit(&self, reason: impl Into<String>) {
        self.lock().fail_next = Some(reason.into());
    }

    pub fn reports(&self) -> Vec<PermanentReport> {
        self.lock().reports.clone()
    }

    pub fn logs(&self) -> Vec<JobLog> {
        self.lock().logs.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ReportStore for InMemoryReportStore {
    async fn commit_batch(&self, rows: &[PermanentReport], log: &JobLog) -> Result<u64, StoreError> {
        let mut state = self.lock();
        if let Some(reason) = state.fail_next.take() {
            return Err(StoreError::Rejected(reason));
        }
        state.reports.extend_from_slice(rows);
        state.logs.push(log.clone());
        Ok(rows.len() as u64)
    }
}
