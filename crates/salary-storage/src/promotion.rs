use std::sync::Arc;

use chrono::{DateTime, Utc};
use salary_core::{JobLog, JobOutcomeKind, JobToken, PermanentReport};
use thiserror::Error;
use tracing::{info, warn};

use crate::staging::{StagingBuffer, StagingError};
use crate::store::{ReportStore, StoreError};

#[derive(Debug, Error)]
pub enum PromotionError {
    #[error("reading staged batch failed: {0}")]
    Staging(#[from] StagingError),
    #[error("promotion transaction failed: {0}")]
    Store(#[from] StoreError),
}

/// Job tallies recorded in the audit log alongside a promoted batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchStats {
    pub total_attempted: usize,
    pub total_succeeded: usize,
    pub started_at: DateTime<Utc>,
}

/// Moves a staged batch into permanent storage in one transaction, or drops it.
#[derive(Clone)]
pub struct PromotionEngine {
    staging: Arc<dyn StagingBuffer>,
    store: Arc<dyn ReportStore>,
}

impl PromotionEngine {
    pub fn new(staging: Arc<dyn StagingBuffer>, store: Arc<dyn ReportStore>) -> Self {
        Self { staging, store }
    }

    pub fn staging(&self) -> &Arc<dyn StagingBuffer> {
        &self.staging
    }

    /// Promotes everything staged under `token` and returns the number of
    /// report rows written.
    ///
    /// An empty buffer is released without touching the store or the audit
    /// log. When the store transaction fails the buffer is left in place; the
    /// caller decides whether to retry or `rollback`.
    pub async fn promote(
        &self,
        token: &JobToken,
        stats: Option<BatchStats>,
    ) -> Result<usize, PromotionError> {
        let staged = self.staging.read_all(token).await?;
        if staged.is_empty() {
            self.staging.discard(token).await?;
            info!(%token, "nothing staged; promotion skipped");
            return Ok(0);
        }

        let rows = staged
            .iter()
            .map(PermanentReport::from_staged)
            .collect::<Vec<_>>();

        let logged_at = Utc::now();
        let stats = stats.unwrap_or(BatchStats {
            total_attempted: staged.len(),
            total_succeeded: staged.len(),
            started_at: logged_at,
        });
        let duration_seconds =
            ((logged_at - stats.started_at).num_milliseconds().max(0) as f64) / 1000.0;
        let log = JobLog {
            logged_at,
            operation_kind: self.staging.kind().to_string(),
            total_attempted: stats.total_attempted as i64,
            total_succeeded: stats.total_succeeded as i64,
            duration_seconds,
            outcome: JobOutcomeKind::Success,
        };

        self.store.commit_batch(&rows, &log).await?;

        // The batch is committed; a leftover staging file is only a cleanup issue.
        if let Err(err) = self.staging.discard(token).await {
            warn!(%token, error = %err, "promoted batch but failed to release staging buffer");
        }

        info!(%token, rows = rows.len(), "promoted staged batch");
        Ok(rows.len())
    }

    /// Drops the staging buffer for `token`. Safe to call repeatedly and for
    /// tokens that never staged anything.
    pub async fn rollback(&self, token: &JobToken) -> Result<(), StagingError> {
        if self.staging.discard(token).await? {
            info!(%token, "rolled back staged batch");
        }
        Ok(())
    }
}
