use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use salary_core::JobToken;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("scrape job {running} is already running")]
pub struct JobAlreadyRunning {
    pub running: JobToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Running {
        token: JobToken,
        started_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
struct ActiveJob {
    token: JobToken,
    started_at: DateTime<Utc>,
}

/// Single-slot guard allowing at most one scraping job per process.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    slot: Arc<Mutex<Option<ActiveJob>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the slot for `token`. The slot frees when the guard drops.
    pub fn try_start(&self, token: JobToken) -> Result<JobGuard, JobAlreadyRunning> {
        let mut slot = self.lock();
        if let Some(active) = slot.as_ref() {
            return Err(JobAlreadyRunning {
                running: active.token.clone(),
            });
        }
        *slot = Some(ActiveJob {
            token: token.clone(),
            started_at: Utc::now(),
        });
        Ok(JobGuard {
            slot: Arc::clone(&self.slot),
            token,
        })
    }

    pub fn status(&self) -> JobStatus {
        match self.lock().as_ref() {
            Some(active) => JobStatus::Running {
                token: active.token.clone(),
                started_at: active.started_at,
            },
            None => JobStatus::Idle,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveJob>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug)]
pub struct JobGuard {
    slot: Arc<Mutex<Option<ActiveJob>>>,
    token: JobToken,
}

impl JobGuard {
    pub fn token(&self) -> &JobToken {
        &self.token
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.as_ref().is_some_and(|active| active.token == self.token) {
            *slot = None;
        }
    }
}
