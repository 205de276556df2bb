use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use salary_core::{Category, FetchedDocument, JobToken, StagedDocument};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("staging buffer for job {token} is full ({limit} documents)")]
    CapacityExceeded { token: JobToken, limit: usize },
    #[error("sqlite staging error: {0}")]
    Sqlite(#[from] sqlx::Error),
    #[error("staging file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("staged payload is not valid json: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("corrupt staged row: {0}")]
    Corrupt(String),
    #[error("staging file {} already exists", .0.display())]
    FileExists(PathBuf),
}

/// Append-only, job-scoped holding area for fetched documents.
///
/// A buffer is created on the first `write` for a token and released by
/// `discard`. Nothing written here is visible in permanent storage.
#[async_trait]
pub trait StagingBuffer: Send + Sync {
    /// Recorded as `operation_kind` in the audit log on promotion.
    fn kind(&self) -> &'static str;

    /// Stages `doc`, stamping it with the current time.
    async fn write(&self, token: &JobToken, doc: FetchedDocument) -> Result<(), StagingError>;

    /// Staged documents in write order. Unknown tokens yield an empty list.
    async fn read_all(&self, token: &JobToken) -> Result<Vec<StagedDocument>, StagingError>;

    async fn len(&self, token: &JobToken) -> Result<usize, StagingError>;

    async fn contains(&self, token: &JobToken) -> bool;

    /// Frees everything held for `token`. Returns whether a buffer existed.
    async fn discard(&self, token: &JobToken) -> Result<bool, StagingError>;
}

/// Strategy (A): process-local buffers keyed by token.
#[derive(Debug, Default)]
pub struct InProcessStaging {
    buffers: Mutex<HashMap<JobToken, Vec<StagedDocument>>>,
    capacity: Option<usize>,
}

impl InProcessStaging {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps documents per token; writes beyond it fail.
    pub fn with_capacity_limit(limit: usize) -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            capacity: Some(limit),
        }
    }
}

#[async_trait]
impl StagingBuffer for InProcessStaging {
    fn kind(&self) -> &'static str {
        "batch_import"
    }

    async fn write(&self, token: &JobToken, doc: FetchedDocument) -> Result<(), StagingError> {
        let mut buffers = self.buffers.lock().await;
        let buffer = buffers.entry(token.clone()).or_default();
        if let Some(limit) = self.capacity {
            if buffer.len() >= limit {
                return Err(StagingError::CapacityExceeded {
                    token: token.clone(),
                    limit,
                });
            }
        }
        buffer.push(StagedDocument {
            document: doc,
            fetched_at: Utc::now(),
        });
        Ok(())
    }

    async fn read_all(&self, token: &JobToken) -> Result<Vec<StagedDocument>, StagingError> {
        let buffers = self.buffers.lock().await;
        Ok(buffers.get(token).cloned().unwrap_or_default())
    }

    async fn len(&self, token: &JobToken) -> Result<usize, StagingError> {
        let buffers = self.buffers.lock().await;
        Ok(buffers.get(token).map(Vec::len).unwrap_or(0))
    }

    async fn contains(&self, token: &JobToken) -> bool {
        self.buffers.lock().await.contains_key(token)
    }

    async fn discard(&self, token: &JobToken) -> Result<bool, StagingError> {
        let removed = self.buffers.lock().await.remove(token);
        if let Some(docs) = &removed {
            info!(%token, documents = docs.len(), "discarded in-process staging buffer");
        }
        Ok(removed.is_some())
    }
}

struct SqliteBuffer {
    pool: SqlitePool,
    path: PathBuf,
}

/// Strategy (B): one throwaway SQLite file per token, bulk-copied into
/// Postgres on promotion and deleted afterwards.
pub struct SqliteStaging {
    dir: PathBuf,
    buffers: Mutex<HashMap<JobToken, SqliteBuffer>>,
}

impl SqliteStaging {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_temp_dir() -> Self {
        Self::new(std::env::temp_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fresh, never-before-used staging file name for `token`. The random
    /// suffix keeps tokens that sanitize to the same text apart.
    fn fresh_file_path(&self, token: &JobToken) -> PathBuf {
        let safe = token
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect::<String>();
        self.dir
            .join(format!("scraper_temp_{safe}_{}.db", Uuid::new_v4().simple()))
    }

    /// Staging file currently backing `token`, if a buffer is open.
    pub async fn buffer_path(&self, token: &JobToken) -> Option<PathBuf> {
        self.buffers.lock().await.get(token).map(|b| b.path.clone())
    }

    async fn open(&self, token: &JobToken) -> Result<SqliteBuffer, StagingError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.fresh_file_path(token);
        if tokio::fs::try_exists(&path).await? {
            return Err(StagingError::FileExists(path));
        }
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        // Plain CREATE TABLE: a file that already holds rows is never reused.
        sqlx::query(
            r#"
            CREATE TABLE temp_reports (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_token TEXT NOT NULL,
                subject_category TEXT NOT NULL,
                subject_id INTEGER NOT NULL,
                data TEXT NOT NULL,
                fetched_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        info!(%token, path = %path.display(), "opened sqlite staging buffer");
        Ok(SqliteBuffer { pool, path })
    }

    async fn pool_for(&self, token: &JobToken) -> Option<SqlitePool> {
        self.buffers.lock().await.get(token).map(|b| b.pool.clone())
    }
}

#[async_trait]
impl StagingBuffer for SqliteStaging {
    fn kind(&self) -> &'static str {
        "sqlite_import"
    }

    async fn write(&self, token: &JobToken, doc: FetchedDocument) -> Result<(), StagingError> {
        let pool = {
            let mut buffers = self.buffers.lock().await;
            match buffers.get(token) {
                Some(buffer) => buffer.pool.clone(),
                None => {
                    let buffer = self.open(token).await?;
                    let pool = buffer.pool.clone();
                    buffers.insert(token.clone(), buffer);
                    pool
                }
            }
        };

        let data = serde_json::to_string(&doc.payload)?;
        let fetched_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        sqlx::query(
            r#"
            INSERT INTO temp_reports (job_token, subject_category, subject_id, data, fetched_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(token.as_str())
        .bind(doc.subject_category.table_name())
        .bind(doc.subject_id)
        .bind(data)
        .bind(fetched_at)
        .execute(&pool)
        .await?;
        Ok(())
    }

    async fn read_all(&self, token: &JobToken) -> Result<Vec<StagedDocument>, StagingError> {
        let Some(pool) = self.pool_for(token).await else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query_as::<_, (String, i64, String, String)>(
            r#"
            SELECT subject_category, subject_id, data, fetched_at
              FROM temp_reports
             WHERE job_token = ?
             ORDER BY id
            "#,
        )
        .bind(token.as_str())
        .fetch_all(&pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for (category, subject_id, data, fetched_at) in rows {
            let subject_category: Category = category
                .parse()
                .map_err(|_| StagingError::Corrupt(format!("unknown category `{category}`")))?;
            let fetched_at = DateTime::parse_from_rfc3339(&fetched_at)
                .map_err(|e| StagingError::Corrupt(format!("bad timestamp `{fetched_at}`: {e}")))?
                .with_timezone(&Utc);
            out.push(StagedDocument {
                document: FetchedDocument {
                    payload: serde_json::from_str(&data)?,
                    subject_id,
                    subject_category,
                },
                fetched_at,
            });
        }
        Ok(out)
    }

    async fn len(&self, token: &JobToken) -> Result<usize, StagingError> {
        let Some(pool) = self.pool_for(token).await else {
            return Ok(0);
        };
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM temp_reports WHERE job_token = ?")
            .bind(token.as_str())
            .fetch_one(&pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn contains(&self, token: &JobToken) -> bool {
        self.buffers.lock().await.contains_key(token)
    }

    async fn discard(&self, token: &JobToken) -> Result<bool, StagingError> {
        let Some(buffer) = self.buffers.lock().await.remove(token) else {
            return Ok(false);
        };
        buffer.pool.close().await;

        match tokio::fs::remove_file(&buffer.path).await {
            Ok(()) => {
                info!(%token, path = %buffer.path.display(), "removed sqlite staging file");
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(%token, path = %buffer.path.display(), error = %err, "could not remove sqlite staging file");
                return Err(err.into());
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn doc(id: i64, category: Category) -> FetchedDocument {
        FetchedDocument {
            payload: json!({
                "groups": [{"name": "Senior", "title": "Старший", "median": 350000, "salary": {"value": 300000, "bonus": 50000}}],
                "subject": id
            }),
            subject_id: id,
            subject_category: category,
        }
    }

    async fn exercise_round_trip(staging: &dyn StagingBuffer) {
        let token = JobToken::from("job-a");
        let written = vec![doc(1, Category::Skill), doc(7, Category::Region), doc(3, Category::Company)];
        for d in &written {
            staging.write(&token, d.clone()).await.unwrap();
        }

        let staged = staging.read_all(&token).await.unwrap();
        assert_eq!(
            staged.iter().map(|s| s.document.clone()).collect::<Vec<_>>(),
            written
        );
        assert!(staged.windows(2).all(|w| w[0].fetched_at <= w[1].fetched_at));
        assert_eq!(staging.len(&token).await.unwrap(), 3);
    }

    async fn exercise_isolation_and_discard(staging: &dyn StagingBuffer) {
        let a = JobToken::from("job-a");
        let b = JobToken::from("job-b");
        staging.write(&a, doc(1, Category::Skill)).await.unwrap();
        staging.write(&b, doc(2, Category::Skill)).await.unwrap();
        staging.write(&a, doc(3, Category::Skill)).await.unwrap();

        assert_eq!(staging.len(&a).await.unwrap(), 2);
        assert_eq!(staging.len(&b).await.unwrap(), 1);

        assert!(staging.discard(&a).await.unwrap());
        assert!(!staging.discard(&a).await.unwrap());
        assert!(!staging.contains(&a).await);
        assert!(staging.read_all(&a).await.unwrap().is_empty());
        assert_eq!(staging.read_all(&b).await.unwrap()[0].document.subject_id, 2);
    }

    #[tokio::test]
    async fn in_process_round_trip_preserves_documents() {
        exercise_round_trip(&InProcessStaging::new()).await;
    }

    #[tokio::test]
    async fn in_process_tokens_are_isolated() {
        exercise_isolation_and_discard(&InProcessStaging::new()).await;
    }

    #[tokio::test]
    async fn in_process_capacity_limit_rejects_writes() {
        let staging = InProcessStaging::with_capacity_limit(1);
        let token = JobToken::from("job");
        staging.write(&token, doc(1, Category::Skill)).await.unwrap();
        let err = staging.write(&token, doc(2, Category::Skill)).await.unwrap_err();
        assert!(matches!(err, StagingError::CapacityExceeded { limit: 1, .. }));
    }

    #[tokio::test]
    async fn sqlite_round_trip_preserves_documents() {
        let dir = tempdir().expect("tempdir");
        exercise_round_trip(&SqliteStaging::new(dir.path())).await;
    }

    #[tokio::test]
    async fn sqlite_tokens_are_isolated() {
        let dir = tempdir().expect("tempdir");
        exercise_isolation_and_discard(&SqliteStaging::new(dir.path())).await;
    }

    #[tokio::test]
    async fn sqlite_discard_removes_file() {
        let dir = tempdir().expect("tempdir");
        let staging = SqliteStaging::new(dir.path());
        let token = JobToken::generate();

        assert!(staging.buffer_path(&token).await.is_none());
        staging.write(&token, doc(1, Category::Specialization)).await.unwrap();
        let path = staging.buffer_path(&token).await.unwrap();
        assert!(path.exists());

        staging.discard(&token).await.unwrap();
        assert!(!path.exists());
        assert!(staging.buffer_path(&token).await.is_none());
        assert!(!staging.discard(&token).await.unwrap());
    }

    #[tokio::test]
    async fn sqlite_file_name_is_sanitized_and_unique() {
        let dir = tempdir().expect("tempdir");
        let staging = SqliteStaging::new(dir.path());
        let token = JobToken::from("../evil/token");
        staging.write(&token, doc(1, Category::Skill)).await.unwrap();

        let path = staging.buffer_path(&token).await.unwrap();
        assert_eq!(path.parent(), Some(dir.path()));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("scraper_temp____evil_token_"), "{name}");
        assert!(name.ends_with(".db"));
        staging.discard(&token).await.unwrap();
    }

    #[tokio::test]
    async fn sqlite_tokens_sanitizing_alike_stay_separate() {
        let dir = tempdir().expect("tempdir");
        let staging = SqliteStaging::new(dir.path());
        let slash = JobToken::from("job/a");
        let underscore = JobToken::from("job_a");

        staging.write(&slash, doc(1, Category::Skill)).await.unwrap();
        staging.write(&underscore, doc(2, Category::Skill)).await.unwrap();

        let ids = |docs: Vec<StagedDocument>| docs.iter().map(|d| d.document.subject_id).collect::<Vec<_>>();
        assert_eq!(ids(staging.read_all(&slash).await.unwrap()), vec![1]);
        assert_eq!(ids(staging.read_all(&underscore).await.unwrap()), vec![2]);
        assert_ne!(
            staging.buffer_path(&slash).await,
            staging.buffer_path(&underscore).await
        );
    }

    #[tokio::test]
    async fn sqlite_leftover_file_is_not_reused() {
        let dir = tempdir().expect("tempdir");
        let token = JobToken::from("nightly");

        // a previous process wrote under the same token and never discarded
        let crashed = SqliteStaging::new(dir.path());
        crashed.write(&token, doc(99, Category::Region)).await.unwrap();
        let leftover = crashed.buffer_path(&token).await.unwrap();

        let fresh = SqliteStaging::new(dir.path());
        fresh.write(&token, doc(1, Category::Region)).await.unwrap();

        let staged = fresh.read_all(&token).await.unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].document.subject_id, 1);
        assert_eq!(fresh.len(&token).await.unwrap(), 1);
        assert_ne!(fresh.buffer_path(&token).await, Some(leftover));
    }
}
