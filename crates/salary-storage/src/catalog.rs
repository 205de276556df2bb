use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use salary_core::{Category, CoreError, ReferenceEntity};
use sqlx::PgPool;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    InvalidCategory(#[from] CoreError),
    #[error("catalog query failed: {0}")]
    Database(#[from] sqlx::Error),
}

/// Read-only view of the reference tables.
///
/// Implementations return only the most recently loaded snapshot of a
/// category (rows sharing the table's latest `created_at`), ordered by id
/// ascending and capped at `limit`. Duplicates inside a snapshot are returned
/// as stored.
#[async_trait]
pub trait ReferenceCatalog: Send + Sync {
    async fn list(&self, category: Category, limit: usize)
        -> Result<Vec<ReferenceEntity>, CatalogError>;
}

/// String-keyed entry point for callers holding raw table names.
pub async fn list_named(
    catalog: &dyn ReferenceCatalog,
    name: &str,
    limit: usize,
) -> Result<Vec<ReferenceEntity>, CatalogError> {
    let category: Category = name.parse()?;
    catalog.list(category, limit).await
}

#[derive(Debug, Clone)]
pub struct PgReferenceCatalog {
    pool: PgPool,
}

impl PgReferenceCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReferenceCatalog for PgReferenceCatalog {
    async fn list(
        &self,
        category: Category,
        limit: usize,
    ) -> Result<Vec<ReferenceEntity>, CatalogError> {
        // Table names come from the closed Category enum, never from input.
        let table = category.table_name();
        let sql = format!(
            r#"
            SELECT id, title, alias
              FROM {table}
             WHERE created_at = (SELECT MAX(created_at) FROM {table})
             ORDER BY id
             LIMIT $1
            "#
        );
        let rows = sqlx::query_as::<_, (i64, String, String)>(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(id, title, alias)| ReferenceEntity { id, title, alias })
            .collect())
    }
}

#[derive(Debug, Clone)]
struct CatalogRow {
    entity: ReferenceEntity,
    created_at: DateTime<Utc>,
}

/// Process-local catalog with the same latest-snapshot semantics as the
/// Postgres one. Used for dry runs and tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    rows: HashMap<Category, Vec<CatalogRow>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a load batch of entities stamped with `created_at`.
    pub fn with_snapshot(
        mut self,
        category: Category,
        created_at: DateTime<Utc>,
        entities: impl IntoIterator<Item = ReferenceEntity>,
    ) -> Self {
        let rows = self.rows.entry(category).or_default();
        rows.extend(
            entities
                .into_iter()
                .map(|entity| CatalogRow { entity, created_at }),
        );
        self
    }

    /// Single snapshot stamped now.
    pub fn with_entities(
        self,
        category: Category,
        entities: impl IntoIterator<Item = ReferenceEntity>,
    ) -> Self {
        self.with_snapshot(category, Utc::now(), entities)
    }
}

#[async_trait]
impl ReferenceCatalog for InMemoryCatalog {
    async fn list(
        &self,
        category: Category,
        limit: usize,
    ) -> Result<Vec<ReferenceEntity>, CatalogError> {
        let Some(rows) = self.rows.get(&category) else {
            return Ok(Vec::new());
        };
        let Some(latest) = rows.iter().map(|r| r.created_at).max() else {
            return Ok(Vec::new());
        };

        let mut out = rows
            .iter()
            .filter(|r| r.created_at == latest)
            .map(|r| r.entity.clone())
            .collect::<Vec<_>>();
        out.sort_by_key(|e| e.id);
        out.truncate(limit);
        Ok(out)
    }
}
