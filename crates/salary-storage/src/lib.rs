//! Reference catalog access, job-scoped staging buffers and atomic promotion
//! of staged salary documents into Postgres.

mod catalog;
mod promotion;
mod staging;
mod store;

pub use catalog::{list_named, CatalogError, InMemoryCatalog, PgReferenceCatalog, ReferenceCatalog};
pub use promotion::{BatchStats, PromotionEngine, PromotionError};
pub use staging::{InProcessStaging, SqliteStaging, StagingBuffer, StagingError};
pub use store::{connect_pg_pool, migrate, InMemoryReportStore, PgReportStore, ReportStore, StoreError};

pub const CRATE_NAME: &str = "salary-storage";
