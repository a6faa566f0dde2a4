//! Hierarchy persistence + HTTP fetch utilities for tiersync.

use async_trait::async_trait;
use thiserror::Error;
use tiersync_core::{Child, Grandchild, GrandchildRecord, Level, Parent, ParentRecord, RowId};

mod http;
mod memory;
mod postgres;

pub use http::{
    classify_reqwest_error, classify_status, content_digest, BackoffPolicy, FetchError,
    FetchedResponse, HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use memory::{MemorySnapshot, MemoryStore};
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "tiersync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    /// Insert referenced a row that does not exist at the owning level.
    #[error("{level} {id} does not exist")]
    MissingReference { level: Level, id: RowId },
    /// No connection could be obtained; nothing was read or written.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => StoreError::Unavailable(err.to_string()),
            other => StoreError::Database(other),
        }
    }
}

/// Relational store holding the parent -> child -> grandchild chain.
///
/// Lookups are exact matches on each level's natural key. Inserts return the
/// store-assigned id and must reject references to missing owners.
#[async_trait]
pub trait HierarchyStore: Send + Sync {
    async fn find_parent_by_email(&self, email: &str) -> Result<Option<RowId>, StoreError>;

    async fn insert_parent(&self, parent: &ParentRecord) -> Result<RowId, StoreError>;

    async fn find_child(&self, parent_id: RowId, title: &str) -> Result<Option<RowId>, StoreError>;

    async fn insert_child(
        &self,
        parent_id: RowId,
        title: &str,
        body: &str,
    ) -> Result<RowId, StoreError>;

    async fn find_grandchild(
        &self,
        child_id: RowId,
        body: &str,
    ) -> Result<Option<RowId>, StoreError>;

    async fn insert_grandchild(
        &self,
        child_id: RowId,
        grandchild: &GrandchildRecord,
    ) -> Result<RowId, StoreError>;

    async fn list_parents(&self, limit: usize) -> Result<Vec<Parent>, StoreError>;

    async fn list_children(&self, parent_id: RowId, limit: usize) -> Result<Vec<Child>, StoreError>;

    async fn list_grandchildren(
        &self,
        child_id: RowId,
        limit: usize,
    ) -> Result<Vec<Grandchild>, StoreError>;

    async fn count_parents(&self) -> Result<i64, StoreError>;
}
