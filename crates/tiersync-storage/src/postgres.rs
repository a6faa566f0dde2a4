use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tiersync_core::{Child, Grandchild, GrandchildRecord, Parent, ParentRecord, RowId};
use tracing::info;

use crate::{HierarchyStore, StoreError};

/// Waiting longer than this for a pooled connection surfaces as `StoreError::Unavailable`.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Postgres-backed store over a shared connection pool.
///
/// Cloning shares the pool, so the sync engine and the read API can hold the
/// same store without a process-wide handle.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await?;
        info!(max_connections, "connected to postgres");
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("hierarchy migrations applied");
        Ok(())
    }
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn parent_from_row(row: &PgRow) -> Result<Parent, sqlx::Error> {
    Ok(Parent {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        username: row.try_get("username")?,
        email: row.try_get("email")?,
    })
}

fn child_from_row(row: &PgRow) -> Result<Child, sqlx::Error> {
    Ok(Child {
        id: row.try_get("id")?,
        parent_id: row.try_get("parent_id")?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
    })
}

fn grandchild_from_row(row: &PgRow) -> Result<Grandchild, sqlx::Error> {
    Ok(Grandchild {
        id: row.try_get("id")?,
        child_id: row.try_get("child_id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        body: row.try_get("body")?,
    })
}

#[async_trait]
impl HierarchyStore for PgStore {
    async fn find_parent_by_email(&self, email: &str) -> Result<Option<RowId>, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT id
              FROM parents
             WHERE email = $1
             ORDER BY id
             LIMIT 1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn insert_parent(&self, parent: &ParentRecord) -> Result<RowId, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO parents (name, username, email)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(&parent.name)
        .bind(parent.username.as_deref())
        .bind(&parent.email)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn find_child(&self, parent_id: RowId, title: &str) -> Result<Option<RowId>, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT id
              FROM children
             WHERE parent_id = $1
               AND title = $2
             ORDER BY id
             LIMIT 1
            "#,
        )
        .bind(parent_id)
        .bind(title)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn insert_child(
        &self,
        parent_id: RowId,
        title: &str,
        body: &str,
    ) -> Result<RowId, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO children (parent_id, title, body)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(parent_id)
        .bind(title)
        .bind(body)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn find_grandchild(
        &self,
        child_id: RowId,
        body: &str,
    ) -> Result<Option<RowId>, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT id
              FROM grandchildren
             WHERE child_id = $1
               AND md5(body) = md5($2)
               AND body = $2
             ORDER BY id
             LIMIT 1
            "#,
        )
        .bind(child_id)
        .bind(body)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn insert_grandchild(
        &self,
        child_id: RowId,
        grandchild: &GrandchildRecord,
    ) -> Result<RowId, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO grandchildren (child_id, name, email, body)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(child_id)
        .bind(&grandchild.name)
        .bind(&grandchild.email)
        .bind(&grandchild.body)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn list_parents(&self, limit: usize) -> Result<Vec<Parent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, username, email
              FROM parents
             ORDER BY id
             LIMIT $1
            "#,
        )
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(parent_from_row).collect::<Result<_, _>>()?)
    }

    async fn list_children(&self, parent_id: RowId, limit: usize) -> Result<Vec<Child>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, parent_id, title, body
              FROM children
             WHERE parent_id = $1
             ORDER BY id
             LIMIT $2
            "#,
        )
        .bind(parent_id)
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(child_from_row).collect::<Result<_, _>>()?)
    }

    async fn list_grandchildren(
        &self,
        child_id: RowId,
        limit: usize,
    ) -> Result<Vec<Grandchild>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, child_id, name, email, body
              FROM grandchildren
             WHERE child_id = $1
             ORDER BY id
             LIMIT $2
            "#,
        )
        .bind(child_id)
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(grandchild_from_row).collect::<Result<_, _>>()?)
    }

    async fn count_parents(&self) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM parents")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
