//! SQLite-backed request store.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use super::{RequestStore, StoreError};
use crate::migrations;
use crate::request::{Request, RequestStatus};

#[derive(Debug, sqlx::FromRow)]
struct RequestRow {
    request_id: i64,
    body: String,
}

/// SQLite-backed request store.
///
/// Queryable columns are kept next to the full request serialized as JSON.
#[derive(Clone)]
pub struct SqliteRequestStore {
    pool: SqlitePool,
}

impl SqliteRequestStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and run migrations.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| StoreError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Create and initialize a store from a file path.
    ///
    /// Creates parent directories and the database file when missing, then
    /// runs migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Database {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// Run the embedded migrations on `pool`.
    pub async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
        migrations::run_sqlite(pool).await.map_err(|e| StoreError::Database {
            operation: "migrate".to_string(),
            details: format!("Failed to run migrations: {}", e),
        })
    }

    /// Check the database answers.
    pub async fn health_check(&self) -> Result<bool, StoreError> {
        let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }

    /// Ids of requests in `status`, oldest first.
    pub async fn ids_with_status(
        &self,
        status: RequestStatus,
        limit: i64,
    ) -> Result<Vec<i64>, StoreError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT request_id FROM requests
            WHERE status = ?
            ORDER BY last_update ASC, request_id ASC
            LIMIT ?
            "#,
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[async_trait]
impl RequestStore for SqliteRequestStore {
    async fn load(&self, request_id: i64) -> Result<Request, StoreError> {
        let row = sqlx::query_as::<_, RequestRow>(
            r#"
            SELECT request_id, body
            FROM requests
            WHERE request_id = ?
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound { request_id })?;

        let mut request: Request = serde_json::from_str(&row.body)?;
        request.request_id = Some(row.request_id);
        Ok(request)
    }

    async fn save(&self, request: &Request) -> Result<i64, StoreError> {
        let now = Utc::now();
        let mut stored = request.clone();
        stored.last_update = Some(now);

        match request.request_id {
            None => {
                let body = serde_json::to_string(&stored)?;
                let result = sqlx::query(
                    r#"
                    INSERT INTO requests (request_name, owner_subject, owner_group, job_id,
                                          status, error, body, created_at, last_update)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&stored.request_name)
                .bind(&stored.owner_subject)
                .bind(&stored.owner_group)
                .bind(stored.job_id)
                .bind(stored.status.as_str())
                .bind(&stored.error)
                .bind(&body)
                .bind(stored.created_at)
                .bind(now)
                .execute(&self.pool)
                .await?;

                Ok(result.last_insert_rowid())
            }
            Some(request_id) => {
                let body = serde_json::to_string(&stored)?;
                sqlx::query(
                    r#"
                    INSERT INTO requests (request_id, request_name, owner_subject, owner_group,
                                          job_id, status, error, body, created_at, last_update)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT (request_id) DO UPDATE SET
                        status = excluded.status,
                        error = excluded.error,
                        job_id = excluded.job_id,
                        body = excluded.body,
                        last_update = excluded.last_update
                    "#,
                )
                .bind(request_id)
                .bind(&stored.request_name)
                .bind(&stored.owner_subject)
                .bind(&stored.owner_group)
                .bind(stored.job_id)
                .bind(stored.status.as_str())
                .bind(&stored.error)
                .bind(&body)
                .bind(stored.created_at)
                .bind(now)
                .execute(&self.pool)
                .await?;

                Ok(request_id)
            }
        }
    }
}
