//! SQLite storage implementation.
//!
//! Provides persistent storage using SQLite database. Several processes may
//! open the same database file; lease updates are single statements so the
//! database arbitrates between them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::{Lease, Storage, StorageError, StoredJob, lease_expiry};
use crate::core::types::{JobId, JobTarget, QueueName};

/// How long a connection waits on a lock held by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteStorage {
    pool: SqlitePool,
}

type JobRow = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<i64>,
    i64,
    i64,
);

const JOB_COLUMNS: &str =
    "id, target, trigger, args, kwargs, name, executor, next_run_time, created_at, updated_at";

impl SqliteStorage {
    /// Create a new SQLite storage with the given database path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| StorageError::Other(e.to_string()))?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StorageError::SerializationError(format!("invalid timestamp: {millis}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, StorageError> {
    serde_json::from_str(s).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn db_error(e: sqlx::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

fn job_from_row(row: JobRow) -> Result<StoredJob, StorageError> {
    Ok(StoredJob {
        id: JobId::new(row.0),
        target: JobTarget::parse(&row.1)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?,
        trigger: from_json(&row.2)?,
        args: from_json(&row.3)?,
        kwargs: from_json(&row.4)?,
        name: row.5,
        executor: row.6.map(QueueName::new),
        next_run_time: row.7.map(from_millis).transpose()?,
        created_at: from_millis(row.8)?,
        updated_at: from_millis(row.9)?,
    })
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn upsert_job(&self, job: StoredJob) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_jobs
                (id, target, trigger, args, kwargs, name, executor, next_run_time, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                target = excluded.target,
                trigger = excluded.trigger,
                args = excluded.args,
                kwargs = excluded.kwargs,
                name = excluded.name,
                executor = excluded.executor,
                next_run_time = excluded.next_run_time,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(job.id.as_str())
        .bind(job.target.to_string())
        .bind(to_json(&job.trigger)?)
        .bind(to_json(&job.args)?)
        .bind(to_json(&job.kwargs)?)
        .bind(&job.name)
        .bind(job.executor.as_ref().map(|q| q.as_str().to_string()))
        .bind(job.next_run_time.map(to_millis))
        .bind(to_millis(job.created_at))
        .bind(to_millis(job.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<StoredJob, StorageError> {
        let row: JobRow = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE id = ?"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))?;

        job_from_row(row)
    }

    async fn list_jobs(&self) -> Result<Vec<StoredJob>, StorageError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduled_jobs ORDER BY created_at, id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(job_from_row).collect()
    }

    async fn delete_job(&self, id: &JobId) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("job: {}", id)));
        }
        Ok(())
    }

    async fn delete_all_jobs(&self) -> Result<usize, StorageError> {
        let result = sqlx::query("DELETE FROM scheduled_jobs")
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected() as usize)
    }

    async fn update_next_run_time(
        &self,
        id: &JobId,
        next_run_time: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        let result =
            sqlx::query("UPDATE scheduled_jobs SET next_run_time = ?, updated_at = ? WHERE id = ?")
                .bind(next_run_time.map(to_millis))
                .bind(to_millis(Utc::now()))
                .bind(id.as_str())
                .execute(&self.pool)
                .await
                .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("job: {}", id)));
        }
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO leases (name, holder, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                holder = excluded.holder,
                expires_at = excluded.expires_at
            WHERE leases.expires_at <= ? OR leases.holder = excluded.holder
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(to_millis(lease_expiry(now, ttl)?))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn renew_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let expires_at = lease_expiry(Utc::now(), ttl)?;
        let result = sqlx::query("UPDATE leases SET expires_at = ? WHERE name = ? AND holder = ?")
            .bind(to_millis(expires_at))
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM leases WHERE name = ? AND holder = ?")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn get_lease(&self, name: &str) -> Result<Option<Lease>, StorageError> {
        let row: Option<(String, String, i64)> =
            sqlx::query_as("SELECT name, holder, expires_at FROM leases WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;

        row.map(|(name, holder, expires_at)| {
            Ok(Lease {
                name,
                holder,
                expires_at: from_millis(expires_at)?,
            })
        })
        .transpose()
    }
}
