//! Storage abstraction for scheduled jobs and the singleton lease.
//!
//! This module provides a trait-based storage abstraction with
//! pluggable backends (in-memory, SQLite). The scheduler persists its job
//! table here, and the managers use the lease records to elect exactly one
//! scheduler owner across processes sharing the same backend.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::StorageConfig;
use crate::core::job::{JobArgs, JobKwargs};
use crate::core::snapshot::{DEFAULT_EXECUTOR, JobSnapshot};
use crate::core::trigger::Trigger;
use crate::core::types::{JobId, JobTarget, QueueName};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// The database rejected an operation.
    #[error("database error: {0}")]
    Database(String),

    /// The backend is not available in this build.
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

/// A job installed in a live scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredJob {
    pub id: JobId,
    pub target: JobTarget,
    pub trigger: Trigger,
    pub args: JobArgs,
    pub kwargs: JobKwargs,
    pub name: Option<String>,
    /// Queue the job runs on, `None` for the scheduler's own executor.
    pub executor: Option<QueueName>,
    /// `None` while the job is paused or exhausted.
    pub next_run_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredJob {
    /// Read-only view of this job.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id.clone(),
            func: self.target.to_string(),
            executor: self
                .executor
                .as_ref()
                .map(|q| q.to_string())
                .unwrap_or_else(|| DEFAULT_EXECUTOR.to_string()),
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
            name: self.name.clone(),
            next_run_time: self.next_run_time,
        }
    }
}

/// A time-limited claim on a named resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub name: String,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Storage trait for scheduler persistence.
///
/// Implementations must be thread-safe (Send + Sync) and support
/// async operations.
#[async_trait]
pub trait Storage: Send + Sync {
    // Job operations

    /// Insert or replace a job.
    async fn upsert_job(&self, job: StoredJob) -> Result<(), StorageError>;

    /// Get a job by ID.
    async fn get_job(&self, id: &JobId) -> Result<StoredJob, StorageError>;

    /// List all jobs, oldest first.
    async fn list_jobs(&self) -> Result<Vec<StoredJob>, StorageError>;

    /// Delete a job.
    async fn delete_job(&self, id: &JobId) -> Result<(), StorageError>;

    /// Delete every job, returning how many were removed.
    async fn delete_all_jobs(&self) -> Result<usize, StorageError>;

    /// Set the next run time of a job.
    async fn update_next_run_time(
        &self,
        id: &JobId,
        next_run_time: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError>;

    // Lease operations

    /// Claim `name` for `holder` if it is free, expired, or already held by
    /// `holder`. Returns whether the lease is now held by `holder`.
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError>;

    /// Extend a lease held by `holder`. Returns `false` if another holder
    /// owns it.
    async fn renew_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError>;

    /// Drop a lease if `holder` owns it.
    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), StorageError>;

    /// Current lease record for `name`, expired or not.
    async fn get_lease(&self, name: &str) -> Result<Option<Lease>, StorageError>;
}

/// Open the backend described by `config`.
pub async fn open_storage(config: &StorageConfig) -> Result<Arc<dyn Storage>, StorageError> {
    match config {
        StorageConfig::Memory => Ok(Arc::new(InMemoryStorage::new())),
        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { path } => Ok(Arc::new(SqliteStorage::new(path).await?)),
        #[cfg(not(feature = "sqlite"))]
        StorageConfig::Sqlite { .. } => Err(StorageError::Unavailable(
            "built without the sqlite feature".into(),
        )),
    }
}

fn lease_expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>, StorageError> {
    chrono::TimeDelta::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| StorageError::Other(format!("lease ttl out of range: {ttl:?}")))
}
