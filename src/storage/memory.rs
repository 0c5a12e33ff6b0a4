//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and development.
//! Leases held here are only visible inside one process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use super::{Lease, Storage, StorageError, StoredJob, lease_expiry};
use crate::core::types::JobId;

/// In-memory storage backend.
///
/// Thread-safe storage using RwLock for concurrent access.
/// Data is not persisted across restarts.
pub struct InMemoryStorage {
    jobs: RwLock<HashMap<JobId, StoredJob>>,
    leases: RwLock<HashMap<String, Lease>>,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            leases: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn upsert_job(&self, job: StoredJob) -> Result<(), StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        let job = match jobs.get(&job.id) {
            Some(existing) => StoredJob {
                created_at: existing.created_at,
                ..job
            },
            None => job,
        };
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<StoredJob, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        jobs.get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))
    }

    async fn list_jobs(&self) -> Result<Vec<StoredJob>, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = jobs.values().cloned().collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(result)
    }

    async fn delete_job(&self, id: &JobId) -> Result<(), StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        jobs.remove(id)
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))?;
        Ok(())
    }

    async fn delete_all_jobs(&self) -> Result<usize, StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        let removed = jobs.len();
        jobs.clear();
        Ok(removed)
    }

    async fn update_next_run_time(
        &self,
        id: &JobId,
        next_run_time: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))?;
        job.next_run_time = next_run_time;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let now = Utc::now();
        let mut leases = self.leases.write().map_err(|_| StorageError::LockPoisoned)?;
        if let Some(current) = leases.get(name) {
            if current.holder != holder && !current.is_expired(now) {
                return Ok(false);
            }
        }
        leases.insert(
            name.to_string(),
            Lease {
                name: name.to_string(),
                holder: holder.to_string(),
                expires_at: lease_expiry(now, ttl)?,
            },
        );
        Ok(true)
    }

    async fn renew_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let now = Utc::now();
        let mut leases = self.leases.write().map_err(|_| StorageError::LockPoisoned)?;
        match leases.get_mut(name) {
            Some(lease) if lease.holder == holder => {
                lease.expires_at = lease_expiry(now, ttl)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), StorageError> {
        let mut leases = self.leases.write().map_err(|_| StorageError::LockPoisoned)?;
        if leases.get(name).is_some_and(|lease| lease.holder == holder) {
            leases.remove(name);
        }
        Ok(())
    }

    async fn get_lease(&self, name: &str) -> Result<Option<Lease>, StorageError> {
        let leases = self.leases.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(leases.get(name).cloned())
    }
}
