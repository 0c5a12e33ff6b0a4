//! The operations every scheduler handle offers, local or remote.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use super::types::{QueueResult, SchedulerError};
use crate::core::job::{JobArgs, JobKwargs, JobSpec};
use crate::core::snapshot::JobSnapshot;
use crate::core::types::{JobId, QueueName};
use crate::events::{Event, EventKind};

/// Control surface of a live scheduler.
///
/// Implemented by [`SchedulerHandle`](super::SchedulerHandle) in the owning
/// process and by [`RpcClient`](crate::rpc::RpcClient) everywhere else.
#[async_trait]
pub trait SchedulerApi: Send + Sync {
    /// Install a job. Returns the installed job.
    async fn add_job(&self, spec: JobSpec) -> Result<JobSnapshot, SchedulerError>;

    async fn get_job(&self, job_id: &JobId) -> Result<Option<JobSnapshot>, SchedulerError>;

    async fn get_jobs(&self) -> Result<Vec<JobSnapshot>, SchedulerError>;

    async fn remove_job(&self, job_id: &JobId) -> Result<(), SchedulerError>;

    async fn remove_all_jobs(&self) -> Result<(), SchedulerError>;

    /// Submit an instance to a named queue without waiting for it to run.
    async fn queue_job(
        &self,
        queue_name: &QueueName,
        args: JobArgs,
        kwargs: JobKwargs,
    ) -> Result<QueueResult, SchedulerError>;

    /// Queued and running instances of a queue.
    async fn get_queued_jobs(
        &self,
        queue_name: &QueueName,
    ) -> Result<HashMap<JobId, JobSnapshot>, SchedulerError>;

    /// Remove an instance that has not started yet.
    async fn cancel_queued_job(
        &self,
        queue_name: &QueueName,
        job_id: &JobId,
    ) -> Result<bool, SchedulerError>;

    /// Wait for the next event of `kind`, up to `timeout`.
    async fn await_event(
        &self,
        kind: EventKind,
        timeout: Duration,
    ) -> Result<Option<Event>, SchedulerError>;

    async fn shutdown(&self) -> Result<(), SchedulerError>;
}
