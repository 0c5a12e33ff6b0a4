//! Scheduler type definitions.
//!
//! This module contains error types, state enums, and command types for the scheduler.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::core::job::JobSpec;
use crate::core::snapshot::JobSnapshot;
use crate::core::trigger::TriggerError;
use crate::core::types::JobId;
use crate::queue::QueueError;
use crate::storage::StorageError;

/// Errors that can occur in the scheduler or while reaching it.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// A job with this id exists and replacement was not requested.
    #[error("job id already in use: {0}")]
    ConflictingJobId(JobId),

    /// The job spec cannot be scheduled.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Trigger error.
    #[error("trigger error: {0}")]
    Trigger(#[from] TriggerError),

    /// Queue error.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),

    /// The scheduler has been shut down.
    #[error("scheduler is not running")]
    NotRunning,

    /// The RPC server could not be reached.
    #[error("scheduler unreachable: {0}")]
    Unreachable(String),

    /// The RPC server rejected our credentials.
    #[error("scheduler rejected credentials")]
    Unauthorized,

    /// The RPC server answered with an error.
    #[error("scheduler error ({status}): {message}")]
    Remote { status: u16, message: String },

    /// The scheduler process could not be started.
    #[error("failed to start scheduler process: {0}")]
    Spawn(String),
}

/// State of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    /// Scheduler is stopped.
    Stopped,
    /// Scheduler is running.
    Running,
    /// Scheduler is paused.
    Paused,
}

/// Result of submitting to a named queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobSnapshot>,
}

impl QueueResult {
    pub fn submitted(job: JobSnapshot) -> Self {
        Self {
            success: true,
            message: None,
            job: Some(job),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            job: None,
        }
    }
}

/// Commands that can be sent to the scheduler loop.
pub(crate) enum SchedulerCommand {
    AddJob {
        spec: JobSpec,
        response: oneshot::Sender<Result<JobSnapshot, SchedulerError>>,
    },
    GetJob {
        job_id: JobId,
        response: oneshot::Sender<Option<JobSnapshot>>,
    },
    GetJobs {
        response: oneshot::Sender<Vec<JobSnapshot>>,
    },
    RemoveJob {
        job_id: JobId,
        response: oneshot::Sender<Result<(), SchedulerError>>,
    },
    RemoveAllJobs {
        response: oneshot::Sender<Result<usize, SchedulerError>>,
    },
    /// Pause the scheduler.
    Pause { response: oneshot::Sender<()> },
    /// Resume the scheduler.
    Resume { response: oneshot::Sender<()> },
    /// Shutdown the scheduler.
    Shutdown { response: oneshot::Sender<()> },
}
