//! Plain-data job snapshots.
//!
//! Live scheduler entries and queue instances hold handlers and task state
//! that cannot leave the process. A [`JobSnapshot`] is the read-only record
//! returned to callers instead, locally and over RPC alike.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{JobArgs, JobKwargs};
use super::types::JobId;

/// Executor name reported for jobs run by the scheduler itself.
pub const DEFAULT_EXECUTOR: &str = "default";

/// Read-only status record of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    /// Target as a `module:callable` string.
    pub func: String,
    /// `default` for scheduled jobs, the queue name for queued jobs.
    pub executor: String,
    pub args: JobArgs,
    pub kwargs: JobKwargs,
    pub name: Option<String>,
    pub next_run_time: Option<DateTime<Utc>>,
}
