//! Job declarations and ad-hoc job specifications.
//!
//! A [`ScheduledJob`] is a periodic job declared at startup, a
//! [`QueuedJobType`] is a kind of ad-hoc work served by a bounded queue, and a
//! [`JobSpec`] is what gets handed to a live scheduler to create or replace
//! one of its entries.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::trigger::Trigger;
use super::types::{JobId, JobTarget, QueueName};

/// Positional arguments passed to a job callable.
pub type JobArgs = Vec<Value>;

/// Keyword arguments passed to a job callable.
pub type JobKwargs = Map<String, Value>;

/// A periodic job declaration held by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub job_id: JobId,
    pub target: JobTarget,
    pub trigger: Trigger,
    #[serde(default)]
    pub job_kwargs: JobKwargs,
    pub enabled: bool,
}

impl ScheduledJob {
    /// The spec used to install this job in a live scheduler.
    ///
    /// Registry jobs always replace an existing entry with the same id.
    pub fn to_spec(&self) -> JobSpec {
        JobSpec {
            id: Some(self.job_id.clone()),
            target: self.target.clone(),
            trigger: Some(self.trigger.clone()),
            args: Vec::new(),
            kwargs: self.job_kwargs.clone(),
            name: Some(self.job_id.to_string()),
            executor: None,
            replace_existing: true,
        }
    }
}

/// A kind of ad-hoc work, served by a bounded queue of the same name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedJobType {
    pub queue_name: QueueName,
    pub target: JobTarget,
    pub max_concurrent: usize,
    pub enabled: bool,
}

/// Request to add a job to a live scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Job id. Defaults to the target's callable name.
    #[serde(default)]
    pub id: Option<JobId>,
    pub target: JobTarget,
    /// When to run. `None` runs the job once, as soon as possible.
    #[serde(default)]
    pub trigger: Option<Trigger>,
    #[serde(default)]
    pub args: JobArgs,
    #[serde(default)]
    pub kwargs: JobKwargs,
    #[serde(default)]
    pub name: Option<String>,
    /// Queue to run the job on instead of the scheduler's own executor.
    #[serde(default)]
    pub executor: Option<QueueName>,
    #[serde(default)]
    pub replace_existing: bool,
}

impl JobSpec {
    /// Create a spec that runs `target` once, as soon as possible.
    pub fn new(target: JobTarget) -> Self {
        Self {
            id: None,
            target,
            trigger: None,
            args: Vec::new(),
            kwargs: JobKwargs::new(),
            name: None,
            executor: None,
            replace_existing: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_args(mut self, args: JobArgs) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: JobKwargs) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_executor(mut self, queue: impl Into<QueueName>) -> Self {
        self.executor = Some(queue.into());
        self
    }

    pub fn replace_existing(mut self, replace: bool) -> Self {
        self.replace_existing = replace;
        self
    }

    /// The id this spec resolves to.
    pub fn resolved_id(&self) -> JobId {
        self.id
            .clone()
            .unwrap_or_else(|| JobId::new(self.target.callable()))
    }
}
