//! Process-local registry of job declarations.
//!
//! Jobs are declared (usually at startup, through [`declare`]) before any
//! scheduler exists. The registry records the scheduled jobs, the queue
//! types, and the handler table used to resolve `module:callable` targets.
//! It is an explicit value shared as `Arc<Registry>`: there is no global
//! registry.
//!
//! All state sits behind one mutex and every getter returns a snapshot, so
//! callers can never hold a reference into registry state.

pub mod declare;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::Environment;
use crate::core::handler::Handler;
use crate::core::job::{JobKwargs, QueuedJobType, ScheduledJob};
use crate::core::trigger::Trigger;
use crate::core::types::{JobId, JobTarget, QueueName};

pub use declare::{DeclareError, cron, date, interval, queue};

#[derive(Default)]
struct RegistryState {
    scheduled: HashMap<JobId, ScheduledJob>,
    queued: HashMap<QueueName, QueuedJobType>,
    handlers: HashMap<JobTarget, Handler>,
}

/// Registry of scheduled jobs, queue types and job handlers.
pub struct Registry {
    environment: Environment,
    state: Mutex<RegistryState>,
}

impl Registry {
    /// Create an empty registry for the given environment.
    pub fn new(environment: Environment) -> Self {
        Self {
            environment,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// The environment declarations are made in.
    pub fn environment(&self) -> Environment {
        self.environment
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        // Every critical section leaves the maps consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a callable under `target` without scheduling it.
    ///
    /// Used for targets that are only ever run through ad-hoc `add_job`.
    pub fn register_handler(&self, target: JobTarget, handler: Handler) {
        self.state().handlers.insert(target, handler);
    }

    /// Register a scheduled job whose id is the target's callable name.
    pub fn register_scheduled_job(
        &self,
        target: JobTarget,
        handler: Handler,
        trigger: Trigger,
        enabled: bool,
        job_kwargs: JobKwargs,
    ) -> ScheduledJob {
        let job = ScheduledJob {
            job_id: JobId::new(target.callable()),
            target,
            trigger,
            job_kwargs,
            enabled,
        };
        self.register_scheduled(job, handler)
    }

    /// Register a fully built scheduled job.
    ///
    /// A job with the same id replaces the previous registration.
    pub fn register_scheduled(&self, job: ScheduledJob, handler: Handler) -> ScheduledJob {
        let mut state = self.state();
        state.handlers.insert(job.target.clone(), handler);

        match state.scheduled.insert(job.job_id.clone(), job.clone()) {
            Some(previous) if previous != job => {
                tracing::warn!(
                    job_id = %job.job_id,
                    previous = %previous.trigger,
                    current = %job.trigger,
                    "scheduled job re-registered with different parameters, replacing"
                );
            }
            Some(_) => tracing::debug!(job_id = %job.job_id, "scheduled job re-registered"),
            None => tracing::debug!(job_id = %job.job_id, trigger = %job.trigger, "registered scheduled job"),
        }

        job
    }

    /// Register a queue type.
    ///
    /// `max_concurrent` is clamped to at least 1. A queue with the same name
    /// replaces the previous registration.
    pub fn register_queued_job(
        &self,
        target: JobTarget,
        handler: Handler,
        queue_name: QueueName,
        max_concurrent: usize,
        enabled: bool,
    ) -> QueuedJobType {
        if max_concurrent == 0 {
            tracing::warn!(queue = %queue_name, "max_concurrent of 0 raised to 1");
        }

        let queued = QueuedJobType {
            queue_name,
            target,
            max_concurrent: max_concurrent.max(1),
            enabled,
        };

        let mut state = self.state();
        state.handlers.insert(queued.target.clone(), handler);

        match state
            .queued
            .insert(queued.queue_name.clone(), queued.clone())
        {
            Some(previous) if previous != queued => {
                tracing::warn!(
                    queue = %queued.queue_name,
                    "queue re-registered with different parameters, replacing"
                );
            }
            Some(_) => tracing::debug!(queue = %queued.queue_name, "queue re-registered"),
            None => tracing::debug!(
                queue = %queued.queue_name,
                max_concurrent = queued.max_concurrent,
                "registered queue"
            ),
        }

        queued
    }

    /// Snapshot of all scheduled jobs.
    pub fn get_scheduled_jobs(&self) -> HashMap<JobId, ScheduledJob> {
        self.state().scheduled.clone()
    }

    /// Snapshot of all queue types.
    pub fn get_queued_jobs(&self) -> HashMap<QueueName, QueuedJobType> {
        self.state().queued.clone()
    }

    /// Snapshot of a single queue type.
    pub fn get_queued_job(&self, queue_name: &QueueName) -> Option<QueuedJobType> {
        self.state().queued.get(queue_name).cloned()
    }

    /// Sorted names of all registered queues.
    pub fn list_queue_names(&self) -> Vec<QueueName> {
        let mut names: Vec<QueueName> = self.state().queued.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve a target to its handler.
    pub fn handler(&self, target: &JobTarget) -> Option<Handler> {
        self.state().handlers.get(target).cloned()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Registry")
            .field("environment", &self.environment)
            .field("scheduled", &state.scheduled.len())
            .field("queued", &state.queued.len())
            .field("handlers", &state.handlers.len())
            .finish()
    }
}
