//! Scheduler handle for controlling the scheduler.
//!
//! This module provides the `SchedulerHandle` type that allows in-process
//! control of the scheduler. Job table changes travel over the command
//! channel to the scheduler loop; queue operations go straight to the
//! shared [`QueueSet`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, oneshot};

use super::api::SchedulerApi;
use super::types::{QueueResult, SchedulerCommand, SchedulerError, SchedulerState};
use crate::core::job::{JobArgs, JobKwargs, JobSpec};
use crate::core::snapshot::JobSnapshot;
use crate::core::types::{JobId, QueueName};
use crate::events::{Event, EventBus, EventKind};
use crate::queue::{QueueSet, SubmitOutcome};
use crate::registry::Registry;

/// Buffer size for the command channel between SchedulerHandle and Scheduler.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Handle for controlling the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    pub(crate) command_tx: mpsc::Sender<SchedulerCommand>,
    pub(crate) state: Arc<RwLock<SchedulerState>>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) queues: Arc<QueueSet>,
    pub(crate) events: Arc<EventBus>,
}

impl SchedulerHandle {
    /// Helper to send a command and wait for its response.
    async fn request<T>(
        &self,
        build_command: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand,
        operation: &str,
    ) -> Result<T, SchedulerError>
    where
        T: Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| SchedulerError::NotRunning)?;

        response_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!("failed to receive {} response", operation))
        })
    }

    /// Pause the scheduler.
    ///
    /// While paused, scheduled jobs are not fired. Queues keep running.
    pub async fn pause(&self) -> Result<(), SchedulerError> {
        self.request(|response| SchedulerCommand::Pause { response }, "pause")
            .await
    }

    /// Resume the scheduler after being paused.
    pub async fn resume(&self) -> Result<(), SchedulerError> {
        self.request(|response| SchedulerCommand::Resume { response }, "resume")
            .await
    }

    /// Get the current scheduler state.
    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }

    /// Check if the scheduler is running.
    pub async fn is_running(&self) -> bool {
        *self.state.read().await == SchedulerState::Running
    }

    /// Check if the scheduler is paused.
    pub async fn is_paused(&self) -> bool {
        *self.state.read().await == SchedulerState::Paused
    }

    /// The event bus this scheduler emits on.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// The queues this scheduler serves.
    pub fn queues(&self) -> &Arc<QueueSet> {
        &self.queues
    }
}

#[async_trait]
impl SchedulerApi for SchedulerHandle {
    async fn add_job(&self, spec: JobSpec) -> Result<JobSnapshot, SchedulerError> {
        self.request(
            |response| SchedulerCommand::AddJob { spec, response },
            "add_job",
        )
        .await?
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<JobSnapshot>, SchedulerError> {
        let job_id = job_id.clone();
        self.request(
            |response| SchedulerCommand::GetJob { job_id, response },
            "get_job",
        )
        .await
    }

    async fn get_jobs(&self) -> Result<Vec<JobSnapshot>, SchedulerError> {
        self.request(|response| SchedulerCommand::GetJobs { response }, "get_jobs")
            .await
    }

    async fn remove_job(&self, job_id: &JobId) -> Result<(), SchedulerError> {
        let job_id = job_id.clone();
        self.request(
            |response| SchedulerCommand::RemoveJob { job_id, response },
            "remove_job",
        )
        .await?
    }

    async fn remove_all_jobs(&self) -> Result<(), SchedulerError> {
        self.request(
            |response| SchedulerCommand::RemoveAllJobs { response },
            "remove_all_jobs",
        )
        .await??;
        Ok(())
    }

    async fn queue_job(
        &self,
        queue_name: &QueueName,
        args: JobArgs,
        kwargs: JobKwargs,
    ) -> Result<QueueResult, SchedulerError> {
        let Some(queued) = self.registry.get_queued_job(queue_name) else {
            return Ok(QueueResult::rejected(format!("queue {queue_name} not found")));
        };
        if !queued.enabled {
            return Ok(QueueResult::rejected(format!("queue {queue_name} disabled")));
        }
        let Some(handler) = self.registry.handler(&queued.target) else {
            return Ok(QueueResult::rejected(format!(
                "no handler registered for {}",
                queued.target
            )));
        };

        let queue = match self.queues.get_or_create(&queued, handler) {
            Ok(queue) => queue,
            Err(e) => return Ok(QueueResult::rejected(e.to_string())),
        };
        match queue.submit(args, kwargs).await {
            Ok(SubmitOutcome::Duplicate(existing)) => Ok(QueueResult {
                success: true,
                message: Some("identical job already queued".into()),
                job: Some(existing),
            }),
            Ok(outcome) => Ok(QueueResult::submitted(outcome.into_snapshot())),
            Err(e) => Ok(QueueResult::rejected(e.to_string())),
        }
    }

    async fn get_queued_jobs(
        &self,
        queue_name: &QueueName,
    ) -> Result<HashMap<JobId, JobSnapshot>, SchedulerError> {
        Ok(self
            .queues
            .get(queue_name)
            .map(|queue| queue.snapshot())
            .unwrap_or_default())
    }

    async fn cancel_queued_job(
        &self,
        queue_name: &QueueName,
        job_id: &JobId,
    ) -> Result<bool, SchedulerError> {
        match self.queues.get(queue_name) {
            Some(queue) => Ok(queue.cancel(job_id).await),
            None => Ok(false),
        }
    }

    async fn await_event(
        &self,
        kind: EventKind,
        timeout: Duration,
    ) -> Result<Option<Event>, SchedulerError> {
        Ok(self.events.wait_for(kind, timeout).await)
    }

    /// Shutdown the scheduler. Calling it again after shutdown is a no-op.
    async fn shutdown(&self) -> Result<(), SchedulerError> {
        if self.state().await == SchedulerState::Stopped {
            return Ok(());
        }
        match self
            .request(
                |response| SchedulerCommand::Shutdown { response },
                "shutdown",
            )
            .await
        {
            // The loop may exit before answering a second, racing shutdown.
            Ok(()) | Err(SchedulerError::NotRunning | SchedulerError::ChannelError(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
