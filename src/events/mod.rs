//! Lifecycle events and event handling.
//!
//! The scheduler and its queues emit an [`Event`] for every job lifecycle
//! transition. Events are delivered to registered [`EventHandler`]s and
//! published on a broadcast channel, which backs [`EventBus::wait_for`] (the
//! `await_event` primitive exposed over RPC).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};
use tokio::time::Instant;

use crate::core::types::{JobId, QueueName};

const BROADCAST_CAPACITY: usize = 256;

/// Lifecycle events emitted by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    /// The scheduler loop started.
    SchedulerStarted { timestamp: DateTime<Utc> },

    /// The scheduler loop stopped.
    SchedulerShutdown { timestamp: DateTime<Utc> },

    /// A job was added to (or replaced in) the live scheduler.
    JobAdded {
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },

    /// A job was removed from the live scheduler.
    JobRemoved {
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },

    /// Every job was removed from the live scheduler.
    AllJobsRemoved { timestamp: DateTime<Utc> },

    /// A queued job is waiting for a free slot.
    JobQueued {
        job_id: JobId,
        queue: QueueName,
        timestamp: DateTime<Utc>,
    },

    /// A job was handed to an executor and is running.
    JobSubmitted {
        job_id: JobId,
        queue: Option<QueueName>,
        timestamp: DateTime<Utc>,
    },

    /// A job finished successfully.
    JobExecuted {
        job_id: JobId,
        queue: Option<QueueName>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A job body returned an error or panicked.
    JobError {
        job_id: JobId,
        queue: Option<QueueName>,
        error: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A queued job was removed before it started.
    JobCancelled {
        job_id: JobId,
        queue: QueueName,
        timestamp: DateTime<Utc>,
    },
}

/// Event kinds, used to select events in [`EventBus::wait_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SchedulerStarted,
    SchedulerShutdown,
    JobAdded,
    JobRemoved,
    AllJobsRemoved,
    JobQueued,
    JobSubmitted,
    JobExecuted,
    JobError,
    JobCancelled,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::SchedulerStarted => "scheduler_started",
            EventKind::SchedulerShutdown => "scheduler_shutdown",
            EventKind::JobAdded => "job_added",
            EventKind::JobRemoved => "job_removed",
            EventKind::AllJobsRemoved => "all_jobs_removed",
            EventKind::JobQueued => "job_queued",
            EventKind::JobSubmitted => "job_submitted",
            EventKind::JobExecuted => "job_executed",
            EventKind::JobError => "job_error",
            EventKind::JobCancelled => "job_cancelled",
        };
        f.write_str(s)
    }
}

impl Event {
    /// Get the kind of the event.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::SchedulerStarted { .. } => EventKind::SchedulerStarted,
            Event::SchedulerShutdown { .. } => EventKind::SchedulerShutdown,
            Event::JobAdded { .. } => EventKind::JobAdded,
            Event::JobRemoved { .. } => EventKind::JobRemoved,
            Event::AllJobsRemoved { .. } => EventKind::AllJobsRemoved,
            Event::JobQueued { .. } => EventKind::JobQueued,
            Event::JobSubmitted { .. } => EventKind::JobSubmitted,
            Event::JobExecuted { .. } => EventKind::JobExecuted,
            Event::JobError { .. } => EventKind::JobError,
            Event::JobCancelled { .. } => EventKind::JobCancelled,
        }
    }

    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::SchedulerStarted { timestamp }
            | Event::SchedulerShutdown { timestamp }
            | Event::JobAdded { timestamp, .. }
            | Event::JobRemoved { timestamp, .. }
            | Event::AllJobsRemoved { timestamp }
            | Event::JobQueued { timestamp, .. }
            | Event::JobSubmitted { timestamp, .. }
            | Event::JobExecuted { timestamp, .. }
            | Event::JobError { timestamp, .. }
            | Event::JobCancelled { timestamp, .. } => *timestamp,
        }
    }

    /// Get the job the event refers to, if any.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            Event::JobAdded { job_id, .. }
            | Event::JobRemoved { job_id, .. }
            | Event::JobQueued { job_id, .. }
            | Event::JobSubmitted { job_id, .. }
            | Event::JobExecuted { job_id, .. }
            | Event::JobError { job_id, .. }
            | Event::JobCancelled { job_id, .. } => Some(job_id),
            Event::SchedulerStarted { .. }
            | Event::SchedulerShutdown { .. }
            | Event::AllJobsRemoved { .. } => None,
        }
    }

    pub fn scheduler_started() -> Self {
        Event::SchedulerStarted {
            timestamp: Utc::now(),
        }
    }

    pub fn scheduler_shutdown() -> Self {
        Event::SchedulerShutdown {
            timestamp: Utc::now(),
        }
    }

    pub fn job_added(job_id: JobId) -> Self {
        Event::JobAdded {
            job_id,
            timestamp: Utc::now(),
        }
    }

    pub fn job_removed(job_id: JobId) -> Self {
        Event::JobRemoved {
            job_id,
            timestamp: Utc::now(),
        }
    }

    pub fn all_jobs_removed() -> Self {
        Event::AllJobsRemoved {
            timestamp: Utc::now(),
        }
    }

    pub fn job_queued(job_id: JobId, queue: QueueName) -> Self {
        Event::JobQueued {
            job_id,
            queue,
            timestamp: Utc::now(),
        }
    }

    pub fn job_submitted(job_id: JobId, queue: Option<QueueName>) -> Self {
        Event::JobSubmitted {
            job_id,
            queue,
            timestamp: Utc::now(),
        }
    }

    pub fn job_executed(job_id: JobId, queue: Option<QueueName>, duration: Duration) -> Self {
        Event::JobExecuted {
            job_id,
            queue,
            duration_ms: duration.as_millis() as u64,
            timestamp: Utc::now(),
        }
    }

    pub fn job_error(
        job_id: JobId,
        queue: Option<QueueName>,
        error: String,
        duration: Duration,
    ) -> Self {
        Event::JobError {
            job_id,
            queue,
            error,
            duration_ms: duration.as_millis() as u64,
            timestamp: Utc::now(),
        }
    }

    pub fn job_cancelled(job_id: JobId, queue: QueueName) -> Self {
        Event::JobCancelled {
            job_id,
            queue,
            timestamp: Utc::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers and waiters.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    waiters: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        let (waiters, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            handlers: RwLock::new(Vec::new()),
            waiters,
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers and waiters.
    pub async fn emit(&self, event: Event) {
        // No receivers is the normal case.
        let _ = self.waiters.send(event.clone());

        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Subscribe to every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.waiters.subscribe()
    }

    /// Wait for the next event of `kind`, up to `timeout`.
    ///
    /// Only events emitted after this call starts are considered.
    pub async fn wait_for(&self, kind: EventKind, timeout: Duration) -> Option<Event> {
        let mut rx = self.subscribe();
        wait_on(&mut rx, kind, timeout).await
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait on an existing subscription for the next event of `kind`.
pub async fn wait_on(
    rx: &mut broadcast::Receiver<Event>,
    kind: EventKind,
    timeout: Duration,
) -> Option<Event> {
    let deadline = Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(event)) if event.kind() == kind => return Some(event),
            Ok(Ok(_)) => continue,
            Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                tracing::debug!(skipped, "event waiter lagged behind");
                continue;
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => return None,
            Err(_) => return None,
        }
    }
}
