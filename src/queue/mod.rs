//! Bounded job queues.
//!
//! Each named queue runs ad-hoc instances of one job callable with at most
//! `max_concurrent` of them in flight. Submission never blocks the caller:
//! an instance either takes a free slot and starts immediately, or is
//! appended to the queue's FIFO. When an instance finishes, its completion
//! event is emitted and its permit is handed straight to the head of the
//! FIFO, so instances start and complete in submission order.
//!
//! Queue state lives in memory only. Instances that are still waiting when
//! the process stops are lost.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::handler::{Handler, JobCall};
use crate::core::job::{JobArgs, JobKwargs, QueuedJobType};
use crate::core::snapshot::JobSnapshot;
use crate::core::types::{JobId, JobTarget, QueueName};
use crate::events::{Event, EventBus};

/// Errors returned by queue operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue was closed by a scheduler shutdown.
    #[error("queue {0} is closed")]
    Closed(QueueName),
}

/// Lifecycle state of a queued job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Queued,
    Running,
    Completed,
}

/// One submission to a queue.
#[derive(Debug, Clone)]
pub struct QueuedJobInstance {
    pub job_id: JobId,
    pub queue_name: QueueName,
    pub target: JobTarget,
    pub args: JobArgs,
    pub kwargs: JobKwargs,
    pub state: InstanceState,
    pub submitted_at: DateTime<Utc>,
}

impl QueuedJobInstance {
    /// Plain-data view of the instance.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.job_id.clone(),
            func: self.target.to_string(),
            executor: self.queue_name.to_string(),
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
            name: Some(self.target.callable().to_string()),
            next_run_time: None,
        }
    }
}

/// Result of a submission.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// A slot was free and the instance is running.
    Started(JobSnapshot),
    /// Every slot is taken; the instance waits in the FIFO.
    Queued(JobSnapshot),
    /// An identical instance is already queued or running.
    Duplicate(JobSnapshot),
}

impl SubmitOutcome {
    pub fn snapshot(&self) -> &JobSnapshot {
        match self {
            SubmitOutcome::Started(s) | SubmitOutcome::Queued(s) | SubmitOutcome::Duplicate(s) => s,
        }
    }

    pub fn into_snapshot(self) -> JobSnapshot {
        match self {
            SubmitOutcome::Started(s) | SubmitOutcome::Queued(s) | SubmitOutcome::Duplicate(s) => s,
        }
    }
}

/// Counters for a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub completed: u64,
    pub max_concurrent: usize,
}

/// Content id of an instance: hex SHA-256 of its queue name and arguments.
///
/// Identical concurrent submissions share an id and are deduplicated.
pub fn instance_id(queue_name: &QueueName, args: &JobArgs, kwargs: &JobKwargs) -> JobId {
    let payload = serde_json::json!({
        "queue_name": queue_name,
        "args": args,
        "kwargs": kwargs,
    });
    let digest = Sha256::digest(payload.to_string().as_bytes());
    JobId::new(hex::encode(digest))
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueuedJobInstance>,
    running: HashMap<JobId, QueuedJobInstance>,
    completed: u64,
    /// Finished instances whose slot is not yet passed on.
    releasing: usize,
    closed: bool,
}

/// A named queue with bounded concurrency and FIFO overflow.
pub struct BoundedQueue {
    name: QueueName,
    target: JobTarget,
    max_concurrent: usize,
    handler: Handler,
    semaphore: Arc<Semaphore>,
    state: Mutex<QueueState>,
    events: Arc<EventBus>,
}

impl BoundedQueue {
    /// Create a queue for `queued`, running instances with `handler`.
    pub fn new(queued: &QueuedJobType, handler: Handler, events: Arc<EventBus>) -> Arc<Self> {
        let max_concurrent = queued.max_concurrent.max(1);
        Arc::new(Self {
            name: queued.queue_name.clone(),
            target: queued.target.clone(),
            max_concurrent,
            handler,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            state: Mutex::new(QueueState::default()),
            events,
        })
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submit an instance. Returns without waiting for it to run.
    pub async fn submit(
        self: &Arc<Self>,
        args: JobArgs,
        kwargs: JobKwargs,
    ) -> Result<SubmitOutcome, QueueError> {
        let job_id = instance_id(&self.name, &args, &kwargs);
        let instance = QueuedJobInstance {
            job_id: job_id.clone(),
            queue_name: self.name.clone(),
            target: self.target.clone(),
            args,
            kwargs,
            state: InstanceState::Queued,
            submitted_at: Utc::now(),
        };

        let outcome = {
            let mut state = self.state();
            if state.closed {
                return Err(QueueError::Closed(self.name.clone()));
            }

            let existing = state
                .running
                .get(&job_id)
                .or_else(|| state.pending.iter().find(|i| i.job_id == job_id));
            if let Some(existing) = existing {
                tracing::debug!(queue = %self.name, job_id = %job_id, "identical job already queued");
                return Ok(SubmitOutcome::Duplicate(existing.snapshot()));
            }

            match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => SubmitOutcome::Started(self.dispatch(&mut state, instance, permit)),
                Err(_) => {
                    let snapshot = instance.snapshot();
                    state.pending.push_back(instance);
                    SubmitOutcome::Queued(snapshot)
                }
            }
        };

        if let SubmitOutcome::Queued(_) = &outcome {
            tracing::debug!(queue = %self.name, job_id = %job_id, "all slots busy, job queued");
            self.events
                .emit(Event::job_queued(job_id, self.name.clone()))
                .await;
        }

        Ok(outcome)
    }

    /// Mark the instance running and spawn it. Called with the lock held.
    fn dispatch(
        self: &Arc<Self>,
        state: &mut QueueState,
        mut instance: QueuedJobInstance,
        permit: OwnedSemaphorePermit,
    ) -> JobSnapshot {
        instance.state = InstanceState::Running;
        let snapshot = instance.snapshot();
        let call = JobCall {
            job_id: instance.job_id.clone(),
            args: instance.args.clone(),
            kwargs: instance.kwargs.clone(),
        };
        state.running.insert(instance.job_id.clone(), instance);

        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.run(call, permit).await });

        snapshot
    }

    async fn run(self: Arc<Self>, call: JobCall, permit: OwnedSemaphorePermit) {
        let job_id = call.job_id.clone();
        self.events
            .emit(Event::job_submitted(job_id.clone(), Some(self.name.clone())))
            .await;

        tracing::info!(queue = %self.name, job_id = %job_id, "running job");
        let started = Instant::now();
        let result = self.handler.invoke(call).await;
        let elapsed = started.elapsed();

        self.release(&job_id);

        match result {
            Ok(()) => {
                tracing::info!(queue = %self.name, job_id = %job_id, ?elapsed, "completed job");
                self.events
                    .emit(Event::job_executed(job_id, Some(self.name.clone()), elapsed))
                    .await;
            }
            Err(e) => {
                tracing::error!(queue = %self.name, job_id = %job_id, error = %e, "job failed");
                self.events
                    .emit(Event::job_error(
                        job_id,
                        Some(self.name.clone()),
                        e.to_string(),
                        elapsed,
                    ))
                    .await;
            }
        }

        // The slot passes to the next instance only after the completion
        // event is out, so completion events follow dispatch order.
        self.dispatch_next(permit);
    }

    /// Drop a finished instance from the running set.
    fn release(&self, job_id: &JobId) {
        let mut state = self.state();
        if let Some(mut finished) = state.running.remove(job_id) {
            finished.state = InstanceState::Completed;
            state.completed += 1;
            state.releasing += 1;
            tracing::debug!(queue = %self.name, job_id = %finished.job_id, state = ?finished.state, "slot released");
        }
    }

    /// Hand a released slot to the head of the FIFO, or free it.
    fn dispatch_next(self: &Arc<Self>, permit: OwnedSemaphorePermit) {
        let mut state = self.state();
        state.releasing = state.releasing.saturating_sub(1);
        if state.closed {
            return;
        }
        if let Some(next) = state.pending.pop_front() {
            self.dispatch(&mut state, next, permit);
        }
    }

    /// Remove a waiting instance. Running instances cannot be cancelled.
    pub async fn cancel(&self, job_id: &JobId) -> bool {
        let removed = {
            let mut state = self.state();
            match state.pending.iter().position(|i| &i.job_id == job_id) {
                Some(index) => state.pending.remove(index).is_some(),
                None => false,
            }
        };

        if removed {
            tracing::info!(queue = %self.name, job_id = %job_id, "queued job cancelled");
            self.events
                .emit(Event::job_cancelled(job_id.clone(), self.name.clone()))
                .await;
        }
        removed
    }

    /// Snapshots of queued and running instances.
    pub fn snapshot(&self) -> HashMap<JobId, JobSnapshot> {
        let state = self.state();
        state
            .running
            .values()
            .chain(state.pending.iter())
            .map(|i| (i.job_id.clone(), i.snapshot()))
            .collect()
    }

    /// State of an instance that is still queued or running.
    pub fn instance_state(&self, job_id: &JobId) -> Option<InstanceState> {
        let state = self.state();
        if let Some(running) = state.running.get(job_id) {
            return Some(running.state);
        }
        state
            .pending
            .iter()
            .find(|i| &i.job_id == job_id)
            .map(|i| i.state)
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state();
        QueueStats {
            queued: state.pending.len(),
            running: state.running.len(),
            completed: state.completed,
            max_concurrent: self.max_concurrent,
        }
    }

    /// Running instances, counting finished ones still handing off their slot.
    pub fn running_count(&self) -> usize {
        let state = self.state();
        state.running.len() + state.releasing
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// Refuse new submissions and drop waiting instances.
    ///
    /// Returns the number of dropped instances. Running instances finish.
    pub fn close(&self) -> usize {
        let mut state = self.state();
        state.closed = true;
        let dropped = state.pending.len();
        state.pending.clear();
        if dropped > 0 {
            tracing::warn!(queue = %self.name, dropped, "queued jobs dropped on close");
        }
        dropped
    }
}

/// All queues of one scheduler.
pub struct QueueSet {
    table: RwLock<QueueTable>,
    events: Arc<EventBus>,
}

#[derive(Default)]
struct QueueTable {
    queues: HashMap<QueueName, Arc<BoundedQueue>>,
    closed: bool,
}

impl QueueSet {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            table: RwLock::new(QueueTable::default()),
            events,
        }
    }

    /// Get the queue for `queued`, creating it if needed.
    ///
    /// A queue keeps the `max_concurrent` it was created with. Once the set
    /// is closed no queue is created and every lookup fails.
    pub fn get_or_create(
        &self,
        queued: &QueuedJobType,
        handler: Handler,
    ) -> Result<Arc<BoundedQueue>, QueueError> {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if table.closed {
            return Err(QueueError::Closed(queued.queue_name.clone()));
        }
        let queue = table
            .queues
            .entry(queued.queue_name.clone())
            .or_insert_with(|| {
                tracing::debug!(
                    queue = %queued.queue_name,
                    max_concurrent = queued.max_concurrent,
                    "created queue"
                );
                BoundedQueue::new(queued, handler, Arc::clone(&self.events))
            });

        if queue.max_concurrent() != queued.max_concurrent.max(1) {
            tracing::debug!(
                queue = %queued.queue_name,
                current = queue.max_concurrent(),
                requested = queued.max_concurrent,
                "queue already created, keeping its concurrency"
            );
        }
        Ok(Arc::clone(queue))
    }

    pub fn is_closed(&self) -> bool {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    pub fn len(&self) -> usize {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .queues
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, name: &QueueName) -> Option<Arc<BoundedQueue>> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .queues
            .get(name)
            .cloned()
    }

    fn all(&self) -> Vec<Arc<BoundedQueue>> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .queues
            .values()
            .cloned()
            .collect()
    }

    /// Running instances across all queues.
    pub fn running_count(&self) -> usize {
        self.all().iter().map(|q| q.running_count()).sum()
    }

    /// Close every queue and refuse to create new ones.
    ///
    /// Returns the number of dropped instances.
    pub fn close_all(&self) -> usize {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        table.closed = true;
        table.queues.values().map(|q| q.close()).sum()
    }

    /// Wait until no instance is running, up to `timeout`.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.running_count() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }
}
