//! Scheduler engine implementation.
//!
//! The scheduler is responsible for:
//! - Firing jobs when their trigger comes due
//! - Keeping the job table in sync with storage
//! - Routing runs to its own tasks or to a named queue
//! - Pause and resume
//! - Graceful shutdown
//! - Event emission

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;

use super::handle::{COMMAND_CHANNEL_BUFFER, SchedulerHandle};
use super::types::{SchedulerCommand, SchedulerError, SchedulerState};
use crate::core::handler::{Handler, JobCall};
use crate::core::job::JobSpec;
use crate::core::snapshot::JobSnapshot;
use crate::core::trigger::{DateTrigger, Trigger};
use crate::core::types::{JobId, QueueName, RunId};
use crate::events::{Event, EventBus};
use crate::queue::{BoundedQueue, QueueSet};
use crate::registry::Registry;
use crate::storage::{Storage, StorageError, StoredJob};

type RunningJobs = Arc<RwLock<HashMap<RunId, (JobId, JoinHandle<()>)>>>;

/// Main scheduler for job execution.
pub struct Scheduler {
    /// Declarations and handler table.
    registry: Arc<Registry>,
    /// Storage backend.
    storage: Arc<dyn Storage>,
    /// Event bus for emitting events.
    event_bus: Arc<EventBus>,
    /// Named queues. Registered queue types get one each on start.
    queues: Option<Arc<QueueSet>>,
    /// Longest the loop sleeps without re-checking triggers.
    tick_interval: Duration,
    /// Graceful shutdown timeout (default: 30 seconds).
    shutdown_timeout: Duration,
    /// Live job table, mirrored to storage.
    jobs: HashMap<JobId, StoredJob>,
    /// Runs spawned by the scheduler itself (not queue instances).
    running_jobs: RunningJobs,
}

impl Scheduler {
    /// Create a new scheduler resolving handlers through `registry`.
    pub fn new(registry: Arc<Registry>, storage: Arc<dyn Storage>) -> Self {
        Self {
            registry,
            storage,
            event_bus: Arc::new(EventBus::new()),
            queues: None,
            tick_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            jobs: HashMap::new(),
            running_jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Set the tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Serve queues from an existing set.
    pub fn with_queues(mut self, queues: Arc<QueueSet>) -> Self {
        self.queues = Some(queues);
        self
    }

    /// Get the event bus.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Load persisted jobs, start the loop and return a handle for it.
    pub async fn start(mut self) -> Result<(SchedulerHandle, JoinHandle<()>), SchedulerError> {
        self.load_jobs().await?;

        let queues = match &self.queues {
            Some(queues) => Arc::clone(queues),
            None => {
                let queues = Arc::new(QueueSet::new(Arc::clone(&self.event_bus)));
                self.queues = Some(Arc::clone(&queues));
                queues
            }
        };
        self.create_registered_queues(&queues);

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let state = Arc::new(RwLock::new(SchedulerState::Running));

        let handle = SchedulerHandle {
            command_tx,
            state: Arc::clone(&state),
            registry: Arc::clone(&self.registry),
            queues,
            events: Arc::clone(&self.event_bus),
        };

        tracing::info!(jobs = self.jobs.len(), "scheduler started");
        self.event_bus.emit(Event::scheduler_started()).await;

        let scheduler_task = tokio::spawn(async move {
            self.run(command_rx, state).await;
        });

        Ok((handle, scheduler_task))
    }

    /// Load the job table from storage.
    ///
    /// A job whose run time passed while no scheduler was running keeps that
    /// time, so it fires once on the first wakeup.
    async fn load_jobs(&mut self) -> Result<(), SchedulerError> {
        let now = Utc::now();
        for job in self.storage.list_jobs().await? {
            if job.next_run_time.is_some_and(|t| t < now) {
                tracing::info!(
                    job_id = %job.id,
                    next_run_time = ?job.next_run_time,
                    "run time missed while stopped, running once"
                );
            }
            self.jobs.insert(job.id.clone(), job);
        }
        Ok(())
    }

    /// Main scheduler loop.
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<SchedulerCommand>,
        state: Arc<RwLock<SchedulerState>>,
    ) {
        loop {
            let current_state = *state.read().await;
            let wait = self.time_until_wakeup(current_state, Utc::now());

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    if *state.read().await == SchedulerState::Running {
                        self.process_due_jobs().await;
                    }

                    // Clean up finished job handles
                    self.cleanup_finished_jobs().await;
                }

                Some(command) = command_rx.recv() => {
                    if !self.handle_command(command, &state).await {
                        break;
                    }
                }
            }
        }
    }

    /// Time until the earliest due job, capped at the tick interval.
    fn time_until_wakeup(&self, state: SchedulerState, now: DateTime<Utc>) -> Duration {
        if state != SchedulerState::Running {
            return self.tick_interval;
        }
        self.jobs
            .values()
            .filter_map(|job| job.next_run_time)
            .min()
            .map(|next| (next - now).to_std().unwrap_or(Duration::ZERO))
            .map_or(self.tick_interval, |until| until.min(self.tick_interval))
    }

    /// Apply one command. Returns `false` once the loop should stop.
    async fn handle_command(
        &mut self,
        command: SchedulerCommand,
        state: &Arc<RwLock<SchedulerState>>,
    ) -> bool {
        match command {
            SchedulerCommand::AddJob { spec, response } => {
                let result = self.add_job(spec).await;
                let _ = response.send(result);
            }
            SchedulerCommand::GetJob { job_id, response } => {
                let _ = response.send(self.jobs.get(&job_id).map(StoredJob::snapshot));
            }
            SchedulerCommand::GetJobs { response } => {
                let _ = response.send(self.snapshots());
            }
            SchedulerCommand::RemoveJob { job_id, response } => {
                let result = self.remove_job(&job_id).await;
                let _ = response.send(result);
            }
            SchedulerCommand::RemoveAllJobs { response } => {
                let result = self.remove_all_jobs().await;
                let _ = response.send(result);
            }
            SchedulerCommand::Pause { response } => {
                *state.write().await = SchedulerState::Paused;
                tracing::info!("scheduler paused");
                let _ = response.send(());
            }
            SchedulerCommand::Resume { response } => {
                *state.write().await = SchedulerState::Running;
                tracing::info!("scheduler resumed");
                let _ = response.send(());
            }
            SchedulerCommand::Shutdown { response } => {
                let mut s = state.write().await;
                *s = SchedulerState::Stopped;
                drop(s); // Release the lock before waiting

                self.await_running_jobs().await;
                if let Some(queues) = &self.queues {
                    queues.close_all();
                }

                tracing::info!("scheduler shut down");
                self.event_bus.emit(Event::scheduler_shutdown()).await;
                let _ = response.send(());
                return false;
            }
        }
        true
    }

    /// Jobs ordered by next run time, paused or exhausted jobs last.
    fn snapshots(&self) -> Vec<JobSnapshot> {
        let mut jobs: Vec<&StoredJob> = self.jobs.values().collect();
        jobs.sort_by(|a, b| {
            (a.next_run_time.is_none(), a.next_run_time, &a.id).cmp(&(
                b.next_run_time.is_none(),
                b.next_run_time,
                &b.id,
            ))
        });
        jobs.into_iter().map(StoredJob::snapshot).collect()
    }

    async fn add_job(&mut self, spec: JobSpec) -> Result<JobSnapshot, SchedulerError> {
        let job_id = spec.resolved_id();
        let existing = self.jobs.get(&job_id);
        if existing.is_some() && !spec.replace_existing {
            return Err(SchedulerError::ConflictingJobId(job_id));
        }

        if let Some(queue_name) = &spec.executor {
            let queued = self.registry.get_queued_job(queue_name).ok_or_else(|| {
                SchedulerError::InvalidJob(format!("queue {queue_name} not found"))
            })?;
            if queued.target != spec.target {
                return Err(SchedulerError::InvalidJob(format!(
                    "queue {queue_name} runs {}, not {}",
                    queued.target, spec.target
                )));
            }
        }

        let now = Utc::now();
        let trigger = spec
            .trigger
            .unwrap_or_else(|| Trigger::Date(DateTrigger::new(now)));
        trigger.validate()?;

        // Re-adding an unchanged trigger keeps the pending fire time, so a
        // restart does not push the next run back.
        let next_run_time = match existing {
            Some(current) if current.trigger == trigger && current.next_run_time.is_some() => {
                current.next_run_time
            }
            _ => trigger.first_fire_time(now)?,
        };
        if next_run_time.is_none() {
            return Err(SchedulerError::InvalidJob(format!(
                "trigger {trigger} never fires"
            )));
        }

        let job = StoredJob {
            id: job_id.clone(),
            name: spec.name.or_else(|| Some(spec.target.callable().to_string())),
            target: spec.target,
            trigger,
            args: spec.args,
            kwargs: spec.kwargs,
            executor: spec.executor,
            next_run_time,
            created_at: existing.map_or(now, |current| current.created_at),
            updated_at: now,
        };

        if self.registry.handler(&job.target).is_none() {
            tracing::warn!(job_id = %job_id, target = %job.target, "no handler registered for target");
        }

        self.storage.upsert_job(job.clone()).await?;
        tracing::info!(
            job_id = %job_id,
            trigger = %job.trigger,
            next_run_time = ?job.next_run_time,
            "added job"
        );
        let snapshot = job.snapshot();
        self.jobs.insert(job_id.clone(), job);
        self.event_bus.emit(Event::job_added(job_id)).await;
        Ok(snapshot)
    }

    async fn remove_job(&mut self, job_id: &JobId) -> Result<(), SchedulerError> {
        if self.jobs.remove(job_id).is_none() {
            return Err(SchedulerError::JobNotFound(job_id.clone()));
        }
        self.delete_stored(job_id).await?;
        tracing::info!(job_id = %job_id, "removed job");
        self.event_bus.emit(Event::job_removed(job_id.clone())).await;
        Ok(())
    }

    async fn remove_all_jobs(&mut self) -> Result<usize, SchedulerError> {
        let removed = self.storage.delete_all_jobs().await?;
        let removed = removed.max(self.jobs.len());
        self.jobs.clear();
        tracing::info!(removed, "removed all jobs");
        self.event_bus.emit(Event::all_jobs_removed()).await;
        Ok(removed)
    }

    async fn delete_stored(&self, job_id: &JobId) -> Result<(), SchedulerError> {
        match self.storage.delete_job(job_id).await {
            Ok(()) | Err(StorageError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Fire every job whose run time has come.
    async fn process_due_jobs(&mut self) {
        let now = Utc::now();
        let mut due: Vec<(DateTime<Utc>, JobId)> = self
            .jobs
            .values()
            .filter_map(|job| match job.next_run_time {
                Some(t) if t <= now => Some((t, job.id.clone())),
                _ => None,
            })
            .collect();
        due.sort();

        for (scheduled, job_id) in due {
            self.fire(&job_id, scheduled).await;
        }
    }

    /// Run a job once and move it to its next fire time.
    async fn fire(&mut self, job_id: &JobId, scheduled: DateTime<Utc>) {
        let Some(job) = self.jobs.get(job_id).cloned() else {
            return;
        };

        let lateness = Utc::now() - scheduled;
        if lateness > chrono::TimeDelta::from_std(self.tick_interval).unwrap_or_default() {
            tracing::debug!(job_id = %job_id, lateness_ms = lateness.num_milliseconds(), "job fired late");
        }

        match &job.executor {
            Some(queue_name) => self.submit_to_queue(&job, queue_name).await,
            None => self.spawn_run(&job).await,
        }

        let next = match job.trigger.next_fire_time(scheduled, Utc::now()) {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "cannot compute next fire time");
                None
            }
        };

        match next {
            Some(next) => {
                if let Some(entry) = self.jobs.get_mut(job_id) {
                    entry.next_run_time = Some(next);
                    entry.updated_at = Utc::now();
                }
                if let Err(e) = self.storage.update_next_run_time(job_id, Some(next)).await {
                    tracing::warn!(job_id = %job_id, error = %e, "failed to persist next run time");
                }
            }
            None => {
                self.jobs.remove(job_id);
                if let Err(e) = self.delete_stored(job_id).await {
                    tracing::warn!(job_id = %job_id, error = %e, "failed to delete finished job");
                }
                tracing::info!(job_id = %job_id, "job has no more run times, removed");
                self.event_bus.emit(Event::job_removed(job_id.clone())).await;
            }
        }
    }

    /// Spawn a run of `job` on its own task.
    ///
    /// A run that is still going when the next one is due does not hold the
    /// next one back.
    async fn spawn_run(&self, job: &StoredJob) {
        let Some(handler) = self.registry.handler(&job.target) else {
            let message = format!("no handler registered for {}", job.target);
            tracing::error!(job_id = %job.id, error = %message, "job failed");
            self.event_bus
                .emit(Event::job_error(job.id.clone(), None, message, Duration::ZERO))
                .await;
            return;
        };

        let in_progress = self.count_running_for_job(&job.id).await;
        if in_progress > 0 {
            tracing::warn!(job_id = %job.id, in_progress, "previous run still in progress, starting another");
        }

        let run_id = RunId::new();
        let call = JobCall {
            job_id: job.id.clone(),
            args: job.args.clone(),
            kwargs: job.kwargs.clone(),
        };
        let event_bus = Arc::clone(&self.event_bus);
        let running_jobs = Arc::clone(&self.running_jobs);

        let handle = tokio::spawn(execute(handler, call, run_id, event_bus, running_jobs));

        // Track the running job
        self.running_jobs
            .write()
            .await
            .insert(run_id, (job.id.clone(), handle));
    }

    async fn submit_to_queue(&self, job: &StoredJob, queue_name: &QueueName) {
        let result = match self.queue(queue_name) {
            Some(queue) => queue
                .submit(job.args.clone(), job.kwargs.clone())
                .await
                .map_err(|e| e.to_string()),
            None => Err(format!("queue {queue_name} not available")),
        };

        match result {
            Ok(outcome) => {
                tracing::debug!(job_id = %job.id, queue = %queue_name, instance = %outcome.snapshot().id, "submitted scheduled run to queue");
            }
            Err(message) => {
                tracing::error!(job_id = %job.id, queue = %queue_name, error = %message, "job failed");
                self.event_bus
                    .emit(Event::job_error(
                        job.id.clone(),
                        Some(queue_name.clone()),
                        message,
                        Duration::ZERO,
                    ))
                    .await;
            }
        }
    }

    fn queue(&self, queue_name: &QueueName) -> Option<Arc<BoundedQueue>> {
        let queues = self.queues.as_ref()?;
        let queued = self.registry.get_queued_job(queue_name)?;
        if !queued.enabled {
            return None;
        }
        let handler = self.registry.handler(&queued.target)?;
        queues.get_or_create(&queued, handler).ok()
    }

    /// Create one queue per enabled registered queue type.
    fn create_registered_queues(&self, queues: &QueueSet) {
        for queued in self.registry.get_queued_jobs().into_values() {
            if !queued.enabled {
                continue;
            }
            let Some(handler) = self.registry.handler(&queued.target) else {
                tracing::warn!(queue = %queued.queue_name, target = %queued.target, "no handler registered for queue");
                continue;
            };
            if let Err(e) = queues.get_or_create(&queued, handler) {
                tracing::warn!(queue = %queued.queue_name, error = %e, "cannot create queue");
            }
        }
    }

    /// Count running instances of a specific job.
    async fn count_running_for_job(&self, job_id: &JobId) -> usize {
        let running = self.running_jobs.read().await;
        running
            .values()
            .filter(|(jid, handle)| jid == job_id && !handle.is_finished())
            .count()
    }

    /// Clean up finished job handles.
    async fn cleanup_finished_jobs(&self) {
        let mut running = self.running_jobs.write().await;
        running.retain(|_, (_, handle)| !handle.is_finished());
    }

    /// Wait for running jobs and queue instances, up to the shutdown timeout.
    async fn await_running_jobs(&self) {
        let running_count = self.running_jobs.read().await.len()
            + self.queues.as_ref().map_or(0, |q| q.running_count());

        if running_count == 0 {
            tracing::info!("no running jobs to wait for during shutdown");
            return;
        }

        tracing::info!(
            running = running_count,
            timeout = ?self.shutdown_timeout,
            "graceful shutdown: waiting for running jobs"
        );

        let start = tokio::time::Instant::now();
        let deadline = start + self.shutdown_timeout;

        loop {
            let mut running = self.running_jobs.write().await;
            running.retain(|_, (_, handle)| !handle.is_finished());
            let remaining =
                running.len() + self.queues.as_ref().map_or(0, |q| q.running_count());
            drop(running);

            if remaining == 0 {
                tracing::info!(elapsed = ?start.elapsed(), "all running jobs completed");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    remaining,
                    timeout = ?self.shutdown_timeout,
                    "graceful shutdown timeout exceeded with jobs still running"
                );
                break;
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Body of one scheduler-owned run.
async fn execute(
    handler: Handler,
    call: JobCall,
    run_id: RunId,
    event_bus: Arc<EventBus>,
    running_jobs: RunningJobs,
) {
    let job_id = call.job_id.clone();
    event_bus
        .emit(Event::job_submitted(job_id.clone(), None))
        .await;

    tracing::info!(job_id = %job_id, run_id = %run_id, "running job");
    let started = Instant::now();
    let result = handler.invoke(call).await;
    let elapsed = started.elapsed();

    match result {
        Ok(()) => {
            tracing::info!(job_id = %job_id, run_id = %run_id, ?elapsed, "completed job");
            event_bus
                .emit(Event::job_executed(job_id, None, elapsed))
                .await;
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, run_id = %run_id, error = %e, "job failed");
            event_bus
                .emit(Event::job_error(job_id, None, e.to_string(), elapsed))
                .await;
        }
    }

    running_jobs.write().await.remove(&run_id);
}
