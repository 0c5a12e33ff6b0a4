//! Testing utilities for users of the cadence library.
//!
//! This module provides helpers for testing scheduled and queued jobs:
//!
//! - [`RecordingHandler`]: an event handler that keeps every event it sees
//! - [`CallRecorder`]: a job callable that records its invocations
//! - [`FailingJob`]: a job callable that fails N times then succeeds
//! - [`panicking_handler`]: a job callable that always panics

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, RwLock, Semaphore};
use tokio::time::Instant;

use crate::core::handler::{Handler, JobCall, JobError, JobHandler};
use crate::core::types::JobId;
use crate::events::{Event, EventHandler, EventKind};

/// Event handler that records every event for later assertions.
#[derive(Default)]
pub struct RecordingHandler {
    events: RwLock<Vec<Event>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All recorded events, oldest first.
    pub async fn events(&self) -> Vec<Event> {
        self.events.read().await.clone()
    }

    /// Recorded events of one kind.
    pub async fn of_kind(&self, kind: EventKind) -> Vec<Event> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }

    pub async fn count(&self, kind: EventKind) -> usize {
        self.of_kind(kind).await.len()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) {
        self.events.write().await.push(event.clone());
    }
}

/// A job callable that records each call.
///
/// Calls can be made to take a while with [`CallRecorder::with_delay`], or
/// to block until released with [`CallRecorder::gated`]. A gated call
/// finishes once it takes a permit from the gate, so `add_permits(1)`
/// releases exactly one call.
pub struct CallRecorder {
    calls: Mutex<Vec<JobCall>>,
    finished: Mutex<Vec<JobId>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Option<Duration>,
    gate: Option<Arc<Semaphore>>,
    changed: Notify,
}

impl CallRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None, None))
    }

    /// Each call sleeps for `delay` before finishing.
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self::build(Some(delay), None))
    }

    /// Each call waits for a permit from `gate` before finishing.
    pub fn gated(gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self::build(None, Some(gate)))
    }

    fn build(delay: Option<Duration>, gate: Option<Arc<Semaphore>>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            delay,
            gate,
            changed: Notify::new(),
        }
    }

    /// A [`Handler`] that runs this recorder.
    pub fn handler(self: &Arc<Self>) -> Handler {
        Handler::from(Arc::clone(self))
    }

    /// Calls that have started, in start order.
    pub fn calls(&self) -> Vec<JobCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Job ids of calls that have finished, in finish order.
    pub fn finished(&self) -> Vec<JobId> {
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Highest number of calls that were running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` calls have started. Returns `false` on
    /// timeout.
    pub async fn wait_for_calls(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.call_count() >= count)
            .await
    }

    /// Wait until at least `count` calls have finished. Returns `false` on
    /// timeout.
    pub async fn wait_for_finished(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.finished().len() >= count)
            .await
    }

    async fn wait_until(&self, timeout: Duration, done: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let changed = self.changed.notified();
            if done() {
                return true;
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return done();
            }
        }
    }
}

#[async_trait]
impl JobHandler for CallRecorder {
    async fn call(&self, call: JobCall) -> Result<(), JobError> {
        let job_id = call.job_id.clone();
        let now_running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_running, Ordering::SeqCst);
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
        self.changed.notify_waiters();

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(gate) = &self.gate {
            // A closed gate lets every call through.
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(job_id);
        self.changed.notify_waiters();
        Ok(())
    }
}

/// A job callable that fails a configurable number of times before
/// succeeding.
pub struct FailingJob {
    failures_remaining: AtomicUsize,
    attempts: AtomicUsize,
}

impl FailingJob {
    /// Fail the first `failures` calls.
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures_remaining: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        })
    }

    /// Fail every call.
    pub fn always() -> Arc<Self> {
        Self::new(usize::MAX)
    }

    pub fn handler(self: &Arc<Self>) -> Handler {
        Handler::from(Arc::clone(self))
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for FailingJob {
    async fn call(&self, call: JobCall) -> Result<(), JobError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(JobError::ExecutionFailed(format!(
                "{} failed on purpose",
                call.job_id
            )));
        }
        Ok(())
    }
}

/// A job callable that always panics.
pub fn panicking_handler() -> Handler {
    Handler::blocking(|call: JobCall| -> Result<(), JobError> {
        panic!("{} panicked on purpose", call.job_id)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;

    fn call(id: &str) -> JobCall {
        JobCall {
            job_id: JobId::new(id),
            args: Vec::new(),
            kwargs: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_recording_handler_records_events() {
        let bus = EventBus::new();
        let recorder = RecordingHandler::new();
        bus.register(recorder.clone()).await;

        bus.emit(Event::scheduler_started()).await;
        bus.emit(Event::job_added(JobId::new("a"))).await;

        assert_eq!(recorder.events().await.len(), 2);
        assert_eq!(recorder.count(EventKind::JobAdded).await, 1);
    }

    #[tokio::test]
    async fn test_call_recorder_counts_calls() {
        let recorder = CallRecorder::new();
        let handler = recorder.handler();

        handler.invoke(call("a")).await.unwrap();
        handler.invoke(call("b")).await.unwrap();

        assert_eq!(recorder.call_count(), 2);
        assert_eq!(recorder.finished(), vec![JobId::new("a"), JobId::new("b")]);
        assert_eq!(recorder.max_in_flight(), 1);
        assert!(recorder.wait_for_finished(2, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_gated_recorder_waits_for_release() {
        let gate = Arc::new(Semaphore::new(0));
        let recorder = CallRecorder::gated(Arc::clone(&gate));
        let handler = recorder.handler();

        let run = tokio::spawn(async move { handler.invoke(call("a")).await });
        assert!(recorder.wait_for_calls(1, Duration::from_secs(1)).await);
        assert!(recorder.finished().is_empty());

        gate.add_permits(1);
        run.await.unwrap().unwrap();
        assert_eq!(recorder.finished().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_job_fails_then_succeeds() {
        let job = FailingJob::new(2);
        let handler = job.handler();

        assert!(handler.invoke(call("a")).await.is_err());
        assert!(handler.invoke(call("a")).await.is_err());
        assert!(handler.invoke(call("a")).await.is_ok());
        assert_eq!(job.attempts(), 3);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let result = panicking_handler().invoke(call("boom")).await;
        assert!(matches!(result, Err(JobError::Panicked(_))));
    }
}
