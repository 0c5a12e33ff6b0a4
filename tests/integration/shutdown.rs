//! Graceful shutdown integration tests.
//!
//! Tests that verify the scheduler waits for running scheduled and queued
//! jobs before exiting, and that repeated shutdowns are harmless.

use cadence::testing::{CallRecorder, RecordingHandler};
use cadence::{
    EventBus, EventKind, InMemoryStorage, JobKwargs, JobSpec, JobTarget, LocalSchedulerManager,
    QueueName, SchedulerError, SchedulerManager, declare,
};
use std::sync::Arc;
use std::time::Duration;

use crate::common;

#[tokio::test]
async fn test_shutdown_waits_for_running_scheduled_job() {
    let registry = common::registry();
    let recorder = CallRecorder::with_delay(Duration::from_millis(300));
    declare::interval()
        .seconds(0.1)
        .register(&registry, "services.stats:update_site_stats", recorder.handler())
        .unwrap();

    let events = Arc::new(EventBus::new());
    let recording = RecordingHandler::new();
    events.register(recording.clone()).await;

    let manager = LocalSchedulerManager::new(
        common::local_config(),
        Arc::new(registry),
        Arc::new(InMemoryStorage::new()),
    )
    .with_event_bus(events);
    manager.start().await.unwrap();
    assert!(recorder.wait_for_calls(1, Duration::from_secs(1)).await);

    manager.shutdown().await.unwrap();

    assert!(!recorder.finished().is_empty(), "shutdown returned before the job finished");
    assert!(recording.count(EventKind::JobExecuted).await >= 1);
    assert_eq!(recording.count(EventKind::SchedulerShutdown).await, 1);
}

#[tokio::test]
async fn test_shutdown_waits_for_running_queued_job() {
    let registry = common::registry();
    let recorder = CallRecorder::with_delay(Duration::from_millis(300));
    declare::queue()
        .register(&registry, "services.webseeds:validate", recorder.handler())
        .unwrap();

    let manager = LocalSchedulerManager::new(
        common::local_config(),
        Arc::new(registry),
        Arc::new(InMemoryStorage::new()),
    );
    manager.start().await.unwrap();
    let api = manager.get_scheduler().await.unwrap();
    api.queue_job(&QueueName::new("validate"), vec![], JobKwargs::new())
        .await
        .unwrap();
    assert!(recorder.wait_for_calls(1, Duration::from_secs(1)).await);

    manager.shutdown().await.unwrap();
    assert_eq!(recorder.finished().len(), 1);
}

#[tokio::test]
async fn test_double_shutdown_then_reacquire() {
    let storage = Arc::new(InMemoryStorage::new());
    let registry = Arc::new(common::registry());

    let first = LocalSchedulerManager::new(
        common::local_config(),
        Arc::clone(&registry),
        storage.clone(),
    );
    assert!(first.start().await.unwrap());
    assert!(first.is_running().await);
    let api = first.get_scheduler().await.unwrap();

    first.shutdown().await.unwrap();
    first.shutdown().await.unwrap();
    assert!(!first.is_running().await);
    assert!(!first.guard().is_held());

    let target = JobTarget::parse("services.stats:update_site_stats").unwrap();
    let result = api.add_job(JobSpec::new(target)).await;
    assert!(matches!(result, Err(SchedulerError::NotRunning)));

    let second = LocalSchedulerManager::new(common::local_config(), registry, storage);
    assert!(second.start().await.unwrap());
    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_without_start_is_a_no_op() {
    let manager = LocalSchedulerManager::new(
        common::local_config(),
        Arc::new(common::registry()),
        Arc::new(InMemoryStorage::new()),
    );
    manager.shutdown().await.unwrap();
    assert!(!manager.is_running().await);
}
