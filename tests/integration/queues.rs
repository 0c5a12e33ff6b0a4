//! Bounded queue integration tests.

use cadence::testing::CallRecorder;
use cadence::{
    InMemoryStorage, JobKwargs, LocalSchedulerManager, QueueName, Registry, SchedulerManager,
    declare,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::common;

fn manager(registry: Registry) -> LocalSchedulerManager {
    LocalSchedulerManager::new(
        common::local_config(),
        Arc::new(registry),
        Arc::new(InMemoryStorage::new()),
    )
}

#[tokio::test]
async fn test_single_slot_queue_runs_in_submission_order() {
    let registry = common::registry();
    let recorder = CallRecorder::with_delay(Duration::from_millis(30));
    declare::queue()
        .max_concurrent(1)
        .register(&registry, "services.webseeds:validate", recorder.handler())
        .unwrap();

    let manager = manager(registry);
    manager.start().await.unwrap();
    let api = manager.get_scheduler().await.unwrap();
    let queue = QueueName::new("validate");

    let mut submitted = Vec::new();
    for url in ["http://a.example", "http://b.example", "http://c.example"] {
        let result = api
            .queue_job(&queue, vec![json!(url)], JobKwargs::new())
            .await
            .unwrap();
        assert!(result.success);
        submitted.push(result.job.unwrap().id);
    }

    assert!(recorder.wait_for_finished(3, Duration::from_secs(2)).await);
    assert_eq!(recorder.finished(), submitted);
    assert_eq!(recorder.max_in_flight(), 1);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_identical_submission_is_deduplicated() {
    let registry = common::registry();
    let gate = Arc::new(Semaphore::new(0));
    let recorder = CallRecorder::gated(Arc::clone(&gate));
    declare::queue()
        .max_concurrent(1)
        .register(&registry, "services.webseeds:validate", recorder.handler())
        .unwrap();

    let manager = manager(registry);
    manager.start().await.unwrap();
    let api = manager.get_scheduler().await.unwrap();
    let queue = QueueName::new("validate");

    let first = api
        .queue_job(&queue, vec![json!("http://a.example")], JobKwargs::new())
        .await
        .unwrap();
    let second = api
        .queue_job(&queue, vec![json!("http://a.example")], JobKwargs::new())
        .await
        .unwrap();

    assert!(second.success);
    assert_eq!(second.job.unwrap().id, first.job.unwrap().id);
    assert_eq!(api.get_queued_jobs(&queue).await.unwrap().len(), 1);

    gate.add_permits(1);
    assert!(recorder.wait_for_finished(1, Duration::from_secs(1)).await);
    assert_eq!(recorder.call_count(), 1);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pending_instance_can_be_cancelled() {
    let registry = common::registry();
    let gate = Arc::new(Semaphore::new(0));
    let recorder = CallRecorder::gated(Arc::clone(&gate));
    declare::queue()
        .max_concurrent(1)
        .register(&registry, "services.webseeds:validate", recorder.handler())
        .unwrap();

    let manager = manager(registry);
    manager.start().await.unwrap();
    let api = manager.get_scheduler().await.unwrap();
    let queue = QueueName::new("validate");

    let running = api
        .queue_job(&queue, vec![json!(1)], JobKwargs::new())
        .await
        .unwrap()
        .job
        .unwrap();
    let pending = api
        .queue_job(&queue, vec![json!(2)], JobKwargs::new())
        .await
        .unwrap()
        .job
        .unwrap();
    assert!(recorder.wait_for_calls(1, Duration::from_secs(1)).await);

    assert!(!api.cancel_queued_job(&queue, &running.id).await.unwrap());
    assert!(api.cancel_queued_job(&queue, &pending.id).await.unwrap());

    gate.add_permits(1);
    assert!(recorder.wait_for_finished(1, Duration::from_secs(1)).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.call_count(), 1);
    assert!(api.get_queued_jobs(&queue).await.unwrap().is_empty());

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_and_disabled_queues_are_rejected() {
    let registry = common::registry();
    let recorder = CallRecorder::new();
    declare::queue()
        .enabled(false)
        .register(&registry, "services.webseeds:validate", recorder.handler())
        .unwrap();

    let manager = manager(registry);
    manager.start().await.unwrap();
    let api = manager.get_scheduler().await.unwrap();

    let disabled = api
        .queue_job(&QueueName::new("validate"), vec![], JobKwargs::new())
        .await
        .unwrap();
    assert!(!disabled.success);
    assert!(disabled.message.unwrap().contains("disabled"));

    let unknown = api
        .queue_job(&QueueName::new("nope"), vec![], JobKwargs::new())
        .await
        .unwrap();
    assert!(!unknown.success);
    assert!(unknown.message.unwrap().contains("not found"));
    assert_eq!(recorder.call_count(), 0);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_queued_instances_do_not_survive_restart() {
    let registry = Arc::new(common::registry());
    let gate = Arc::new(Semaphore::new(0));
    let recorder = CallRecorder::gated(Arc::clone(&gate));
    declare::queue()
        .max_concurrent(1)
        .register(&registry, "services.webseeds:validate", recorder.handler())
        .unwrap();
    let storage = Arc::new(InMemoryStorage::new());
    let queue = QueueName::new("validate");

    let mut config = common::local_config();
    config.shutdown_timeout_secs = 1;
    let first = LocalSchedulerManager::new(config.clone(), Arc::clone(&registry), storage.clone());
    first.start().await.unwrap();
    let api = first.get_scheduler().await.unwrap();
    for n in 0..3 {
        api.queue_job(&queue, vec![json!(n)], JobKwargs::new())
            .await
            .unwrap();
    }
    assert_eq!(api.get_queued_jobs(&queue).await.unwrap().len(), 3);

    // Let the running instance finish so shutdown does not wait on it.
    gate.add_permits(1);
    first.shutdown().await.unwrap();
    gate.close();

    let second = LocalSchedulerManager::new(config, Arc::clone(&registry), storage);
    second.start().await.unwrap();
    let api = second.get_scheduler().await.unwrap();
    assert!(api.get_queued_jobs(&queue).await.unwrap().is_empty());

    second.shutdown().await.unwrap();
}
