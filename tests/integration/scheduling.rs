//! Scheduling integration tests.
//!
//! Jobs declared in a registry before the scheduler starts, driven through
//! the local manager the way a single-process service would run them.

use cadence::events::wait_on;
use cadence::testing::CallRecorder;
use cadence::{
    ConfigLoader, EventBus, EventKind, InMemoryStorage, IntervalTrigger, JobId, JobSpec,
    JobTarget, LocalSchedulerManager, SchedulerManager, Trigger, declare, register_builtins,
};
use std::sync::Arc;
use std::time::Duration;

use crate::common;

#[tokio::test]
async fn test_interval_declared_before_start_fires_within_300ms() {
    let registry = common::registry();
    let recorder = CallRecorder::new();
    declare::interval()
        .seconds(0.1)
        .register(&registry, "services.stats:update_site_stats", recorder.handler())
        .unwrap();

    let manager = LocalSchedulerManager::new(
        common::local_config(),
        Arc::new(registry),
        Arc::new(InMemoryStorage::new()),
    );
    assert!(manager.start().await.unwrap());

    assert!(
        recorder
            .wait_for_calls(1, Duration::from_millis(300))
            .await,
        "interval job did not fire within 300ms"
    );
    assert_eq!(
        recorder.calls()[0].job_id,
        JobId::new("update_site_stats")
    );

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reregistered_job_replaces_previous_declaration() {
    let registry = common::registry();
    let recorder = CallRecorder::new();
    declare::interval()
        .hours(1.0)
        .register(&registry, "services.trackers:scrape", recorder.handler())
        .unwrap();
    declare::cron()
        .hour(3)
        .register(&registry, "services.trackers:scrape", recorder.handler())
        .unwrap();

    let jobs = registry.get_scheduled_jobs();
    assert_eq!(jobs.len(), 1);
    assert!(matches!(jobs[&JobId::new("scrape")].trigger, Trigger::Cron(_)));

    let manager = LocalSchedulerManager::new(
        common::local_config(),
        Arc::new(registry),
        Arc::new(InMemoryStorage::new()),
    );
    manager.start().await.unwrap();

    let api = manager.get_scheduler().await.unwrap();
    let live = api.get_jobs().await.unwrap();
    assert_eq!(live.len(), 1);
    let next = live[0].next_run_time.expect("cron job is scheduled");
    assert_eq!(next.format("%M:%S").to_string(), "00:00");

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_configured_builtin_job_runs() {
    let config = ConfigLoader::parse(
        r#"
env: test
scheduler_mode: local
tick_interval_ms: 50
jobs:
  - target: builtin:log
    id: heartbeat
    kwargs: { message: "still alive" }
    trigger: { type: interval, seconds: 0.1 }
"#,
    )
    .unwrap();
    let registry = common::registry();
    register_builtins(&registry);
    cadence::config::declare_configured_jobs(&config, &registry).unwrap();

    let events = Arc::new(EventBus::new());
    let mut rx = events.subscribe();
    let manager = LocalSchedulerManager::new(
        config,
        Arc::new(registry),
        Arc::new(InMemoryStorage::new()),
    )
    .with_event_bus(Arc::clone(&events));
    manager.start().await.unwrap();

    let executed = wait_on(&mut rx, EventKind::JobExecuted, Duration::from_secs(2))
        .await
        .expect("configured job did not run");
    assert_eq!(executed.job_id(), Some(&JobId::new("heartbeat")));

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_one_shot_date_job_runs_once() {
    let registry = common::registry();
    let recorder = CallRecorder::new();
    declare::date(chrono::Utc::now() + chrono::TimeDelta::milliseconds(300))
        .register(&registry, "services.maintenance:vacuum", recorder.handler())
        .unwrap();

    let manager = LocalSchedulerManager::new(
        common::local_config(),
        Arc::new(registry),
        Arc::new(InMemoryStorage::new()),
    );
    manager.start().await.unwrap();

    assert!(recorder.wait_for_finished(1, Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(recorder.call_count(), 1);

    let api = manager.get_scheduler().await.unwrap();
    assert!(api.get_job(&JobId::new("vacuum")).await.unwrap().is_none());

    manager.shutdown().await.unwrap();
}

#[cfg(feature = "sqlite")]
mod persistence {
    use super::*;
    use cadence::SqliteStorage;
    use cadence::storage::Storage;

    async fn sqlite(dir: &tempfile::TempDir) -> Arc<dyn Storage> {
        Arc::new(SqliteStorage::new(dir.path().join("jobs.db")).await.unwrap())
    }

    #[tokio::test]
    async fn test_ad_hoc_job_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let target = JobTarget::parse("services.reports:weekly").unwrap();

        let registry = Arc::new(common::registry());
        registry.register_handler(target.clone(), CallRecorder::new().handler());

        let first = LocalSchedulerManager::new(
            common::local_config(),
            Arc::clone(&registry),
            sqlite(&dir).await,
        );
        first.start().await.unwrap();
        let added = first
            .get_scheduler()
            .await
            .unwrap()
            .add_job(
                JobSpec::new(target)
                    .with_id("weekly-report")
                    .with_trigger(Trigger::Interval(IntervalTrigger::new(
                        Duration::from_secs(7 * 24 * 3600),
                    ))),
            )
            .await
            .unwrap();
        first.shutdown().await.unwrap();

        let second = LocalSchedulerManager::new(
            common::local_config(),
            Arc::clone(&registry),
            sqlite(&dir).await,
        );
        second.start().await.unwrap();
        let restored = second
            .get_scheduler()
            .await
            .unwrap()
            .get_job(&JobId::new("weekly-report"))
            .await
            .unwrap()
            .expect("job was persisted");
        assert_eq!(restored.next_run_time, added.next_run_time);
        assert_eq!(restored.func, "services.reports:weekly");

        second.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_job_is_removed_on_next_start() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = CallRecorder::new();

        let registry = common::registry();
        declare::interval()
            .hours(1.0)
            .register(&registry, "services.trackers:scrape", recorder.handler())
            .unwrap();
        let first = LocalSchedulerManager::new(
            common::local_config(),
            Arc::new(registry),
            sqlite(&dir).await,
        );
        first.start().await.unwrap();
        first.shutdown().await.unwrap();

        let registry = common::registry();
        declare::interval()
            .hours(1.0)
            .enabled(false)
            .register(&registry, "services.trackers:scrape", recorder.handler())
            .unwrap();
        let storage = sqlite(&dir).await;
        let second = LocalSchedulerManager::new(
            common::local_config(),
            Arc::new(registry),
            Arc::clone(&storage),
        );
        second.start().await.unwrap();

        let api = second.get_scheduler().await.unwrap();
        assert!(api.get_job(&JobId::new("scrape")).await.unwrap().is_none());
        assert!(storage.list_jobs().await.unwrap().is_empty());

        second.shutdown().await.unwrap();
    }
}
