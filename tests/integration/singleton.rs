//! Singleton scheduler ownership tests.
//!
//! Several managers (or worker processes) race for the scheduler lease in a
//! shared store; exactly one of them may become the owner.

use cadence::{InMemoryStorage, LocalSchedulerManager, SchedulerManager, Storage};
use std::sync::Arc;
use std::time::Duration;

use crate::common;

#[tokio::test]
async fn test_concurrent_start_in_process_elects_one_owner() {
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    let registry = Arc::new(common::registry());

    let managers: Vec<Arc<LocalSchedulerManager>> = (0..5)
        .map(|_| {
            Arc::new(LocalSchedulerManager::new(
                common::local_config(),
                Arc::clone(&registry),
                Arc::clone(&storage),
            ))
        })
        .collect();

    let mut starts = Vec::new();
    for manager in &managers {
        let manager = Arc::clone(manager);
        starts.push(tokio::spawn(async move { manager.start().await.unwrap() }));
    }
    let mut owners = 0;
    for start in starts {
        if start.await.unwrap() {
            owners += 1;
        }
    }
    assert_eq!(owners, 1);

    let running: Vec<_> = {
        let mut running = Vec::new();
        for manager in &managers {
            running.push(manager.is_running().await);
        }
        running
    };
    assert_eq!(running.iter().filter(|r| **r).count(), 1);

    for manager in &managers {
        manager.shutdown().await.unwrap();
    }
}

#[cfg(feature = "sqlite")]
mod processes {
    use super::*;
    use crate::common::{spawn_worker, stop_worker, worker_role, write_config};

    #[tokio::test]
    async fn test_concurrent_start_across_processes_elects_one_owner() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("jobs.db");
        let config = write_config(
            dir.path(),
            &format!(
                r#"
env: test
scheduler_mode: local
tick_interval_ms: 100
lease_ttl_secs: 10
shutdown_timeout_secs: 2
storage:
  type: sqlite
  path: {}
jobs:
  - target: builtin:log
    id: heartbeat
    trigger: {{ type: interval, minutes: 5 }}
"#,
                db.display()
            ),
        );

        let mut workers: Vec<_> = (0..3).map(|_| spawn_worker(&config, "token")).collect();
        let mut roles = Vec::new();
        for worker in &mut workers {
            roles.push(worker_role(worker, Duration::from_secs(20)).await);
        }

        assert_eq!(
            roles.iter().filter(|r| r.as_str() == "owner").count(),
            1,
            "roles: {roles:?}"
        );
        assert_eq!(roles.iter().filter(|r| r.as_str() == "client").count(), 2);

        for worker in workers {
            assert!(stop_worker(worker, Duration::from_secs(10)).await.success());
        }

        // The owner released its lease on the way out.
        let storage = cadence::SqliteStorage::new(&db).await.unwrap();
        let lease = storage.get_lease(cadence::manager::SCHEDULER_LEASE).await.unwrap();
        assert!(lease.is_none());
    }
}
