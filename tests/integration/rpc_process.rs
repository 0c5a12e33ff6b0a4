//! RPC mode against a real scheduler process.
//!
//! These tests run the `cadence` binary: the RPC manager spawns
//! `cadence serve-rpc`, and worker processes elect the owner that does so.

use cadence::manager::SpawnCommand;
use cadence::rpc::{RpcClient, RpcToken, TOKEN_ENV};
use cadence::{
    ConfigLoader, EventKind, InMemoryStorage, JobId, JobKwargs, QueueName, RpcSchedulerManager,
    SchedulerApi, SchedulerError, SchedulerManager,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::common::{self, CADENCE_BIN};

fn rpc_config(dir: &Path, port: u16, storage: &str) -> std::path::PathBuf {
    common::write_config(
        dir,
        &format!(
            r#"
env: test
scheduler_mode: rpc
scheduler_rpc_port: {port}
tick_interval_ms: 100
startup_timeout_secs: 20
shutdown_timeout_secs: 5
lease_ttl_secs: 10
storage: {storage}
jobs:
  - target: builtin:log
    id: heartbeat
    trigger: {{ type: interval, minutes: 10 }}
queues:
  - target: builtin:sleep
    name: sleepers
    max_concurrent: 2
"#
        ),
    )
}

#[tokio::test]
async fn test_rpc_manager_supervises_scheduler_process() {
    let dir = tempfile::tempdir().unwrap();
    let port = common::free_port();
    let path = rpc_config(dir.path(), port, "{ type: memory }");
    let config = ConfigLoader::load(&path).unwrap();

    let manager = RpcSchedulerManager::new(config, Arc::new(InMemoryStorage::new()))
        .with_token(RpcToken::new("process-token"))
        .with_spawn_command(
            SpawnCommand::new(CADENCE_BIN)
                .arg("--config")
                .arg(&path)
                .arg("serve-rpc"),
        );

    assert!(manager.start().await.unwrap());
    assert!(manager.is_running().await);

    let api = manager.get_scheduler().await.expect("scheduler reachable");
    let jobs = api.get_jobs().await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, JobId::new("heartbeat"));
    assert_eq!(jobs[0].func, "builtin:log");

    let waiter = {
        let client = manager.client().clone();
        tokio::spawn(async move {
            client
                .await_event(EventKind::JobExecuted, Duration::from_secs(10))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut kwargs = JobKwargs::new();
    kwargs.insert("millis".into(), json!(20));
    let result = api
        .queue_job(&QueueName::new("sleepers"), vec![], kwargs)
        .await
        .unwrap();
    assert!(result.success, "{result:?}");
    assert_eq!(result.job.unwrap().executor, "sleepers");
    assert!(waiter.await.unwrap().unwrap().is_some());

    manager.shutdown().await.unwrap();
    assert!(!manager.is_running().await);
    assert!(!manager.guard().is_held());
    assert!(matches!(
        manager.client().ping().await,
        Err(SchedulerError::Unreachable(_))
    ));
}

#[tokio::test]
async fn test_server_process_rejects_other_tokens() {
    let dir = tempfile::tempdir().unwrap();
    let port = common::free_port();
    let path = rpc_config(dir.path(), port, "{ type: memory }");
    let config = ConfigLoader::load(&path).unwrap();

    let manager = RpcSchedulerManager::new(config, Arc::new(InMemoryStorage::new()))
        .with_token(RpcToken::new("right"))
        .with_spawn_command(
            SpawnCommand::new(CADENCE_BIN)
                .arg("--config")
                .arg(&path)
                .arg("serve-rpc"),
        );
    assert!(manager.start().await.unwrap());

    let intruder = RpcClient::new(port, RpcToken::new("wrong"));
    assert!(matches!(
        intruder.remove_all_jobs().await,
        Err(SchedulerError::Unauthorized)
    ));
    let jobs = manager.client().get_jobs().await.unwrap();
    assert_eq!(jobs.len(), 1);

    manager.shutdown().await.unwrap();
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_workers_share_one_scheduler_process() {
    let dir = tempfile::tempdir().unwrap();
    let port = common::free_port();
    let db = dir.path().join("jobs.db");
    let path = rpc_config(
        dir.path(),
        port,
        &format!("{{ type: sqlite, path: {} }}", db.display()),
    );
    let token = "shared-worker-token";

    let mut workers: Vec<_> = (0..2).map(|_| common::spawn_worker(&path, token)).collect();
    let mut roles = Vec::new();
    for worker in &mut workers {
        roles.push(common::worker_role(worker, Duration::from_secs(30)).await);
    }
    assert_eq!(
        roles.iter().filter(|r| r.as_str() == "owner").count(),
        1,
        "roles: {roles:?}"
    );

    // The operator CLI reaches the scheduler with the shared token.
    let output = tokio::process::Command::new(CADENCE_BIN)
        .arg("--config")
        .arg(&path)
        .args(["queue", "sleepers", "--kwargs", r#"{"millis": 10}"#])
        .env(TOKEN_ENV, token)
        .output()
        .await
        .unwrap();
    assert!(
        output.status.success(),
        "queue failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let printed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(printed["success"], true);

    for worker in workers {
        assert!(common::stop_worker(worker, Duration::from_secs(20)).await.success());
    }

    let client = RpcClient::new(port, RpcToken::new(token));
    assert!(client.ping().await.is_err(), "scheduler process outlived its owner");
}
