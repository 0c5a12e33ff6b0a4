//! RPC control channel tests against an in-process server.
//!
//! The scheduler process entry point ([`serve_scheduler`]) runs on a tokio
//! task and is driven over real HTTP with [`RpcClient`].

use cadence::rpc::{RPC_PATH, RpcClient, RpcToken, serve_scheduler};
use cadence::testing::CallRecorder;
use cadence::{
    EventKind, InMemoryStorage, JobId, JobKwargs, JobSpec, JobTarget, QueueName, Registry,
    SchedulerApi, SchedulerError, ServiceConfig, declare,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::common;

struct Server {
    client: RpcClient,
    task: JoinHandle<Result<(), cadence::rpc::ServeError>>,
    queue_calls: Arc<CallRecorder>,
}

async fn serve() -> Server {
    let registry = Registry::new(cadence::Environment::Test);
    let queue_calls = CallRecorder::new();
    declare::queue()
        .register(&registry, "services.webseeds:validate", queue_calls.handler())
        .unwrap();
    declare::interval()
        .hours(1.0)
        .register(&registry, "services.stats:update_site_stats", CallRecorder::new().handler())
        .unwrap();

    let config = ServiceConfig {
        scheduler_rpc_port: common::free_port(),
        shutdown_timeout_secs: 2,
        ..common::local_config()
    };
    let token = RpcToken::new("integration-token");
    let client = RpcClient::new(config.scheduler_rpc_port, token.clone());

    let task = tokio::spawn(async move {
        serve_scheduler(
            &config,
            Arc::new(registry),
            Arc::new(InMemoryStorage::new()),
            token,
        )
        .await
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while client.ping().await.is_err() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "rpc server did not come up"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    Server {
        client,
        task,
        queue_calls,
    }
}

async fn stop(server: Server) {
    server.client.shutdown().await.unwrap();
    let served = tokio::time::timeout(Duration::from_secs(5), server.task)
        .await
        .expect("server did not stop after shutdown")
        .unwrap();
    assert!(served.is_ok(), "{served:?}");
}

#[tokio::test]
async fn test_registered_jobs_and_queues_over_http() {
    let server = serve().await;
    let client = &server.client;

    let jobs = client.get_jobs().await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, JobId::new("update_site_stats"));
    assert_eq!(jobs[0].executor, "default");

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .await_event(EventKind::JobExecuted, Duration::from_secs(5))
                .await
        })
    };
    // Give the waiter time to subscribe on the server.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let queue = QueueName::new("validate");
    let result = client
        .queue_job(&queue, vec![json!("https://example.org/a.torrent")], JobKwargs::new())
        .await
        .unwrap();
    assert!(result.success);

    let executed = waiter.await.unwrap().unwrap().expect("no job_executed event");
    assert_eq!(Some(&result.job.unwrap().id), executed.job_id());
    assert_eq!(server.queue_calls.call_count(), 1);

    client.remove_job(&JobId::new("update_site_stats")).await.unwrap();
    assert!(client.get_jobs().await.unwrap().is_empty());

    stop(server).await;
}

#[tokio::test]
async fn test_unauthenticated_request_has_no_side_effect() {
    let server = serve().await;
    let url = server.client.url().to_string();
    assert!(url.ends_with(RPC_PATH));

    let http = reqwest::Client::new();
    let body = json!({"method": "queue_job", "params": {"queue_name": "validate"}});

    let response = http.post(&url).json(&body).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    let response = http
        .post(&url)
        .basic_auth("cadence", Some("not-the-token"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    let response = http
        .post(&url)
        .json(&json!({"method": "remove_all_jobs"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.queue_calls.call_count(), 0);
    assert_eq!(server.client.get_jobs().await.unwrap().len(), 1);

    let wrong = RpcClient::with_base_url(
        url.trim_end_matches(RPC_PATH).to_string(),
        RpcToken::new("not-the-token"),
    );
    assert!(matches!(wrong.get_jobs().await, Err(SchedulerError::Unauthorized)));

    stop(server).await;
}

#[tokio::test]
async fn test_remote_errors_keep_their_kind() {
    let server = serve().await;
    let client = &server.client;

    let missing = client.remove_job(&JobId::new("ghost")).await;
    assert!(matches!(missing, Err(SchedulerError::JobNotFound(id)) if id.as_str() == "ghost"));

    let target = JobTarget::parse("services.stats:update_site_stats").unwrap();
    let conflict = client.add_job(JobSpec::new(target.clone())).await;
    assert!(matches!(conflict, Err(SchedulerError::ConflictingJobId(_))));

    let wrong_executor = client
        .add_job(
            JobSpec::new(target)
                .with_id("on-missing-queue")
                .with_executor("nope"),
        )
        .await;
    assert!(matches!(wrong_executor, Err(SchedulerError::InvalidJob(_))));

    stop(server).await;
}
