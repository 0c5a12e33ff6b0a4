//! RPC client used by worker processes.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;

use super::auth::{RPC_USERNAME, RpcToken};
use super::errors::{ErrorResponse, codes};
use super::{PingResponse, RPC_PATH, RpcRequest};
use crate::core::job::{JobArgs, JobKwargs, JobSpec};
use crate::core::snapshot::JobSnapshot;
use crate::core::types::{JobId, QueueName};
use crate::events::{Event, EventKind};
use crate::scheduler::{QueueResult, SchedulerApi, SchedulerError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// [`SchedulerApi`] over the authenticated RPC channel.
#[derive(Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    url: String,
    token: RpcToken,
    timeout: Duration,
}

impl RpcClient {
    /// Client for the scheduler process on `127.0.0.1:port`.
    pub fn new(port: u16, token: RpcToken) -> Self {
        Self::with_base_url(format!("http://127.0.0.1:{port}"), token)
    }

    pub fn with_base_url(base_url: impl Into<String>, token: RpcToken) -> Self {
        let base_url = base_url.into();
        Self {
            http: reqwest::Client::new(),
            url: format!("{}{RPC_PATH}", base_url.trim_end_matches('/')),
            token,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Check that the server is up and accepts our token.
    pub async fn ping(&self) -> Result<PingResponse, SchedulerError> {
        self.call(&RpcRequest::Ping, self.timeout).await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        request: &RpcRequest,
        timeout: Duration,
    ) -> Result<T, SchedulerError> {
        let response = self
            .http
            .post(&self.url)
            .basic_auth(RPC_USERNAME, Some(self.token.as_str()))
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                SchedulerError::Unreachable(format!("{} {}: {e}", request.method(), self.url))
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(SchedulerError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(remote_error(status, &body));
        }

        response.json::<T>().await.map_err(|e| {
            SchedulerError::ChannelError(format!("bad {} response: {e}", request.method()))
        })
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("url", &self.url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn remote_error(status: StatusCode, body: &str) -> SchedulerError {
    let Ok(error) = serde_json::from_str::<ErrorResponse>(body) else {
        return SchedulerError::Remote {
            status: status.as_u16(),
            message: body.to_string(),
        };
    };
    match error.code.as_str() {
        codes::INVALID_JOB => SchedulerError::InvalidJob(error.error),
        codes::SERVICE_UNAVAILABLE => SchedulerError::NotRunning,
        _ => SchedulerError::Remote {
            status: status.as_u16(),
            message: error.error,
        },
    }
}

fn is_status(err: &SchedulerError, expected: StatusCode) -> bool {
    matches!(err, SchedulerError::Remote { status, .. } if *status == expected.as_u16())
}

#[async_trait]
impl SchedulerApi for RpcClient {
    async fn add_job(&self, spec: JobSpec) -> Result<JobSnapshot, SchedulerError> {
        let job_id = spec.resolved_id();
        self.call(&RpcRequest::AddJob { spec }, self.timeout)
            .await
            .map_err(|e| {
                if is_status(&e, StatusCode::CONFLICT) {
                    SchedulerError::ConflictingJobId(job_id)
                } else {
                    e
                }
            })
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<JobSnapshot>, SchedulerError> {
        let request = RpcRequest::GetJob {
            job_id: job_id.clone(),
        };
        self.call(&request, self.timeout).await
    }

    async fn get_jobs(&self) -> Result<Vec<JobSnapshot>, SchedulerError> {
        self.call(&RpcRequest::GetJobs, self.timeout).await
    }

    async fn remove_job(&self, job_id: &JobId) -> Result<(), SchedulerError> {
        let request = RpcRequest::RemoveJob {
            job_id: job_id.clone(),
        };
        self.call(&request, self.timeout).await.map_err(|e| {
            if is_status(&e, StatusCode::NOT_FOUND) {
                SchedulerError::JobNotFound(job_id.clone())
            } else {
                e
            }
        })
    }

    async fn remove_all_jobs(&self) -> Result<(), SchedulerError> {
        self.call(&RpcRequest::RemoveAllJobs, self.timeout).await
    }

    async fn queue_job(
        &self,
        queue_name: &QueueName,
        args: JobArgs,
        kwargs: JobKwargs,
    ) -> Result<QueueResult, SchedulerError> {
        let request = RpcRequest::QueueJob {
            queue_name: queue_name.clone(),
            args,
            kwargs,
        };
        self.call(&request, self.timeout).await
    }

    async fn get_queued_jobs(
        &self,
        queue_name: &QueueName,
    ) -> Result<HashMap<JobId, JobSnapshot>, SchedulerError> {
        let request = RpcRequest::GetQueuedJobs {
            queue_name: queue_name.clone(),
        };
        self.call(&request, self.timeout).await
    }

    async fn cancel_queued_job(
        &self,
        queue_name: &QueueName,
        job_id: &JobId,
    ) -> Result<bool, SchedulerError> {
        let request = RpcRequest::CancelQueuedJob {
            queue_name: queue_name.clone(),
            job_id: job_id.clone(),
        };
        self.call(&request, self.timeout).await
    }

    /// The request stays open on the server until the event or the timeout.
    async fn await_event(
        &self,
        kind: EventKind,
        timeout: Duration,
    ) -> Result<Option<Event>, SchedulerError> {
        let request = RpcRequest::AwaitEvent {
            event_kind: kind,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        };
        self.call(&request, self.timeout + timeout).await
    }

    async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.call(&RpcRequest::Shutdown, self.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use crate::core::types::JobTarget;
    use crate::registry::Registry;
    use crate::rpc::{RpcState, build_router};
    use crate::scheduler::Scheduler;
    use crate::storage::InMemoryStorage;
    use crate::testing::CallRecorder;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn serve(token: RpcToken) -> (RpcClient, Arc<CallRecorder>) {
        let registry = Arc::new(Registry::new(Environment::Test));
        let calls = CallRecorder::new();
        registry.register_handler(JobTarget::parse("m:job").unwrap(), calls.handler());
        registry.register_queued_job(
            JobTarget::parse("webseeds:validate").unwrap(),
            calls.handler(),
            QueueName::new("validate"),
            2,
            true,
        );
        let (handle, _task) = Scheduler::new(registry, Arc::new(InMemoryStorage::new()))
            .with_tick_interval(Duration::from_millis(50))
            .start()
            .await
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let router = build_router(RpcState::new(Arc::new(handle)), token.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        (RpcClient::new(port, token), calls)
    }

    #[tokio::test]
    async fn test_client_round_trips_job_operations() {
        let token = RpcToken::new("client-test");
        let (client, _calls) = serve(token).await;

        assert_eq!(client.ping().await.unwrap().status, "ok");

        let trigger = crate::core::trigger::Trigger::Interval(
            crate::core::trigger::IntervalTrigger::new(Duration::from_secs(60)),
        );
        let spec = JobSpec::new(JobTarget::parse("m:job").unwrap()).with_trigger(trigger);
        let added = client.add_job(spec.clone()).await.unwrap();
        assert_eq!(added.id, JobId::new("job"));
        assert_eq!(added.executor, "default");

        let conflict = client.add_job(spec).await;
        assert!(matches!(conflict, Err(SchedulerError::ConflictingJobId(_))));

        assert_eq!(client.get_jobs().await.unwrap().len(), 1);
        assert!(client.get_job(&JobId::new("job")).await.unwrap().is_some());

        client.remove_job(&JobId::new("job")).await.unwrap();
        let missing = client.remove_job(&JobId::new("job")).await;
        assert!(matches!(missing, Err(SchedulerError::JobNotFound(_))));

        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_client_queue_and_await_event() {
        let token = RpcToken::new("client-test");
        let (client, calls) = serve(token).await;
        let queue = QueueName::new("validate");

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .await_event(EventKind::JobExecuted, Duration::from_secs(2))
                    .await
            })
        };
        // Give the waiter time to subscribe.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let result = client
            .queue_job(&queue, vec![json!("https://example.org/x")], JobKwargs::new())
            .await
            .unwrap();
        assert!(result.success);

        let event = waiter.await.unwrap().unwrap();
        assert!(matches!(event, Some(Event::JobExecuted { .. })));
        assert_eq!(calls.call_count(), 1);

        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_client_with_wrong_token_is_unauthorized() {
        let (server, _calls) = serve(RpcToken::new("right")).await;
        let client = RpcClient::with_base_url(
            server.url().trim_end_matches(RPC_PATH),
            RpcToken::new("wrong"),
        );

        assert!(matches!(
            client.ping().await,
            Err(SchedulerError::Unauthorized)
        ));
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = RpcClient::new(port, RpcToken::new("t"))
            .with_timeout(Duration::from_millis(500));
        assert!(matches!(
            client.get_jobs().await,
            Err(SchedulerError::Unreachable(_))
        ));
    }
}
