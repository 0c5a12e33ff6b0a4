//! RPC request handlers.

use axum::{Json, extract::State, extract::rejection::JsonRejection};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::errors::RpcError;
use super::{PingResponse, RpcRequest};
use crate::scheduler::SchedulerApi;

/// Shared state for RPC handlers.
#[derive(Clone)]
pub struct RpcState {
    pub api: Arc<dyn SchedulerApi>,
    /// Signalled once a `shutdown` call has stopped the scheduler.
    pub shutdown: Arc<Notify>,
}

impl RpcState {
    pub fn new(api: Arc<dyn SchedulerApi>) -> Self {
        Self {
            api,
            shutdown: Arc::new(Notify::new()),
        }
    }
}

fn to_value(value: impl Serialize) -> Result<Json<Value>, RpcError> {
    serde_json::to_value(value)
        .map(Json)
        .map_err(|e| RpcError::Internal(e.to_string()))
}

/// Dispatch one RPC call onto the scheduler.
pub async fn dispatch(
    State(state): State<RpcState>,
    payload: Result<Json<RpcRequest>, JsonRejection>,
) -> Result<Json<Value>, RpcError> {
    let Json(request) = payload.map_err(|e| RpcError::BadRequest(e.body_text()))?;
    tracing::debug!(method = request.method(), "rpc call");
    let api = &state.api;

    match request {
        RpcRequest::Ping => to_value(PingResponse {
            status: "ok".to_string(),
            pid: std::process::id(),
        }),
        RpcRequest::AddJob { spec } => to_value(api.add_job(spec).await?),
        RpcRequest::GetJob { job_id } => to_value(api.get_job(&job_id).await?),
        RpcRequest::GetJobs => to_value(api.get_jobs().await?),
        RpcRequest::RemoveJob { job_id } => to_value(api.remove_job(&job_id).await?),
        RpcRequest::RemoveAllJobs => to_value(api.remove_all_jobs().await?),
        RpcRequest::QueueJob {
            queue_name,
            args,
            kwargs,
        } => to_value(api.queue_job(&queue_name, args, kwargs).await?),
        RpcRequest::GetQueuedJobs { queue_name } => {
            to_value(api.get_queued_jobs(&queue_name).await?)
        }
        RpcRequest::CancelQueuedJob { queue_name, job_id } => {
            to_value(api.cancel_queued_job(&queue_name, &job_id).await?)
        }
        RpcRequest::AwaitEvent {
            event_kind,
            timeout_ms,
        } => to_value(
            api.await_event(event_kind, Duration::from_millis(timeout_ms))
                .await?,
        ),
        RpcRequest::Shutdown => {
            api.shutdown().await?;
            state.shutdown.notify_one();
            to_value(())
        }
    }
}
