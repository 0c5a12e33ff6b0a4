//! Authenticated control channel between worker processes and the
//! scheduler process.
//!
//! The scheduler process serves `POST /rpc` on localhost. Each call is a
//! JSON object `{"method": ..., "params": ...}` and every request must carry
//! the deployment's Basic credentials.

mod auth;
mod client;
mod errors;
mod handlers;

pub use auth::{RPC_USERNAME, RpcToken, TOKEN_ENV, require_basic_auth};
pub use client::RpcClient;
pub use errors::{ErrorResponse, RpcError, ServeError, codes};
pub use handlers::RpcState;

use axum::{Router, middleware, routing::post};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::ServiceConfig;
use crate::core::job::{JobArgs, JobKwargs, JobSpec};
use crate::core::types::{JobId, QueueName};
use crate::events::{EventBus, EventKind};
use crate::manager::prepare_scheduler;
use crate::registry::Registry;
use crate::scheduler::{Scheduler, SchedulerApi};
use crate::storage::Storage;

/// Line printed on stdout once the server accepts connections.
pub const READY_MARKER: &str = "CADENCE_RPC_READY";

/// Path of the RPC endpoint.
pub const RPC_PATH: &str = "/rpc";

/// A remote call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum RpcRequest {
    Ping,
    AddJob {
        spec: JobSpec,
    },
    GetJob {
        job_id: JobId,
    },
    GetJobs,
    RemoveJob {
        job_id: JobId,
    },
    RemoveAllJobs,
    QueueJob {
        queue_name: QueueName,
        #[serde(default)]
        args: JobArgs,
        #[serde(default)]
        kwargs: JobKwargs,
    },
    GetQueuedJobs {
        queue_name: QueueName,
    },
    CancelQueuedJob {
        queue_name: QueueName,
        job_id: JobId,
    },
    AwaitEvent {
        event_kind: EventKind,
        timeout_ms: u64,
    },
    Shutdown,
}

impl RpcRequest {
    /// Method name as it appears on the wire.
    pub fn method(&self) -> &'static str {
        match self {
            RpcRequest::Ping => "ping",
            RpcRequest::AddJob { .. } => "add_job",
            RpcRequest::GetJob { .. } => "get_job",
            RpcRequest::GetJobs => "get_jobs",
            RpcRequest::RemoveJob { .. } => "remove_job",
            RpcRequest::RemoveAllJobs => "remove_all_jobs",
            RpcRequest::QueueJob { .. } => "queue_job",
            RpcRequest::GetQueuedJobs { .. } => "get_queued_jobs",
            RpcRequest::CancelQueuedJob { .. } => "cancel_queued_job",
            RpcRequest::AwaitEvent { .. } => "await_event",
            RpcRequest::Shutdown => "shutdown",
        }
    }
}

/// Response to `ping`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    pub status: String,
    pub pid: u32,
}

/// Build the RPC router. Every route requires `token`.
pub fn build_router(state: RpcState, token: RpcToken) -> Router {
    Router::new()
        .route(RPC_PATH, post(handlers::dispatch))
        .layer(middleware::from_fn_with_state(token, require_basic_auth))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the scheduler process: start the scheduler, reconcile it with the
/// registry, then serve RPC on `127.0.0.1:<scheduler_rpc_port>` until a
/// `shutdown` call or ctrl-c.
pub async fn serve_scheduler(
    config: &ServiceConfig,
    registry: Arc<Registry>,
    storage: Arc<dyn Storage>,
    token: RpcToken,
) -> Result<(), ServeError> {
    let (handle, scheduler_task) = Scheduler::new(Arc::clone(&registry), storage)
        .with_event_bus(Arc::new(EventBus::new()))
        .with_tick_interval(config.tick_interval())
        .with_shutdown_timeout(config.shutdown_timeout())
        .start()
        .await?;

    let addr = format!("127.0.0.1:{}", config.scheduler_rpc_port);
    let prepared = prepare_scheduler(&handle, &registry, config.clear_jobs).await;
    let listener = match prepared {
        Ok(()) => TcpListener::bind(&addr).await.map_err(|source| ServeError::Bind {
            addr: addr.clone(),
            source,
        }),
        Err(e) => Err(e.into()),
    };
    let listener = match listener {
        Ok(listener) => listener,
        Err(e) => {
            let _ = handle.shutdown().await;
            let _ = scheduler_task.await;
            return Err(e);
        }
    };

    let state = RpcState::new(Arc::new(handle.clone()));
    let shutdown = Arc::clone(&state.shutdown);
    let router = build_router(state, token);

    tracing::info!("RPC server listening on http://{}", addr);
    announce_ready()?;

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown.notified() => tracing::info!("shutdown requested over rpc"),
                _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
            }
        })
        .await;

    handle.shutdown().await?;
    if let Err(e) = scheduler_task.await {
        tracing::warn!(error = %e, "scheduler task ended abnormally");
    }
    served.map_err(ServeError::Io)
}

fn announce_ready() -> std::io::Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{READY_MARKER}")?;
    stdout.flush()
}
