//! RPC error types and HTTP status mapping.

use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::SchedulerError;
use crate::storage::StorageError;

/// RPC error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Error codes carried in [`ErrorResponse::code`].
pub mod codes {
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const BAD_REQUEST: &str = "BAD_REQUEST";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const CONFLICT: &str = "CONFLICT";
    pub const INVALID_JOB: &str = "INVALID_JOB";
    pub const SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// RPC error type that can be converted to HTTP responses.
#[derive(Debug)]
pub enum RpcError {
    /// Missing or wrong credentials.
    Unauthorized,
    /// The request body is not a valid RPC call.
    BadRequest(String),
    /// Job not found.
    NotFound(String),
    /// A job with this id already exists.
    Conflict(String),
    /// The job spec cannot be scheduled.
    InvalidJob(String),
    /// Scheduler not running.
    ServiceUnavailable(String),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            RpcError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                codes::UNAUTHORIZED,
                "authentication required".to_string(),
            ),
            RpcError::BadRequest(msg) => (StatusCode::BAD_REQUEST, codes::BAD_REQUEST, msg),
            RpcError::NotFound(msg) => (StatusCode::NOT_FOUND, codes::NOT_FOUND, msg),
            RpcError::Conflict(msg) => (StatusCode::CONFLICT, codes::CONFLICT, msg),
            RpcError::InvalidJob(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, codes::INVALID_JOB, msg)
            }
            RpcError::ServiceUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                codes::SERVICE_UNAVAILABLE,
                msg,
            ),
            RpcError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, codes::INTERNAL_ERROR, msg)
            }
        };

        let body = Json(ErrorResponse {
            error: message,
            code: code.to_string(),
        });

        if status == StatusCode::UNAUTHORIZED {
            return (
                status,
                [(header::WWW_AUTHENTICATE, r#"Basic realm="cadence""#)],
                body,
            )
                .into_response();
        }
        (status, body).into_response()
    }
}

impl From<SchedulerError> for RpcError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::JobNotFound(_) => RpcError::NotFound(err.to_string()),
            SchedulerError::ConflictingJobId(_) => RpcError::Conflict(err.to_string()),
            SchedulerError::InvalidJob(_) | SchedulerError::Trigger(_) => {
                RpcError::InvalidJob(err.to_string())
            }
            SchedulerError::NotRunning => {
                RpcError::ServiceUnavailable("scheduler is not running".to_string())
            }
            SchedulerError::Storage(e) => e.into(),
            _ => RpcError::Internal(err.to_string()),
        }
    }
}

impl From<StorageError> for RpcError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(msg) => RpcError::NotFound(msg),
            StorageError::DuplicateKey(msg) => RpcError::Conflict(msg),
            _ => RpcError::Internal(err.to_string()),
        }
    }
}

/// Errors that stop the RPC server process.
#[derive(Debug, Error)]
pub enum ServeError {
    /// The listening socket could not be opened.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The scheduler could not be started.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Serving failed.
    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}
