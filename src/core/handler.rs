//! Job callables.
//!
//! The scheduler never runs closures sent across a process boundary. Every
//! callable is registered locally under a [`JobTarget`](super::types::JobTarget)
//! and resolved by name when a job fires. A [`Handler`] is either an async
//! [`JobHandler`] run as a tokio task, or a blocking function run on the
//! blocking thread pool.
//!
//! # Example
//!
//! ```ignore
//! use cadence::{Handler, JobCall, JobError};
//!
//! let handler = Handler::from_fn(|call: JobCall| async move {
//!     let url = call.args.first().and_then(|v| v.as_str()).unwrap_or_default();
//!     tracing::info!(url, "validating webseed");
//!     Ok::<(), JobError>(())
//! });
//! ```

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

use super::job::{JobArgs, JobKwargs};
use super::types::JobId;

/// Errors raised by a job body.
#[derive(Debug, Error)]
pub enum JobError {
    /// Job execution failed with a message.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// The job was called with arguments it cannot use.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Job timed out.
    #[error("job timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// External command failed with exit code.
    #[error("command exited with code {code}: {stderr}")]
    CommandFailed { code: i32, stderr: String },

    /// The job panicked.
    #[error("job panicked: {0}")]
    Panicked(String),

    /// Generic error wrapper.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// A single invocation of a job callable.
#[derive(Debug, Clone)]
pub struct JobCall {
    pub job_id: JobId,
    pub args: JobArgs,
    pub kwargs: JobKwargs,
}

/// An asynchronous job callable.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn call(&self, call: JobCall) -> Result<(), JobError>;
}

type BlockingFn = dyn Fn(JobCall) -> Result<(), JobError> + Send + Sync;

/// A registered job callable.
#[derive(Clone)]
pub enum Handler {
    /// Runs as a tokio task.
    Async(Arc<dyn JobHandler>),
    /// Runs on the blocking thread pool.
    Blocking(Arc<BlockingFn>),
}

impl Handler {
    /// Wrap an async closure.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(JobCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        Handler::Async(Arc::new(FnHandler(f)))
    }

    /// Wrap a blocking function.
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(JobCall) -> Result<(), JobError> + Send + Sync + 'static,
    {
        Handler::Blocking(Arc::new(f))
    }

    /// Run the callable to completion.
    ///
    /// Panics inside the job body are caught and reported as
    /// [`JobError::Panicked`].
    pub async fn invoke(&self, call: JobCall) -> Result<(), JobError> {
        let joined = match self {
            Handler::Async(handler) => {
                let handler = Arc::clone(handler);
                tokio::spawn(async move { handler.call(call).await }).await
            }
            Handler::Blocking(f) => {
                let f = Arc::clone(f);
                tokio::task::spawn_blocking(move || f(call)).await
            }
        };

        joined.map_err(|e| JobError::Panicked(e.to_string()))?
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, Handler::Blocking(_))
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Async(_) => f.write_str("Handler::Async"),
            Handler::Blocking(_) => f.write_str("Handler::Blocking"),
        }
    }
}

impl<H: JobHandler + 'static> From<Arc<H>> for Handler {
    fn from(handler: Arc<H>) -> Self {
        Handler::Async(handler)
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn call(&self, call: JobCall) -> Result<(), JobError> {
        (self.0)(call).await
    }
}
