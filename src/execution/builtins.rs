//! Small jobs that ship with the binary.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::core::handler::{JobCall, JobError, JobHandler};

/// `builtin:log` writes `kwargs.message` to the log.
///
/// `kwargs.level` picks the level (`debug`, `info`, `warn` or `error`,
/// default `info`).
#[derive(Debug, Default)]
pub struct LogJob;

#[async_trait]
impl JobHandler for LogJob {
    async fn call(&self, call: JobCall) -> Result<(), JobError> {
        let message = match call.kwargs.get("message") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => call.job_id.to_string(),
        };
        let level = call
            .kwargs
            .get("level")
            .and_then(Value::as_str)
            .unwrap_or("info");

        match level {
            "debug" => tracing::debug!(job_id = %call.job_id, "{message}"),
            "info" => tracing::info!(job_id = %call.job_id, "{message}"),
            "warn" => tracing::warn!(job_id = %call.job_id, "{message}"),
            "error" => tracing::error!(job_id = %call.job_id, "{message}"),
            other => {
                return Err(JobError::InvalidArguments(format!(
                    "unknown log level '{other}'"
                )));
            }
        }
        Ok(())
    }
}

/// `builtin:sleep` waits for `kwargs.millis`, or the first positional
/// argument, in milliseconds.
#[derive(Debug, Default)]
pub struct SleepJob;

impl SleepJob {
    fn duration(call: &JobCall) -> Result<Duration, JobError> {
        let value = call.kwargs.get("millis").or_else(|| call.args.first());
        match value {
            None => Ok(Duration::ZERO),
            Some(v) => v.as_u64().map(Duration::from_millis).ok_or_else(|| {
                JobError::InvalidArguments(format!("sleep needs a millisecond count, got {v}"))
            }),
        }
    }
}

#[async_trait]
impl JobHandler for SleepJob {
    async fn call(&self, call: JobCall) -> Result<(), JobError> {
        let duration = Self::duration(&call)?;
        tokio::time::sleep(duration).await;
        Ok(())
    }
}
