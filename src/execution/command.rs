//! External command job.
//!
//! `builtin:command` runs an external program described by the job's
//! keyword arguments:
//!
//! ```yaml
//! jobs:
//!   - target: builtin:command
//!     id: nightly-backup
//!     kwargs:
//!       program: /usr/local/bin/backup.sh
//!       args: ["--full"]
//!       env: { BACKUP_DIR: /srv/backups }
//!       working_dir: /srv
//!       timeout_secs: 3600
//!     trigger: { type: cron, hour: 2 }
//! ```
//!
//! String positional arguments of a run are appended after `args`, so a
//! queue of commands can be fed per-instance arguments.
//!
//! A non-zero exit is reported as [`JobError::CommandFailed`] with the exit
//! code and stderr. On timeout the child is killed and the run fails with
//! [`JobError::Timeout`].

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use crate::core::handler::{JobCall, JobError, JobHandler};

/// What to run, read from the job's keyword arguments.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommandSpec {
    /// Program to execute
    pub program: String,
    /// Command arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Execution timeout in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl CommandSpec {
    /// Read the spec of one call.
    pub fn from_call(call: &JobCall) -> Result<Self, JobError> {
        let mut spec: CommandSpec = serde_json::from_value(Value::Object(call.kwargs.clone()))
            .map_err(|e| JobError::InvalidArguments(e.to_string()))?;

        for arg in &call.args {
            match arg {
                Value::String(s) => spec.args.push(s.clone()),
                Value::Number(n) => spec.args.push(n.to_string()),
                other => {
                    return Err(JobError::InvalidArguments(format!(
                        "command arguments must be strings or numbers, got {other}"
                    )));
                }
            }
        }
        Ok(spec)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Handler behind `builtin:command`.
#[derive(Debug, Default)]
pub struct CommandJob;

#[async_trait]
impl JobHandler for CommandJob {
    async fn call(&self, call: JobCall) -> Result<(), JobError> {
        let spec = CommandSpec::from_call(&call)?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.envs(&spec.env);

        // Set working directory if specified
        if let Some(ref dir) = spec.working_dir {
            cmd.current_dir(dir);
        }

        // Capture stdout and stderr
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        // Execute with optional timeout
        let output = match spec.timeout() {
            Some(duration) => timeout(duration, cmd.output())
                .await
                .map_err(|_| JobError::Timeout(duration))?
                .map_err(|e| JobError::ExecutionFailed(format!("{}: {e}", spec.program)))?,
            None => cmd
                .output()
                .await
                .map_err(|e| JobError::ExecutionFailed(format!("{}: {e}", spec.program)))?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let code = output.status.code().unwrap_or(-1);

        tracing::debug!(
            job_id = %call.job_id,
            program = %spec.program,
            code,
            stdout = %stdout.trim_end(),
            "command finished"
        );

        if output.status.success() {
            Ok(())
        } else {
            Err(JobError::CommandFailed { code, stderr })
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::job::JobKwargs;
    use crate::core::types::JobId;
    use serde_json::json;

    fn call(kwargs: Value, args: Vec<Value>) -> JobCall {
        let kwargs: JobKwargs = match kwargs {
            Value::Object(map) => map,
            _ => panic!("kwargs must be an object"),
        };
        JobCall {
            job_id: JobId::new("cmd"),
            args,
            kwargs,
        }
    }

    #[tokio::test]
    async fn test_successful_command() {
        let result = CommandJob
            .call(call(json!({"program": "true"}), vec![]))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_failed_command_reports_code_and_stderr() {
        let result = CommandJob
            .call(call(
                json!({"program": "sh", "args": ["-c", "echo oops >&2; exit 4"]}),
                vec![],
            ))
            .await;

        match result {
            Err(JobError::CommandFailed { code, stderr }) => {
                assert_eq!(code, 4);
                assert_eq!(stderr.trim(), "oops");
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_env_working_dir_and_positional_args() {
        let dir = tempfile::tempdir().unwrap();
        let result = CommandJob
            .call(call(
                json!({
                    "program": "sh",
                    "args": ["-c", "test \"$GREETING\" = hi && test \"$(pwd -P)\" = \"$1\"", "sh"],
                    "env": {"GREETING": "hi"},
                    "working_dir": dir.path(),
                }),
                vec![json!(dir.path().canonicalize().unwrap())],
            ))
            .await;
        assert!(result.is_ok(), "{result:?}");
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let result = CommandJob
            .call(call(
                json!({"program": "sleep", "args": ["5"], "timeout_secs": 1}),
                vec![],
            ))
            .await;
        assert!(matches!(result, Err(JobError::Timeout(d)) if d == Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_missing_program_is_invalid() {
        let result = CommandJob.call(call(json!({"args": ["x"]}), vec![])).await;
        assert!(matches!(result, Err(JobError::InvalidArguments(_))));

        let result = CommandJob
            .call(call(json!({"program": "/nonexistent/bin"}), vec![]))
            .await;
        assert!(matches!(result, Err(JobError::ExecutionFailed(_))));
    }
}
