//! Scheduler ownership through a dedicated RPC server process.

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;

use super::SchedulerManager;
use super::guard::{SingletonGuard, lease_lost};
use crate::config::ServiceConfig;
use crate::rpc::{READY_MARKER, RpcClient, RpcToken, TOKEN_ENV};
use crate::scheduler::{SchedulerApi, SchedulerError};
use crate::storage::Storage;

/// How the scheduler process is launched.
#[derive(Debug, Clone)]
pub struct SpawnCommand {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl SpawnCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// `<current executable> serve-rpc --config <config_path>`.
    pub fn serve_rpc(config_path: &Path) -> Result<Self, SchedulerError> {
        let exe = std::env::current_exe()
            .map_err(|e| SchedulerError::Spawn(format!("cannot locate current executable: {e}")))?;
        Ok(Self::new(exe)
            .arg("serve-rpc")
            .arg("--config")
            .arg(config_path))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command.envs(self.envs.iter().map(|(k, v)| (k, v)));
        command
    }
}

/// Supervises the scheduler process and talks to it over RPC.
pub struct RpcSchedulerManager {
    config: ServiceConfig,
    guard: SingletonGuard,
    token: RpcToken,
    client: RpcClient,
    spawn: Option<SpawnCommand>,
    child: Arc<Mutex<Option<Child>>>,
}

impl RpcSchedulerManager {
    pub fn new(config: ServiceConfig, storage: Arc<dyn Storage>) -> Self {
        let token = RpcToken::for_process();
        Self {
            guard: SingletonGuard::new(storage, config.lease_ttl()),
            client: RpcClient::new(config.scheduler_rpc_port, token.clone()),
            token,
            spawn: None,
            child: Arc::new(Mutex::new(None)),
            config,
        }
    }

    /// Use `token` instead of the process token.
    pub fn with_token(mut self, token: RpcToken) -> Self {
        self.client = RpcClient::new(self.config.scheduler_rpc_port, token.clone());
        self.token = token;
        self
    }

    /// Launch the scheduler process with `spawn` instead of
    /// `<current executable> serve-rpc`.
    pub fn with_spawn_command(mut self, spawn: SpawnCommand) -> Self {
        self.spawn = Some(spawn);
        self
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    fn spawn_command(&self) -> Result<SpawnCommand, SchedulerError> {
        if let Some(spawn) = &self.spawn {
            return Ok(spawn.clone());
        }
        let path = self.config.source.as_deref().ok_or_else(|| {
            SchedulerError::Spawn("rpc mode needs a configuration file".to_string())
        })?;
        SpawnCommand::serve_rpc(path)
    }
}

/// Read child stdout until the ready marker.
async fn wait_until_ready(lines: &mut Lines<BufReader<ChildStdout>>) -> Result<(), String> {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim() == READY_MARKER => return Ok(()),
            Ok(Some(line)) => tracing::debug!(target: "cadence::rpc_server", "{line}"),
            Ok(None) => return Err("scheduler process exited before becoming ready".to_string()),
            Err(e) => return Err(format!("failed to read scheduler process output: {e}")),
        }
    }
}

#[async_trait]
impl SchedulerManager for RpcSchedulerManager {
    fn guard(&self) -> &SingletonGuard {
        &self.guard
    }

    async fn start_scheduler(&self) -> Result<(), SchedulerError> {
        let mut slot = self.child.lock().await;
        if let Some(child) = slot.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                tracing::info!(pid = child.id(), "scheduler process already running");
                return Ok(());
            }
        }

        let spawn = self.spawn_command()?;
        let mut command = spawn.command();
        command
            .env(TOKEN_ENV, self.token.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            SchedulerError::Spawn(format!("{}: {e}", spawn.program().display()))
        })?;
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill().await;
            return Err(SchedulerError::Spawn("scheduler process has no stdout".to_string()));
        };
        let mut lines = BufReader::new(stdout).lines();

        let startup_timeout = self.config.startup_timeout();
        let ready = match tokio::time::timeout(startup_timeout, wait_until_ready(&mut lines)).await
        {
            Ok(ready) => ready,
            Err(_) => Err(format!(
                "scheduler process not ready after {startup_timeout:?}"
            )),
        };
        if let Err(reason) = ready {
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "failed to kill scheduler process");
            }
            return Err(SchedulerError::Spawn(reason));
        }

        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(target: "cadence::rpc_server", "{line}");
            }
        });

        tracing::info!(
            mode = "rpc",
            pid = child.id(),
            port = self.config.scheduler_rpc_port,
            "scheduler owner started"
        );
        *slot = Some(child);

        let supervised = Arc::clone(&self.child);
        let lease = self.guard.subscribe();
        tokio::spawn(async move {
            if !lease_lost(lease).await {
                return;
            }
            tracing::error!(mode = "rpc", "lease lost, killing scheduler process");
            if let Some(mut child) = supervised.lock().await.take() {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill scheduler process");
                }
            }
        });
        Ok(())
    }

    async fn shutdown_scheduler(&self) -> Result<(), SchedulerError> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        let grace = self.config.shutdown_timeout();
        let client = self.client.clone().with_timeout(grace + Duration::from_secs(5));
        if let Err(e) = client.shutdown().await {
            tracing::debug!(error = %e, "shutdown rpc failed");
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => tracing::info!(%status, "scheduler process exited"),
            Ok(Err(e)) => tracing::warn!(error = %e, "failed to wait for scheduler process"),
            Err(_) => {
                tracing::warn!(timeout = ?grace, "scheduler process did not exit, killing it");
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill scheduler process");
                }
            }
        }
        Ok(())
    }

    async fn get_scheduler(&self) -> Option<Arc<dyn SchedulerApi>> {
        match self.client.ping().await {
            Ok(_) => Some(Arc::new(self.client.clone())),
            Err(e) => {
                tracing::warn!(error = %e, url = self.client.url(), "scheduler unreachable");
                None
            }
        }
    }

    async fn is_running(&self) -> bool {
        match self.child.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}
