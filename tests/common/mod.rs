//! Common test utilities shared across integration tests.

use cadence::{Environment, Registry, SchedulerMode, ServiceConfig};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

/// Path of the `cadence` binary built for this test run.
pub const CADENCE_BIN: &str = env!("CARGO_BIN_EXE_cadence");

/// An empty registry in the test environment (no start delays).
pub fn registry() -> Registry {
    Registry::new(Environment::Test)
}

/// Local-mode configuration with fast ticks and short timeouts.
pub fn local_config() -> ServiceConfig {
    ServiceConfig {
        env: Environment::Test,
        scheduler_mode: SchedulerMode::Local,
        tick_interval_ms: 50,
        shutdown_timeout_secs: 5,
        lease_ttl_secs: 5,
        ..ServiceConfig::default()
    }
}

/// A localhost port nothing is listening on right now.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Write `yaml` to `cadence.yaml` inside `dir`.
pub fn write_config(dir: &Path, yaml: &str) -> PathBuf {
    let path = dir.join("cadence.yaml");
    std::fs::write(&path, yaml).unwrap();
    path
}

/// Spawn `cadence --config <config> worker` with piped stdio.
pub fn spawn_worker(config: &Path, token: &str) -> Child {
    Command::new(CADENCE_BIN)
        .arg("--config")
        .arg(config)
        .arg("worker")
        .env(cadence::rpc::TOKEN_ENV, token)
        .env("RUST_LOG", "warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .unwrap()
}

/// Read the worker's role line (`owner` or `client`).
///
/// # Panics
///
/// Panics if the worker prints nothing within `timeout`.
pub async fn worker_role(child: &mut Child, timeout: Duration) -> String {
    let stdout = child.stdout.take().expect("worker stdout is piped");
    let mut lines = BufReader::new(stdout).lines();
    let line = tokio::time::timeout(timeout, lines.next_line())
        .await
        .expect("timed out waiting for worker role")
        .unwrap()
        .expect("worker exited without printing its role");
    line.strip_prefix("cadence-worker: ")
        .unwrap_or_else(|| panic!("unexpected worker output: {line}"))
        .to_string()
}

/// Close the worker's stdin and wait for it to exit.
pub async fn stop_worker(mut child: Child, timeout: Duration) -> std::process::ExitStatus {
    drop(child.stdin.take());
    tokio::time::timeout(timeout, child.wait())
        .await
        .expect("worker did not exit after stdin closed")
        .unwrap()
}
