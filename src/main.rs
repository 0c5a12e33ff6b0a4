//! cadence - singleton job scheduler with bounded job queues.
//!
//! Usage:
//!   cadence run --workers 4      Supervise worker processes sharing one scheduler
//!   cadence worker               Run a single worker
//!   cadence validate             Validate the configuration without running
//!   cadence list                 List configured jobs and queues
//!   cadence queue <NAME> [ARGS]  Submit an instance to a queue over RPC
//!   cadence queued <NAME>        List the instances of a queue

use cadence::config::declare_configured_jobs;
use cadence::rpc::{RpcClient, RpcToken, TOKEN_ENV, serve_scheduler};
use cadence::{
    ConfigLoader, JobKwargs, QueueName, Registry, SchedulerApi, ServiceConfig, build_manager,
    open_storage, register_builtins,
};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// cadence - singleton job scheduler with bounded job queues
#[derive(Parser)]
#[command(name = "cadence")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the service configuration
    #[arg(short, long, global = true, env = "CADENCE_CONFIG", default_value = "cadence.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Supervise worker processes that share one scheduler
    Run {
        /// Number of worker processes
        #[arg(short, long, default_value = "2")]
        workers: usize,
    },

    /// Run a single worker
    Worker {
        /// Keep running when stdin closes; stop on ctrl-c only
        #[arg(long)]
        ignore_stdin: bool,
    },

    /// Run the scheduler RPC server (started by the owning worker)
    #[command(hide = true)]
    ServeRpc,

    /// Validate the configuration without running
    Validate,

    /// List configured jobs and queues
    List,

    /// Submit an instance to a queue over RPC
    Queue {
        /// Queue name
        #[arg(value_name = "QUEUE")]
        queue_name: String,

        /// Positional arguments, parsed as JSON when possible
        #[arg(value_name = "ARGS")]
        args: Vec<String>,

        /// Keyword arguments as a JSON object
        #[arg(long, value_name = "JSON")]
        kwargs: Option<String>,
    },

    /// List the queued and running instances of a queue
    Queued {
        /// Queue name
        #[arg(value_name = "QUEUE")]
        queue_name: String,
    },
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let cli = Cli::parse();

    // stdout of these commands carries protocol lines or results.
    let to_stderr = matches!(
        cli.command,
        Commands::ServeRpc | Commands::Worker { .. } | Commands::Queue { .. } | Commands::Queued { .. }
    );
    init_logging(to_stderr);

    match cli.command {
        Commands::Run { workers } => run_workers(&cli.config, workers).await?,
        Commands::Worker { ignore_stdin } => run_worker(&cli.config, ignore_stdin).await?,
        Commands::ServeRpc => serve_rpc(&cli.config).await?,
        Commands::Validate => validate(&cli.config)?,
        Commands::List => list(&cli.config)?,
        Commands::Queue {
            queue_name,
            args,
            kwargs,
        } => queue(&cli.config, queue_name, args, kwargs).await?,
        Commands::Queued { queue_name } => queued(&cli.config, queue_name).await?,
    }

    Ok(())
}

fn init_logging(to_stderr: bool) {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    if to_stderr {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Load the configuration and declare everything it lists.
fn load(config_path: &Path) -> CliResult<(ServiceConfig, Arc<Registry>)> {
    let config = ConfigLoader::load(config_path)?;
    let registry = Registry::new(config.env);
    register_builtins(&registry);
    declare_configured_jobs(&config, &registry)?;
    Ok((config, Arc::new(registry)))
}

fn client(config: &ServiceConfig) -> CliResult<RpcClient> {
    let token =
        RpcToken::from_env().ok_or_else(|| format!("{TOKEN_ENV} must be set to reach the scheduler"))?;
    Ok(RpcClient::new(config.scheduler_rpc_port, token))
}

/// Spawn `workers` worker processes and keep them running until ctrl-c.
async fn run_workers(config_path: &Path, workers: usize) -> CliResult<()> {
    let config = ConfigLoader::load(config_path)?;
    let token = RpcToken::from_env().unwrap_or_else(RpcToken::generate);
    let exe = std::env::current_exe()?;

    info!(
        "Starting {} worker(s) ({:?} mode, rpc port {})",
        workers, config.scheduler_mode, config.scheduler_rpc_port
    );

    let mut children: Vec<Child> = Vec::with_capacity(workers);
    for _ in 0..workers {
        let child = Command::new(&exe)
            .arg("--config")
            .arg(config_path)
            .arg("worker")
            .env(TOKEN_ENV, token.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        info!("  - worker pid {}", child.id().unwrap_or_default());
        children.push(child);
    }

    info!("Press Ctrl+C to stop");
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            _ = ticker.tick() => {
                children.retain_mut(|child| match child.try_wait() {
                    Ok(Some(status)) => {
                        warn!("worker exited: {}", status);
                        false
                    }
                    _ => true,
                });
                if children.is_empty() {
                    error!("All workers exited");
                    return Err("all workers exited".into());
                }
            }
        }
    }

    // Closing stdin asks each worker to stop.
    for child in &mut children {
        drop(child.stdin.take());
    }
    let grace = config.shutdown_timeout() + config.startup_timeout();
    for mut child in children {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => info!("worker exited: {}", status),
            Ok(Err(e)) => warn!("failed to wait for worker: {}", e),
            Err(_) => {
                warn!("worker did not stop within {:?}, killing it", grace);
                child.kill().await?;
            }
        }
    }

    info!("Goodbye!");
    Ok(())
}

/// One web-worker: race for scheduler ownership, then idle until asked to
/// stop.
async fn run_worker(config_path: &Path, ignore_stdin: bool) -> CliResult<()> {
    let (config, registry) = load(config_path)?;
    let storage = open_storage(&config.storage).await?;
    let manager = build_manager(&config, registry, storage);

    let owner = manager.start().await?;
    {
        let mut stdout = std::io::stdout().lock();
        writeln!(
            stdout,
            "cadence-worker: {}",
            if owner { "owner" } else { "client" }
        )?;
        stdout.flush()?;
    }

    if !owner && manager.get_scheduler().await.is_none() {
        warn!("no scheduler reachable from this worker");
    }

    let stdin_closed = stdin_closed(ignore_stdin);
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        _ = stdin_closed => info!("stdin closed"),
    }

    manager.shutdown().await?;
    Ok(())
}

/// Resolves when stdin reaches EOF, or never with `ignore_stdin`.
///
/// The read runs on a detached thread so an open terminal cannot hold up
/// process exit.
async fn stdin_closed(ignore_stdin: bool) {
    if ignore_stdin {
        return std::future::pending().await;
    }
    let (tx, rx) = oneshot::channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        while matches!(stdin.lock().read_line(&mut line), Ok(n) if n > 0) {
            line.clear();
        }
        let _ = tx.send(());
    });
    let _ = rx.await;
}

/// The scheduler process of rpc mode.
async fn serve_rpc(config_path: &Path) -> CliResult<()> {
    let (config, registry) = load(config_path)?;
    let token = RpcToken::from_env().ok_or_else(|| format!("{TOKEN_ENV} is not set"))?;
    let storage = open_storage(&config.storage).await?;

    info!("Starting scheduler RPC server (pid {})", std::process::id());
    serve_scheduler(&config, registry, storage, token).await?;
    info!("Scheduler RPC server stopped");
    Ok(())
}

/// Validate the configuration without running.
fn validate(config_path: &Path) -> CliResult<()> {
    info!("Validating configuration: {}", config_path.display());

    match load(config_path) {
        Ok((config, _)) => {
            info!(
                "Configuration is valid: {} job(s), {} queue(s)",
                config.jobs.len(),
                config.queues.len()
            );
            Ok(())
        }
        Err(e) => {
            error!("Validation failed: {}", e);
            Err(e)
        }
    }
}

/// Print configured jobs and queues.
fn list(config_path: &Path) -> CliResult<()> {
    let (config, registry) = load(config_path)?;

    let mut jobs: Vec<_> = registry.get_scheduled_jobs().into_values().collect();
    jobs.sort_by(|a, b| a.job_id.cmp(&b.job_id));
    let mut queues: Vec<_> = registry.get_queued_jobs().into_values().collect();
    queues.sort_by(|a, b| a.queue_name.cmp(&b.queue_name));

    if jobs.is_empty() && queues.is_empty() {
        println!("No jobs or queues in {}", config_path.display());
        return Ok(());
    }

    println!(
        "Configuration {} ({:?} mode):",
        config_path.display(),
        config.scheduler_mode
    );
    println!();

    for job in &jobs {
        println!("Job: {}", job.job_id);
        println!("  Target: {}", job.target);
        println!("  Trigger: {}", job.trigger);
        println!("  Enabled: {}", job.enabled);
        if !job.job_kwargs.is_empty() {
            println!("  Kwargs: {}", Value::Object(job.job_kwargs.clone()));
        }
        println!();
    }

    for queue in &queues {
        println!("Queue: {}", queue.queue_name);
        println!("  Target: {}", queue.target);
        println!("  Max concurrent: {}", queue.max_concurrent);
        println!("  Enabled: {}", queue.enabled);
        println!();
    }

    Ok(())
}

/// Submit to a queue of the running scheduler.
async fn queue(
    config_path: &Path,
    queue_name: String,
    args: Vec<String>,
    kwargs: Option<String>,
) -> CliResult<()> {
    let config = ConfigLoader::load(config_path)?;
    let client = client(&config)?;

    let args: Vec<Value> = args
        .into_iter()
        .map(|arg| serde_json::from_str(&arg).unwrap_or(Value::String(arg)))
        .collect();
    let kwargs: JobKwargs = match kwargs {
        Some(raw) => match serde_json::from_str(&raw)? {
            Value::Object(map) => map,
            other => return Err(format!("--kwargs must be a JSON object, got {other}").into()),
        },
        None => JobKwargs::new(),
    };

    let result = client
        .queue_job(&QueueName::new(queue_name), args, kwargs)
        .await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if result.success {
        Ok(())
    } else {
        Err(result
            .message
            .unwrap_or_else(|| "submission rejected".to_string())
            .into())
    }
}

/// List the instances of a queue of the running scheduler.
async fn queued(config_path: &Path, queue_name: String) -> CliResult<()> {
    let config = ConfigLoader::load(config_path)?;
    let client = client(&config)?;

    let instances = client.get_queued_jobs(&QueueName::new(&queue_name)).await?;
    if instances.is_empty() {
        println!("Queue '{}' is empty", queue_name);
        return Ok(());
    }

    let mut instances: Vec<_> = instances.into_values().collect();
    instances.sort_by(|a, b| a.id.cmp(&b.id));
    for job in instances {
        println!("{}  {}  args={}", job.id, job.func, Value::Array(job.args));
    }
    Ok(())
}
