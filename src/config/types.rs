//! Configuration type definitions.
//!
//! This module contains the type definitions for the service configuration
//! file (`cadence.yaml`): deployment settings, storage, and the scheduled
//! jobs and queues to declare at startup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Deployment environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Dev,
    Prod,
    Test,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Environment::Dev => "dev",
            Environment::Prod => "prod",
            Environment::Test => "test",
        };
        f.write_str(s)
    }
}

/// Where the live scheduler runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerMode {
    /// In the process that wins the singleton race.
    Local,
    /// In a dedicated process reached over authenticated RPC.
    #[default]
    Rpc,
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage (default, non-persistent, single process).
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

/// Service configuration (cadence.yaml).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub env: Environment,
    pub scheduler_mode: SchedulerMode,
    pub scheduler_rpc_port: u16,
    /// Wipe persisted scheduled jobs before reconciling the registry.
    pub clear_jobs: bool,
    pub storage: StorageConfig,
    /// Longest the scheduler loop sleeps without checking triggers.
    pub tick_interval_ms: u64,
    /// How long to wait for the RPC server process to become reachable.
    pub startup_timeout_secs: u64,
    /// How long shutdown waits for running jobs.
    pub shutdown_timeout_secs: u64,
    /// Lifetime of the singleton lease between heartbeats.
    pub lease_ttl_secs: u64,
    pub jobs: Vec<ScheduledJobConfig>,
    pub queues: Vec<QueueConfig>,
    /// File this configuration was loaded from, if any.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            env: Environment::default(),
            scheduler_mode: SchedulerMode::default(),
            scheduler_rpc_port: 8011,
            clear_jobs: false,
            storage: StorageConfig::default(),
            tick_interval_ms: 1000,
            startup_timeout_secs: 10,
            shutdown_timeout_secs: 30,
            lease_ttl_secs: 30,
            jobs: Vec::new(),
            queues: Vec::new(),
            source: None,
        }
    }
}

impl ServiceConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

/// A scheduled job declared in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJobConfig {
    /// Target in `module:callable` form.
    pub target: String,
    /// Job id. Defaults to the callable name.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    pub trigger: TriggerConfig,
}

/// Trigger configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    Interval {
        /// Period as a duration string, e.g. `30m` or `1h30m`.
        #[serde(default)]
        every: Option<String>,
        #[serde(default)]
        weeks: Option<f64>,
        #[serde(default)]
        days: Option<f64>,
        #[serde(default)]
        hours: Option<f64>,
        #[serde(default)]
        minutes: Option<f64>,
        #[serde(default)]
        seconds: Option<f64>,
        #[serde(default)]
        start_date: Option<DateTime<Utc>>,
        #[serde(default)]
        end_date: Option<DateTime<Utc>>,
        #[serde(default)]
        jitter_secs: Option<f64>,
    },
    Cron {
        /// A 5-field crontab line, instead of individual fields.
        #[serde(default)]
        crontab: Option<String>,
        #[serde(default, deserialize_with = "string_or_number")]
        year: Option<String>,
        #[serde(default, deserialize_with = "string_or_number")]
        month: Option<String>,
        #[serde(default, deserialize_with = "string_or_number")]
        week: Option<String>,
        #[serde(default, deserialize_with = "string_or_number")]
        day: Option<String>,
        #[serde(default, deserialize_with = "string_or_number")]
        day_of_week: Option<String>,
        #[serde(default, deserialize_with = "string_or_number")]
        hour: Option<String>,
        #[serde(default, deserialize_with = "string_or_number")]
        minute: Option<String>,
        #[serde(default, deserialize_with = "string_or_number")]
        second: Option<String>,
        #[serde(default)]
        timezone: Option<String>,
        #[serde(default)]
        start_date: Option<DateTime<Utc>>,
        #[serde(default)]
        end_date: Option<DateTime<Utc>>,
        #[serde(default)]
        jitter_secs: Option<f64>,
    },
    Date {
        /// RFC 3339 timestamp, or a naive `YYYY-MM-DDTHH:MM:SS` read in
        /// `timezone`.
        run_date: String,
        #[serde(default)]
        timezone: Option<String>,
    },
}

/// A queue declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Target in `module:callable` form.
    pub target: String,
    /// Queue name. Defaults to the callable name.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent() -> usize {
    1
}

/// Accept `hour: 3` as well as `hour: "*/2"`.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Field {
        Str(String),
        Int(i64),
    }

    Ok(Option::<Field>::deserialize(deserializer)?.map(|field| match field {
        Field::Str(s) => s,
        Field::Int(n) => n.to_string(),
    }))
}
