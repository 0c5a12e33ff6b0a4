//! Configuration loading and parsing.
//!
//! This module provides the YAML service configuration and the declaration
//! of the jobs and queues it lists.

mod builder;
mod error;
mod types;
mod yaml;

pub use builder::declare_configured_jobs;
pub use error::ConfigError;
pub use types::{
    Environment, QueueConfig, ScheduledJobConfig, SchedulerMode, ServiceConfig, StorageConfig,
    TriggerConfig,
};
pub use yaml::ConfigLoader;
