//! YAML configuration parsing.
//!
//! Parses the service configuration (`cadence.yaml`) and checks it for
//! mistakes that would otherwise only show up once the scheduler runs.

use std::collections::HashSet;
use std::path::Path;

use super::error::ConfigError;
use super::types::{ServiceConfig, TriggerConfig};
use crate::core::trigger::parse_duration;
use crate::core::types::JobTarget;

/// Loader for the service configuration.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load the service configuration from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<ServiceConfig, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
                path: path.to_path_buf(),
                source,
            })?;
        let mut config = Self::parse(&content)?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// Parse the service configuration from a YAML string.
    pub fn parse(yaml: &str) -> Result<ServiceConfig, ConfigError> {
        // An empty document is an all-defaults configuration.
        if yaml.trim().is_empty() {
            return Ok(ServiceConfig::default());
        }
        let config: ServiceConfig = serde_yaml::from_str(yaml)?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate a service configuration.
    fn validate(config: &ServiceConfig) -> Result<(), ConfigError> {
        if config.scheduler_rpc_port == 0 {
            return Err(ConfigError::InvalidConfig(
                "scheduler_rpc_port cannot be zero".into(),
            ));
        }
        if config.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "tick_interval_ms cannot be zero".into(),
            ));
        }
        if config.lease_ttl_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "lease_ttl_secs cannot be zero".into(),
            ));
        }

        let mut job_ids = HashSet::new();
        for job in &config.jobs {
            let target = parse_target(&job.target)?;
            let id = job
                .id
                .clone()
                .unwrap_or_else(|| target.callable().to_string());
            if !job_ids.insert(id.clone()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate job id: {id}"
                )));
            }
            validate_trigger(&id, &job.trigger)?;
        }

        let mut queue_names = HashSet::new();
        for queue in &config.queues {
            let target = parse_target(&queue.target)?;
            let name = queue
                .name
                .clone()
                .unwrap_or_else(|| target.callable().to_string());
            if queue.max_concurrent == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "queue '{name}': max_concurrent cannot be zero"
                )));
            }
            if !queue_names.insert(name.clone()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate queue name: {name}"
                )));
            }
        }

        Ok(())
    }
}

fn parse_target(target: &str) -> Result<JobTarget, ConfigError> {
    JobTarget::parse(target).map_err(|e| ConfigError::InvalidConfig(e.to_string()))
}

fn validate_trigger(id: &str, trigger: &TriggerConfig) -> Result<(), ConfigError> {
    let TriggerConfig::Interval {
        every,
        weeks,
        days,
        hours,
        minutes,
        seconds,
        ..
    } = trigger
    else {
        return Ok(());
    };

    let period_secs = match every {
        Some(every) => parse_duration(every)
            .map_err(|e| ConfigError::InvalidConfig(format!("job '{id}': {e}")))?
            .as_secs_f64(),
        None => [
            weeks.map(|w| w * 604_800.0),
            days.map(|d| d * 86_400.0),
            hours.map(|h| h * 3_600.0),
            minutes.map(|m| m * 60.0),
            *seconds,
        ]
        .into_iter()
        .flatten()
        .sum(),
    };

    if period_secs <= 0.0 {
        return Err(ConfigError::InvalidConfig(format!(
            "job '{id}': interval period must be greater than zero"
        )));
    }
    Ok(())
}
