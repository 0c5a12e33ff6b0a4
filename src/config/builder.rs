//! Declare configured jobs and queues in a registry.
//!
//! Configured targets resolve against handlers already present in the
//! registry, typically the built-ins from
//! [`register_builtins`](crate::execution::register_builtins).

use chrono::{DateTime, NaiveDateTime, Utc};
use std::time::Duration;

use super::error::ConfigError;
use super::types::{QueueConfig, ScheduledJobConfig, ServiceConfig, TriggerConfig};
use crate::core::handler::Handler;
use crate::core::trigger::parse_duration;
use crate::core::types::JobTarget;
use crate::registry::{DeclareError, Registry, declare};

/// Register every job and queue from `config`.
///
/// Returns the number of declarations made.
pub fn declare_configured_jobs(
    config: &ServiceConfig,
    registry: &Registry,
) -> Result<usize, ConfigError> {
    for job in &config.jobs {
        declare_job(job, registry)?;
    }
    for queue in &config.queues {
        declare_queue(queue, registry)?;
    }

    let declared = config.jobs.len() + config.queues.len();
    tracing::debug!(
        jobs = config.jobs.len(),
        queues = config.queues.len(),
        "declared configured jobs"
    );
    Ok(declared)
}

fn resolve_handler(target: &str, registry: &Registry) -> Result<Handler, ConfigError> {
    let parsed =
        JobTarget::parse(target).map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
    registry
        .handler(&parsed)
        .ok_or_else(|| ConfigError::UnknownTarget(target.to_string()))
}

fn declare_job(job: &ScheduledJobConfig, registry: &Registry) -> Result<(), ConfigError> {
    let handler = resolve_handler(&job.target, registry)?;
    let name = job.id.clone().unwrap_or_else(|| job.target.clone());
    let declare_err = |source: DeclareError| ConfigError::Declare {
        name: name.clone(),
        source,
    };

    let result = match &job.trigger {
        TriggerConfig::Interval {
            every,
            weeks,
            days,
            hours,
            minutes,
            seconds,
            start_date,
            end_date,
            jitter_secs,
        } => {
            let mut builder = declare::interval()
                .enabled(job.enabled)
                .job_kwargs(job.kwargs.clone());
            if let Some(every) = every {
                let period = parse_duration(every).map_err(|e| declare_err(e.into()))?;
                builder = builder.seconds(period.as_secs_f64());
            }
            if let Some(weeks) = weeks {
                builder = builder.weeks(*weeks);
            }
            if let Some(days) = days {
                builder = builder.days(*days);
            }
            if let Some(hours) = hours {
                builder = builder.hours(*hours);
            }
            if let Some(minutes) = minutes {
                builder = builder.minutes(*minutes);
            }
            if let Some(seconds) = seconds {
                builder = builder.seconds(*seconds);
            }
            if let Some(start_date) = start_date {
                builder = builder.start_date(*start_date);
            }
            if let Some(end_date) = end_date {
                builder = builder.end_date(*end_date);
            }
            if let Some(jitter) = jitter(*jitter_secs, &name)? {
                builder = builder.jitter(jitter);
            }
            if let Some(id) = &job.id {
                builder = builder.id(id.as_str());
            }
            builder.register(registry, &job.target, handler)
        }
        TriggerConfig::Cron {
            crontab,
            year,
            month,
            week,
            day,
            day_of_week,
            hour,
            minute,
            second,
            timezone,
            start_date,
            end_date,
            jitter_secs,
        } => {
            let mut builder = declare::cron()
                .enabled(job.enabled)
                .job_kwargs(job.kwargs.clone());
            if let Some(crontab) = crontab {
                builder = builder.crontab(crontab).map_err(&declare_err)?;
            }
            if let Some(year) = year {
                builder = builder.year(year);
            }
            if let Some(month) = month {
                builder = builder.month(month);
            }
            if let Some(week) = week {
                builder = builder.week(week);
            }
            if let Some(day) = day {
                builder = builder.day(day);
            }
            if let Some(day_of_week) = day_of_week {
                builder = builder.day_of_week(day_of_week);
            }
            if let Some(hour) = hour {
                builder = builder.hour(hour);
            }
            if let Some(minute) = minute {
                builder = builder.minute(minute);
            }
            if let Some(second) = second {
                builder = builder.second(second);
            }
            if let Some(timezone) = timezone {
                builder = builder.timezone(timezone.as_str());
            }
            if let Some(start_date) = start_date {
                builder = builder.start_date(*start_date);
            }
            if let Some(end_date) = end_date {
                builder = builder.end_date(*end_date);
            }
            if let Some(jitter) = jitter(*jitter_secs, &name)? {
                builder = builder.jitter(jitter);
            }
            if let Some(id) = &job.id {
                builder = builder.id(id.as_str());
            }
            builder.register(registry, &job.target, handler)
        }
        TriggerConfig::Date { run_date, timezone } => {
            let mut builder = match DateTime::parse_from_rfc3339(run_date) {
                Ok(at) => declare::date(at.with_timezone(&Utc)),
                Err(_) => {
                    let naive = NaiveDateTime::parse_from_str(run_date, "%Y-%m-%dT%H:%M:%S")
                        .or_else(|_| NaiveDateTime::parse_from_str(run_date, "%Y-%m-%d %H:%M:%S"))
                        .map_err(|e| {
                            ConfigError::InvalidConfig(format!(
                                "job '{name}': invalid run_date '{run_date}': {e}"
                            ))
                        })?;
                    declare::date(naive)
                }
            }
            .enabled(job.enabled)
            .job_kwargs(job.kwargs.clone());
            if let Some(timezone) = timezone {
                builder = builder.timezone(timezone.as_str());
            }
            if let Some(id) = &job.id {
                builder = builder.id(id.as_str());
            }
            builder.register(registry, &job.target, handler)
        }
    };

    result.map(|_| ()).map_err(declare_err)
}

fn jitter(jitter_secs: Option<f64>, name: &str) -> Result<Option<Duration>, ConfigError> {
    match jitter_secs {
        None => Ok(None),
        Some(secs) => Duration::try_from_secs_f64(secs).map(Some).map_err(|_| {
            ConfigError::InvalidConfig(format!("job '{name}': invalid jitter_secs {secs}"))
        }),
    }
}

fn declare_queue(queue: &QueueConfig, registry: &Registry) -> Result<(), ConfigError> {
    let handler = resolve_handler(&queue.target, registry)?;
    let mut builder = declare::queue()
        .enabled(queue.enabled)
        .max_concurrent(queue.max_concurrent);
    if let Some(name) = &queue.name {
        builder = builder.job_name(name.as_str());
    }
    builder
        .register(registry, &queue.target, handler)
        .map(|_| ())
        .map_err(|source| ConfigError::Declare {
            name: queue.name.clone().unwrap_or_else(|| queue.target.clone()),
            source,
        })
}
