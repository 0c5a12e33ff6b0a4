//! Declaration API for scheduled jobs and queues.
//!
//! Each builder normalizes its trigger fields and forwards to the
//! [`Registry`]:
//!
//! ```ignore
//! use cadence::registry::{self, Registry};
//!
//! registry::interval()
//!     .minutes(30.0)
//!     .register(&registry, "services.stats:update_site_stats", handler)?;
//!
//! registry::cron()
//!     .hour(3)
//!     .register(&registry, "services.trackers:scrape_torrent_stats", scrape)?;
//!
//! registry::queue()
//!     .max_concurrent(4)
//!     .register(&registry, "services.webseeds:validate_webseed", validate)?;
//! ```
//!
//! Interval jobs without a `start_date` first run [`DEFAULT_START_DELAY`]
//! after the scheduler adds them, except in the `test` environment where they
//! run one period after being added.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use super::Registry;
use crate::config::Environment;
use crate::core::handler::Handler;
use crate::core::job::{JobKwargs, QueuedJobType, ScheduledJob};
use crate::core::trigger::{
    CronFields, CronTrigger, DateTrigger, IntervalTrigger, Trigger, TriggerError,
};
use crate::core::types::{JobId, JobTarget, QueueName, TargetError};

/// Delay before the first run of an interval job with no start date.
pub const DEFAULT_START_DELAY: Duration = Duration::from_secs(10);

/// Errors produced while declaring a job.
#[derive(Debug, Error)]
pub enum DeclareError {
    #[error(transparent)]
    Target(#[from] TargetError),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    /// No interval field was set.
    #[error("interval needs at least one of weeks, days, hours, minutes or seconds")]
    EmptyInterval,

    /// A numeric field is negative or not finite.
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Start an interval declaration.
pub fn interval() -> IntervalBuilder {
    IntervalBuilder::default()
}

/// Start a cron declaration.
pub fn cron() -> CronBuilder {
    CronBuilder::default()
}

/// Start a one-off date declaration.
pub fn date(run_date: impl Into<RunDate>) -> DateBuilder {
    DateBuilder {
        run_date: run_date.into(),
        timezone: None,
        common: Common::default(),
    }
}

/// Start a queue declaration.
pub fn queue() -> QueueBuilder {
    QueueBuilder::default()
}

/// Options shared by every scheduled-job builder.
#[derive(Debug, Clone)]
struct Common {
    id: Option<JobId>,
    enabled: bool,
    job_kwargs: JobKwargs,
}

impl Default for Common {
    fn default() -> Self {
        Self {
            id: None,
            enabled: true,
            job_kwargs: JobKwargs::new(),
        }
    }
}

impl Common {
    fn register(
        self,
        registry: &Registry,
        target: &str,
        handler: Handler,
        trigger: Trigger,
    ) -> Result<ScheduledJob, DeclareError> {
        let target = JobTarget::parse(target)?;
        trigger.validate()?;

        let job = ScheduledJob {
            job_id: self.id.unwrap_or_else(|| JobId::new(target.callable())),
            target,
            trigger,
            job_kwargs: self.job_kwargs,
            enabled: self.enabled,
        };
        Ok(registry.register_scheduled(job, handler))
    }
}

macro_rules! common_setters {
    () => {
        /// Override the job id (defaults to the callable name).
        pub fn id(mut self, id: impl Into<JobId>) -> Self {
            self.common.id = Some(id.into());
            self
        }

        /// Whether the job is installed in the live scheduler.
        pub fn enabled(mut self, enabled: bool) -> Self {
            self.common.enabled = enabled;
            self
        }

        /// Keyword arguments passed to every run.
        pub fn job_kwargs(mut self, job_kwargs: JobKwargs) -> Self {
            self.common.job_kwargs = job_kwargs;
            self
        }
    };
}

/// Builder for interval jobs.
#[derive(Debug, Clone, Default)]
pub struct IntervalBuilder {
    weeks: f64,
    days: f64,
    hours: f64,
    minutes: f64,
    seconds: f64,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    jitter: Option<Duration>,
    common: Common,
}

impl IntervalBuilder {
    common_setters!();

    pub fn weeks(mut self, weeks: f64) -> Self {
        self.weeks = weeks;
        self
    }

    pub fn days(mut self, days: f64) -> Self {
        self.days = days;
        self
    }

    pub fn hours(mut self, hours: f64) -> Self {
        self.hours = hours;
        self
    }

    pub fn minutes(mut self, minutes: f64) -> Self {
        self.minutes = minutes;
        self
    }

    pub fn seconds(mut self, seconds: f64) -> Self {
        self.seconds = seconds;
        self
    }

    pub fn start_date(mut self, start_date: DateTime<Utc>) -> Self {
        self.start_date = Some(start_date);
        self
    }

    pub fn end_date(mut self, end_date: DateTime<Utc>) -> Self {
        self.end_date = Some(end_date);
        self
    }

    /// Delay each run by a random amount up to `jitter`.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Normalize the fields into a trigger for the given environment.
    pub fn build_trigger(&self, environment: Environment) -> Result<Trigger, DeclareError> {
        let parts = [
            ("weeks", self.weeks, 604_800.0),
            ("days", self.days, 86_400.0),
            ("hours", self.hours, 3_600.0),
            ("minutes", self.minutes, 60.0),
            ("seconds", self.seconds, 1.0),
        ];

        let mut total = 0.0;
        for (field, value, scale) in parts {
            if !value.is_finite() || value < 0.0 {
                return Err(DeclareError::InvalidValue {
                    field,
                    value: value.to_string(),
                });
            }
            total += value * scale;
        }
        if total == 0.0 {
            return Err(DeclareError::EmptyInterval);
        }

        let period = Duration::try_from_secs_f64(total).map_err(|_| DeclareError::InvalidValue {
            field: "interval",
            value: total.to_string(),
        })?;

        let start_delay = match (self.start_date, environment) {
            (None, Environment::Dev | Environment::Prod) => Some(DEFAULT_START_DELAY),
            _ => None,
        };

        Ok(Trigger::Interval(IntervalTrigger {
            period,
            start_date: self.start_date,
            end_date: self.end_date,
            start_delay,
            jitter: self.jitter,
        }))
    }

    pub fn register(
        self,
        registry: &Registry,
        target: &str,
        handler: Handler,
    ) -> Result<ScheduledJob, DeclareError> {
        let trigger = self.build_trigger(registry.environment())?;
        self.common.register(registry, target, handler, trigger)
    }
}

/// Builder for cron jobs.
#[derive(Debug, Clone, Default)]
pub struct CronBuilder {
    fields: CronFields,
    timezone: Option<String>,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    jitter: Option<Duration>,
    common: Common,
}

impl CronBuilder {
    common_setters!();

    pub fn year(mut self, year: impl ToString) -> Self {
        self.fields.year = Some(year.to_string());
        self
    }

    pub fn month(mut self, month: impl ToString) -> Self {
        self.fields.month = Some(month.to_string());
        self
    }

    /// ISO week number.
    pub fn week(mut self, week: impl ToString) -> Self {
        self.fields.week = Some(week.to_string());
        self
    }

    pub fn day(mut self, day: impl ToString) -> Self {
        self.fields.day = Some(day.to_string());
        self
    }

    pub fn day_of_week(mut self, day_of_week: impl ToString) -> Self {
        self.fields.day_of_week = Some(day_of_week.to_string());
        self
    }

    pub fn hour(mut self, hour: impl ToString) -> Self {
        self.fields.hour = Some(hour.to_string());
        self
    }

    pub fn minute(mut self, minute: impl ToString) -> Self {
        self.fields.minute = Some(minute.to_string());
        self
    }

    pub fn second(mut self, second: impl ToString) -> Self {
        self.fields.second = Some(second.to_string());
        self
    }

    /// Timezone the fields are evaluated in (default UTC).
    pub fn timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    pub fn start_date(mut self, start_date: DateTime<Utc>) -> Self {
        self.start_date = Some(start_date);
        self
    }

    pub fn end_date(mut self, end_date: DateTime<Utc>) -> Self {
        self.end_date = Some(end_date);
        self
    }

    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Replace all fields with those of a 5-field crontab line.
    pub fn crontab(mut self, expression: &str) -> Result<Self, DeclareError> {
        self.fields = CronTrigger::from_crontab(expression)?.fields;
        Ok(self)
    }

    pub fn build_trigger(&self) -> Result<Trigger, DeclareError> {
        let mut trigger = CronTrigger::new(self.fields.clone());
        if let Some(timezone) = &self.timezone {
            trigger = trigger.with_timezone(timezone.clone());
        }
        trigger.start_date = self.start_date;
        trigger.end_date = self.end_date;
        trigger.jitter = self.jitter;
        trigger.validate()?;
        Ok(Trigger::Cron(trigger))
    }

    pub fn register(
        self,
        registry: &Registry,
        target: &str,
        handler: Handler,
    ) -> Result<ScheduledJob, DeclareError> {
        let trigger = self.build_trigger()?;
        self.common.register(registry, target, handler, trigger)
    }
}

/// Run date of a one-off job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDate {
    /// An absolute point in time.
    Utc(DateTime<Utc>),
    /// A wall-clock time, read in the builder's timezone (default UTC).
    Naive(NaiveDateTime),
}

impl From<DateTime<Utc>> for RunDate {
    fn from(dt: DateTime<Utc>) -> Self {
        RunDate::Utc(dt)
    }
}

impl From<NaiveDateTime> for RunDate {
    fn from(dt: NaiveDateTime) -> Self {
        RunDate::Naive(dt)
    }
}

/// Builder for one-off jobs.
#[derive(Debug, Clone)]
pub struct DateBuilder {
    run_date: RunDate,
    timezone: Option<String>,
    common: Common,
}

impl DateBuilder {
    common_setters!();

    /// Timezone used to read a naive run date.
    pub fn timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    pub fn build_trigger(&self) -> Result<Trigger, DeclareError> {
        let trigger = match self.run_date {
            RunDate::Utc(dt) => DateTrigger::new(dt),
            RunDate::Naive(naive) => {
                DateTrigger::in_timezone(naive, self.timezone.as_deref().unwrap_or("UTC"))?
            }
        };
        Ok(Trigger::Date(trigger))
    }

    pub fn register(
        self,
        registry: &Registry,
        target: &str,
        handler: Handler,
    ) -> Result<ScheduledJob, DeclareError> {
        let trigger = self.build_trigger()?;
        self.common.register(registry, target, handler, trigger)
    }
}

/// Builder for queue declarations.
#[derive(Debug, Clone)]
pub struct QueueBuilder {
    enabled: bool,
    max_concurrent: usize,
    job_name: Option<String>,
}

impl Default for QueueBuilder {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: 1,
            job_name: None,
        }
    }
}

impl QueueBuilder {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Queue name (defaults to the callable name).
    pub fn job_name(mut self, job_name: impl Into<String>) -> Self {
        self.job_name = Some(job_name.into());
        self
    }

    pub fn register(
        self,
        registry: &Registry,
        target: &str,
        handler: Handler,
    ) -> Result<QueuedJobType, DeclareError> {
        let target = JobTarget::parse(target)?;
        let queue_name = match self.job_name {
            Some(name) => QueueName::new(name),
            None => QueueName::new(target.callable()),
        };
        Ok(registry.register_queued_job(
            target,
            handler,
            queue_name,
            self.max_concurrent,
            self.enabled,
        ))
    }
}
