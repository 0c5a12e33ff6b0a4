//! Trigger definitions and next fire time calculation.
//!
//! A trigger decides when a scheduled job runs:
//!
//! - [`CronTrigger`]: calendar fields (`year`, `month`, `week`, `day`,
//!   `day_of_week`, `hour`, `minute`, `second`) evaluated in a timezone
//! - [`IntervalTrigger`]: a fixed recurring period
//! - [`DateTrigger`]: a single point in time
//!
//! Cron fields that are left unset follow calendar semantics: fields more
//! significant than the least significant explicit field match anything,
//! less significant ones take their minimum value. `cron().hour("3")` fires
//! once a day at 03:00:00, not every second of the third hour.

use chrono::{DateTime, Datelike, Days, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Upper bound on whole-week skips while searching for a matching ISO week.
const MAX_WEEK_SKIPS: usize = 110;

/// Longest interval period, start delay or jitter accepted (about 100 years).
pub const MAX_INTERVAL: Duration = Duration::from_secs(100 * 365 * 86_400);

/// Errors that can occur when building or evaluating triggers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriggerError {
    /// Invalid cron field combination.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// Invalid value for the `week` field.
    #[error("invalid week expression: {0}")]
    InvalidWeek(String),

    /// Invalid interval period.
    #[error("invalid interval: {0}")]
    InvalidInterval(String),

    /// Invalid timezone.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// A naive run date does not exist in its timezone.
    #[error("invalid run date: {0}")]
    InvalidDate(String),
}

/// The kind of a trigger, without its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Cron,
    Date,
    Interval,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerKind::Cron => "cron",
            TriggerKind::Date => "date",
            TriggerKind::Interval => "interval",
        };
        f.write_str(s)
    }
}

/// A normalized trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    Cron(CronTrigger),
    Date(DateTrigger),
    Interval(IntervalTrigger),
}

impl Trigger {
    /// The kind of this trigger.
    pub fn kind(&self) -> TriggerKind {
        match self {
            Trigger::Cron(_) => TriggerKind::Cron,
            Trigger::Date(_) => TriggerKind::Date,
            Trigger::Interval(_) => TriggerKind::Interval,
        }
    }

    /// Check that the trigger can be evaluated.
    pub fn validate(&self) -> Result<(), TriggerError> {
        match self {
            Trigger::Cron(cron) => cron.validate(),
            Trigger::Date(_) => Ok(()),
            Trigger::Interval(interval) => interval.validate(),
        }
    }

    /// Compute the first fire time for a job added at `now`.
    ///
    /// Returns `None` if the trigger will never fire.
    pub fn first_fire_time(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, TriggerError> {
        match self {
            Trigger::Cron(cron) => cron.first_fire_time(now),
            Trigger::Date(date) => Ok(Some(date.run_date)),
            Trigger::Interval(interval) => interval.first_fire_time(now),
        }
    }

    /// Compute the fire time following `previous`.
    ///
    /// Occurrences that fall before `now` are skipped rather than replayed.
    pub fn next_fire_time(
        &self,
        previous: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, TriggerError> {
        match self {
            Trigger::Cron(cron) => cron.next_fire_time(previous, now),
            Trigger::Date(_) => Ok(None),
            Trigger::Interval(interval) => interval.next_fire_time(previous, now),
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Cron(cron) => write!(
                f,
                "cron[{}] ({})",
                cron.fields.expression(),
                cron.timezone
            ),
            Trigger::Date(date) => write!(f, "date[{}]", date.run_date.to_rfc3339()),
            Trigger::Interval(interval) => write!(f, "interval[{:?}]", interval.period),
        }
    }
}

/// Calendar fields of a cron trigger. `None` means "not given".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CronFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub month: Option<String>,
    /// ISO week number (1-53).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub week: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day: Option<String>,
    /// Day of week, by name (`MON-FRI`) or number with 1 = Sunday.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hour: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minute: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub second: Option<String>,
}

impl CronFields {
    /// Fields ordered from most to least significant.
    fn ordered(&self) -> [&Option<String>; 8] {
        [
            &self.year,
            &self.month,
            &self.week,
            &self.day,
            &self.day_of_week,
            &self.hour,
            &self.minute,
            &self.second,
        ]
    }

    /// Resolve every field, filling the unset ones with calendar defaults.
    fn resolved(&self) -> [String; 8] {
        const MINIMUMS: [&str; 8] = ["*", "1", "*", "1", "*", "0", "0", "0"];

        let fields = self.ordered();
        let last_explicit = fields.iter().rposition(|f| f.is_some());

        std::array::from_fn(|i| match fields[i] {
            Some(value) => value.trim().to_string(),
            None => match last_explicit {
                Some(last) if i > last => MINIMUMS[i].to_string(),
                _ => "*".to_string(),
            },
        })
    }

    /// The 7-field expression handed to the cron parser
    /// (`sec min hour day month day_of_week year`).
    pub fn expression(&self) -> String {
        let [year, month, _week, day, day_of_week, hour, minute, second] = self.resolved();
        format!("{second} {minute} {hour} {day} {month} {day_of_week} {year}")
    }

    fn week_filter(&self) -> Result<Option<BTreeSet<u32>>, TriggerError> {
        match self.week.as_deref().map(str::trim) {
            None | Some("*") => Ok(None),
            Some(expr) => parse_week(expr).map(Some),
        }
    }
}

/// A calendar-based trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronTrigger {
    pub fields: CronFields,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<Duration>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl CronTrigger {
    /// Create a cron trigger in UTC.
    pub fn new(fields: CronFields) -> Self {
        Self {
            fields,
            timezone: default_timezone(),
            start_date: None,
            end_date: None,
            jitter: None,
        }
    }

    /// Build a trigger from a standard 5-field crontab line
    /// (`minute hour day month day_of_week`).
    pub fn from_crontab(expression: &str) -> Result<Self, TriggerError> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        let [minute, hour, day, month, day_of_week] = parts.as_slice() else {
            return Err(TriggerError::InvalidCron(format!(
                "expected 5 fields, got {}",
                parts.len()
            )));
        };

        let fields = CronFields {
            month: Some(month.to_string()),
            day: Some(day.to_string()),
            day_of_week: Some(day_of_week.to_string()),
            hour: Some(hour.to_string()),
            minute: Some(minute.to_string()),
            second: Some("0".to_string()),
            ..CronFields::default()
        };
        let trigger = Self::new(fields);
        trigger.validate()?;
        Ok(trigger)
    }

    /// Set the timezone the fields are evaluated in.
    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn validate(&self) -> Result<(), TriggerError> {
        parse_timezone(&self.timezone)?;
        self.compile()?;
        self.fields.week_filter()?;
        Ok(())
    }

    fn compile(&self) -> Result<CronSchedule, TriggerError> {
        let expression = self.fields.expression();
        CronSchedule::from_str(&expression)
            .map_err(|e| TriggerError::InvalidCron(format!("{expression}: {e}")))
    }

    fn first_fire_time(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, TriggerError> {
        let from = match self.start_date {
            Some(start) if start > now => start - TimeDelta::seconds(1),
            _ => now,
        };
        self.occurrence_after(from)
    }

    fn next_fire_time(
        &self,
        previous: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, TriggerError> {
        self.occurrence_after(previous.max(now))
    }

    fn occurrence_after(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, TriggerError> {
        let tz = parse_timezone(&self.timezone)?;
        let schedule = self.compile()?;
        let weeks = self.fields.week_filter()?;

        let mut cursor = after.with_timezone(&tz);
        for _ in 0..MAX_WEEK_SKIPS {
            let Some(candidate) = schedule.after(&cursor).next() else {
                return Ok(None);
            };

            if let Some(weeks) = &weeks {
                if !weeks.contains(&candidate.iso_week().week()) {
                    cursor = start_of_next_week(&tz, &candidate) - TimeDelta::seconds(1);
                    continue;
                }
            }

            let fire = candidate.with_timezone(&Utc);
            if self.end_date.is_some_and(|end| fire > end) {
                return Ok(None);
            }
            return apply_jitter(fire, self.jitter).map(Some);
        }

        Ok(None)
    }
}

/// A trigger that fires once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateTrigger {
    pub run_date: DateTime<Utc>,
}

impl DateTrigger {
    pub fn new(run_date: DateTime<Utc>) -> Self {
        Self { run_date }
    }

    /// Interpret a naive local time in the named timezone.
    pub fn in_timezone(
        run_date: chrono::NaiveDateTime,
        timezone: &str,
    ) -> Result<Self, TriggerError> {
        let tz = parse_timezone(timezone)?;
        let local = tz
            .from_local_datetime(&run_date)
            .earliest()
            .ok_or_else(|| TriggerError::InvalidDate(format!("{run_date} in {timezone}")))?;
        Ok(Self::new(local.with_timezone(&Utc)))
    }
}

/// A trigger that fires on a fixed period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalTrigger {
    pub period: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    /// Delay before the first run when no `start_date` is given.
    /// Without it, the first run happens one period after the job is added.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_delay: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<Duration>,
}

impl IntervalTrigger {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            start_date: None,
            end_date: None,
            start_delay: None,
            jitter: None,
        }
    }

    pub fn validate(&self) -> Result<(), TriggerError> {
        self.period_delta()?;
        for (name, value) in [("start delay", self.start_delay), ("jitter", self.jitter)] {
            if value.is_some_and(|v| v > MAX_INTERVAL) {
                return Err(TriggerError::InvalidInterval(format!(
                    "{name} {value:?} exceeds {MAX_INTERVAL:?}"
                )));
            }
        }
        Ok(())
    }

    fn period_delta(&self) -> Result<TimeDelta, TriggerError> {
        if self.period < Duration::from_millis(1) {
            return Err(TriggerError::InvalidInterval(format!(
                "period must be at least 1ms, got {:?}",
                self.period
            )));
        }
        if self.period > MAX_INTERVAL {
            return Err(TriggerError::InvalidInterval(format!(
                "period {:?} exceeds {MAX_INTERVAL:?}",
                self.period
            )));
        }
        TimeDelta::from_std(self.period)
            .map_err(|e| TriggerError::InvalidInterval(e.to_string()))
    }

    fn first_fire_time(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, TriggerError> {
        let period = self.period_delta()?;
        let first = match (self.start_date, self.start_delay) {
            (Some(start), _) if start >= now => start,
            (Some(start), _) => align_after(start, now, period)?,
            (None, Some(delay)) => shift(
                now,
                TimeDelta::from_std(delay)
                    .map_err(|e| TriggerError::InvalidInterval(e.to_string()))?,
            )?,
            (None, None) => shift(now, period)?,
        };
        self.bounded(first)
    }

    fn next_fire_time(
        &self,
        previous: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, TriggerError> {
        let period = self.period_delta()?;
        let mut next = shift(previous, period)?;
        if next < now {
            next = align_after(previous, now, period)?;
        }
        self.bounded(next)
    }

    fn bounded(&self, fire: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, TriggerError> {
        if self.end_date.is_some_and(|end| fire > end) {
            return Ok(None);
        }
        apply_jitter(fire, self.jitter).map(Some)
    }
}

/// `at + delta`, failing instead of leaving the representable range.
fn shift(at: DateTime<Utc>, delta: TimeDelta) -> Result<DateTime<Utc>, TriggerError> {
    at.checked_add_signed(delta).ok_or_else(|| {
        TriggerError::InvalidInterval(format!("{at} plus {delta} is out of range"))
    })
}

/// First `anchor + k * period` (k >= 1) strictly after `now`.
fn align_after(
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
    period: TimeDelta,
) -> Result<DateTime<Utc>, TriggerError> {
    let period_ms = period.num_milliseconds().max(1);
    let elapsed_ms = (now - anchor).num_milliseconds().max(0);
    let periods = elapsed_ms / period_ms + 1;
    let offset = period_ms
        .checked_mul(periods)
        .and_then(TimeDelta::try_milliseconds)
        .ok_or_else(|| TriggerError::InvalidInterval(format!("{periods} periods of {period}")))?;
    shift(anchor, offset)
}

fn apply_jitter(
    fire: DateTime<Utc>,
    jitter: Option<Duration>,
) -> Result<DateTime<Utc>, TriggerError> {
    match jitter {
        Some(jitter) if !jitter.is_zero() => {
            let max_ms = jitter.as_millis().min(i64::MAX as u128) as i64;
            let offset = rand::thread_rng().gen_range(0..=max_ms);
            let offset = TimeDelta::try_milliseconds(offset).ok_or_else(|| {
                TriggerError::InvalidInterval(format!("jitter {jitter:?} is out of range"))
            })?;
            shift(fire, offset)
        }
        _ => Ok(fire),
    }
}

fn start_of_next_week(tz: &Tz, current: &DateTime<Tz>) -> DateTime<Tz> {
    let days_left = 7 - u64::from(current.weekday().num_days_from_monday());
    current
        .date_naive()
        .checked_add_days(Days::new(days_left))
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .and_then(|midnight| tz.from_local_datetime(&midnight).earliest())
        .unwrap_or_else(|| current.clone() + TimeDelta::days(1))
}

/// Parse a timezone name such as `UTC` or `Europe/Berlin`.
pub fn parse_timezone(timezone: &str) -> Result<Tz, TriggerError> {
    timezone
        .parse::<Tz>()
        .map_err(|_| TriggerError::InvalidTimezone(timezone.to_string()))
}

/// Parse an ISO week expression: `n`, `a-b`, `*/n`, `a-b/n`, comma-separated.
fn parse_week(expr: &str) -> Result<BTreeSet<u32>, TriggerError> {
    let invalid = || TriggerError::InvalidWeek(expr.to_string());
    let mut weeks = BTreeSet::new();

    for part in expr.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, step.parse::<u32>().map_err(|_| invalid())?),
            None => (part, 1),
        };
        if step == 0 {
            return Err(invalid());
        }

        let (lo, hi) = match range {
            "*" => (1, 53),
            r => match r.split_once('-') {
                Some((lo, hi)) => (
                    lo.parse::<u32>().map_err(|_| invalid())?,
                    hi.parse::<u32>().map_err(|_| invalid())?,
                ),
                None => {
                    let n = r.parse::<u32>().map_err(|_| invalid())?;
                    (n, n)
                }
            },
        };
        if lo == 0 || hi > 53 || lo > hi {
            return Err(invalid());
        }

        weeks.extend((lo..=hi).step_by(step as usize));
    }

    Ok(weeks)
}

/// Parse a duration string like "5m", "1h30m", "30s", "2d" or "250ms".
pub fn parse_duration(s: &str) -> Result<Duration, TriggerError> {
    let invalid = || TriggerError::InvalidInterval(s.to_string());
    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut chars = s.trim().chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }

        let num: u64 = digits.parse().map_err(|_| invalid())?;
        digits.clear();

        total += match c {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                Duration::from_millis(num)
            }
            's' => Duration::from_secs(num),
            'm' => Duration::from_secs(num * 60),
            'h' => Duration::from_secs(num * 3600),
            'd' => Duration::from_secs(num * 86400),
            'w' => Duration::from_secs(num * 604800),
            _ => return Err(invalid()),
        };
    }

    if !digits.is_empty() || total.is_zero() {
        return Err(invalid());
    }

    Ok(total)
}
