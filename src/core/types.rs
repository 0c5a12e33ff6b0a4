//! Core identifier types for the scheduler.
//!
//! These types provide type-safe identifiers for scheduled jobs, queues,
//! individual runs, and the string targets that name job callables.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a job known to the scheduler.
///
/// Scheduled jobs use their function identity; queued job instances use a
/// content hash of their queue name and arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(String);

/// Name of a bounded job queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueName(String);

/// Unique identifier for a single execution of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl JobId {
    /// Create a new JobId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl QueueName {
    /// Create a new QueueName from a string.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for QueueName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for QueueName {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl RunId {
    /// Generate a new random RunId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors produced when parsing a job target.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    /// The target has no `:` separator.
    #[error("job target '{0}' must have the form 'module:callable'")]
    MissingSeparator(String),

    /// One side of the separator is empty or contains whitespace.
    #[error("job target '{0}' has an empty or malformed module or callable")]
    Malformed(String),
}

/// A `"module:callable"` reference to a job callable.
///
/// Targets cross process boundaries as plain strings and are resolved through
/// the handler table of the process that executes them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobTarget {
    module: String,
    callable: String,
}

impl JobTarget {
    /// Parse a target from its `module:callable` form.
    pub fn parse(s: &str) -> Result<Self, TargetError> {
        let (module, callable) = s
            .split_once(':')
            .ok_or_else(|| TargetError::MissingSeparator(s.to_string()))?;

        let valid = |part: &str| !part.is_empty() && !part.contains(char::is_whitespace);
        if !valid(module) || !valid(callable) || callable.contains(':') {
            return Err(TargetError::Malformed(s.to_string()));
        }

        Ok(Self {
            module: module.to_string(),
            callable: callable.to_string(),
        })
    }

    /// The module part of the target.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// The callable name, used as the default job id and queue name.
    pub fn callable(&self) -> &str {
        &self.callable
    }
}

impl FromStr for JobTarget {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for JobTarget {
    type Error = TargetError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<JobTarget> for String {
    fn from(target: JobTarget) -> Self {
        target.to_string()
    }
}

impl fmt::Display for JobTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.callable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_creation() {
        let job_id = JobId::new("scrape_torrent_stats");
        assert_eq!(job_id.as_str(), "scrape_torrent_stats");
        assert_eq!(format!("{}", job_id), "scrape_torrent_stats");
    }

    #[test]
    fn test_queue_name_equality() {
        assert_eq!(QueueName::from("webseeds"), QueueName::new("webseeds"));
        assert_ne!(QueueName::from("webseeds"), QueueName::new("stats"));
    }

    #[test]
    fn test_run_id_is_unique() {
        assert_ne!(RunId::new(), RunId::new());
    }

    #[test]
    fn test_target_parse() {
        let target = JobTarget::parse("services.stats:update_site_stats").unwrap();
        assert_eq!(target.module(), "services.stats");
        assert_eq!(target.callable(), "update_site_stats");
        assert_eq!(target.to_string(), "services.stats:update_site_stats");
    }

    #[test]
    fn test_target_rejects_missing_separator() {
        assert_eq!(
            JobTarget::parse("update_site_stats"),
            Err(TargetError::MissingSeparator("update_site_stats".into()))
        );
    }

    #[test]
    fn test_target_rejects_malformed() {
        assert!(matches!(
            JobTarget::parse(":callable"),
            Err(TargetError::Malformed(_))
        ));
        assert!(matches!(
            JobTarget::parse("module:"),
            Err(TargetError::Malformed(_))
        ));
        assert!(matches!(
            JobTarget::parse("a:b:c"),
            Err(TargetError::Malformed(_))
        ));
        assert!(matches!(
            JobTarget::parse("my module:call"),
            Err(TargetError::Malformed(_))
        ));
    }

    #[test]
    fn test_target_serde_as_string() {
        let target = JobTarget::parse("builtin:sleep").unwrap();
        let json = serde_json::to_string(&target).unwrap();
        assert_eq!(json, "\"builtin:sleep\"");

        let back: JobTarget = serde_json::from_str(&json).unwrap();
        assert_eq!(back, target);

        let bad: Result<JobTarget, _> = serde_json::from_str("\"nocolon\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_ids_are_hashable() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(JobId::new("a"));
        set.insert(JobId::new("a"));
        set.insert(JobId::new("b"));
        assert_eq!(set.len(), 2);
    }
}
