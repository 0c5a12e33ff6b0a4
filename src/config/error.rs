//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

use crate::registry::DeclareError;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a specific file with context.
    #[error("failed to read file '{path}': {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML.
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A job or queue names a target with no registered handler.
    #[error("unknown job target: {0}")]
    UnknownTarget(String),

    /// A configured job could not be declared.
    #[error("failed to declare '{name}': {source}")]
    Declare {
        name: String,
        #[source]
        source: DeclareError,
    },
}
