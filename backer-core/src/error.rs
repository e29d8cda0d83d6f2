//! Error types for backer-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::version::{Thresholds, Version};

/// All errors that can arise while loading or validating configuration and
/// persisted version state. Every variant is fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure, annotated with the path involved.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file did not exist.
    #[error("configuration file not found at {path}; create it with your directory settings")]
    NotFound { path: PathBuf },

    /// JSON parse error on load, with file path context.
    #[error("failed to parse configuration at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// JSON serialization error (version mirroring).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("threshold '{name}' is {value}; every threshold must be at least 2")]
    InvalidThreshold { name: &'static str, value: u64 },

    #[error("invalid version '{value}'; expected numeric components like 1.0.0.0")]
    InvalidVersion { value: String },

    /// A version whose components do not fit the configured thresholds.
    #[error(
        "version {version} is out of range for thresholds {thresholds}; \
         fix the persisted state or the thresholds before restarting"
    )]
    VersionOutOfRange {
        version: Version,
        thresholds: Thresholds,
    },

    #[error("'{field}' has a non-numeric index '{key}'")]
    InvalidIndex { field: &'static str, key: String },

    #[error("pair {index} has no entry in '{missing}'; source_dirs and backup_dirs must list the same indices")]
    PairMismatch { index: usize, missing: &'static str },

    #[error("'{field}' refers to pair {index}, which is not configured")]
    UnknownPair { field: &'static str, index: usize },

    #[error("pair {index} has an empty path in '{field}'")]
    EmptyPath { field: &'static str, index: usize },

    #[error("no source/backup directory pairs configured")]
    NoPairs,

    #[error("source directory for pair {index} does not exist or is not a directory: {path}")]
    SourceMissing { index: usize, path: PathBuf },

    #[error("scan delay for pair {index} is not a number of seconds: '{value}'")]
    InvalidDelay { index: usize, value: String },

    #[error("max_workers must be at least 1")]
    InvalidWorkers,

    /// `dirs::home_dir()` returned `None` while expanding `~`.
    #[error("cannot determine home directory to expand '~'; set $HOME or equivalent")]
    HomeNotFound,
}

/// Convenience constructor for [`ConfigError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.into(),
        source,
    }
}
