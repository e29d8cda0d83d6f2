//! Error types for backer-sync.

use std::path::PathBuf;

use thiserror::Error;

use backer_core::ConfigError;

/// All errors that can arise from scanning, copying, and version persistence.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Invalid configuration or corrupt persisted version state.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A directory walk failed before reaching any entry.
    #[error("cannot traverse {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    /// The persisted version state could not be parsed.
    #[error("failed to parse version state at {path}: {source}")]
    StateParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// JSON serialization error (version state).
    #[error("version state JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Another thread panicked while holding the version ledger.
    #[error("version ledger lock poisoned")]
    LedgerPoisoned,

    /// A commit named a version that is not reserved.
    #[error("version {0} is not reserved")]
    UnknownReservation(backer_core::Version),
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
