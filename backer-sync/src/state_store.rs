//! Durable storage for the committed version.
//!
//! Persists a [`StateFile`] JSON document, by default at
//! `<state_dir>/version.json`. Saves write `<path>.tmp`, fsync it, rename
//! over the target, then fsync the directory, so a returned `save` survives
//! a crash.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use backer_core::{Thresholds, Version};

use crate::error::{io_err, SyncError};

pub const STATE_FILE: &str = "version.json";

/// Where the authoritative version lives between runs.
pub trait VersionStateStore: Send {
    /// The last saved version, or the configured starting version when
    /// nothing has been saved yet.
    fn load(&self) -> Result<Version, SyncError>;

    fn save(&self, version: &Version) -> Result<(), SyncError>;
}

/// On-disk payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateFile {
    pub version: Version,
    pub saved_at: DateTime<Utc>,
}

/// JSON file store.
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    path: PathBuf,
    initial: Version,
    thresholds: Thresholds,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>, initial: Version, thresholds: Thresholds) -> Self {
        Self {
            path: path.into(),
            initial,
            thresholds,
        }
    }

    /// Store at `<state_dir>/version.json`.
    pub fn in_dir(state_dir: &Path, initial: Version, thresholds: Thresholds) -> Self {
        Self::new(state_dir.join(STATE_FILE), initial, thresholds)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VersionStateStore for JsonStateStore {
    fn load(&self) -> Result<Version, SyncError> {
        if !self.path.exists() {
            return Ok(self.initial);
        }
        let contents = fs::read_to_string(&self.path).map_err(|e| io_err(&self.path, e))?;
        let state: StateFile =
            serde_json::from_str(&contents).map_err(|source| SyncError::StateParse {
                path: self.path.clone(),
                source,
            })?;
        self.thresholds.check(&state.version)?;
        Ok(state.version)
    }

    fn save(&self, version: &Version) -> Result<(), SyncError> {
        let Some(dir) = self.path.parent() else {
            return Err(io_err(
                &self.path,
                std::io::Error::other("invalid version state path"),
            ));
        };
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

        let state = StateFile {
            version: *version,
            saved_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&state)?;
        let tmp = self.path.with_extension("json.tmp");

        let mut file = File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
        file.write_all(json.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| io_err(&tmp, e))?;
        drop(file);

        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(&self.path, e));
        }

        // Persist the rename itself; not every platform can open a directory.
        if let Ok(dir_handle) = File::open(dir) {
            let _ = dir_handle.sync_all();
        }
        Ok(())
    }
}
