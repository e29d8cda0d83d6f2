//! JSON configuration: load, validate, normalize.
//!
//! # File shape
//!
//! ```text
//! {
//!   "project_name": "Site",
//!   "project_version": "1.0.0.0",
//!   "source_dirs":   { "0": "~/site" },
//!   "backup_dirs":   { "0": "/mnt/backup/site" },
//!   "excluded_dirs": { "0": ["node_modules", "build/cache"] },   // or a single string
//!   "backup_times":  { "0": 5 },                                // seconds, number or string
//!   "thresholds":    { "alpha": 250, "beta": 4, "major": 3 },
//!   "max_workers": 4,
//!   "initial_backup": false,
//!   "state_dir": ".backer"
//! }
//! ```
//!
//! Relative paths are anchored at the directory holding the config file.
//! Everything returned from [`load`] is validated; the engine never
//! re-checks configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{io_err, ConfigError};
use crate::exclusion::ExclusionSet;
use crate::paths;
use crate::types::{DirectoryPair, PairId, ProjectName};
use crate::version::{Thresholds, Version};

pub const CONFIG_FILE: &str = "config.json";
pub const DEFAULT_PROJECT_NAME: &str = "Unknown Project";
pub const DEFAULT_PROJECT_VERSION: &str = "1.0.0.0";
pub const DEFAULT_SCAN_DELAY_SECS: u64 = 5;
pub const DEFAULT_MAX_WORKERS: usize = 4;
pub const DEFAULT_STATE_DIR: &str = ".backer";

// ---------------------------------------------------------------------------
// On-disk representation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default = "default_project_name")]
    project_name: String,
    #[serde(default = "default_project_version")]
    project_version: String,
    #[serde(default)]
    source_dirs: BTreeMap<String, String>,
    #[serde(default)]
    backup_dirs: BTreeMap<String, String>,
    #[serde(default)]
    excluded_dirs: BTreeMap<String, ExclusionEntry>,
    #[serde(default)]
    backup_times: BTreeMap<String, DelaySpec>,
    #[serde(default)]
    thresholds: Thresholds,
    max_workers: Option<usize>,
    #[serde(default)]
    initial_backup: bool,
    state_dir: Option<String>,
}

fn default_project_name() -> String {
    DEFAULT_PROJECT_NAME.to_string()
}

fn default_project_version() -> String {
    DEFAULT_PROJECT_VERSION.to_string()
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExclusionEntry {
    One(String),
    Many(Vec<String>),
}

impl ExclusionEntry {
    fn into_entries(self) -> Vec<String> {
        match self {
            ExclusionEntry::One(entry) => vec![entry],
            ExclusionEntry::Many(entries) => entries,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DelaySpec {
    Seconds(u64),
    Text(String),
}

// ---------------------------------------------------------------------------
// Validated configuration
// ---------------------------------------------------------------------------

/// Fully validated configuration handed to the engine.
#[derive(Debug, Clone)]
pub struct BackerConfig {
    /// Absolute path of the config file this was loaded from.
    pub path: PathBuf,
    pub project_name: ProjectName,
    /// Version to start from when no state has been persisted yet.
    pub initial_version: Version,
    pub thresholds: Thresholds,
    /// Ordered by pair index.
    pub pairs: Vec<DirectoryPair>,
    pub max_workers: usize,
    /// Back up every pair on its first scan instead of only baselining.
    pub initial_backup: bool,
    pub state_dir: PathBuf,
}

impl BackerConfig {
    pub fn pair(&self, id: PairId) -> Option<&DirectoryPair> {
        self.pairs.iter().find(|p| p.id == id)
    }
}

/// Load and validate the configuration at `path`.
///
/// Destination roots are created as a side effect.
pub fn load(path: &Path) -> Result<BackerConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let path = std::fs::canonicalize(path).map_err(|e| io_err(path, e))?;
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    let raw: RawConfig = serde_json::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.clone(),
        source: e,
    })?;
    let base = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    build(path, &base, raw)
}

fn build(path: PathBuf, base: &Path, raw: RawConfig) -> Result<BackerConfig, ConfigError> {
    raw.thresholds.validate()?;
    let initial_version = parse_version(&raw.project_version)?;
    raw.thresholds.check(&initial_version)?;

    let sources = index_map("source_dirs", raw.source_dirs)?;
    let backups = index_map("backup_dirs", raw.backup_dirs)?;
    for index in sources.keys() {
        if !backups.contains_key(index) {
            return Err(ConfigError::PairMismatch {
                index: *index,
                missing: "backup_dirs",
            });
        }
    }
    for index in backups.keys() {
        if !sources.contains_key(index) {
            return Err(ConfigError::PairMismatch {
                index: *index,
                missing: "source_dirs",
            });
        }
    }
    if sources.is_empty() {
        return Err(ConfigError::NoPairs);
    }

    let mut exclusions = index_map("excluded_dirs", raw.excluded_dirs)?;
    let mut delays = index_map("backup_times", raw.backup_times)?;
    for (field, index) in exclusions
        .keys()
        .map(|i| ("excluded_dirs", *i))
        .chain(delays.keys().map(|i| ("backup_times", *i)))
    {
        if !sources.contains_key(&index) {
            return Err(ConfigError::UnknownPair { field, index });
        }
    }

    // Resolve every path first: source existence depends on all destinations.
    let mut resolved = Vec::with_capacity(sources.len());
    for (index, raw_source) in &sources {
        let raw_backup = &backups[index];
        if raw_source.trim().is_empty() {
            return Err(ConfigError::EmptyPath {
                field: "source_dirs",
                index: *index,
            });
        }
        if raw_backup.trim().is_empty() {
            return Err(ConfigError::EmptyPath {
                field: "backup_dirs",
                index: *index,
            });
        }
        let source = paths::resolve(base, raw_source)?;
        let destination = paths::resolve(base, raw_backup)?;
        std::fs::create_dir_all(&destination).map_err(|e| io_err(&destination, e))?;
        let destination =
            std::fs::canonicalize(&destination).map_err(|e| io_err(&destination, e))?;
        resolved.push((*index, source, destination));
    }

    let mut pairs = Vec::with_capacity(resolved.len());
    for (index, source, destination) in &resolved {
        let fed_by_cascade = resolved.iter().any(|(_, _, d)| d.starts_with(source));
        if !source.is_dir() {
            if fed_by_cascade && !source.exists() {
                std::fs::create_dir_all(source).map_err(|e| io_err(source, e))?;
            } else {
                return Err(ConfigError::SourceMissing {
                    index: *index,
                    path: source.clone(),
                });
            }
        }
        let source = std::fs::canonicalize(source).map_err(|e| io_err(source, e))?;

        let entries = exclusions
            .remove(index)
            .map(ExclusionEntry::into_entries)
            .unwrap_or_default();
        let exclusion_set = ExclusionSet::from_entries(&source, entries)?;

        let scan_delay = match delays.remove(index) {
            None => Duration::from_secs(DEFAULT_SCAN_DELAY_SECS),
            Some(DelaySpec::Seconds(secs)) => Duration::from_secs(secs),
            Some(DelaySpec::Text(text)) => {
                let secs = text.trim().parse::<u64>().map_err(|_| ConfigError::InvalidDelay {
                    index: *index,
                    value: text.clone(),
                })?;
                Duration::from_secs(secs)
            }
        };

        pairs.push(DirectoryPair {
            id: PairId(*index),
            source,
            destination: destination.clone(),
            exclusions: exclusion_set,
            scan_delay,
        });
    }

    let max_workers = match raw.max_workers {
        Some(0) => return Err(ConfigError::InvalidWorkers),
        Some(n) => n,
        None => DEFAULT_MAX_WORKERS,
    };

    let state_dir = match raw.state_dir.as_deref() {
        Some(dir) if !dir.trim().is_empty() => paths::resolve(base, dir)?,
        _ => base.join(DEFAULT_STATE_DIR),
    };

    Ok(BackerConfig {
        path,
        project_name: ProjectName::from(raw.project_name),
        initial_version,
        thresholds: raw.thresholds,
        pairs,
        max_workers,
        initial_backup: raw.initial_backup,
        state_dir,
    })
}

fn index_map<T>(
    field: &'static str,
    raw: BTreeMap<String, T>,
) -> Result<BTreeMap<usize, T>, ConfigError> {
    raw.into_iter()
        .map(|(key, value)| {
            key.trim()
                .parse::<usize>()
                .map(|index| (index, value))
                .map_err(|_| ConfigError::InvalidIndex { field, key })
        })
        .collect()
}

/// Parse a configured version, zero-padding missing trailing components
/// (`"2.1"` → `2.1.0.0`).
pub fn parse_version(text: &str) -> Result<Version, ConfigError> {
    let invalid = || ConfigError::InvalidVersion {
        value: text.to_string(),
    };
    let parts: Vec<&str> = text.trim().split('.').collect();
    if parts.len() > 4 {
        return Err(invalid());
    }
    let mut nums = [0u64; 4];
    for (slot, part) in nums.iter_mut().zip(&parts) {
        *slot = part.trim().parse().map_err(|_| invalid())?;
    }
    Ok(Version::new(nums[0], nums[1], nums[2], nums[3]))
}

// ---------------------------------------------------------------------------
// Version mirroring
// ---------------------------------------------------------------------------

/// Rewrite `project_version` in the config file, keeping every other key.
///
/// Write flow: read → patch JSON value → `.json.tmp` sibling → `rename`.
pub fn record_version(path: &Path, version: &Version) -> Result<(), ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    let mut doc: serde_json::Value =
        serde_json::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
    let Some(object) = doc.as_object_mut() else {
        return Err(io_err(
            path,
            std::io::Error::other("configuration root is not a JSON object"),
        ));
    };
    object.insert(
        "project_version".to_string(),
        serde_json::Value::String(version.to_string()),
    );

    let json = serde_json::to_string_pretty(&doc)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    Ok(())
}
