//! Domain types for backer.
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem paths.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::exclusion::ExclusionSet;
use crate::version::Version;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// The project name stamped into every backup folder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectName(pub String);

impl fmt::Display for ProjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ProjectName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ProjectName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl ProjectName {
    /// `{project}_v{major}.{minor}.{patch}.{build}`
    pub fn backup_folder_name(&self, version: &Version) -> String {
        format!("{}_v{}", self.0, version)
    }
}

/// Identity of a directory pair: its index in the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PairId(pub usize);

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<usize> for PairId {
    fn from(i: usize) -> Self {
        Self(i)
    }
}

// ---------------------------------------------------------------------------
// Directory pair
// ---------------------------------------------------------------------------

/// A configured source → destination mapping. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryPair {
    pub id: PairId,
    /// Absolute, normalized source root.
    pub source: PathBuf,
    /// Absolute, normalized destination root; backup folders are its children.
    pub destination: PathBuf,
    pub exclusions: ExclusionSet,
    pub scan_delay: Duration,
}

impl DirectoryPair {
    /// Whether writing at `written` lands inside this pair's scanned tree,
    /// i.e. at or under the source and not excluded.
    pub fn receives(&self, written: &Path) -> bool {
        match written.strip_prefix(&self.source) {
            Ok(rel) => !self.exclusions.is_excluded(&self.source, rel),
            Err(_) => false,
        }
    }

    /// Where this pair's backup for `version` goes.
    pub fn backup_folder(&self, project: &ProjectName, version: &Version) -> PathBuf {
        self.destination.join(project.backup_folder_name(version))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
