//! Path normalization shared by configuration and exclusion handling.
//!
//! Raw strings from the config file go through [`resolve`]: `~` expansion,
//! anchoring relative paths at a base directory, lexical cleanup of `.` and
//! `..`, then canonicalization when the path already exists.

use std::path::{Component, Path, PathBuf};

use crate::error::ConfigError;

/// Expand a leading `~` (alone or followed by a separator) to the home dir.
pub fn expand_home(raw: &str) -> Result<PathBuf, ConfigError> {
    let Some(rest) = raw.strip_prefix('~') else {
        return Ok(PathBuf::from(raw));
    };
    if !(rest.is_empty() || rest.starts_with('/') || rest.starts_with('\\')) {
        // `~user` forms are left untouched.
        return Ok(PathBuf::from(raw));
    }
    let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
    let rest = rest.trim_start_matches(['/', '\\']);
    if rest.is_empty() {
        Ok(home)
    } else {
        Ok(home.join(rest))
    }
}

/// Remove `.` components and fold `..` against preceding normal components.
/// Never touches the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(out.components().next_back(), Some(Component::Normal(_)))
                    && out.pop();
                if !popped && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalize if the path exists; otherwise return it unchanged.
pub fn canonical_or_self(path: PathBuf) -> PathBuf {
    std::fs::canonicalize(&path).unwrap_or(path)
}

/// Resolve a raw config path against `base`.
pub fn resolve(base: &Path, raw: &str) -> Result<PathBuf, ConfigError> {
    let expanded = expand_home(raw.trim())?;
    let anchored = if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    };
    Ok(canonical_or_self(normalize_lexically(&anchored)))
}
