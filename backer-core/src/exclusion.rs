//! Exclusion rules for a single source tree.
//!
//! The config file accepts a string or an array of strings per pair; both
//! are normalized here into one [`ExclusionSet`] so the scanner and the
//! copier only ever see a homogeneous rule list.

use std::path::{Component, Path, PathBuf};

use crate::error::ConfigError;
use crate::paths;

/// A single normalized exclusion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExclusionRule {
    /// A bare name such as `node_modules`: matches that segment anywhere.
    Segment(String),
    /// A subtree of the source, relative to the source root.
    Relative(PathBuf),
    /// A subtree outside (or not expressible relative to) the source root.
    Absolute(PathBuf),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionSet {
    rules: Vec<ExclusionRule>,
}

impl ExclusionSet {
    pub fn new(rules: Vec<ExclusionRule>) -> Self {
        Self { rules }
    }

    /// Normalize raw config entries for the source tree rooted at `source`.
    ///
    /// Blank entries are dropped. Absolute entries that fall inside `source`
    /// become [`ExclusionRule::Relative`].
    pub fn from_entries<I, S>(source: &Path, entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Vec::new();
        for entry in entries {
            let raw = entry.as_ref().trim().trim_end_matches(['/', '\\']);
            if raw.is_empty() {
                continue;
            }
            let rule = if let Some(segment) = bare_segment(raw) {
                ExclusionRule::Segment(segment)
            } else {
                let full = paths::resolve(source, raw)?;
                match full.strip_prefix(source) {
                    Ok(rel) if !rel.as_os_str().is_empty() => {
                        ExclusionRule::Relative(rel.to_path_buf())
                    }
                    _ => ExclusionRule::Absolute(full),
                }
            };
            if !rules.contains(&rule) {
                rules.push(rule);
            }
        }
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[ExclusionRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether `relative` (a path under `root`) is excluded.
    pub fn is_excluded(&self, root: &Path, relative: &Path) -> bool {
        if relative.as_os_str().is_empty() {
            return false;
        }
        self.rules.iter().any(|rule| match rule {
            ExclusionRule::Segment(name) => relative
                .components()
                .any(|c| matches!(c, Component::Normal(s) if s == name.as_str())),
            ExclusionRule::Relative(prefix) => relative.starts_with(prefix),
            ExclusionRule::Absolute(prefix) => root.join(relative).starts_with(prefix),
        })
    }

    /// Human-readable rule list for startup output.
    pub fn describe(&self) -> Vec<String> {
        self.rules
            .iter()
            .map(|rule| match rule {
                ExclusionRule::Segment(name) => format!("{name} (any depth)"),
                ExclusionRule::Relative(path) => path.display().to_string(),
                ExclusionRule::Absolute(path) => path.display().to_string(),
            })
            .collect()
    }
}

fn bare_segment(raw: &str) -> Option<String> {
    if raw.contains(['/', '\\']) || raw == "." || raw == ".." || raw.starts_with('~') {
        return None;
    }
    Some(raw.to_string())
}
