//! Four-component versions and the rollover counter.
//!
//! The counter is a pure value-type transition: [`step`] maps a version to
//! its successor under a set of [`Thresholds`]. [`VersionCounter`] owns the
//! authoritative copy and is the only thing that ever advances it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// `major.minor.patch.build`. Ordering is lexicographic over the fields.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub build: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64, build: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            build,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.patch, self.build
        )
    }
}

/// Strict parse: exactly four numeric components.
impl FromStr for Version {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidVersion {
            value: s.to_string(),
        };
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 4 {
            return Err(invalid());
        }
        let mut nums = [0u64; 4];
        for (slot, part) in nums.iter_mut().zip(&parts) {
            *slot = part.parse().map_err(|_| invalid())?;
        }
        Ok(Self::new(nums[0], nums[1], nums[2], nums[3]))
    }
}

impl TryFrom<String> for Version {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}

/// Which component an increment rolled up to. Reporting only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bump {
    Build,
    Patch,
    Minor,
    Major,
}

impl fmt::Display for Bump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bump::Build => write!(f, "build"),
            Bump::Patch => write!(f, "patch"),
            Bump::Minor => write!(f, "minor"),
            Bump::Major => write!(f, "major"),
        }
    }
}

/// Rollover thresholds. `alpha` builds make a patch, `beta` patches make a
/// minor, `major` minors make a major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default = "default_alpha")]
    pub alpha: u64,
    #[serde(default = "default_beta")]
    pub beta: u64,
    #[serde(default = "default_major")]
    pub major: u64,
}

fn default_alpha() -> u64 {
    250
}

fn default_beta() -> u64 {
    4
}

fn default_major() -> u64 {
    3
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            beta: default_beta(),
            major: default_major(),
        }
    }
}

impl fmt::Display for Thresholds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "alpha={} beta={} major={}",
            self.alpha, self.beta, self.major
        )
    }
}

impl Thresholds {
    pub const fn new(alpha: u64, beta: u64, major: u64) -> Self {
        Self { alpha, beta, major }
    }

    /// Reject thresholds of 0 or 1.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("alpha", self.alpha),
            ("beta", self.beta),
            ("major", self.major),
        ] {
            if value < 2 {
                return Err(ConfigError::InvalidThreshold { name, value });
            }
        }
        Ok(())
    }

    /// Check that `version` is a state reachable under these thresholds.
    pub fn check(&self, version: &Version) -> Result<(), ConfigError> {
        if version.build >= self.alpha || version.patch >= self.beta || version.minor >= self.major
        {
            return Err(ConfigError::VersionOutOfRange {
                version: *version,
                thresholds: *self,
            });
        }
        Ok(())
    }
}

/// The successor of `version`, with the highest component that changed.
pub fn step(version: Version, thresholds: &Thresholds) -> (Version, Bump) {
    let mut next = version;
    let mut bump = Bump::Build;

    next.build += 1;
    if next.build >= thresholds.alpha {
        next.build = 0;
        next.patch += 1;
        bump = Bump::Patch;
        if next.patch >= thresholds.beta {
            next.patch = 0;
            next.minor += 1;
            bump = Bump::Minor;
            if next.minor >= thresholds.major {
                next.minor = 0;
                next.major += 1;
                bump = Bump::Major;
            }
        }
    }
    (next, bump)
}

/// Owner of the current version. Assumes validated thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionCounter {
    current: Version,
    thresholds: Thresholds,
}

impl VersionCounter {
    pub fn new(current: Version, thresholds: Thresholds) -> Self {
        Self {
            current,
            thresholds,
        }
    }

    pub fn current(&self) -> Version {
        self.current
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// What the next [`increment`](Self::increment) will produce, without
    /// advancing.
    pub fn peek_next(&self) -> (Version, Bump) {
        step(self.current, &self.thresholds)
    }

    pub fn increment(&mut self) -> (Version, Bump) {
        let (next, bump) = self.peek_next();
        self.current = next;
        (next, bump)
    }
}
