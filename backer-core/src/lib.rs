//! Backer core library: domain types, version arithmetic, configuration.
//!
//! - [`types`]: newtypes and [`DirectoryPair`]
//! - [`version`]: [`Version`], [`Thresholds`] and the rollover [`VersionCounter`]
//! - [`exclusion`]: [`ExclusionSet`] normalized at the config boundary
//! - [`paths`]: cross-platform path normalization
//! - [`config`]: JSON configuration load / validate / version mirroring
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod exclusion;
pub mod paths;
pub mod types;
pub mod version;

pub use config::BackerConfig;
pub use error::ConfigError;
pub use exclusion::{ExclusionRule, ExclusionSet};
pub use types::{DirectoryPair, PairId, ProjectName};
pub use version::{Bump, Thresholds, Version, VersionCounter};
