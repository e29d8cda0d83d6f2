//! # backer-sync
//!
//! Change detection, cascade ordering, tree copying and version persistence.
//!
//! Build a [`CascadeGraph`] from the configured pairs, open a
//! [`VersionLedger`] over a [`JsonStateStore`], then drive each group with a
//! [`BackupCoordinator`].

pub mod cascade;
pub mod coordinator;
pub mod copier;
pub mod detector;
pub mod error;
pub mod ledger;
pub mod state_store;

pub use cascade::{CascadeGraph, CascadeGroup, CascadeTracker};
pub use coordinator::{BackupCoordinator, CopyFailure, CycleOutcome, CycleReport, PairReport};
pub use copier::{CopyOutcome, FsCopier, TreeCopier};
pub use detector::{ChangeDetector, ScanSnapshot};
pub use error::SyncError;
pub use ledger::{Reservation, VersionLedger};
pub use state_store::{JsonStateStore, VersionStateStore, STATE_FILE};
