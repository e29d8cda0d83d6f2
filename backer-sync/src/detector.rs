//! Change detection over a source tree.
//!
//! A [`ScanSnapshot`] is the newest file modification time plus the file
//! count under a pair's source, ignoring excluded subtrees. Comparing two
//! snapshots flags a change when the newest mtime moved forward or the count
//! differs; the count is what catches pure deletions.

use std::path::Path;
use std::time::SystemTime;

use walkdir::{DirEntry, WalkDir};

use backer_core::{DirectoryPair, ExclusionSet};

use crate::error::SyncError;

/// Snapshot of one source tree at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanSnapshot {
    pub newest_mtime: Option<SystemTime>,
    pub file_count: usize,
    /// Entries that could not be read and were left out of the two fields above.
    pub skipped: usize,
}

impl ScanSnapshot {
    /// Whether `self` reflects a change relative to `previous`.
    pub fn differs_from(&self, previous: &ScanSnapshot) -> bool {
        self.newest_mtime > previous.newest_mtime || self.file_count != previous.file_count
    }
}

/// Decides whether a pair's source changed since the last scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeDetector {
    /// Treat a pair with no previous snapshot as changed instead of
    /// silently baselining it.
    backup_unseen: bool,
}

impl ChangeDetector {
    pub fn new(backup_unseen: bool) -> Self {
        Self { backup_unseen }
    }

    /// Scan `pair` and compare against `previous`.
    ///
    /// Returns the change flag and the snapshot to keep for the next cycle.
    /// An unreadable or missing root yields "no change" and hands back
    /// `previous` untouched.
    pub fn has_changed(
        &self,
        pair: &DirectoryPair,
        previous: Option<&ScanSnapshot>,
    ) -> (bool, Option<ScanSnapshot>) {
        let snapshot = match scan(&pair.source, &pair.exclusions) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(
                    pair = %pair.id,
                    error = %err,
                    "source root unreadable; treating as unchanged",
                );
                return (false, previous.copied());
            }
        };

        let changed = match previous {
            Some(previous) => snapshot.differs_from(previous),
            None => self.backup_unseen,
        };
        (changed, Some(snapshot))
    }
}

/// Walk `root`, skipping excluded subtrees, and build a snapshot.
///
/// Only a failure on the root itself is an error; anything below it is
/// logged, counted in [`ScanSnapshot::skipped`], and left out.
pub fn scan(root: &Path, exclusions: &ExclusionSet) -> Result<ScanSnapshot, SyncError> {
    let mut snapshot = ScanSnapshot::default();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !is_excluded(root, exclusions, entry));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => {
                return Err(SyncError::Walk {
                    path: root.to_path_buf(),
                    source: err,
                });
            }
            Err(err) => {
                tracing::warn!(root = %root.display(), error = %err, "skipping unreadable entry");
                snapshot.skipped += 1;
                continue;
            }
        };
        if entry.depth() == 0 || entry.file_type().is_dir() {
            continue;
        }

        let modified = entry
            .metadata()
            .map_err(|e| e.to_string())
            .and_then(|meta| meta.modified().map_err(|e| e.to_string()));
        match modified {
            Ok(mtime) => {
                snapshot.file_count += 1;
                if snapshot.newest_mtime.map_or(true, |newest| mtime > newest) {
                    snapshot.newest_mtime = Some(mtime);
                }
            }
            Err(err) => {
                tracing::warn!(path = %entry.path().display(), error = %err, "skipping unreadable file");
                snapshot.skipped += 1;
            }
        }
    }

    Ok(snapshot)
}

pub(crate) fn is_excluded(root: &Path, exclusions: &ExclusionSet, entry: &DirEntry) -> bool {
    match entry.path().strip_prefix(root) {
        Ok(rel) => exclusions.is_excluded(root, rel),
        Err(_) => false,
    }
}
