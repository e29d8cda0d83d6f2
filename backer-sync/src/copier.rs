//! Copying a source tree into a backup folder.
//!
//! Each file is written to `<target>.backer.tmp`, stamped with the source's
//! modification time, then renamed into place, so a crash never leaves a
//! half-written file under its final name.

use std::fs;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use serde::Serialize;
use walkdir::WalkDir;

use backer_core::ExclusionSet;

use crate::detector::is_excluded;
use crate::error::{io_err, SyncError};

/// Per-file result of a tree copy. Paths are relative to the source root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CopyOutcome {
    Copied { path: PathBuf, bytes: u64 },
    Failed { path: PathBuf, reason: String },
}

impl CopyOutcome {
    pub fn path(&self) -> &Path {
        match self {
            Self::Copied { path, .. } | Self::Failed { path, .. } => path,
        }
    }

    pub fn is_copied(&self) -> bool {
        matches!(self, Self::Copied { .. })
    }
}

/// Copies a tree, never descending into excluded subtrees.
///
/// An `Err` means nothing could be copied at all (destination not creatable,
/// source root unreadable); per-file problems come back as
/// [`CopyOutcome::Failed`].
pub trait TreeCopier: Send + Sync {
    fn copy_tree(
        &self,
        source: &Path,
        destination: &Path,
        exclusions: &ExclusionSet,
    ) -> Result<Vec<CopyOutcome>, SyncError>;
}

/// Plain filesystem copier.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsCopier;

impl TreeCopier for FsCopier {
    fn copy_tree(
        &self,
        source: &Path,
        destination: &Path,
        exclusions: &ExclusionSet,
    ) -> Result<Vec<CopyOutcome>, SyncError> {
        fs::create_dir_all(destination).map_err(|e| io_err(destination, e))?;

        let mut outcomes = Vec::new();
        let walker = WalkDir::new(source)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| !is_excluded(source, exclusions, entry));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if err.depth() == 0 => {
                    return Err(SyncError::Walk {
                        path: source.to_path_buf(),
                        source: err,
                    });
                }
                Err(err) => {
                    let rel = err
                        .path()
                        .and_then(|p| p.strip_prefix(source).ok())
                        .map(Path::to_path_buf)
                        .unwrap_or_default();
                    outcomes.push(CopyOutcome::Failed {
                        path: rel,
                        reason: err.to_string(),
                    });
                    continue;
                }
            };
            if entry.depth() == 0 {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(source) else {
                continue;
            };
            let target = destination.join(rel);

            if entry.file_type().is_dir() {
                if let Err(err) = fs::create_dir_all(&target) {
                    outcomes.push(CopyOutcome::Failed {
                        path: rel.to_path_buf(),
                        reason: err.to_string(),
                    });
                }
                continue;
            }

            match copy_file(entry.path(), &target) {
                Ok(bytes) => outcomes.push(CopyOutcome::Copied {
                    path: rel.to_path_buf(),
                    bytes,
                }),
                Err(err) => {
                    tracing::warn!(path = %entry.path().display(), error = %err, "copy failed");
                    outcomes.push(CopyOutcome::Failed {
                        path: rel.to_path_buf(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        Ok(outcomes)
    }
}

/// Atomically copy one file, preserving its modification time.
pub fn copy_file(from: &Path, to: &Path) -> Result<u64, SyncError> {
    let tmp = PathBuf::from(format!("{}.backer.tmp", to.display()));
    copy_file_with_tmp(from, to, &tmp)
}

fn copy_file_with_tmp(from: &Path, to: &Path, tmp: &Path) -> Result<u64, SyncError> {
    let meta = fs::metadata(from).map_err(|e| io_err(from, e))?;

    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }

    let bytes = fs::copy(from, tmp).map_err(|e| io_err(from, e))?;
    let mtime = FileTime::from_last_modification_time(&meta);
    if let Err(e) = filetime::set_file_mtime(tmp, mtime) {
        let _ = fs::remove_file(tmp);
        return Err(io_err(tmp, e));
    }

    if let Err(e) = fs::rename(tmp, to) {
        let _ = fs::remove_file(tmp);
        return Err(io_err(to, e));
    }

    tracing::trace!(path = %to.display(), bytes, "copied");
    Ok(bytes)
}
