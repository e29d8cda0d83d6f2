//! One backup cycle over one cascade group.
//!
//! A cycle walks the group's due pairs (plus everything downstream of them)
//! in topological order: scan, decide, copy. If any pair was copied the
//! version reserved for the cycle is committed exactly once; otherwise no
//! state changes. Pairs on or below a cascade cycle are left out and listed
//! in [`CycleReport::skipped`].

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use backer_core::{Bump, PairId, ProjectName, Version};

use crate::cascade::{CascadeGroup, CascadeTracker};
use crate::copier::{CopyOutcome, TreeCopier};
use crate::detector::{ChangeDetector, ScanSnapshot};
use crate::error::SyncError;
use crate::ledger::{Reservation, VersionLedger};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CopyFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// What happened to one pair during a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairReport {
    pub pair: PairId,
    /// Genuine change in the source, not caused by this cycle's writes.
    pub changed: bool,
    /// The source received a backup folder earlier in this cycle.
    pub cascaded: bool,
    /// Backup folder written into, when a copy ran.
    pub folder: Option<PathBuf>,
    pub files_copied: usize,
    pub bytes_copied: u64,
    pub failures: Vec<CopyFailure>,
}

impl PairReport {
    fn new(pair: PairId, changed: bool, cascaded: bool) -> Self {
        Self {
            pair,
            changed,
            cascaded,
            folder: None,
            files_copied: 0,
            bytes_copied: 0,
            failures: Vec::new(),
        }
    }

    pub fn copied(&self) -> bool {
        self.folder.is_some()
    }

    fn record(&mut self, outcomes: Vec<CopyOutcome>) {
        for outcome in outcomes {
            match outcome {
                CopyOutcome::Copied { bytes, .. } => {
                    self.files_copied += 1;
                    self.bytes_copied += bytes;
                }
                CopyOutcome::Failed { path, reason } => {
                    self.failures.push(CopyFailure { path, reason });
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Nothing needed copying.
    Idle,
    Committed {
        version: Version,
        bump: Bump,
        folder_name: String,
    },
    /// Copies ran but the new version could not be saved; the ledger did
    /// not advance and the next cycle retries.
    PersistFailed { attempted: Version, reason: String },
    /// Shutdown was requested before the cycle committed.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub group: Vec<PairId>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub pairs: Vec<PairReport>,
    /// Pairs this cycle would have visited but that sit on, or downstream
    /// of, a cascade cycle.
    pub skipped: Vec<PairId>,
    pub outcome: CycleOutcome,
}

impl CycleReport {
    fn new(group: &CascadeGroup) -> Self {
        Self {
            group: group.ids(),
            started_at: Utc::now(),
            duration_ms: 0,
            pairs: Vec::new(),
            skipped: Vec::new(),
            outcome: CycleOutcome::Idle,
        }
    }

    fn finish(mut self, clock: Instant) -> Self {
        self.duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn committed_version(&self) -> Option<Version> {
        match &self.outcome {
            CycleOutcome::Committed { version, .. } => Some(*version),
            _ => None,
        }
    }

    pub fn files_copied(&self) -> usize {
        self.pairs.iter().map(|p| p.files_copied).sum()
    }

    pub fn bytes_copied(&self) -> u64 {
        self.pairs.iter().map(|p| p.bytes_copied).sum()
    }

    pub fn failure_count(&self) -> usize {
        self.pairs.iter().map(|p| p.failures.len()).sum()
    }

    pub fn pair(&self, id: PairId) -> Option<&PairReport> {
        self.pairs.iter().find(|p| p.pair == id)
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Runs cycles for one cascade group and owns that group's snapshots.
pub struct BackupCoordinator {
    project: ProjectName,
    detector: ChangeDetector,
    copier: Arc<dyn TreeCopier>,
    snapshots: HashMap<PairId, ScanSnapshot>,
    tracker: CascadeTracker,
    /// Due pairs of the last cycle that did not commit; folded into the next
    /// cycle's due set so upstream and downstream are retried together.
    retry: BTreeSet<PairId>,
}

impl BackupCoordinator {
    pub fn new(project: ProjectName, detector: ChangeDetector, copier: Arc<dyn TreeCopier>) -> Self {
        Self {
            project,
            detector,
            copier,
            snapshots: HashMap::new(),
            tracker: CascadeTracker::default(),
            retry: BTreeSet::new(),
        }
    }

    pub fn snapshot(&self, id: PairId) -> Option<&ScanSnapshot> {
        self.snapshots.get(&id)
    }

    /// Pairs carried over from an uncommitted cycle.
    pub fn pending_retry(&self) -> impl Iterator<Item = PairId> + '_ {
        self.retry.iter().copied()
    }

    /// Run one cycle for `due` pairs of `group`.
    ///
    /// A version is reserved right before the first copy and committed after
    /// the last one; copies run without holding the ledger lock. `cancel` is
    /// checked before every copy and before the commit; once set, the cycle
    /// is abandoned, its reservation released and its snapshots rolled back.
    pub fn run_cycle(
        &mut self,
        group: &CascadeGroup,
        due: &[PairId],
        ledger: &VersionLedger,
        cancel: &AtomicBool,
    ) -> Result<CycleReport, SyncError> {
        let clock = Instant::now();
        let mut report = CycleReport::new(group);

        let mut due: BTreeSet<PairId> = due.iter().copied().collect();
        due.extend(std::mem::take(&mut self.retry));
        let due: Vec<PairId> = due.into_iter().collect();

        report.skipped = group.blocked(&due);
        if !report.skipped.is_empty() {
            tracing::error!(
                skipped = ?report.skipped,
                cycle = ?group.cycle(),
                "cascade cycle: destinations feed back into their own sources; skipping affected pairs",
            );
        }

        self.tracker.reset();
        let mut prior: Vec<(PairId, Option<ScanSnapshot>)> = Vec::new();
        let mut reservation: Option<Reservation> = None;

        for pair in group.evaluation_order(&due) {
            let previous = self.snapshots.get(&pair.id).copied();
            let (changed, snapshot) = self.detector.has_changed(pair, previous.as_ref());
            prior.push((pair.id, previous));
            if let Some(snapshot) = snapshot {
                self.snapshots.insert(pair.id, snapshot);
            }

            let cascaded = self.tracker.was_just_written(pair);
            let mut entry = PairReport::new(pair.id, changed && !cascaded, cascaded);
            if !changed && !cascaded {
                report.pairs.push(entry);
                continue;
            }

            if cancel.load(Ordering::SeqCst) {
                return Ok(self.abandon(report, &due, prior, reservation, ledger, clock));
            }

            let version = match reservation {
                Some(held) => held.version,
                None => match ledger.reserve() {
                    Ok(fresh) => {
                        reservation = Some(fresh);
                        fresh.version
                    }
                    Err(err) => {
                        self.rollback(&due, prior);
                        return Err(err);
                    }
                },
            };

            let folder = pair.backup_folder(&self.project, &version);
            if folder.exists() && !self.tracker.written().contains(&folder) {
                tracing::warn!(folder = %folder.display(), "reusing backup folder left by an uncommitted cycle");
            }

            match self.copier.copy_tree(&pair.source, &folder, &pair.exclusions) {
                Ok(outcomes) => {
                    entry.record(outcomes);
                    self.tracker.mark_written(folder.clone());
                }
                Err(err) => {
                    tracing::warn!(pair = %pair.id, error = %err, "copy failed");
                    entry.failures.push(CopyFailure {
                        path: PathBuf::new(),
                        reason: err.to_string(),
                    });
                }
            }
            tracing::info!(
                pair = %pair.id,
                folder = %folder.display(),
                cascaded,
                files = entry.files_copied,
                failures = entry.failures.len(),
                "pair copied",
            );
            entry.folder = Some(folder);
            report.pairs.push(entry);
        }

        let Some(reservation) = reservation else {
            tracing::debug!(group = ?report.group, "no changes");
            return Ok(report.finish(clock));
        };

        if cancel.load(Ordering::SeqCst) {
            return Ok(self.abandon(report, &due, prior, Some(reservation), ledger, clock));
        }

        let attempted = reservation.version;
        let outcome = match ledger.commit(reservation, cancel) {
            Ok(Some((version, bump))) => {
                tracing::info!(
                    %version,
                    %bump,
                    files = report.files_copied(),
                    bytes = report.bytes_copied(),
                    failures = report.failure_count(),
                    "backup committed",
                );
                CycleOutcome::Committed {
                    version,
                    bump,
                    folder_name: self.project.backup_folder_name(&version),
                }
            }
            Ok(None) => return Ok(self.abandon(report, &due, prior, None, ledger, clock)),
            Err(err) => {
                tracing::error!(%attempted, error = %err, "failed to persist version; will retry next cycle");
                self.rollback(&due, prior);
                CycleOutcome::PersistFailed {
                    attempted,
                    reason: err.to_string(),
                }
            }
        };
        report.outcome = outcome;
        Ok(report.finish(clock))
    }

    fn abandon(
        &mut self,
        mut report: CycleReport,
        due: &[PairId],
        prior: Vec<(PairId, Option<ScanSnapshot>)>,
        reservation: Option<Reservation>,
        ledger: &VersionLedger,
        clock: Instant,
    ) -> CycleReport {
        tracing::warn!(group = ?report.group, "shutdown requested; abandoning uncommitted cycle");
        if let Some(reservation) = reservation {
            ledger.release(reservation);
        }
        self.rollback(due, prior);
        report.outcome = CycleOutcome::Abandoned;
        report.finish(clock)
    }

    /// Restore the snapshots a failed cycle replaced and remember its due
    /// pairs, so the next cycle sees the same changes with the same scope.
    fn rollback(&mut self, due: &[PairId], prior: Vec<(PairId, Option<ScanSnapshot>)>) {
        for (id, previous) in prior.into_iter().rev() {
            match previous {
                Some(snapshot) => {
                    self.snapshots.insert(id, snapshot);
                }
                None => {
                    self.snapshots.remove(&id);
                }
            }
        }
        self.retry.extend(due.iter().copied());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    use backer_core::{DirectoryPair, ExclusionSet, Thresholds};
    use tempfile::TempDir;

    use crate::cascade::CascadeGraph;
    use crate::copier::FsCopier;
    use crate::state_store::JsonStateStore;

    fn setup() -> (TempDir, CascadeGroup, VersionLedger) {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.txt"), "a").unwrap();
        let pair = DirectoryPair {
            id: PairId(0),
            source: src,
            destination: tmp.path().join("out"),
            exclusions: ExclusionSet::default(),
            scan_delay: Duration::from_secs(1),
        };
        let group = CascadeGraph::build(&[pair]).into_groups().remove(0);
        let store = JsonStateStore::in_dir(
            &tmp.path().join(".backer"),
            Version::new(1, 0, 0, 0),
            Thresholds::default(),
        );
        let ledger = VersionLedger::open(store, Thresholds::default()).unwrap();
        (tmp, group, ledger)
    }

    #[test]
    fn baseline_cycle_is_idle() {
        let (_tmp, group, ledger) = setup();
        let mut coordinator =
            BackupCoordinator::new("Site".into(), ChangeDetector::default(), Arc::new(FsCopier));

        let report = coordinator
            .run_cycle(&group, &[PairId(0)], &ledger, &AtomicBool::new(false))
            .unwrap();
        assert_eq!(report.outcome, CycleOutcome::Idle);
        assert!(coordinator.snapshot(PairId(0)).is_some());
        assert_eq!(ledger.current(), Version::new(1, 0, 0, 0));
    }

    #[test]
    fn initial_backup_commits_on_first_cycle() {
        let (tmp, group, ledger) = setup();
        let mut coordinator =
            BackupCoordinator::new("Site".into(), ChangeDetector::new(true), Arc::new(FsCopier));

        let report = coordinator
            .run_cycle(&group, &[PairId(0)], &ledger, &AtomicBool::new(false))
            .unwrap();
        assert_eq!(report.committed_version(), Some(Version::new(1, 0, 0, 1)));
        assert!(tmp.path().join("out/Site_v1.0.0.1/a.txt").exists());
    }

    #[test]
    fn nothing_due_is_idle() {
        let (_tmp, group, ledger) = setup();
        let mut coordinator =
            BackupCoordinator::new("Site".into(), ChangeDetector::new(true), Arc::new(FsCopier));

        let report = coordinator
            .run_cycle(&group, &[], &ledger, &AtomicBool::new(false))
            .unwrap();
        assert_eq!(report.outcome, CycleOutcome::Idle);
        assert!(report.pairs.is_empty());
    }

    #[test]
    fn cancelled_cycle_is_abandoned_and_retried() {
        let (tmp, group, ledger) = setup();
        let mut coordinator =
            BackupCoordinator::new("Site".into(), ChangeDetector::new(true), Arc::new(FsCopier));

        let report = coordinator
            .run_cycle(&group, &[PairId(0)], &ledger, &AtomicBool::new(true))
            .unwrap();
        assert_eq!(report.outcome, CycleOutcome::Abandoned);
        assert!(coordinator.snapshot(PairId(0)).is_none());
        assert!(!tmp.path().join("out/Site_v1.0.0.1").exists());
        assert_eq!(ledger.current(), Version::new(1, 0, 0, 0));

        let retry = coordinator
            .run_cycle(&group, &[PairId(0)], &ledger, &AtomicBool::new(false))
            .unwrap();
        assert_eq!(retry.committed_version(), Some(Version::new(1, 0, 0, 1)));
    }

    #[test]
    fn abandoned_pairs_are_carried_into_the_next_cycle() {
        let (tmp, group, ledger) = setup();
        let mut coordinator =
            BackupCoordinator::new("Site".into(), ChangeDetector::new(true), Arc::new(FsCopier));

        coordinator
            .run_cycle(&group, &[PairId(0)], &ledger, &AtomicBool::new(true))
            .unwrap();
        assert_eq!(coordinator.pending_retry().collect::<Vec<_>>(), vec![PairId(0)]);

        let next = coordinator
            .run_cycle(&group, &[], &ledger, &AtomicBool::new(false))
            .unwrap();
        assert_eq!(next.committed_version(), Some(Version::new(1, 0, 0, 1)));
        assert_eq!(coordinator.pending_retry().count(), 0);
        assert!(tmp.path().join("out/Site_v1.0.0.1/a.txt").exists());
    }
}
