use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use backer_core::{
    Bump, DirectoryPair, ExclusionRule, ExclusionSet, PairId, ProjectName, Thresholds, Version,
};
use backer_sync::{
    BackupCoordinator, CascadeGraph, CascadeGroup, ChangeDetector, CopyOutcome, CycleOutcome,
    FsCopier, JsonStateStore, SyncError, TreeCopier, VersionLedger, VersionStateStore,
};
use filetime::{set_file_mtime, FileTime};
use tempfile::TempDir;

const PROJECT: &str = "Site";

fn pair(id: usize, source: &Path, destination: &Path) -> DirectoryPair {
    fs::create_dir_all(source).expect("create source");
    fs::create_dir_all(destination).expect("create destination");
    DirectoryPair {
        id: PairId(id),
        source: source.to_path_buf(),
        destination: destination.to_path_buf(),
        exclusions: ExclusionSet::default(),
        scan_delay: Duration::from_secs(1),
    }
}

fn ledger_at(dir: &Path, start: Version) -> VersionLedger {
    let store = JsonStateStore::in_dir(dir, start, Thresholds::default());
    VersionLedger::open(store, Thresholds::default()).expect("open ledger")
}

fn coordinator(backup_unseen: bool) -> BackupCoordinator {
    BackupCoordinator::new(
        ProjectName::from(PROJECT),
        ChangeDetector::new(backup_unseen),
        Arc::new(FsCopier),
    )
}

fn single_group(pairs: &[DirectoryPair]) -> CascadeGroup {
    let mut groups = CascadeGraph::build(pairs).into_groups();
    assert_eq!(groups.len(), 1, "expected one cascade group");
    groups.remove(0)
}

fn touch_future(path: &Path) {
    let when = SystemTime::now() + Duration::from_secs(300);
    set_file_mtime(path, FileTime::from_system_time(when)).expect("set mtime");
}

fn current(ledger: &VersionLedger) -> Version {
    ledger.current()
}

fn no_cancel() -> AtomicBool {
    AtomicBool::new(false)
}

// ---------------------------------------------------------------------------
// Idempotence
// ---------------------------------------------------------------------------

#[test]
fn unchanged_tree_never_increments_twice() {
    let tmp = TempDir::new().expect("tmp");
    let p = pair(0, &tmp.path().join("src"), &tmp.path().join("out"));
    fs::write(p.source.join("a.txt"), "a").unwrap();
    let group = single_group(&[p]);
    let ledger = ledger_at(&tmp.path().join(".backer"), Version::new(1, 0, 0, 5));
    let mut coord = coordinator(true);

    let first = coord.run_cycle(&group, &[PairId(0)], &ledger, &no_cancel()).unwrap();
    assert_eq!(first.committed_version(), Some(Version::new(1, 0, 0, 6)));

    let second = coord.run_cycle(&group, &[PairId(0)], &ledger, &no_cancel()).unwrap();
    assert_eq!(second.outcome, CycleOutcome::Idle);
    assert_eq!(current(&ledger), Version::new(1, 0, 0, 6));
}

// ---------------------------------------------------------------------------
// Cascade
// ---------------------------------------------------------------------------

#[test]
fn cascade_chain_commits_one_version_into_both_destinations() {
    let tmp = TempDir::new().expect("tmp");
    let s = tmp.path().join("s");
    let d = tmp.path().join("d");
    let e = tmp.path().join("e");
    // Index order deliberately downstream-first.
    let b = pair(0, &d, &e);
    let a = pair(1, &s, &d);
    fs::write(s.join("seed.txt"), "seed").unwrap();
    let group = single_group(&[b, a]);
    let ledger = ledger_at(&tmp.path().join(".backer"), Version::new(1, 0, 0, 5));
    let mut coord = coordinator(false);

    let baseline = coord
        .run_cycle(&group, &[PairId(0), PairId(1)], &ledger, &no_cancel())
        .unwrap();
    assert_eq!(baseline.outcome, CycleOutcome::Idle);

    fs::write(s.join("new.txt"), "new").unwrap();
    let report = coord.run_cycle(&group, &[PairId(1)], &ledger, &no_cancel()).unwrap();

    assert_eq!(report.committed_version(), Some(Version::new(1, 0, 0, 6)));
    assert_eq!(current(&ledger), Version::new(1, 0, 0, 6));

    let upstream = report.pair(PairId(1)).expect("upstream report");
    assert!(upstream.changed && !upstream.cascaded);
    let downstream = report.pair(PairId(0)).expect("downstream report");
    assert!(!downstream.changed, "cascade writes are not a genuine change");
    assert!(downstream.cascaded);
    assert!(downstream.copied());

    assert!(d.join("Site_v1.0.0.6/new.txt").exists());
    assert!(e.join("Site_v1.0.0.6/Site_v1.0.0.6/new.txt").exists());

    let quiet = coord
        .run_cycle(&group, &[PairId(0), PairId(1)], &ledger, &no_cancel())
        .unwrap();
    assert_eq!(quiet.outcome, CycleOutcome::Idle, "cascade write must not echo");
}

#[test]
fn cyclic_group_is_reported_on_every_trigger() {
    let tmp = TempDir::new().expect("tmp");
    let root = tmp.path().join("w");
    let p = pair(0, &root, &root.join("backups"));
    fs::write(root.join("a.txt"), "a").unwrap();
    let group = single_group(&[p]);
    let ledger = ledger_at(&tmp.path().join(".backer"), Version::new(1, 0, 0, 0));
    let mut coord = coordinator(true);

    for _ in 0..2 {
        let report = coord.run_cycle(&group, &[PairId(0)], &ledger, &no_cancel()).unwrap();
        assert_eq!(report.outcome, CycleOutcome::Idle);
        assert_eq!(report.skipped, vec![PairId(0)]);
        assert!(report.pairs.is_empty());
    }
    assert_eq!(current(&ledger), Version::new(1, 0, 0, 0));
    assert_eq!(fs::read_dir(root.join("backups")).unwrap().count(), 0);
}

#[test]
fn pair_feeding_a_cycle_is_still_backed_up() {
    let tmp = TempDir::new().expect("tmp");
    let x = tmp.path().join("x");
    let a_src = tmp.path().join("a_src");
    let b_src = tmp.path().join("b_src");
    let feeder = pair(0, &x, &a_src.join("in"));
    let a = pair(1, &a_src, &b_src);
    let b = pair(2, &b_src, &a_src);
    fs::write(x.join("doc.txt"), "doc").unwrap();
    let group = single_group(&[feeder, a, b]);
    let ledger = ledger_at(&tmp.path().join(".backer"), Version::new(1, 0, 0, 0));
    let mut coord = coordinator(true);

    let report = coord
        .run_cycle(&group, &group.ids(), &ledger, &no_cancel())
        .unwrap();

    assert_eq!(report.committed_version(), Some(Version::new(1, 0, 0, 1)));
    assert!(report.pair(PairId(0)).expect("feeder report").copied());
    assert_eq!(report.skipped, vec![PairId(1), PairId(2)]);
    assert!(a_src.join("in/Site_v1.0.0.1/doc.txt").exists());
    assert!(!b_src.join("Site_v1.0.0.1").exists(), "stuck pairs never copy");
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

#[test]
fn deletion_triggers_backup_without_the_deleted_file() {
    let tmp = TempDir::new().expect("tmp");
    let p = pair(0, &tmp.path().join("src"), &tmp.path().join("out"));
    fs::write(p.source.join("keep.txt"), "k").unwrap();
    fs::write(p.source.join("drop.txt"), "d").unwrap();
    let out = p.destination.clone();
    let group = single_group(&[p.clone()]);
    let ledger = ledger_at(&tmp.path().join(".backer"), Version::new(1, 0, 0, 0));
    let mut coord = coordinator(false);

    coord.run_cycle(&group, &[PairId(0)], &ledger, &no_cancel()).unwrap();
    fs::remove_file(p.source.join("drop.txt")).unwrap();
    let report = coord.run_cycle(&group, &[PairId(0)], &ledger, &no_cancel()).unwrap();

    assert_eq!(report.committed_version(), Some(Version::new(1, 0, 0, 1)));
    assert!(out.join("Site_v1.0.0.1/keep.txt").exists());
    assert!(!out.join("Site_v1.0.0.1/drop.txt").exists());
}

#[test]
fn excluded_directories_never_trigger_or_copy() {
    let tmp = TempDir::new().expect("tmp");
    let mut p = pair(0, &tmp.path().join("src"), &tmp.path().join("out"));
    p.exclusions = ExclusionSet::new(vec![ExclusionRule::Segment("node_modules".into())]);
    fs::create_dir_all(p.source.join("node_modules/pkg")).unwrap();
    fs::write(p.source.join("node_modules/pkg/index.js"), "x").unwrap();
    fs::write(p.source.join("app.js"), "app").unwrap();
    let src = p.source.clone();
    let out = p.destination.clone();
    let group = single_group(&[p]);
    let ledger = ledger_at(&tmp.path().join(".backer"), Version::new(1, 0, 0, 0));
    let mut coord = coordinator(false);

    coord.run_cycle(&group, &[PairId(0)], &ledger, &no_cancel()).unwrap();

    touch_future(&src.join("node_modules/pkg/index.js"));
    fs::write(src.join("node_modules/extra.js"), "y").unwrap();
    let report = coord.run_cycle(&group, &[PairId(0)], &ledger, &no_cancel()).unwrap();
    assert_eq!(report.outcome, CycleOutcome::Idle);

    touch_future(&src.join("app.js"));
    let report = coord.run_cycle(&group, &[PairId(0)], &ledger, &no_cancel()).unwrap();
    assert_eq!(report.committed_version(), Some(Version::new(1, 0, 0, 1)));
    assert_eq!(report.files_copied(), 1);
    assert!(out.join("Site_v1.0.0.1/app.js").exists());
    assert!(!out.join("Site_v1.0.0.1/node_modules").exists());
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// Copies normally, then reports one named file as failed.
struct FlakyCopier {
    fail: PathBuf,
}

impl TreeCopier for FlakyCopier {
    fn copy_tree(
        &self,
        source: &Path,
        destination: &Path,
        exclusions: &ExclusionSet,
    ) -> Result<Vec<CopyOutcome>, SyncError> {
        let outcomes = FsCopier.copy_tree(source, destination, exclusions)?;
        Ok(outcomes
            .into_iter()
            .map(|outcome| {
                if outcome.path() == self.fail {
                    let _ = fs::remove_file(destination.join(&self.fail));
                    CopyOutcome::Failed {
                        path: self.fail.clone(),
                        reason: "simulated I/O error".into(),
                    }
                } else {
                    outcome
                }
            })
            .collect())
    }
}

#[test]
fn partial_copy_failure_still_commits_once() {
    let tmp = TempDir::new().expect("tmp");
    let p = pair(0, &tmp.path().join("src"), &tmp.path().join("out"));
    for i in 0..10 {
        fs::write(p.source.join(format!("f{i}.txt")), format!("file {i}")).unwrap();
    }
    let group = single_group(&[p]);
    let ledger = ledger_at(&tmp.path().join(".backer"), Version::new(1, 0, 0, 0));
    let mut coord = BackupCoordinator::new(
        ProjectName::from(PROJECT),
        ChangeDetector::new(true),
        Arc::new(FlakyCopier {
            fail: PathBuf::from("f7.txt"),
        }),
    );

    let report = coord.run_cycle(&group, &[PairId(0)], &ledger, &no_cancel()).unwrap();

    assert_eq!(report.files_copied(), 9);
    assert_eq!(report.failure_count(), 1);
    let failure = &report.pair(PairId(0)).unwrap().failures[0];
    assert_eq!(failure.path, PathBuf::from("f7.txt"));
    assert_eq!(report.committed_version(), Some(Version::new(1, 0, 0, 1)));
    assert_eq!(current(&ledger), Version::new(1, 0, 0, 1));
}

/// Json store whose saves fail while `failing` is set.
struct SwitchableStore {
    inner: JsonStateStore,
    failing: Arc<AtomicBool>,
}

impl VersionStateStore for SwitchableStore {
    fn load(&self) -> Result<Version, SyncError> {
        self.inner.load()
    }

    fn save(&self, version: &Version) -> Result<(), SyncError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::Io {
                path: self.inner.path().to_path_buf(),
                source: std::io::Error::other("read-only filesystem"),
            });
        }
        self.inner.save(version)
    }
}

#[test]
fn persist_failure_leaves_version_and_retries_into_same_folder() {
    let tmp = TempDir::new().expect("tmp");
    let p = pair(0, &tmp.path().join("src"), &tmp.path().join("out"));
    fs::write(p.source.join("a.txt"), "a").unwrap();
    let out = p.destination.clone();
    let group = single_group(&[p]);

    let failing = Arc::new(AtomicBool::new(true));
    let inner = JsonStateStore::in_dir(
        &tmp.path().join(".backer"),
        Version::new(1, 0, 0, 0),
        Thresholds::default(),
    );
    let store = SwitchableStore {
        inner: inner.clone(),
        failing: Arc::clone(&failing),
    };
    let ledger = VersionLedger::open(store, Thresholds::default()).unwrap();
    let mut coord = coordinator(true);

    let report = coord.run_cycle(&group, &[PairId(0)], &ledger, &no_cancel()).unwrap();
    match &report.outcome {
        CycleOutcome::PersistFailed { attempted, .. } => {
            assert_eq!(*attempted, Version::new(1, 0, 0, 1));
        }
        other => panic!("expected persist failure, got {other:?}"),
    }
    assert_eq!(current(&ledger), Version::new(1, 0, 0, 0));
    assert_eq!(inner.load().unwrap(), Version::new(1, 0, 0, 0));
    assert!(out.join("Site_v1.0.0.1/a.txt").exists(), "leftover folder");

    failing.store(false, Ordering::SeqCst);
    let retry = coord.run_cycle(&group, &[PairId(0)], &ledger, &no_cancel()).unwrap();
    assert_eq!(retry.committed_version(), Some(Version::new(1, 0, 0, 1)));
    assert_eq!(inner.load().unwrap(), Version::new(1, 0, 0, 1));
}

#[test]
fn persist_failure_retry_counts_a_cascaded_change_once() {
    let tmp = TempDir::new().expect("tmp");
    let s = tmp.path().join("s");
    let d = tmp.path().join("d");
    let e = tmp.path().join("e");
    let a = pair(0, &s, &d);
    let b = pair(1, &d, &e);
    fs::write(s.join("seed.txt"), "seed").unwrap();
    let group = single_group(&[a, b]);

    let failing = Arc::new(AtomicBool::new(false));
    let inner = JsonStateStore::in_dir(
        &tmp.path().join(".backer"),
        Version::new(1, 0, 0, 0),
        Thresholds::default(),
    );
    let store = SwitchableStore {
        inner: inner.clone(),
        failing: Arc::clone(&failing),
    };
    let ledger = VersionLedger::open(store, Thresholds::default()).unwrap();
    let mut coord = coordinator(false);

    let baseline = coord
        .run_cycle(&group, &[PairId(0), PairId(1)], &ledger, &no_cancel())
        .unwrap();
    assert_eq!(baseline.outcome, CycleOutcome::Idle);

    fs::write(s.join("new.txt"), "new").unwrap();
    failing.store(true, Ordering::SeqCst);
    let failed = coord.run_cycle(&group, &[PairId(0)], &ledger, &no_cancel()).unwrap();
    assert!(matches!(failed.outcome, CycleOutcome::PersistFailed { .. }));

    // Only the downstream pair is due next, but the upstream retry rides along.
    failing.store(false, Ordering::SeqCst);
    let retry = coord.run_cycle(&group, &[PairId(1)], &ledger, &no_cancel()).unwrap();
    assert_eq!(retry.committed_version(), Some(Version::new(1, 0, 0, 1)));
    let downstream = retry.pair(PairId(1)).expect("downstream report");
    assert!(downstream.cascaded && !downstream.changed);

    let later = coord.run_cycle(&group, &[PairId(0)], &ledger, &no_cancel()).unwrap();
    assert_eq!(later.outcome, CycleOutcome::Idle);
    assert_eq!(current(&ledger), Version::new(1, 0, 0, 1));
    assert_eq!(inner.load().unwrap(), Version::new(1, 0, 0, 1));
    assert!(e.join("Site_v1.0.0.1/Site_v1.0.0.1/new.txt").exists());
}

// ---------------------------------------------------------------------------
// Versioning across cycles and groups
// ---------------------------------------------------------------------------

#[test]
fn build_rollover_names_folder_with_patch_bump() {
    let tmp = TempDir::new().expect("tmp");
    let p = pair(0, &tmp.path().join("src"), &tmp.path().join("out"));
    fs::write(p.source.join("a.txt"), "a").unwrap();
    let out = p.destination.clone();
    let group = single_group(&[p]);
    let ledger = ledger_at(&tmp.path().join(".backer"), Version::new(1, 0, 0, 249));
    let mut coord = coordinator(true);

    let report = coord.run_cycle(&group, &[PairId(0)], &ledger, &no_cancel()).unwrap();
    assert_eq!(
        report.outcome,
        CycleOutcome::Committed {
            version: Version::new(1, 0, 1, 0),
            bump: Bump::Patch,
            folder_name: "Site_v1.0.1.0".into(),
        }
    );
    assert!(out.join("Site_v1.0.1.0").is_dir());
}

#[test]
fn concurrent_groups_claim_distinct_versions() {
    let tmp = TempDir::new().expect("tmp");
    let a = pair(0, &tmp.path().join("a"), &tmp.path().join("a_out"));
    let b = pair(1, &tmp.path().join("b"), &tmp.path().join("b_out"));
    fs::write(a.source.join("x.txt"), "x").unwrap();
    fs::write(b.source.join("y.txt"), "y").unwrap();
    let groups = CascadeGraph::build(&[a, b]).into_groups();
    assert_eq!(groups.len(), 2);
    let ledger = ledger_at(&tmp.path().join(".backer"), Version::new(1, 0, 0, 0));

    let versions: Vec<Version> = std::thread::scope(|scope| {
        let handles: Vec<_> = groups
            .iter()
            .map(|group| {
                let ledger = &ledger;
                scope.spawn(move || {
                    let mut coord = coordinator(true);
                    coord
                        .run_cycle(group, &group.ids(), ledger, &no_cancel())
                        .expect("cycle")
                        .committed_version()
                        .expect("committed")
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().expect("join")).collect()
    });

    let mut sorted = versions.clone();
    sorted.sort();
    assert_eq!(sorted, vec![Version::new(1, 0, 0, 1), Version::new(1, 0, 0, 2)]);
    assert_eq!(current(&ledger), Version::new(1, 0, 0, 2));
}

/// Holds each copy open until a second copy is in flight (or a timeout),
/// recording the highest number of overlapping copies.
#[derive(Default)]
struct OverlapCopier {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl TreeCopier for OverlapCopier {
    fn copy_tree(
        &self,
        source: &Path,
        destination: &Path,
        exclusions: &ExclusionSet,
    ) -> Result<Vec<CopyOutcome>, SyncError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(2);
        while self.in_flight.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        self.peak
            .fetch_max(self.in_flight.load(Ordering::SeqCst), Ordering::SeqCst);
        let result = FsCopier.copy_tree(source, destination, exclusions);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[test]
fn independent_groups_copy_at_the_same_time() {
    let tmp = TempDir::new().expect("tmp");
    let a = pair(0, &tmp.path().join("a"), &tmp.path().join("a_out"));
    let b = pair(1, &tmp.path().join("b"), &tmp.path().join("b_out"));
    fs::write(a.source.join("x.txt"), "x").unwrap();
    fs::write(b.source.join("y.txt"), "y").unwrap();
    let groups = CascadeGraph::build(&[a, b]).into_groups();
    let ledger = ledger_at(&tmp.path().join(".backer"), Version::new(1, 0, 0, 0));
    let copier = Arc::new(OverlapCopier::default());

    std::thread::scope(|scope| {
        for group in &groups {
            let ledger = &ledger;
            let copier: Arc<dyn TreeCopier> = copier.clone();
            scope.spawn(move || {
                let mut coord = BackupCoordinator::new(
                    ProjectName::from(PROJECT),
                    ChangeDetector::new(true),
                    copier,
                );
                let report = coord
                    .run_cycle(group, &group.ids(), ledger, &no_cancel())
                    .expect("cycle");
                assert!(report.committed_version().is_some());
            });
        }
    });

    assert_eq!(copier.peak.load(Ordering::SeqCst), 2, "copies were serialized");
    assert_eq!(current(&ledger), Version::new(1, 0, 0, 2));
}
