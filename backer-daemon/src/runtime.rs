use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex as AsyncMutex, RwLock, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};

use backer_core::{config, BackerConfig, PairId, ProjectName, Version};
use backer_sync::{
    BackupCoordinator, CascadeGraph, CascadeGroup, ChangeDetector, CycleOutcome, CycleReport,
    FsCopier, JsonStateStore, VersionLedger,
};

use crate::error::{io_err, DaemonError};
use crate::paths::{socket_path, version_state_path, TICK_INTERVAL};
use crate::protocol::{ControlRequest, ControlResponse};

/// Last-known activity of one pair, reported by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct PairStatus {
    pub id: PairId,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub scan_delay_secs: u64,
    pub exclusions: Vec<String>,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub last_folder: Option<PathBuf>,
}

#[derive(Debug)]
pub struct DaemonState {
    pub started_at: DateTime<Utc>,
    pub version: Version,
    pub pairs: BTreeMap<PairId, PairStatus>,
}

impl DaemonState {
    fn new(config: &BackerConfig, version: Version) -> Self {
        let pairs = config
            .pairs
            .iter()
            .map(|pair| {
                let status = PairStatus {
                    id: pair.id,
                    source: pair.source.clone(),
                    destination: pair.destination.clone(),
                    scan_delay_secs: pair.scan_delay.as_secs(),
                    exclusions: pair.exclusions.describe(),
                    last_scan_at: None,
                    last_backup_at: None,
                    last_folder: None,
                };
                (pair.id, status)
            })
            .collect();
        Self {
            started_at: Utc::now(),
            version,
            pairs,
        }
    }

    fn apply(&mut self, report: &CycleReport) {
        for entry in &report.pairs {
            if let Some(status) = self.pairs.get_mut(&entry.pair) {
                status.last_scan_at = Some(report.started_at);
                if let (Some(folder), CycleOutcome::Committed { .. }) = (&entry.folder, &report.outcome)
                {
                    status.last_backup_at = Some(report.started_at);
                    status.last_folder = Some(folder.clone());
                }
            }
        }
        if let Some(version) = report.committed_version() {
            self.version = version;
        }
    }
}

type SharedState = Arc<RwLock<DaemonState>>;

struct ScanJob {
    respond_to: oneshot::Sender<Result<CycleReport, String>>,
}

/// Writes committed versions back into the config file, one at a time and
/// never moving backwards.
struct ConfigMirror {
    path: PathBuf,
    recorded: AsyncMutex<Version>,
}

impl ConfigMirror {
    fn new(path: PathBuf, recorded: Version) -> Self {
        Self {
            path,
            recorded: AsyncMutex::new(recorded),
        }
    }

    /// Failures only warn; the state file stays authoritative.
    async fn record(&self, version: Version) {
        let mut recorded = self.recorded.lock().await;
        if version <= *recorded {
            tracing::debug!(%version, recorded = %*recorded, "config already holds a newer version");
            return;
        }

        let path = self.path.clone();
        let result =
            tokio::task::spawn_blocking(move || config::record_version(&path, &version)).await;
        match result {
            Ok(Ok(())) => *recorded = version,
            Ok(Err(err)) => {
                tracing::warn!(path = %self.path.display(), error = %err, "could not record version in config");
            }
            Err(err) => {
                tracing::warn!(error = %err, "version mirror task failed");
            }
        }
    }
}

/// Everything one group task needs.
struct GroupContext {
    group: Arc<CascadeGroup>,
    coordinator: Arc<Mutex<BackupCoordinator>>,
    ledger: Arc<VersionLedger>,
    workers: Arc<Semaphore>,
    cancel: Arc<AtomicBool>,
    state: SharedState,
    mirror: Arc<ConfigMirror>,
}

impl GroupContext {
    fn has_pending_retry(&self) -> bool {
        self.coordinator
            .lock()
            .map(|coordinator| coordinator.pending_retry().next().is_some())
            .unwrap_or(false)
    }
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(config: BackerConfig) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(config))
}

/// Run the daemon until `stop`, ctrl-c, or a fatal task error.
pub async fn run(config: BackerConfig) -> Result<(), DaemonError> {
    let state_dir = config.state_dir.clone();
    if !state_dir.exists() {
        fs::create_dir_all(&state_dir).map_err(|e| io_err(&state_dir, e))?;
    }

    let store = JsonStateStore::in_dir(&state_dir, config.initial_version, config.thresholds);
    let ledger = VersionLedger::open(store, config.thresholds)?;
    let version = ledger.current();
    let ledger = Arc::new(ledger);
    let mirror = Arc::new(ConfigMirror::new(config.path.clone(), config.initial_version));

    tracing::info!(
        project = %config.project_name,
        %version,
        thresholds = %config.thresholds,
        workers = config.max_workers,
        "starting backup daemon",
    );
    for pair in &config.pairs {
        tracing::info!(
            pair = %pair.id,
            source = %pair.source.display(),
            destination = %pair.destination.display(),
            every_secs = pair.scan_delay.as_secs(),
            exclusions = ?pair.exclusions.describe(),
            "monitoring",
        );
    }

    let state: SharedState = Arc::new(RwLock::new(DaemonState::new(&config, version)));
    let workers = Arc::new(Semaphore::new(config.max_workers));
    let cancel = Arc::new(AtomicBool::new(false));
    let copier = Arc::new(FsCopier);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let mut group_handles = Vec::new();
    let mut scan_senders = Vec::new();
    for group in CascadeGraph::build(&config.pairs).into_groups() {
        let (scan_tx, scan_rx) = mpsc::channel::<ScanJob>(8);
        scan_senders.push(scan_tx);

        let ctx = GroupContext {
            group: Arc::new(group),
            coordinator: Arc::new(Mutex::new(BackupCoordinator::new(
                config.project_name.clone(),
                ChangeDetector::new(config.initial_backup),
                copier.clone(),
            ))),
            ledger: ledger.clone(),
            workers: workers.clone(),
            cancel: cancel.clone(),
            state: state.clone(),
            mirror: mirror.clone(),
        };
        let shutdown = shutdown_tx.clone();
        group_handles.push(tokio::spawn(async move {
            let result = group_task(ctx, scan_rx, shutdown.subscribe()).await;
            if result.is_err() {
                let _ = shutdown.send(());
            }
            result
        }));
    }

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let state_dir = state_dir.clone();
        let state = state.clone();
        let project = config.project_name.clone();
        tokio::spawn(async move {
            let result = socket_server_task(
                state_dir,
                project,
                state,
                scan_senders,
                shutdown.clone(),
                shutdown.subscribe(),
            )
            .await;
            let _ = shutdown.send(());
            result
        })
    };

    let cancel_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = shutdown_rx.recv().await;
            cancel.store(true, Ordering::SeqCst);
            Ok::<(), DaemonError>(())
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (socket_result, cancel_result, signal_result) =
        tokio::join!(socket_handle, cancel_handle, signal_handle);
    for handle in group_handles {
        handle_join("group", handle.await)?;
    }
    handle_join("socket_server", socket_result)?;
    handle_join("cancel", cancel_result)?;
    handle_join("signal_handler", signal_result)?;

    let version = state.read().await.version;
    tracing::info!(%version, "backup daemon stopped");
    Ok(())
}

async fn group_task(
    ctx: GroupContext,
    mut scan_rx: mpsc::Receiver<ScanJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut last_evaluated: HashMap<PairId, Instant> = HashMap::new();
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {
                let now = Instant::now();
                let due = due_pairs(&ctx.group, &last_evaluated, now);
                if due.is_empty() && !ctx.has_pending_retry() {
                    continue;
                }
                match run_cycle(&ctx, due.clone()).await {
                    Ok(report) => {
                        for id in due.iter().copied().chain(report.pairs.iter().map(|p| p.pair)) {
                            last_evaluated.insert(id, now);
                        }
                    }
                    Err(err) => tracing::error!(group = ?ctx.group.ids(), error = %err, "backup cycle failed"),
                }
            }
            job = scan_rx.recv() => {
                let Some(job) = job else { break };
                let now = Instant::now();
                let due = ctx.group.ids();
                let outcome = run_cycle(&ctx, due.clone()).await.map_err(|err| err.to_string());
                if outcome.is_ok() {
                    for id in due {
                        last_evaluated.insert(id, now);
                    }
                }
                let _ = job.respond_to.send(outcome);
            }
        }
    }

    Ok(())
}

/// Pairs in `group` whose scan delay has elapsed since they were last
/// evaluated. Never-evaluated pairs are always due.
fn due_pairs(
    group: &CascadeGroup,
    last_evaluated: &HashMap<PairId, Instant>,
    now: Instant,
) -> Vec<PairId> {
    group
        .pairs()
        .iter()
        .filter(|pair| match last_evaluated.get(&pair.id) {
            Some(at) => now.duration_since(*at) >= pair.scan_delay,
            None => true,
        })
        .map(|pair| pair.id)
        .collect()
}

async fn run_cycle(ctx: &GroupContext, due: Vec<PairId>) -> Result<CycleReport, DaemonError> {
    let _permit = ctx
        .workers
        .acquire()
        .await
        .map_err(|_| DaemonError::ChannelClosed("worker pool"))?;

    let group = ctx.group.clone();
    let coordinator = ctx.coordinator.clone();
    let ledger = ctx.ledger.clone();
    let cancel = ctx.cancel.clone();
    let report = tokio::task::spawn_blocking(move || {
        let mut coordinator = coordinator
            .lock()
            .map_err(|_| DaemonError::Protocol("coordinator lock poisoned".to_string()))?;
        coordinator
            .run_cycle(&group, &due, &ledger, &cancel)
            .map_err(DaemonError::from)
    })
    .await
    .map_err(|err| DaemonError::Protocol(format!("cycle task join error: {err}")))??;

    ctx.state.write().await.apply(&report);

    match &report.outcome {
        CycleOutcome::Committed { version, folder_name, .. } => {
            tracing::info!(
                %version,
                folder = %folder_name,
                pairs = report.pairs.iter().filter(|p| p.copied()).count(),
                duration_ms = report.duration_ms,
                "backup cycle completed",
            );
            ctx.mirror.record(*version).await;
        }
        CycleOutcome::PersistFailed { attempted, reason } => {
            tracing::warn!(%attempted, %reason, "backup cycle not committed");
        }
        CycleOutcome::Idle | CycleOutcome::Abandoned => {}
    }

    Ok(report)
}

async fn socket_server_task(
    state_dir: PathBuf,
    project: ProjectName,
    state: SharedState,
    scan_senders: Vec<mpsc::Sender<ScanJob>>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&state_dir);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::debug!(socket = %socket.display(), "control socket listening");

    let scan_senders = Arc::new(scan_senders);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let state_dir = state_dir.clone();
                let project = project.clone();
                let state = state.clone();
                let scan_senders = scan_senders.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(
                        stream,
                        state_dir,
                        project,
                        state,
                        scan_senders,
                        shutdown_tx,
                    ).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    state_dir: PathBuf,
    project: ProjectName,
    state: SharedState,
    scan_senders: Arc<Vec<mpsc::Sender<ScanJob>>>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: ControlRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                let reply = ControlResponse::error(format!("unknown command or malformed request: {err}"));
                write_response(&mut writer, &reply).await?;
                continue;
            }
        };

        let response = match request {
            ControlRequest::Status => {
                ControlResponse::ok(build_status_payload(&state_dir, &project, &state).await)
            }
            ControlRequest::Scan => match scan_all(&scan_senders).await {
                Ok(reports) => ControlResponse::ok(json!({ "reports": reports })),
                Err(err) => ControlResponse::error(err.to_string()),
            },
            ControlRequest::Stop => ControlResponse::ok(json!({ "stopping": true })),
        };

        write_response(&mut writer, &response).await?;
        if request == ControlRequest::Stop {
            tracing::info!("stop requested over control socket");
            let _ = shutdown_tx.send(());
            break;
        }
    }

    Ok(())
}

async fn build_status_payload(state_dir: &Path, project: &ProjectName, state: &SharedState) -> Value {
    let state = state.read().await;
    let pairs: Vec<&PairStatus> = state.pairs.values().collect();
    let last_backup_at = pairs.iter().filter_map(|p| p.last_backup_at).max();

    json!({
        "running": true,
        "project": project.0,
        "version": state.version.to_string(),
        "started_at": state.started_at,
        "last_backup_at": last_backup_at,
        "pairs": pairs,
        "socket": socket_path(state_dir).display().to_string(),
        "state_file": version_state_path(state_dir).display().to_string(),
    })
}

/// Ask every group task for an immediate cycle and gather the reports.
async fn scan_all(senders: &[mpsc::Sender<ScanJob>]) -> Result<Vec<CycleReport>, DaemonError> {
    let mut pending = Vec::with_capacity(senders.len());
    for sender in senders {
        let (tx, rx) = oneshot::channel();
        sender
            .send(ScanJob { respond_to: tx })
            .await
            .map_err(|_| DaemonError::ChannelClosed("scan queue"))?;
        pending.push(rx);
    }

    let mut reports = Vec::with_capacity(pending.len());
    for rx in pending {
        let outcome = rx
            .await
            .map_err(|_| DaemonError::ChannelClosed("scan response"))?;
        reports.push(outcome.map_err(DaemonError::Protocol)?);
    }
    Ok(reports)
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &ControlResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
