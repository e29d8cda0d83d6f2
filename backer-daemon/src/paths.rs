use std::path::{Path, PathBuf};
use std::time::Duration;

use backer_sync::STATE_FILE;

pub const DAEMON_SOCKET: &str = "backer.sock";

/// How often each group task checks whether any of its pairs is due.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

pub fn socket_path(state_dir: &Path) -> PathBuf {
    state_dir.join(DAEMON_SOCKET)
}

pub fn version_state_path(state_dir: &Path) -> PathBuf {
    state_dir.join(STATE_FILE)
}
