//! Backer: versioned directory backup daemon.
//!
//! Reads `config.json` from the working directory and runs until ctrl-c or
//! a `stop` request on the control socket.

use std::path::Path;

use anyhow::{Context, Result};

use backer_core::config::{self, CONFIG_FILE};

fn main() -> Result<()> {
    println!(
        "Backer v{} ({}/{})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH,
    );

    let path = Path::new(CONFIG_FILE);
    let config = config::load(path).with_context(|| format!("failed to load {}", path.display()))?;

    println!(
        "Project: {} (configured version v{})",
        config.project_name, config.initial_version
    );
    println!("Loaded {} directory pair(s)", config.pairs.len());
    println!("Press Ctrl+C to stop");

    backer_daemon::start_blocking(config).context("daemon exited with error")?;
    Ok(())
}
