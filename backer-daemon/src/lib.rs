//! Backup daemon runtime: per-group schedulers, worker pool and control socket.

mod error;
pub mod paths;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use protocol::{ControlClient, ControlRequest, ControlResponse};
pub use runtime::{run, start_blocking, DaemonState, PairStatus};
