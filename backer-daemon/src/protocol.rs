//! Control socket wire format and a small blocking client.
//!
//! One JSON object per line in each direction. Requests are tagged by
//! `cmd`; every reply is a [`ControlResponse`].

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Running version, start time and per-pair activity.
    Status,
    /// Run a cycle for every group now and return the cycle reports.
    Scan,
    /// Reply, then shut the daemon down.
    Stop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    pub fn into_result(self) -> Result<Value, DaemonError> {
        if self.ok {
            return Ok(self.data.unwrap_or(Value::Null));
        }
        let message = self.error.unwrap_or_else(|| "daemon reported an error".to_string());
        Err(DaemonError::Protocol(message))
    }
}

/// Talks to a running daemon through the socket under its state directory.
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket: PathBuf,
}

impl ControlClient {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            socket: socket_path(state_dir),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn status(&self) -> Result<Value, DaemonError> {
        self.request(ControlRequest::Status)
    }

    pub fn scan(&self) -> Result<Value, DaemonError> {
        self.request(ControlRequest::Scan)
    }

    pub fn stop(&self) -> Result<(), DaemonError> {
        self.request(ControlRequest::Stop).map(drop)
    }

    pub fn request(&self, request: ControlRequest) -> Result<Value, DaemonError> {
        let line = serde_json::to_string(&request)?;
        self.exchange(&line)?.into_result()
    }

    /// Send one raw line and read one reply.
    pub fn exchange(&self, line: &str) -> Result<ControlResponse, DaemonError> {
        let mut stream = UnixStream::connect(&self.socket).map_err(|err| match err.kind() {
            ErrorKind::NotFound | ErrorKind::ConnectionRefused => DaemonError::DaemonNotRunning {
                socket: self.socket.clone(),
            },
            _ => io_err(&self.socket, err),
        })?;

        stream
            .write_all(format!("{line}\n").as_bytes())
            .map_err(|e| io_err(&self.socket, e))?;

        let mut reply = String::new();
        let read = BufReader::new(&stream)
            .read_line(&mut reply)
            .map_err(|e| io_err(&self.socket, e))?;
        if read == 0 {
            return Err(DaemonError::Protocol(
                "daemon closed the connection without replying".to_string(),
            ));
        }
        Ok(serde_json::from_str(reply.trim_end())?)
    }
}
