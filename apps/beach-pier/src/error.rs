use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure to bring up a pty-backed shell for one connection.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to allocate pty: {0}")]
    OpenPty(String),
    #[error("failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },
    #[error("working directory does not exist: {}", .0.display())]
    MissingCwd(PathBuf),
    #[error("failed to attach to pty master: {0}")]
    Attach(String),
    #[error("invalid initial size {cols}x{rows}")]
    InvalidSize { cols: u16, rows: u16 },
    #[error("failed to start pty thread: {0}")]
    ReaderThread(#[from] io::Error),
}

/// Failure while driving a live pty session.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("pty io error: {0}")]
    Io(#[from] io::Error),
    #[error("pty resize failed: {0}")]
    Resize(String),
    #[error("terminal size must be non-zero, got {cols}x{rows}")]
    InvalidSize { cols: u16, rows: u16 },
    #[error("blocking pty task failed: {0}")]
    Join(String),
}

/// WebSocket transport failure on a relay connection.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("websocket receive failed: {0}")]
    Receive(#[source] axum::Error),
    #[error("websocket send failed: {0}")]
    Send(#[source] axum::Error),
}

/// Reachability probe failure. Never fatal; it only drives status.
#[derive(Debug, Error)]
pub enum ProbeFailure {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("probe timed out")]
    Timeout,
    #[error("request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for ProbeFailure {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProbeFailure::Timeout
        } else if err.is_connect() {
            ProbeFailure::Connect(err.to_string())
        } else {
            ProbeFailure::Request(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid listen address '{0}'")]
    InvalidAddr(String),
    #[error("invalid environment entry '{0}', expected KEY=VALUE")]
    InvalidEnv(String),
    #[error("terminal size must be non-zero, got {cols}x{rows}")]
    InvalidSize { cols: u16, rows: u16 },
    #[error("probe interval must be greater than zero")]
    ZeroInterval,
}
