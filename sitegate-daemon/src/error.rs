use std::path::PathBuf;

use thiserror::Error;

use sitegate_core::{ConfigError, Domain, DomainError, StoreError};

/// Failures of a single gate operation. None of these are fatal to the daemon.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("site not found: {0}")]
    NotFound(Domain),

    #[error("site already exists: {0}")]
    AlreadyExists(Domain),

    #[error(transparent)]
    InvalidDomain(#[from] DomainError),

    /// The store rejected a read or write; the operation was aborted before any
    /// timer or notification was touched.
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("unexpected gate reply: {0}")]
    UnexpectedReply(&'static str),
}

/// Error surface for daemon runtime and protocol.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("gate error: {0}")]
    Gate(#[from] GateError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
