//! Error types for sitegate-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from site store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure (permission denied, disk full, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error (write/save path).
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// JSON parse error on load, with the offending file path.
    #[error("failed to parse site store at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The stored document was written by a newer schema than this build understands.
    #[error("site store at {path} has schema version {found}; newest supported is {supported}")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    /// `dirs::home_dir()` returned `None`, so `~/.sitegate/` cannot be located.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}

/// Rejected user-supplied domain input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("invalid domain '{input}': {reason}")]
    Invalid { input: String, reason: &'static str },
}

/// Errors from loading `config.yaml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },

    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}
