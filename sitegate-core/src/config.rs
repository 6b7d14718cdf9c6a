//! Daemon configuration loaded from `~/.sitegate/config.yaml`.
//!
//! Every field is optional; a missing file yields [`GateConfig::default`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::store::sitegate_root;

pub const CONFIG_FILE: &str = "config.yaml";

/// Grace period applied when a blocked domain is switched off.
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 60;

/// Longest accepted grace period (30 days).
pub const MAX_GRACE_PERIOD_SECS: u64 = 30 * 24 * 60 * 60;

/// Countdown notification cadence.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub grace_period_secs: u64,
    pub tick_interval_ms: u64,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub log_filter: String,
    pub log_format: LogFormat,
    /// Reconcile timers when `storage.json` changes on disk.
    pub watch_store: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: DEFAULT_GRACE_PERIOD_SECS,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            log_filter: "info".to_owned(),
            log_format: LogFormat::Pretty,
            watch_store: true,
        }
    }
}

impl GateConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.grace_period_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "grace_period_secs",
                reason: "must be greater than zero",
            });
        }
        if self.grace_period_secs > MAX_GRACE_PERIOD_SECS {
            return Err(ConfigError::Invalid {
                field: "grace_period_secs",
                reason: "must not exceed 30 days (2592000 seconds)",
            });
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "tick_interval_ms",
                reason: "must be greater than zero",
            });
        }
        Ok(())
    }
}

/// `<home>/.sitegate/config.yaml`
pub fn config_path_at(home: &Path) -> PathBuf {
    sitegate_root(home).join(CONFIG_FILE)
}

/// Load and validate the config; defaults when the file is absent.
pub fn load_at(home: &Path) -> Result<GateConfig, ConfigError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Ok(GateConfig::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    let config: GateConfig = if contents.trim().is_empty() {
        GateConfig::default()
    } else {
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })?
    };
    config.validate()?;
    Ok(config)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<GateConfig, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
    load_at(&home)
}
