pub mod daemon;
pub mod sites;
pub mod status;
pub mod toggle;
pub mod watch;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;

use sitegate_core::Domain;
use sitegate_daemon::{request_data, DaemonError, DaemonRequest};

pub fn home() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

/// Normalize user input (`https://www.Example.com/x` → `example.com`).
pub fn parse_domain(input: &str) -> Result<Domain> {
    Domain::parse(input).with_context(|| format!("'{input}' is not a valid domain"))
}

/// Send `request` to the daemon and decode its `data` payload.
pub fn call<T: DeserializeOwned>(home: &Path, request: &DaemonRequest) -> Result<T> {
    let data = request_data(home, request).map_err(|err| match err {
        DaemonError::DaemonNotRunning { .. } => {
            anyhow!("daemon is not running; start it with `sitegate daemon start`")
        }
        DaemonError::Protocol(message) => anyhow!(message),
        other => anyhow::Error::new(other).context(format!("'{}' request failed", request.cmd)),
    })?;
    serde_json::from_value(data)
        .with_context(|| format!("unexpected '{}' response from daemon", request.cmd))
}

pub fn format_time_left(secs: u64) -> String {
    match secs {
        0 => "-".to_string(),
        s if s < 60 => format!("{s}s"),
        s => format!("{}m {:02}s", s / 60, s % 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_left_is_human_readable() {
        assert_eq!(format_time_left(0), "-");
        assert_eq!(format_time_left(42), "42s");
        assert_eq!(format_time_left(60), "1m 00s");
        assert_eq!(format_time_left(125), "2m 05s");
    }

    #[test]
    fn domain_input_is_normalized() {
        assert_eq!(
            parse_domain("https://www.Example.com/feed").expect("domain"),
            Domain::from("example.com")
        );
        let err = parse_domain("nodot").unwrap_err();
        assert!(err.to_string().contains("nodot"));
    }
}
