//! `sitegate daemon`: background gate lifecycle.

use anyhow::{Context, Result};
use clap::Subcommand;

use sitegate_daemon::paths::socket_path;
use sitegate_daemon::{request_status, request_stop, start_blocking, DaemonError};

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run daemon in foreground (gate + store watcher + socket server).
    Start,
    /// Request graceful daemon shutdown over Unix socket.
    Stop,
    /// Query daemon runtime status over Unix socket.
    Status,
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let home = super::home()?;

    match command {
        DaemonCommand::Start => {
            start_blocking(&home).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match request_stop(&home) {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                println!("daemon is not running");
            }
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status => {
            let payload = match request_status(&home) {
                Ok(status) => status,
                Err(DaemonError::DaemonNotRunning { .. }) => serde_json::json!({
                    "running": false,
                    "socket": socket_path(&home).display().to_string(),
                }),
                Err(err) => return Err(err).context("failed to query daemon status"),
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&payload)
                    .context("failed to render daemon status JSON")?
            );
        }
    }

    Ok(())
}
