//! `sitegate watch [<host>]`: stream notifications from the daemon.

use anyhow::{anyhow, Result};
use chrono::Local;
use clap::Args;
use colored::Colorize;

use sitegate_daemon::{watch, DaemonError, Notification};

use super::format_time_left;

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Only show notifications for this host (and the domains it falls under).
    pub host: Option<String>,

    /// Print raw JSON lines instead of formatted text.
    #[arg(long)]
    pub json: bool,
}

impl WatchArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let json = self.json;

        let result = watch(&home, self.host.as_deref(), |notification| {
            if json {
                match serde_json::to_string(&notification) {
                    Ok(line) => println!("{line}"),
                    Err(err) => eprintln!("failed to encode notification: {err}"),
                }
            } else {
                println!("{}", render(&notification));
            }
            true
        });

        match result {
            Ok(()) => Ok(()),
            Err(DaemonError::DaemonNotRunning { .. }) => Err(anyhow!(
                "daemon is not running; start it with `sitegate daemon start`"
            )),
            Err(err) => Err(anyhow::Error::new(err).context("watch stream failed")),
        }
    }
}

fn render(notification: &Notification) -> String {
    let at = Local::now().format("%H:%M:%S");
    match notification {
        Notification::UpdateCountdown { domain, time_left } => format!(
            "[{at}] {domain} {} {}",
            "unblocks in".yellow(),
            format_time_left(*time_left)
        ),
        Notification::SiteBlocked { domain } => format!("[{at}] {domain} {}", "blocked".red()),
        Notification::SiteUnblocked { domain } => {
            format!("[{at}] {domain} {}", "unblocked".green())
        }
    }
}
