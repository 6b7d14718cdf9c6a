//! `sitegate status <domain>` and `sitegate check <host>`

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Deserialize;

use sitegate_core::{SiteState, SiteStatus};
use sitegate_daemon::protocol::{CMD_CHECK_SITE_BLOCKED, CMD_GET_SITE_STATUS};
use sitegate_daemon::DaemonRequest;

use super::sites::state_label;
use super::{call, format_time_left, parse_domain};

/// Arguments for `sitegate status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Domain or URL of a watched site.
    pub domain: String,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let domain = parse_domain(&self.domain)?;
        let status: SiteStatus = call(
            &home,
            &DaemonRequest::new(CMD_GET_SITE_STATUS).with_domain(domain.as_str()),
        )?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&status).context("failed to render status JSON")?
            );
            return Ok(());
        }

        let state = state_for(&status);
        println!("{domain}: {}", state_label(state));
        if status.is_in_delay {
            println!(
                "  unblocks in {}",
                format_time_left(status.time_left).bold()
            );
        }
        Ok(())
    }
}

fn state_for(status: &SiteStatus) -> SiteState {
    if status.enabled {
        SiteState::Blocked
    } else if status.is_in_delay {
        SiteState::Grace
    } else {
        SiteState::Free
    }
}

/// Arguments for `sitegate check`.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Host to check, e.g. `news.example.com`.
    pub host: String,
}

#[derive(Deserialize)]
struct CheckOutcome {
    blocked: bool,
}

impl CheckArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let outcome: CheckOutcome = call(
            &home,
            &DaemonRequest::new(CMD_CHECK_SITE_BLOCKED).with_host(self.host.as_str()),
        )?;
        if outcome.blocked {
            println!("{}: {}", self.host, "blocked".red().bold());
        } else {
            println!("{}: {}", self.host, "not blocked".green());
        }
        Ok(())
    }
}
