//! `sitegate block|unblock|force-unblock <domain>`

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use serde::Deserialize;

use sitegate_daemon::protocol::{CMD_FORCE_UNBLOCK_SITE, CMD_TOGGLE_SITE};
use sitegate_daemon::DaemonRequest;

use super::{call, parse_domain};

#[derive(Args, Debug)]
pub struct DomainArgs {
    /// Domain or URL of a watched site.
    pub domain: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleMode {
    Block,
    Unblock,
    Force,
}

/// Only the fields the CLI prints; the site list is ignored.
#[derive(Deserialize)]
struct Outcome {
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

impl DomainArgs {
    pub fn run(self, mode: ToggleMode) -> Result<()> {
        let home = super::home()?;
        let domain = parse_domain(&self.domain)?;

        let request = match mode {
            ToggleMode::Block => DaemonRequest::new(CMD_TOGGLE_SITE)
                .with_domain(domain.as_str())
                .with_enabled(true),
            ToggleMode::Unblock => DaemonRequest::new(CMD_TOGGLE_SITE)
                .with_domain(domain.as_str())
                .with_enabled(false),
            ToggleMode::Force => {
                DaemonRequest::new(CMD_FORCE_UNBLOCK_SITE).with_domain(domain.as_str())
            }
        };

        let outcome: Outcome = call(&home, &request)?;
        if !outcome.success {
            anyhow::bail!("daemon rejected the request for '{domain}'");
        }

        let message = outcome
            .message
            .unwrap_or_else(|| "Site is now unblocked".to_string());
        let line = format!("{domain}: {message}");
        match mode {
            ToggleMode::Block => println!("{}", line.red()),
            ToggleMode::Unblock => println!("{}", line.yellow()),
            ToggleMode::Force => println!("{}", line.green()),
        }
        Ok(())
    }
}
