//! `sitegate sites list|add|remove`

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use sitegate_core::evaluator::{ceil_secs, state_of, time_left};
use sitegate_core::{store, SiteRecord, SiteState};
use sitegate_daemon::protocol::{CMD_ADD_SITE, CMD_GET_SITES, CMD_REMOVE_SITE};
use sitegate_daemon::{request_data, DaemonError, DaemonRequest};

use super::{call, format_time_left, parse_domain};

/// Manage the watched site list.
#[derive(Subcommand, Debug)]
pub enum SitesCommand {
    /// List watched sites with their current state.
    List(ListArgs),

    /// Start watching a site. New sites are blocked.
    Add(SiteArg),

    /// Stop watching a site.
    Remove(SiteArg),
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct SiteArg {
    /// Domain or URL, e.g. `example.com` or `https://www.example.com/feed`.
    pub domain: String,
}

pub fn run(cmd: SitesCommand) -> Result<()> {
    let home = super::home()?;
    match cmd {
        SitesCommand::List(args) => list(&home, args),
        SitesCommand::Add(arg) => {
            let domain = parse_domain(&arg.domain)?;
            let _: Vec<SiteRecord> =
                call(&home, &DaemonRequest::new(CMD_ADD_SITE).with_domain(domain.as_str()))?;
            println!("✓ Added '{domain}' (blocked)");
            Ok(())
        }
        SitesCommand::Remove(arg) => {
            let domain = parse_domain(&arg.domain)?;
            let _: Vec<SiteRecord> = call(
                &home,
                &DaemonRequest::new(CMD_REMOVE_SITE).with_domain(domain.as_str()),
            )?;
            println!("✓ Removed '{domain}'");
            Ok(())
        }
    }
}

/// Ask the daemon; if it is down, read the store directly.
fn load_sites(home: &Path) -> Result<Vec<SiteRecord>> {
    match request_data(home, &DaemonRequest::new(CMD_GET_SITES)) {
        Ok(data) => serde_json::from_value(data).context("unexpected 'get_sites' response"),
        Err(DaemonError::DaemonNotRunning { .. }) => store::load_sites_at(home)
            .with_context(|| format!("failed to read {}", store::storage_path_at(home).display())),
        Err(err) => Err(err).context("failed to list sites"),
    }
}

#[derive(Serialize)]
struct SiteRowJson {
    domain: String,
    state: SiteState,
    enabled: bool,
    time_left: u64,
    disabled_until: Option<DateTime<Utc>>,
    added: Option<DateTime<Utc>>,
}

#[derive(Tabled)]
struct SiteTableRow {
    #[tabled(rename = "domain")]
    domain: String,
    #[tabled(rename = "state")]
    state: String,
    #[tabled(rename = "time left")]
    time_left: String,
    #[tabled(rename = "added")]
    added: String,
}

fn list(home: &Path, args: ListArgs) -> Result<()> {
    let sites = load_sites(home)?;
    let now = Utc::now();

    if args.json {
        let rows: Vec<SiteRowJson> = sites
            .iter()
            .map(|record| SiteRowJson {
                domain: record.domain.to_string(),
                state: state_of(record, now),
                enabled: record.enabled,
                time_left: ceil_secs(time_left(record, now)),
                disabled_until: record.disabled_until,
                added: record.added,
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&rows).context("failed to render sites JSON")?
        );
        return Ok(());
    }

    if sites.is_empty() {
        println!("No sites watched.");
        println!("Run: sitegate sites add <domain>");
        return Ok(());
    }

    let rows: Vec<SiteTableRow> = sites
        .iter()
        .map(|record| SiteTableRow {
            domain: record.domain.to_string(),
            state: state_label(state_of(record, now)),
            time_left: format_time_left(ceil_secs(time_left(record, now))),
            added: record
                .added
                .map(|added| added.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}

pub(crate) fn state_label(state: SiteState) -> String {
    match state {
        SiteState::Blocked => "blocked".red().bold().to_string(),
        SiteState::Grace => "grace".yellow().to_string(),
        SiteState::Free => "free".green().to_string(),
    }
}
