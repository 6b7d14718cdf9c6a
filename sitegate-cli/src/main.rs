//! SiteGate: block distracting sites, with a cooling-off period before they unblock.
//!
//! # Usage
//!
//! ```text
//! sitegate daemon start|stop|status
//! sitegate sites list [--json]
//! sitegate sites add <domain>
//! sitegate sites remove <domain>
//! sitegate block <domain>
//! sitegate unblock <domain>
//! sitegate status <domain> [--json]
//! sitegate check <host>
//! sitegate force-unblock <domain>
//! sitegate watch [<host>]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand,
    sites::SitesCommand,
    status::{CheckArgs, StatusArgs},
    toggle::{DomainArgs, ToggleMode},
    watch::WatchArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "sitegate",
    version,
    about = "Block distracting sites, with a grace period before they unblock",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage the watched site list.
    Sites {
        #[command(subcommand)]
        command: SitesCommand,
    },

    /// Block a site immediately.
    Block(DomainArgs),

    /// Unblock a site after the grace period.
    Unblock(DomainArgs),

    /// Unblock a site now, skipping the grace period.
    ForceUnblock(DomainArgs),

    /// Show whether a site is blocked and how long its grace period has left.
    Status(StatusArgs),

    /// Check whether a host (or a parent domain of it) is blocked.
    Check(CheckArgs),

    /// Print block-state notifications as they happen.
    Watch(WatchArgs),

    /// Run or control the SiteGate daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Sites { command } => commands::sites::run(command),
        Commands::Block(args) => args.run(ToggleMode::Block),
        Commands::Unblock(args) => args.run(ToggleMode::Unblock),
        Commands::ForceUnblock(args) => args.run(ToggleMode::Force),
        Commands::Status(args) => args.run(),
        Commands::Check(args) => args.run(),
        Commands::Watch(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
