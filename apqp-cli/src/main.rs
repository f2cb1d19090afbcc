//! apqp: keep a PFMEA and its Control Plan structurally in sync.
//!
//! # Usage
//!
//! ```text
//! apqp init <project>
//! apqp doc show|import|put|set|remove <project> <document> ...
//! apqp sync <project> --direction pfmea-to-control-plan [--policy ...] [--allow-deletions] [--dry-run]
//! apqp log <project> [--direction ...] [--outcome ...] [--limit N] [--before SEQ]
//! apqp conflicts <project> [--direction ...]
//! apqp resolve <project> <conflict-id> keep-source|keep-target|manual-value [--value V]
//! apqp status [project]
//! apqp daemon start|stop|status
//! ```
//!
//! `--daemon` routes sync, log, conflicts and resolve through a running
//! daemon instead of opening the project databases in this process.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    conflicts::ConflictsArgs, daemon::DaemonCommand, doc::DocCommand, init::InitArgs,
    log::LogArgs, resolve::ResolveArgs, status::StatusArgs, sync::SyncArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "apqp",
    version,
    about = "Synchronize PFMEA and Control Plan structure per project",
    long_about = None,
)]
struct Cli {
    /// Send requests to the running daemon.
    #[arg(long, global = true)]
    daemon: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision a project's namespace.
    Init(InitArgs),

    /// Inspect or edit one of a project's documents.
    Doc {
        #[command(subcommand)]
        command: DocCommand,
    },

    /// Propagate structure from one document to the other.
    Sync(SyncArgs),

    /// Page through a project's sync log, newest first.
    Log(LogArgs),

    /// List conflicts awaiting a manual decision.
    Conflicts(ConflictsArgs),

    /// Resolve a pending conflict.
    Resolve(ResolveArgs),

    /// Show namespace readiness, revisions and watermarks.
    Status(StatusArgs),

    /// Run or control the background daemon.
    #[command(name = "daemon")]
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
    if !matches!(cli.command, Commands::Daemon { .. }) {
        commands::init_tracing();
    }

    let via_daemon = cli.daemon;
    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Doc { command } => commands::doc::run(command),
        Commands::Sync(args) => args.run(via_daemon),
        Commands::Log(args) => args.run(via_daemon),
        Commands::Conflicts(args) => args.run(via_daemon),
        Commands::Resolve(args) => args.run(via_daemon),
        Commands::Status(args) => args.run(via_daemon),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
