//! trialsync: reconcile a trial status feed with a remote trial registry.
//!
//! # Usage
//!
//! ```text
//! trialsync init [--force]
//! trialsync sync [--dry-run]
//! trialsync trial get --protocol-no <no>
//! trialsync trial update --protocol-no <no> --file <path>
//! trialsync trial max-ids
//! trialsync trial nct-ids [--output <file>]
//! trialsync trial seed-env [--force]
//! ```
//!
//! Every command accepts `--config <file>`; the default is
//! `~/.trialsync/config.yaml`.

mod commands;
mod logging;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{init::InitArgs, sync::SyncArgs, trial::TrialCommand};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "trialsync",
    version,
    about = "Synchronize clinical trial documents with a trial registry",
    long_about = None,
)]
struct Cli {
    /// Config file to use instead of ~/.trialsync/config.yaml.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a template config file.
    Init(InitArgs),

    /// Run one synchronization pass.
    Sync(SyncArgs),

    /// Inspect or edit individual registry trials.
    Trial {
        #[command(subcommand)]
        command: TrialCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.config.as_deref();
    match cli.command {
        Commands::Init(args) => args.run(config),
        Commands::Sync(args) => args.run(config),
        Commands::Trial { command } => commands::trial::run(command, config),
    }
}
