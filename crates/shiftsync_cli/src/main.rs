//! shiftsync CLI
//!
//! Operator tools for a shiftsync replica directory.
//!
//! # Commands
//!
//! - `inspect` - Display op-log statistics, cursors and sync status
//! - `verify` - Re-check every device hash chain
//! - `dump-oplog` - Dump journal records for debugging
//! - `conflicts` - List conflicts with their risk scores

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// shiftsync command-line replica tools.
#[derive(Parser)]
#[command(name = "shiftsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the replica directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Device the replica belongs to; its chain is held to strict continuity
    #[arg(global = true, short, long, default_value = "shiftsync-cli")]
    device: String,

    /// Merge rule file (JSON) replacing the standard rules
    #[arg(global = true, short, long)]
    rules: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display op-log statistics, cursors and sync status
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify every device hash chain
    Verify,

    /// Dump journal records for debugging
    DumpOplog {
        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Skip this many records
        #[arg(short, long, default_value = "0")]
        offset: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List conflicts, riskiest first
    Conflicts {
        /// Include settled conflicts
        #[arg(short, long)]
        all: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins over -v.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let open = commands::OpenOptions {
        device: cli.device,
        rules: cli.rules,
    };

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Replica path required for inspect")?;
            commands::inspect::run(&path, &open, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Replica path required for verify")?;
            commands::verify::run(&path, &open)?;
        }
        Commands::DumpOplog {
            limit,
            offset,
            format,
        } => {
            let path = cli.path.ok_or("Replica path required for dump-oplog")?;
            commands::dump_oplog::run(&path, limit, offset, &format)?;
        }
        Commands::Conflicts { all, format } => {
            let path = cli.path.ok_or("Replica path required for conflicts")?;
            commands::conflicts::run(&path, &open, all, &format)?;
        }
        Commands::Version => {
            println!("shiftsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Sync protocol v{}", shiftsync_protocol::PROTOCOL_VERSION);
        }
    }

    Ok(())
}
