//! crmsync CLI
//!
//! Command-line tools for inspecting and maintaining a file-backed
//! crmsync local store.
//!
//! # Commands
//!
//! - `inspect` - Display record counts and checkpoints per owner
//! - `pending` - List records waiting for upload
//! - `reset-checkpoint` - Clear checkpoints so the next sync runs full

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use crmsync_protocol::SyncDomain;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// crmsync command-line store tools.
#[derive(Parser)]
#[command(name = "crmsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the local store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display record counts and checkpoints per owner
    Inspect {
        /// Only show this owner
        #[arg(short, long)]
        owner: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List records waiting for upload
    Pending {
        /// Owner whose records to list
        #[arg(short, long)]
        owner: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Clear checkpoints so the next sync runs full
    ResetCheckpoint {
        /// Owner whose checkpoints to clear
        #[arg(short, long)]
        owner: String,

        /// Only clear this domain (default: both)
        #[arg(short, long, value_enum)]
        domain: Option<DomainArg>,
    },

    /// Show version information
    Version,
}

#[derive(Clone, Copy, ValueEnum)]
enum DomainArg {
    Contacts,
    Calls,
}

impl From<DomainArg> for SyncDomain {
    fn from(arg: DomainArg) -> Self {
        match arg {
            DomainArg::Contacts => SyncDomain::Contacts,
            DomainArg::Calls => SyncDomain::Calls,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { owner, format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, owner.as_deref(), &format)?;
        }
        Commands::Pending { owner, format } => {
            let path = cli.path.ok_or("Store path required for pending")?;
            commands::pending::run(&path, &owner, &format)?;
        }
        Commands::ResetCheckpoint { owner, domain } => {
            let path = cli.path.ok_or("Store path required for reset-checkpoint")?;
            commands::reset_checkpoint::run(&path, &owner, domain.map(SyncDomain::from))?;
        }
        Commands::Version => {
            println!("crmsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
