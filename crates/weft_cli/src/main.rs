//! Weft CLI
//!
//! Synchronization commands for weft issue stores.
//!
//! # Commands
//!
//! - `init` - Create the sync branch and private checkout
//! - `sync` - Run a full pull/resolve/push cycle
//! - `status` - Show how far this clone is ahead of / behind the remote
//! - `attic` - List and restore archived (superseded) record versions

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Peer-to-peer issue synchronization over git.
#[derive(Parser)]
#[command(name = "weft")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path inside the repository to operate on
    #[arg(global = true, short, long, default_value = ".")]
    path: PathBuf,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the sync branch and private checkout
    Init,

    /// Run a sync cycle against the remote
    Sync {
        /// Pull and resolve without publishing
        #[arg(long, conflicts_with = "push_only")]
        pull_only: bool,

        /// Publish local changes; fail instead of looping on contention
        #[arg(long)]
        push_only: bool,
    },

    /// Show ahead/behind counts against the last-known remote state
    Status,

    /// Inspect or restore archived record versions
    Attic {
        #[command(subcommand)]
        command: AtticCommands,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum AtticCommands {
    /// List attic entries, optionally for one record
    List {
        /// Display id (wf-xxxxxx) or internal id to filter by
        id: Option<String>,
    },

    /// Restore an archived payload as a new current version
    Restore {
        /// Display id (wf-xxxxxx) or internal id of the record
        id: String,

        /// The superseded version to restore
        version: u64,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Init => commands::init::run(&cli.path)?,
        Commands::Sync {
            pull_only,
            push_only,
        } => commands::sync::run(&cli.path, pull_only, push_only)?,
        Commands::Status => commands::status::run(&cli.path)?,
        Commands::Attic { command } => match command {
            AtticCommands::List { id } => commands::attic::list(&cli.path, id.as_deref())?,
            AtticCommands::Restore { id, version } => {
                commands::attic::restore(&cli.path, &id, version)?;
            }
        },
        Commands::Version => {
            println!("weft v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
