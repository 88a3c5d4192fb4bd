//! ShelfSync CLI
//!
//! Command-line tools for the on-disk operation queue.
//!
//! # Commands
//!
//! - `inspect` - Display journal statistics and queue counts
//! - `dump-queue` - List queued operations
//! - `retry` - Return a failed operation to the queue
//! - `discard` - Drop a queued operation
//! - `compact` - Rewrite the journal to hold only live rows

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// ShelfSync command-line queue tools.
#[derive(Parser)]
#[command(name = "shelfsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the queue journal file
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
    /// Display journal statistics and queue counts
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List queued operations
    DumpQueue {
        /// Only show failed operations
        #[arg(long)]
        failed: bool,

        /// Include operation payloads
        #[arg(long)]
        payloads: bool,

        /// Maximum number of operations to list
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Return a failed operation to the queue
    Retry {
        /// Operation id
        id: u64,

        /// Move the operation's base version to this server version
        #[arg(long)]
        base: Option<u64>,
    },

    /// Drop a queued operation
    Discard {
        /// Operation id
        id: u64,
    },

    /// Rewrite the journal to hold only live rows
    Compact {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Journal path required for inspect")?;
            runtime.block_on(commands::inspect::run(&path, &format))?;
        }
        Commands::DumpQueue {
            failed,
            payloads,
            limit,
            format,
        } => {
            let path = cli.path.ok_or("Journal path required for dump-queue")?;
            let options = commands::dump_queue::DumpOptions {
                failed_only: failed,
                payloads,
                limit,
            };
            runtime.block_on(commands::dump_queue::run(&path, &options, &format))?;
        }
        Commands::Retry { id, base } => {
            let path = cli.path.ok_or("Journal path required for retry")?;
            runtime.block_on(commands::retry::run(&path, id, base))?;
        }
        Commands::Discard { id } => {
            let path = cli.path.ok_or("Journal path required for discard")?;
            runtime.block_on(commands::discard::run(&path, id))?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Journal path required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::Version => {
            println!("ShelfSync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
