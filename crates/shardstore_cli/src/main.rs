//! shardstore CLI
//!
//! Read-only tools for a storage directory. The storage should not be
//! running while they are used.
//!
//! # Commands
//!
//! - `inspect` - List channels, data files and their records
//! - `verify` - Check transactions logs against the data files
//! - `dump-transactions` - Print the entries of a channel's transactions log

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// shardstore storage inspection tools.
#[derive(Parser)]
#[command(name = "shardstore")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the storage directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Output format of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human readable text
    Text,
    /// Pretty-printed JSON
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// List channels, data files and their records
    Inspect {
        /// Count records per type ID
        #[arg(short, long)]
        types: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Check transactions logs against the data files
    Verify {
        /// Only check this channel
        #[arg(short, long)]
        channel: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Print the entries of a channel's transactions log
    DumpTransactions {
        /// Channel whose log to print
        #[arg(short, long, default_value = "0")]
        channel: usize,

        /// Maximum number of entries to print
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { types, format } => {
            let path = cli.path.ok_or("Storage path required for inspect")?;
            commands::inspect::run(&path, types, format)?;
        }
        Commands::Verify { channel, format } => {
            let path = cli.path.ok_or("Storage path required for verify")?;
            commands::verify::run(&path, channel, format)?;
        }
        Commands::DumpTransactions {
            channel,
            limit,
            format,
        } => {
            let path = cli.path.ok_or("Storage path required for dump-transactions")?;
            commands::dump_transactions::run(&path, channel, limit, format)?;
        }
        Commands::Version => {
            println!("shardstore CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("shardstore core v{}", shardstore_core::VERSION);
        }
    }

    Ok(())
}
