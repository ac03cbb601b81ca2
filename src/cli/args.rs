//! CLI argument definitions using clap
//!
//! Commands:
//! - aerocommit inspect --wal-dir <path>
//! - aerocommit replay --wal-dir <path> [--catalog <name>]
//! - aerocommit check-config [--config <path>]

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// aerocommit - inspect and replay catalog commit WALs
#[derive(Parser, Debug)]
#[command(name = "aerocommit")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the header of every transaction in a WAL directory
    Inspect {
        /// Directory holding the wal_NNNNNN.log files
        #[arg(long)]
        wal_dir: PathBuf,
    },

    /// Rebuild a catalog from its WAL and print a summary
    Replay {
        /// Directory holding the wal_NNNNNN.log files
        #[arg(long)]
        wal_dir: PathBuf,

        /// Catalog name
        #[arg(long, default_value = "catalog")]
        catalog: String,
    },

    /// Validate a pipeline configuration file
    CheckConfig {
        /// Path to configuration file
        #[arg(long, default_value = "./aerocommit.json")]
        config: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
