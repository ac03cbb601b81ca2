//! CLI module for aerocommit
//!
//! Provides command-line interface for:
//! - inspect: Print WAL transaction headers
//! - replay: Rebuild a catalog from its WAL
//! - check-config: Validate a pipeline configuration file

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{check_config, inspect, read_headers, replay, replay_catalog, run, run_command};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{write_json_line, write_response};
