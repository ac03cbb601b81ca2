//! CLI command implementations
//!
//! Every command is read-only with respect to the WAL: nothing is appended,
//! nothing is repaired.

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use crate::catalog::{Catalog, CatalogSummary};
use crate::observability::{log_event_with_fields, Event, MetricsRegistry};
use crate::transaction::{CatalogCoordinator, NoConflictDetector, TransactionConfig};
use crate::wal::{CatalogWal, FileCatalogWal, TransactionHeader};

use super::args::Command;
use super::errors::{CliError, CliResult};
use super::io::{write_json_line, write_response};

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Inspect { wal_dir } => inspect(&wal_dir),
        Command::Replay { wal_dir, catalog } => replay(&wal_dir, &catalog),
        Command::CheckConfig { config } => check_config(&config),
    }
}

/// Print every transaction header of the WAL in `wal_dir` as a JSON line.
pub fn inspect(wal_dir: &Path) -> CliResult<()> {
    let headers = read_headers(wal_dir)?;
    let mut stdout = io::stdout().lock();
    for header in &headers {
        write_json_line(&mut stdout, header)?;
    }
    stdout.flush()?;
    Ok(())
}

/// Rebuild catalog `name` from the WAL in `wal_dir` and print its summary.
pub fn replay(wal_dir: &Path, name: &str) -> CliResult<()> {
    let summary = replay_catalog(wal_dir, name)?;
    write_response(&summary)
}

/// Validate the configuration file at `path` and print the effective values.
pub fn check_config(path: &Path) -> CliResult<()> {
    let config = TransactionConfig::load(path)?;
    let queue_size = config.queue_size.to_string();
    log_event_with_fields(Event::ConfigLoaded, &[("queue_size", &queue_size)]);
    write_response(&config)
}

fn open_existing(wal_dir: &Path) -> CliResult<FileCatalogWal> {
    if !wal_dir.is_dir() {
        return Err(CliError::config_error(format!(
            "WAL directory does not exist: {}",
            wal_dir.display()
        )));
    }
    Ok(FileCatalogWal::open(
        wal_dir,
        TransactionConfig::default().max_wal_file_size_bytes,
    )?)
}

/// Headers of every transaction held by the WAL, oldest first
pub fn read_headers(wal_dir: &Path) -> CliResult<Vec<TransactionHeader>> {
    let wal = open_existing(wal_dir)?;
    let (Some(first), Some(last)) = (wal.first_written_version(), wal.last_written_version())
    else {
        return Ok(Vec::new());
    };

    let mut headers = Vec::new();
    for version in first..=last {
        let transaction = wal.read_transaction(version)?.ok_or_else(|| {
            CliError::replay_failed(format!("WAL has no transaction at version {}", version))
        })?;
        headers.push(transaction.header);
    }
    Ok(headers)
}

/// Replay the whole WAL onto an empty catalog named `name`.
pub fn replay_catalog(wal_dir: &Path, name: &str) -> CliResult<CatalogSummary> {
    let wal = open_existing(wal_dir)?;
    let base = wal.first_written_version().map_or(0, |first| first.saturating_sub(1));

    let coordinator = CatalogCoordinator::open(
        Catalog::new(name).with_versions(base, 0),
        Arc::new(wal),
        Arc::new(NoConflictDetector),
        TransactionConfig::default(),
        Arc::new(MetricsRegistry::new()),
    )?;
    Ok(coordinator.live_catalog().summary())
}
