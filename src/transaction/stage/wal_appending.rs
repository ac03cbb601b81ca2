//! WAL appending stage
//!
//! Appends versioned transactions to the shared WAL strictly in catalog
//! version order. The commit timestamp of a transaction is taken here, right
//! before its frame is written.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;

use super::{fail_task, push, sealed, BoxFuture, TransactionStage};
use crate::observability::{log_event_with_fields, Event};
use crate::transaction::coordinator::CatalogCoordinator;
use crate::transaction::errors::CommitError;
use crate::transaction::progress::Milestone;
use crate::transaction::task::{
    TaskContext, TrunkIncorporationTask, WalAppendingTask, WAL_APPENDING,
};
use crate::wal::TransactionHeader;

/// Bookkeeping for the task currently being appended
#[derive(Debug, Clone, Copy)]
struct InFlight {
    catalog_version: u64,
    /// Set once the frame is in the shared WAL
    durable: bool,
}

pub struct WalAppendingStage {
    coordinator: Arc<CatalogCoordinator>,
    downstream: mpsc::Sender<TrunkIncorporationTask>,
    in_flight: Option<InFlight>,
}

impl WalAppendingStage {
    pub fn new(
        coordinator: Arc<CatalogCoordinator>,
        downstream: mpsc::Sender<TrunkIncorporationTask>,
    ) -> Self {
        Self {
            coordinator,
            downstream,
            in_flight: None,
        }
    }

    fn append(&mut self, task: WalAppendingTask) -> Result<(), CommitError> {
        self.in_flight = None;
        let versions = task.versions();
        let catalog_version = versions.catalog_version;

        let last_written = self.coordinator.last_written_catalog_version();
        if last_written + 1 != catalog_version {
            return Err(CommitError::premise(format!(
                "Transaction {} appended out of order: version {} after last written {}",
                task.transaction_id, catalog_version, last_written
            )));
        }

        self.in_flight = Some(InFlight {
            catalog_version,
            durable: false,
        });

        let header = TransactionHeader {
            transaction_id: task.transaction_id,
            catalog_version,
            catalog_schema_version: versions.catalog_schema_version,
            mutation_count: task.mutation_count(),
            wal_size_bytes: task.wal_size_bytes(),
            commit_timestamp: Utc::now(),
        };

        let WalAppendingTask {
            catalog_name,
            transaction_id,
            wal,
            progress,
            ..
        } = task;

        let written = self
            .coordinator
            .append_wal_and_discard(&header, wal)
            .map_err(|e| CommitError::from_wal(&e, catalog_version))?;
        if let Some(in_flight) = self.in_flight.as_mut() {
            in_flight.durable = true;
        }
        self.coordinator
            .update_last_written_catalog_version(catalog_version)?;
        self.coordinator.metrics().record_wal_append(written);

        let version = catalog_version.to_string();
        let bytes = written.to_string();
        let id = transaction_id.to_string();
        log_event_with_fields(
            Event::WalAppend,
            &[
                ("bytes", &bytes),
                ("catalog", &catalog_name),
                ("catalog_version", &version),
                ("transaction_id", &id),
            ],
        );

        progress.complete(Milestone::WalPersisted, versions)?;
        push(
            TrunkIncorporationTask::new(
                catalog_name,
                transaction_id,
                versions,
                header.mutation_count,
                header.wal_size_bytes,
                header.commit_timestamp,
                progress,
            ),
            &self.downstream,
            self.coordinator.metrics(),
        )?;

        self.in_flight = None;
        Ok(())
    }

    /// Undo the version bookkeeping of a failed append.
    ///
    /// Every version assigned after the failed one is already queued behind
    /// it and can no longer be written in order, so all unwritten versions
    /// are given back at once. The queued successors then fail the order
    /// check without touching the counters.
    fn roll_back(&self, in_flight: InFlight, err: &CommitError) -> Result<(), CommitError> {
        match *err {
            CommitError::WalVersionMismatch { last_written, .. } => {
                let version = in_flight.catalog_version;
                if last_written >= version {
                    return Err(CommitError::premise(format!(
                        "WAL ends at {} at or beyond appended version {}",
                        last_written, version
                    )));
                }
                let dropped = version - last_written;
                self.coordinator
                    .realign_last_written_catalog_version(last_written);

                let version_str = version.to_string();
                let last_str = last_written.to_string();
                let dropped_str = dropped.to_string();
                log_event_with_fields(
                    Event::WalVersionMismatch,
                    &[
                        ("catalog", self.coordinator.name()),
                        ("catalog_version", &version_str),
                        ("dropped", &dropped_str),
                        ("last_written", &last_str),
                    ],
                );
                self.coordinator.release_unwritten_versions().map(|_| ())
            }
            // Once the frame is durable the version stays taken.
            _ if in_flight.durable => Ok(()),
            _ => self.coordinator.release_unwritten_versions().map(|_| ()),
        }
    }
}

impl sealed::Sealed for WalAppendingStage {}

impl TransactionStage for WalAppendingStage {
    type Input = WalAppendingTask;
    const NAME: &'static str = WAL_APPENDING;

    fn coordinator(&self) -> &Arc<CatalogCoordinator> {
        &self.coordinator
    }

    fn handle_next(&mut self, task: Self::Input) -> BoxFuture<'_, Result<(), CommitError>> {
        Box::pin(async move { self.append(task) })
    }

    fn handle_exception(&mut self, context: &TaskContext, err: CommitError) {
        if let Some(in_flight) = self.in_flight.take() {
            if let Err(rollback) = self.roll_back(in_flight, &err) {
                fail_task(&self.coordinator, Self::NAME, context, rollback);
            }
        }
        fail_task(&self.coordinator, Self::NAME, context, err);
    }
}
