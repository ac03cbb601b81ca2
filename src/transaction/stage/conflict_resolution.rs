//! Conflict resolution stage
//!
//! The only place catalog versions are assigned. Versions are handed out in
//! the order transactions leave the entry queue.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::{fail_task, push, sealed, BoxFuture, TransactionStage};
use crate::observability::{log_event_with_fields, Event};
use crate::transaction::coordinator::CatalogCoordinator;
use crate::transaction::errors::CommitError;
use crate::transaction::progress::Milestone;
use crate::transaction::task::{
    ConflictResolutionTask, TaskContext, TransactionTask, WalAppendingTask, CONFLICT_RESOLUTION,
};

/// Version reserved for the task in flight
#[derive(Debug, Clone, Copy)]
struct Reservation {
    schema_delta: u64,
}

pub struct ConflictResolutionStage {
    coordinator: Arc<CatalogCoordinator>,
    downstream: mpsc::Sender<WalAppendingTask>,
    reserved: Option<Reservation>,
}

impl ConflictResolutionStage {
    pub fn new(
        coordinator: Arc<CatalogCoordinator>,
        downstream: mpsc::Sender<WalAppendingTask>,
    ) -> Self {
        Self {
            coordinator,
            downstream,
            reserved: None,
        }
    }

    fn resolve(&mut self, task: ConflictResolutionTask) -> Result<(), CommitError> {
        self.reserved = None;
        self.coordinator.identify_conflicts(&task)?;

        let schema_delta = task.schema_delta();
        let versions = self.coordinator.assign_catalog_versions(schema_delta);
        self.reserved = Some(Reservation { schema_delta });

        let version = versions.catalog_version.to_string();
        let transaction_id = task.transaction_id().to_string();
        log_event_with_fields(
            Event::ConflictResolved,
            &[
                ("catalog", task.catalog_name()),
                ("catalog_version", &version),
                ("transaction_id", &transaction_id),
            ],
        );

        task.progress()
            .complete(Milestone::ConflictResolved, versions)?;
        push(
            task.into_wal_appending(versions),
            &self.downstream,
            self.coordinator.metrics(),
        )?;

        self.reserved = None;
        Ok(())
    }
}

impl sealed::Sealed for ConflictResolutionStage {}

impl TransactionStage for ConflictResolutionStage {
    type Input = ConflictResolutionTask;
    const NAME: &'static str = CONFLICT_RESOLUTION;

    fn coordinator(&self) -> &Arc<CatalogCoordinator> {
        &self.coordinator
    }

    fn handle_next(&mut self, task: Self::Input) -> BoxFuture<'_, Result<(), CommitError>> {
        Box::pin(async move { self.resolve(task) })
    }

    fn handle_exception(&mut self, context: &TaskContext, err: CommitError) {
        // Give back the version only if this task actually reserved one.
        if let Some(reservation) = self.reserved.take() {
            if let Err(rollback) = self
                .coordinator
                .notify_catalog_version_dropped(1, reservation.schema_delta)
            {
                fail_task(&self.coordinator, Self::NAME, context, rollback);
            }
        }
        fail_task(&self.coordinator, Self::NAME, context, err);
    }
}
