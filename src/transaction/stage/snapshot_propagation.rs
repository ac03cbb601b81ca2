//! Catalog snapshot propagation stage
//!
//! Last stage of the pipeline. Swaps the live catalog reference and marks
//! the triggering transaction's changes visible.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::{sealed, BoxFuture, TransactionStage};
use crate::observability::{log_event_with_fields, Event};
use crate::transaction::coordinator::CatalogCoordinator;
use crate::transaction::errors::CommitError;
use crate::transaction::progress::Milestone;
use crate::transaction::task::{TransactionTask, UpdatedCatalogTask, SNAPSHOT_PROPAGATION};

pub struct SnapshotPropagationStage {
    coordinator: Arc<CatalogCoordinator>,
}

impl SnapshotPropagationStage {
    pub fn new(coordinator: Arc<CatalogCoordinator>) -> Self {
        Self { coordinator }
    }

    fn propagate(&self, task: UpdatedCatalogTask) -> Result<(), CommitError> {
        let catalog = Arc::clone(task.catalog());
        let version = catalog.version();

        if self.coordinator.propagate_catalog_snapshot(catalog)? {
            let metrics = self.coordinator.metrics();
            metrics.increment_snapshots_propagated();
            let now = Utc::now();
            for committed_at in task.commit_times() {
                let lag = (now - *committed_at).to_std().unwrap_or(Duration::ZERO);
                metrics.observe_visibility_lag(lag);
            }

            let version_str = version.to_string();
            let absorbed = task.absorbed_transactions().to_string();
            log_event_with_fields(
                Event::CatalogPropagated,
                &[
                    ("catalog", task.catalog_name()),
                    ("catalog_version", &version_str),
                    ("transactions", &absorbed),
                ],
            );
        }

        task.progress()
            .complete(Milestone::ChangesVisible, task.versions)?;
        Ok(())
    }
}

impl sealed::Sealed for SnapshotPropagationStage {}

impl TransactionStage for SnapshotPropagationStage {
    type Input = UpdatedCatalogTask;
    const NAME: &'static str = SNAPSHOT_PROPAGATION;

    fn coordinator(&self) -> &Arc<CatalogCoordinator> {
        &self.coordinator
    }

    fn handle_next(&mut self, task: Self::Input) -> BoxFuture<'_, Result<(), CommitError>> {
        Box::pin(async move { self.propagate(task) })
    }
}
