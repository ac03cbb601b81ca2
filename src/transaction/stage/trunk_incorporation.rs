//! Trunk incorporation stage
//!
//! Greedily merges every WAL-persisted transaction into a new catalog
//! snapshot. One pass may absorb many transactions; the tasks of the
//! transactions absorbed by an earlier pass find their version already
//! finalized and only wait for it to become visible.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::{push, sealed, BoxFuture, TransactionStage};
use crate::observability::{log_event_with_fields, Event};
use crate::transaction::coordinator::CatalogCoordinator;
use crate::transaction::errors::CommitError;
use crate::transaction::progress::Milestone;
use crate::transaction::task::{
    TransactionTask, TrunkIncorporationTask, UpdatedCatalogTask, TRUNK_INCORPORATION,
};

pub struct TrunkIncorporationStage {
    coordinator: Arc<CatalogCoordinator>,
    downstream: mpsc::Sender<UpdatedCatalogTask>,
}

impl TrunkIncorporationStage {
    pub fn new(
        coordinator: Arc<CatalogCoordinator>,
        downstream: mpsc::Sender<UpdatedCatalogTask>,
    ) -> Self {
        Self {
            coordinator,
            downstream,
        }
    }

    async fn incorporate(&self, task: TrunkIncorporationTask) -> Result<(), CommitError> {
        let versions = task.versions();
        let catalog_version = versions.catalog_version;

        if catalog_version <= self.coordinator.last_finalized_catalog_version() {
            // Absorbed by an earlier pass.
            self.coordinator
                .wait_until_live_version_reaches(catalog_version)
                .await?;
            task.progress()
                .complete(Milestone::TrunkIncorporated, versions)?;
            task.progress()
                .complete(Milestone::ChangesVisible, versions)?;
            return Ok(());
        }

        let flush_frequency = self.coordinator.config().flush_frequency();
        let version = catalog_version.to_string();
        let updated = match self
            .coordinator
            .process_transactions(catalog_version, flush_frequency, true)?
        {
            Some(result) => {
                self.coordinator.metrics().record_trunk_pass(
                    result.processed_transactions,
                    result.processed_atomic_mutations,
                    result.processed_local_mutations,
                );
                let finalized = result.catalog.version().to_string();
                let processed = result.processed_transactions.to_string();
                let last_id = result.last_transaction_id.to_string();
                log_event_with_fields(
                    Event::TrunkIncorporated,
                    &[
                        ("catalog", task.catalog_name()),
                        ("catalog_version", &finalized),
                        ("last_transaction_id", &last_id),
                        ("transactions", &processed),
                        ("trigger_version", &version),
                    ],
                );

                task.progress()
                    .complete(Milestone::TrunkIncorporated, versions)?;
                task.into_updated_catalog(
                    result.catalog,
                    result.processed_transactions,
                    result.commit_times,
                )
            }
            None => {
                log_event_with_fields(
                    Event::TrunkIncorporationEmpty,
                    &[("catalog", task.catalog_name()), ("trigger_version", &version)],
                );
                task.progress()
                    .complete(Milestone::TrunkIncorporated, versions)?;
                let catalog = self.coordinator.last_finalized_catalog();
                task.into_updated_catalog(catalog, 0, Vec::new())
            }
        };

        push(updated, &self.downstream, self.coordinator.metrics())
    }
}

impl sealed::Sealed for TrunkIncorporationStage {}

impl TransactionStage for TrunkIncorporationStage {
    type Input = TrunkIncorporationTask;
    const NAME: &'static str = TRUNK_INCORPORATION;

    fn coordinator(&self) -> &Arc<CatalogCoordinator> {
        &self.coordinator
    }

    fn handle_next(&mut self, task: Self::Input) -> BoxFuture<'_, Result<(), CommitError>> {
        Box::pin(self.incorporate(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Mutation;
    use crate::transaction::progress::{CommitProgress, CommitVersions};
    use crate::transaction::stage::test_support::{header_for, memory_coordinator};
    use crate::wal::{CatalogWal, IsolatedWal};
    use chrono::Utc;
    use uuid::Uuid;

    /// Write a transaction at the next version and return its trunk task.
    fn persisted(coordinator: &CatalogCoordinator, mutations: usize) -> TrunkIncorporationTask {
        let mutations: Vec<Mutation> = (0..mutations)
            .map(|i| Mutation::upsert("product", format!("p{}", i), vec![]))
            .collect();
        let wal = IsolatedWal::from_mutations(&mutations).unwrap();
        let version = coordinator.next_catalog_version_to_assign();
        let header = header_for(version, &wal);
        coordinator.wal().append(&header, wal.as_bytes()).unwrap();
        coordinator.update_last_written_catalog_version(version).unwrap();

        let versions = CommitVersions::new(version, 0);
        let progress = Arc::new(CommitProgress::new(header.transaction_id));
        progress.complete(Milestone::ConflictResolved, versions).unwrap();
        progress.complete(Milestone::WalPersisted, versions).unwrap();
        TrunkIncorporationTask::new(
            "shop".to_string(),
            header.transaction_id,
            versions,
            header.mutation_count,
            header.wal_size_bytes,
            header.commit_timestamp,
            progress,
        )
    }

    #[tokio::test]
    async fn test_one_pass_absorbs_every_persisted_transaction() {
        let coordinator = memory_coordinator(0);
        let (down_tx, mut down_rx) = mpsc::channel(4);
        let mut stage = TrunkIncorporationStage::new(Arc::clone(&coordinator), down_tx);

        let a = persisted(&coordinator, 3);
        let b = persisted(&coordinator, 1);
        stage.handle_next(a).await.unwrap();

        let updated = down_rx.recv().await.unwrap();
        assert_eq!(updated.catalog().version(), 2);
        assert_eq!(updated.absorbed_transactions(), 2);
        assert_eq!(updated.commit_times().len(), 2);
        assert_eq!(updated.catalog_version().unwrap(), 1);
        assert_eq!(coordinator.last_finalized_catalog_version(), 2);

        let snapshot = coordinator.metrics().snapshot();
        assert_eq!(snapshot.trunk_passes, 1);
        assert_eq!(snapshot.transactions_incorporated, 2);
        assert_eq!(snapshot.atomic_mutations, 6);

        // B was absorbed already; it only waits for the live view.
        coordinator
            .propagate_catalog_snapshot(Arc::clone(updated.catalog()))
            .unwrap();
        let b_progress = Arc::clone(b.progress());
        stage.handle_next(b).await.unwrap();
        assert_eq!(b_progress.on_changes_visible().await.unwrap().catalog_version, 2);
        assert!(down_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_absorbed_transaction_times_out_without_visibility() {
        let coordinator = memory_coordinator(0);
        let (down_tx, _down_rx) = mpsc::channel(4);
        let mut stage = TrunkIncorporationStage::new(Arc::clone(&coordinator), down_tx);

        let a = persisted(&coordinator, 1);
        let b = persisted(&coordinator, 1);
        stage.handle_next(a).await.unwrap();

        let err = stage.handle_next(b).await.unwrap_err();
        assert!(matches!(err, CommitError::PremiseViolation(_)));
    }

    #[tokio::test]
    async fn test_nothing_available_forwards_last_finalized_catalog() {
        let coordinator = memory_coordinator(5);
        let (down_tx, mut down_rx) = mpsc::channel(4);
        let mut stage = TrunkIncorporationStage::new(Arc::clone(&coordinator), down_tx);

        // Version 6 is assigned but its frame never reached the WAL.
        let version = coordinator.next_catalog_version_to_assign();
        let versions = CommitVersions::new(version, 0);
        let id = Uuid::new_v4();
        let progress = Arc::new(CommitProgress::new(id));
        progress.complete(Milestone::ConflictResolved, versions).unwrap();
        progress.complete(Milestone::WalPersisted, versions).unwrap();
        let task = TrunkIncorporationTask::new(
            "shop".to_string(),
            id,
            versions,
            0,
            0,
            Utc::now(),
            Arc::clone(&progress),
        );

        stage.handle_next(task).await.unwrap();
        let updated = down_rx.recv().await.unwrap();
        assert_eq!(updated.catalog().version(), 5);
        assert_eq!(updated.absorbed_transactions(), 0);
        assert!(updated.commit_times().is_empty());
        assert!(matches!(
            progress.outcome(Milestone::TrunkIncorporated),
            Some(Ok(_))
        ));
    }

    #[tokio::test]
    async fn test_full_propagation_queue_warns_about_lost_data() {
        let coordinator = memory_coordinator(0);
        let (down_tx, _down_rx) = mpsc::channel(1);
        let mut stage = TrunkIncorporationStage::new(Arc::clone(&coordinator), down_tx);

        stage.handle_next(persisted(&coordinator, 1)).await.unwrap();
        let err = stage
            .handle_next(persisted(&coordinator, 1))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CommitError::Rejected {
                stage: "catalog snapshot propagation",
                data_may_be_lost: true
            }
        );
    }
}
