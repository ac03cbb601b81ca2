//! Transaction manager
//!
//! Front door of a catalog's commit pipeline. Owns the coordinator and the
//! four stage workers, hands committed transactions to the first stage and
//! gives callers a `CommitProgress` to wait on.
//!
//! # Lifecycle
//!
//! ```text
//! open -> commit* -> close
//!           |
//!           +-- pipeline failed -> recreate_pipeline -> commit* ...
//! ```
//!
//! A failed pipeline is never restarted implicitly.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::config::TransactionConfig;
use super::conflict::{ConflictDetector, NoConflictDetector};
use super::coordinator::CatalogCoordinator;
use super::errors::{CommitError, CommitResult, OpenError};
use super::progress::{CommitBehavior, CommitProgress, CommitVersions};
use super::stage::{
    fail_task, push, spawn_stage, ConflictResolutionStage, SnapshotPropagationStage,
    TrunkIncorporationStage, WalAppendingStage,
};
use super::task::{ConflictResolutionTask, TransactionTask, CONFLICT_RESOLUTION};
use crate::catalog::Catalog;
use crate::observability::{log_event_with_fields, Event, Logger, MetricsRegistry};
use crate::wal::{CatalogWal, FileCatalogWal, IsolatedWal};

/// Running stage workers and the entry queue feeding them
struct Pipeline {
    entry: mpsc::Sender<ConflictResolutionTask>,
    workers: Vec<JoinHandle<()>>,
}

impl Pipeline {
    fn spawn(coordinator: &Arc<CatalogCoordinator>) -> Self {
        let capacity = coordinator.config().queue_size;
        let (propagation_tx, propagation_rx) = mpsc::channel(capacity);
        let (trunk_tx, trunk_rx) = mpsc::channel(capacity);
        let (wal_tx, wal_rx) = mpsc::channel(capacity);
        let (entry, conflict_rx) = mpsc::channel(capacity);

        let workers = vec![
            spawn_stage(
                ConflictResolutionStage::new(Arc::clone(coordinator), wal_tx),
                conflict_rx,
            ),
            spawn_stage(
                WalAppendingStage::new(Arc::clone(coordinator), trunk_tx),
                wal_rx,
            ),
            spawn_stage(
                TrunkIncorporationStage::new(Arc::clone(coordinator), propagation_tx),
                trunk_rx,
            ),
            spawn_stage(
                SnapshotPropagationStage::new(Arc::clone(coordinator)),
                propagation_rx,
            ),
        ];

        Self { entry, workers }
    }

    fn is_alive(&self) -> bool {
        !self.entry.is_closed() && self.workers.iter().all(|w| !w.is_finished())
    }

    /// Close the entry queue and wait for every stage to drain.
    async fn shutdown(self, catalog: &str) {
        drop(self.entry);
        for worker in self.workers {
            if let Err(e) = worker.await {
                let reason = e.to_string();
                Logger::error(
                    Event::PipelineFailed.as_str(),
                    &[("catalog", catalog), ("reason", &reason)],
                );
            }
        }
    }
}

/// Commit pipeline of one open catalog
pub struct TransactionManager {
    coordinator: Arc<CatalogCoordinator>,
    pipeline: Mutex<Option<Pipeline>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("coordinator", &self.coordinator)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl TransactionManager {
    /// Open `catalog` on `wal` with a detector that accepts every transaction.
    pub async fn open(
        catalog: Catalog,
        wal: Arc<dyn CatalogWal>,
        config: TransactionConfig,
    ) -> Result<Self, OpenError> {
        Self::open_with_detector(catalog, wal, Arc::new(NoConflictDetector), config).await
    }

    /// Open `catalog` on `wal` and start its pipeline.
    ///
    /// WAL transactions newer than `catalog` are replayed first.
    pub async fn open_with_detector(
        catalog: Catalog,
        wal: Arc<dyn CatalogWal>,
        conflict_detector: Arc<dyn ConflictDetector>,
        config: TransactionConfig,
    ) -> Result<Self, OpenError> {
        let coordinator = Arc::new(CatalogCoordinator::open(
            catalog,
            wal,
            conflict_detector,
            config,
            Arc::new(MetricsRegistry::new()),
        )?);
        let pipeline = Pipeline::spawn(&coordinator);

        Ok(Self {
            coordinator,
            pipeline: Mutex::new(Some(pipeline)),
            closed: AtomicBool::new(false),
        })
    }

    /// Open `catalog` with a file WAL kept in `dir`.
    pub async fn open_file(
        dir: impl AsRef<Path>,
        catalog: Catalog,
        config: TransactionConfig,
    ) -> Result<Self, OpenError> {
        config.validate()?;
        let wal = FileCatalogWal::open(dir, config.max_wal_file_size_bytes)?;
        Self::open(catalog, Arc::new(wal), config).await
    }

    /// Submit a transaction's pending mutations.
    ///
    /// Never blocks. A full entry queue or a closed pipeline fails the
    /// returned progress right away.
    pub fn commit(&self, wal: IsolatedWal) -> Arc<CommitProgress> {
        let transaction_id = Uuid::new_v4();
        let progress = Arc::new(CommitProgress::new(transaction_id));
        let metrics = self.coordinator.metrics();
        metrics.increment_submitted();

        let id = transaction_id.to_string();
        let mutations = wal.mutation_count().to_string();
        log_event_with_fields(
            Event::TransactionSubmitted,
            &[
                ("catalog", self.coordinator.name()),
                ("mutations", &mutations),
                ("transaction_id", &id),
            ],
        );

        let task = ConflictResolutionTask::new(
            self.coordinator.name(),
            transaction_id,
            wal,
            Arc::clone(&progress),
        );
        let context = task.context();

        let handed_off = if self.closed.load(Ordering::SeqCst) {
            Err(CommitError::PipelineClosed)
        } else {
            let pipeline = self.pipeline.lock().unwrap_or_else(PoisonError::into_inner);
            match pipeline.as_ref() {
                Some(pipeline) => push(task, &pipeline.entry, metrics),
                None => Err(CommitError::PipelineClosed),
            }
        };
        if let Err(err) = handed_off {
            fail_task(&self.coordinator, CONFLICT_RESOLUTION, &context, err);
        }

        progress
    }

    /// Submit a transaction and wait for the milestone `behavior` asks for.
    pub async fn commit_and_wait(
        &self,
        wal: IsolatedWal,
        behavior: CommitBehavior,
    ) -> CommitResult<CommitVersions> {
        self.commit(wal).on_completion(behavior).await
    }

    pub fn name(&self) -> &str {
        self.coordinator.name()
    }

    /// Current live catalog snapshot
    pub fn live_catalog(&self) -> Arc<Catalog> {
        self.coordinator.live_catalog()
    }

    /// Receiver observing every swap of the live catalog
    pub fn subscribe(&self) -> watch::Receiver<Arc<Catalog>> {
        self.coordinator.subscribe()
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        self.coordinator.metrics()
    }

    pub fn coordinator(&self) -> &Arc<CatalogCoordinator> {
        &self.coordinator
    }

    /// Whether every stage worker is still running
    pub fn is_pipeline_alive(&self) -> bool {
        self.pipeline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(Pipeline::is_alive)
    }

    /// Replace the pipeline with a fresh one.
    ///
    /// The old pipeline is drained first. Versions that were assigned but
    /// never reached the WAL are released; transactions already in the WAL
    /// are picked up by the next trunk incorporation pass.
    pub async fn recreate_pipeline(&self) -> CommitResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CommitError::PipelineClosed);
        }

        let old = self
            .pipeline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(old) = old {
            old.shutdown(self.coordinator.name()).await;
        }

        let released = self.coordinator.release_unwritten_versions()?;
        let pipeline = Pipeline::spawn(&self.coordinator);
        *self.pipeline.lock().unwrap_or_else(PoisonError::into_inner) = Some(pipeline);

        let released = released.to_string();
        let version = self.coordinator.last_written_catalog_version().to_string();
        log_event_with_fields(
            Event::PipelineRecreated,
            &[
                ("catalog", self.coordinator.name()),
                ("last_written", &version),
                ("released_versions", &released),
            ],
        );
        Ok(())
    }

    /// Stop accepting commits and wait for queued transactions to finish.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let pipeline = self
            .pipeline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pipeline) = pipeline {
            pipeline.shutdown(self.coordinator.name()).await;
        }

        let version = self.coordinator.live_version().to_string();
        log_event_with_fields(
            Event::CatalogClosed,
            &[("catalog", self.coordinator.name()), ("catalog_version", &version)],
        );
    }
}
