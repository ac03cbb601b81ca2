//! Transaction tasks
//!
//! Each stage consumes one task type and produces the next. Tasks are moved
//! from stage to stage; a stage never edits a task it received, it builds
//! the next one from it. The catalog name and transaction id are carried
//! unchanged from the first task to the last.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::errors::{CommitError, CommitResult};
use super::progress::{CommitProgress, CommitVersions};
use crate::catalog::Catalog;
use crate::observability::QueuedEvent;
use crate::wal::IsolatedWal;

pub(crate) const CONFLICT_RESOLUTION: &str = "conflict resolution";
pub(crate) const WAL_APPENDING: &str = "WAL appending";
pub(crate) const TRUNK_INCORPORATION: &str = "trunk incorporation";
pub(crate) const SNAPSHOT_PROPAGATION: &str = "catalog snapshot propagation";

mod sealed {
    pub trait Sealed {}
}

/// What a stage needs to fail a task after the task itself was consumed
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub catalog_name: String,
    pub transaction_id: Uuid,
    pub catalog_version: Option<u64>,
    pub progress: Arc<CommitProgress>,
}

/// Common surface of the four task types
pub trait TransactionTask: sealed::Sealed + Send + 'static {
    /// Stage that consumes this task
    const STAGE: &'static str;

    /// Whether a refused hand-off of this task can be retried safely.
    ///
    /// False once the transaction is durable in the shared WAL.
    const REPEATABLE: bool;

    fn catalog_name(&self) -> &str;

    fn transaction_id(&self) -> Uuid;

    /// Assigned catalog version
    fn catalog_version(&self) -> CommitResult<u64>;

    fn progress(&self) -> &Arc<CommitProgress>;

    fn event(&self) -> &QueuedEvent;

    fn context(&self) -> TaskContext {
        TaskContext {
            catalog_name: self.catalog_name().to_string(),
            transaction_id: self.transaction_id(),
            catalog_version: self.catalog_version().ok(),
            progress: Arc::clone(self.progress()),
        }
    }
}

/// A freshly committed transaction, not yet versioned
#[derive(Debug)]
pub struct ConflictResolutionTask {
    pub(crate) catalog_name: String,
    pub(crate) transaction_id: Uuid,
    pub(crate) wal: IsolatedWal,
    pub(crate) progress: Arc<CommitProgress>,
    pub(crate) event: QueuedEvent,
}

impl ConflictResolutionTask {
    pub fn new(
        catalog_name: impl Into<String>,
        transaction_id: Uuid,
        wal: IsolatedWal,
        progress: Arc<CommitProgress>,
    ) -> Self {
        let catalog_name = catalog_name.into();
        Self {
            event: QueuedEvent::new(catalog_name.clone(), CONFLICT_RESOLUTION),
            catalog_name,
            transaction_id,
            wal,
            progress,
        }
    }

    pub fn mutation_count(&self) -> u64 {
        self.wal.mutation_count()
    }

    pub fn wal_size_bytes(&self) -> u64 {
        self.wal.size_bytes()
    }

    pub fn schema_delta(&self) -> u64 {
        self.wal.schema_delta()
    }

    /// Pending mutations of the transaction
    pub fn wal(&self) -> &IsolatedWal {
        &self.wal
    }

    pub(crate) fn into_wal_appending(self, versions: CommitVersions) -> WalAppendingTask {
        WalAppendingTask {
            event: QueuedEvent::new(self.catalog_name.clone(), WAL_APPENDING),
            catalog_name: self.catalog_name,
            transaction_id: self.transaction_id,
            versions,
            wal: self.wal,
            progress: self.progress,
        }
    }
}

/// A versioned transaction waiting for its WAL append
#[derive(Debug)]
pub struct WalAppendingTask {
    pub(crate) catalog_name: String,
    pub(crate) transaction_id: Uuid,
    pub(crate) versions: CommitVersions,
    pub(crate) wal: IsolatedWal,
    pub(crate) progress: Arc<CommitProgress>,
    pub(crate) event: QueuedEvent,
}

impl WalAppendingTask {
    pub fn versions(&self) -> CommitVersions {
        self.versions
    }

    pub fn mutation_count(&self) -> u64 {
        self.wal.mutation_count()
    }

    pub fn wal_size_bytes(&self) -> u64 {
        self.wal.size_bytes()
    }

    pub fn schema_delta(&self) -> u64 {
        self.wal.schema_delta()
    }
}

/// A WAL-persisted transaction ready to be merged into the trunk
#[derive(Debug)]
pub struct TrunkIncorporationTask {
    pub(crate) catalog_name: String,
    pub(crate) transaction_id: Uuid,
    pub(crate) versions: CommitVersions,
    pub(crate) mutation_count: u64,
    pub(crate) wal_size_bytes: u64,
    pub(crate) commit_timestamp: DateTime<Utc>,
    pub(crate) progress: Arc<CommitProgress>,
    pub(crate) event: QueuedEvent,
}

impl TrunkIncorporationTask {
    pub(crate) fn new(
        catalog_name: String,
        transaction_id: Uuid,
        versions: CommitVersions,
        mutation_count: u64,
        wal_size_bytes: u64,
        commit_timestamp: DateTime<Utc>,
        progress: Arc<CommitProgress>,
    ) -> Self {
        Self {
            event: QueuedEvent::new(catalog_name.clone(), TRUNK_INCORPORATION),
            catalog_name,
            transaction_id,
            versions,
            mutation_count,
            wal_size_bytes,
            commit_timestamp,
            progress,
        }
    }

    pub fn versions(&self) -> CommitVersions {
        self.versions
    }

    pub fn commit_timestamp(&self) -> DateTime<Utc> {
        self.commit_timestamp
    }

    /// Build the propagation task carrying `catalog`.
    pub(crate) fn into_updated_catalog(
        self,
        catalog: Arc<Catalog>,
        absorbed_transactions: u64,
        commit_times: Vec<DateTime<Utc>>,
    ) -> UpdatedCatalogTask {
        UpdatedCatalogTask {
            event: QueuedEvent::new(self.catalog_name.clone(), SNAPSHOT_PROPAGATION),
            catalog_name: self.catalog_name,
            transaction_id: self.transaction_id,
            versions: self.versions,
            catalog,
            absorbed_transactions,
            commit_times,
            progress: self.progress,
        }
    }
}

/// A new catalog snapshot waiting to become live
#[derive(Debug)]
pub struct UpdatedCatalogTask {
    pub(crate) catalog_name: String,
    pub(crate) transaction_id: Uuid,
    /// Versions of the transaction that triggered the trunk pass
    pub(crate) versions: CommitVersions,
    pub(crate) catalog: Arc<Catalog>,
    pub(crate) absorbed_transactions: u64,
    /// Commit times of every transaction absorbed into `catalog`
    pub(crate) commit_times: Vec<DateTime<Utc>>,
    pub(crate) progress: Arc<CommitProgress>,
    pub(crate) event: QueuedEvent,
}

impl UpdatedCatalogTask {
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn absorbed_transactions(&self) -> u64 {
        self.absorbed_transactions
    }

    pub fn commit_times(&self) -> &[DateTime<Utc>] {
        &self.commit_times
    }
}

impl sealed::Sealed for ConflictResolutionTask {}
impl sealed::Sealed for WalAppendingTask {}
impl sealed::Sealed for TrunkIncorporationTask {}
impl sealed::Sealed for UpdatedCatalogTask {}

impl TransactionTask for ConflictResolutionTask {
    const STAGE: &'static str = CONFLICT_RESOLUTION;
    const REPEATABLE: bool = true;

    fn catalog_name(&self) -> &str {
        &self.catalog_name
    }

    fn transaction_id(&self) -> Uuid {
        self.transaction_id
    }

    fn catalog_version(&self) -> CommitResult<u64> {
        Err(CommitError::premise(format!(
            "Transaction {} has no catalog version before conflict resolution",
            self.transaction_id
        )))
    }

    fn progress(&self) -> &Arc<CommitProgress> {
        &self.progress
    }

    fn event(&self) -> &QueuedEvent {
        &self.event
    }
}

impl TransactionTask for WalAppendingTask {
    const STAGE: &'static str = WAL_APPENDING;
    const REPEATABLE: bool = true;

    fn catalog_name(&self) -> &str {
        &self.catalog_name
    }

    fn transaction_id(&self) -> Uuid {
        self.transaction_id
    }

    fn catalog_version(&self) -> CommitResult<u64> {
        Ok(self.versions.catalog_version)
    }

    fn progress(&self) -> &Arc<CommitProgress> {
        &self.progress
    }

    fn event(&self) -> &QueuedEvent {
        &self.event
    }
}

impl TransactionTask for TrunkIncorporationTask {
    const STAGE: &'static str = TRUNK_INCORPORATION;
    const REPEATABLE: bool = false;

    fn catalog_name(&self) -> &str {
        &self.catalog_name
    }

    fn transaction_id(&self) -> Uuid {
        self.transaction_id
    }

    fn catalog_version(&self) -> CommitResult<u64> {
        Ok(self.versions.catalog_version)
    }

    fn progress(&self) -> &Arc<CommitProgress> {
        &self.progress
    }

    fn event(&self) -> &QueuedEvent {
        &self.event
    }
}

impl TransactionTask for UpdatedCatalogTask {
    const STAGE: &'static str = SNAPSHOT_PROPAGATION;
    const REPEATABLE: bool = false;

    fn catalog_name(&self) -> &str {
        &self.catalog_name
    }

    fn transaction_id(&self) -> Uuid {
        self.transaction_id
    }

    fn catalog_version(&self) -> CommitResult<u64> {
        Ok(self.versions.catalog_version)
    }

    fn progress(&self) -> &Arc<CommitProgress> {
        &self.progress
    }

    fn event(&self) -> &QueuedEvent {
        &self.event
    }
}
