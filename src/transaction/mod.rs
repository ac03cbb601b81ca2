//! Transaction commit pipeline
//!
//! Moves a committed transaction through four single-writer stages:
//! conflict resolution assigns its catalog version, WAL appending makes it
//! durable, trunk incorporation merges it into a new catalog snapshot and
//! snapshot propagation makes that snapshot live.
//!
//! Callers follow a transaction through its `CommitProgress`, which resolves
//! four ordered milestones. Any failure resolves every pending milestone
//! with the same error.
//!
//! # Usage
//!
//! ```ignore
//! use aerocommit::catalog::{Catalog, Mutation};
//! use aerocommit::transaction::{CommitBehavior, TransactionConfig, TransactionManager};
//! use aerocommit::wal::{IsolatedWal, MemoryCatalogWal};
//!
//! let manager = TransactionManager::open(
//!     Catalog::new("shop"),
//!     Arc::new(MemoryCatalogWal::new()),
//!     TransactionConfig::default(),
//! )
//! .await?;
//!
//! let wal = IsolatedWal::from_mutations(&[Mutation::create_collection("product")])?;
//! let versions = manager
//!     .commit_and_wait(wal, CommitBehavior::WaitForChangesVisible)
//!     .await?;
//! ```

mod config;
mod conflict;
mod coordinator;
mod errors;
mod manager;
mod progress;
pub mod stage;
mod task;

pub use config::{ConfigError, ConfigErrorCode, TransactionConfig};
pub use conflict::{ConflictDetector, NoConflictDetector};
pub use coordinator::{CatalogCoordinator, ProcessResult};
pub use errors::{CommitError, CommitResult, ErrorSeverity, OpenError};
pub use manager::TransactionManager;
pub use progress::{CommitBehavior, CommitProgress, CommitVersions, Milestone, Resolution};
pub use task::{
    ConflictResolutionTask, TaskContext, TransactionTask, TrunkIncorporationTask,
    UpdatedCatalogTask, WalAppendingTask,
};
