//! Conflict detection seam
//!
//! The pipeline only reacts to the verdict; how conflicts are computed is up
//! to the detector plugged into the coordinator.

use super::errors::CommitResult;
use super::task::ConflictResolutionTask;
use crate::catalog::Catalog;

/// Decides whether a committing transaction collides with accepted ones.
pub trait ConflictDetector: Send + Sync {
    /// `Err(CommitError::Conflict(..))` rejects the transaction.
    fn identify_conflicts(&self, live: &Catalog, task: &ConflictResolutionTask) -> CommitResult<()>;
}

/// Accepts every transaction
#[derive(Debug, Default, Clone, Copy)]
pub struct NoConflictDetector;

impl ConflictDetector for NoConflictDetector {
    fn identify_conflicts(&self, _live: &Catalog, _task: &ConflictResolutionTask) -> CommitResult<()> {
        Ok(())
    }
}

impl<F> ConflictDetector for F
where
    F: Fn(&Catalog, &ConflictResolutionTask) -> CommitResult<()> + Send + Sync,
{
    fn identify_conflicts(&self, live: &Catalog, task: &ConflictResolutionTask) -> CommitResult<()> {
        self(live, task)
    }
}
