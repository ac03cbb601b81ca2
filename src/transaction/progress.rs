//! Per-transaction commit progress
//!
//! A transaction passes four ordered milestones. Each milestone has one
//! result slot that is set exactly once, with the assigned versions or with
//! the error that failed the transaction. A slot may only be set after every
//! earlier slot succeeded; a failure fills every slot still empty, so a
//! caller waiting on any milestone always gets an answer.

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use super::errors::{CommitError, CommitResult};

/// Ordered completion points of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Milestone {
    /// Catalog version assigned, no conflict found
    ConflictResolved = 0,
    /// Durably appended to the shared WAL
    WalPersisted = 1,
    /// Merged into a new catalog snapshot (internal)
    TrunkIncorporated = 2,
    /// Snapshot holding the transaction is live
    ChangesVisible = 3,
}

impl Milestone {
    pub const ALL: [Milestone; 4] = [
        Milestone::ConflictResolved,
        Milestone::WalPersisted,
        Milestone::TrunkIncorporated,
        Milestone::ChangesVisible,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Milestone::ConflictResolved => "CONFLICT_RESOLVED",
            Milestone::WalPersisted => "WAL_PERSISTED",
            Milestone::TrunkIncorporated => "TRUNK_INCORPORATED",
            Milestone::ChangesVisible => "CHANGES_VISIBLE",
        }
    }
}

impl fmt::Display for Milestone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Versions assigned to a committed transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitVersions {
    pub catalog_version: u64,
    pub catalog_schema_version: u64,
}

impl CommitVersions {
    pub fn new(catalog_version: u64, catalog_schema_version: u64) -> Self {
        Self {
            catalog_version,
            catalog_schema_version,
        }
    }
}

/// Which milestone a committing caller waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitBehavior {
    /// Return once the version is assigned
    WaitForConflictResolution,
    /// Return once the transaction is in the WAL
    WaitForWalPersistence,
    /// Return once the changes are readable
    #[default]
    WaitForChangesVisible,
}

impl CommitBehavior {
    pub fn milestone(&self) -> Milestone {
        match self {
            CommitBehavior::WaitForConflictResolution => Milestone::ConflictResolved,
            CommitBehavior::WaitForWalPersistence => Milestone::WalPersisted,
            CommitBehavior::WaitForChangesVisible => Milestone::ChangesVisible,
        }
    }
}

/// Outcome of one milestone
#[derive(Debug, Clone)]
pub struct Resolution {
    pub outcome: CommitResult<CommitVersions>,
    pub resolved_at: Instant,
}

type Slot = watch::Sender<Option<Resolution>>;

/// Commit progress handle shared between the pipeline and the caller
#[derive(Debug)]
pub struct CommitProgress {
    transaction_id: Uuid,
    slots: [Slot; 4],
    /// Serializes completions so the ordering check and the write are atomic
    guard: Mutex<()>,
}

impl CommitProgress {
    pub fn new(transaction_id: Uuid) -> Self {
        Self {
            transaction_id,
            slots: std::array::from_fn(|_| watch::channel(None).0),
            guard: Mutex::new(()),
        }
    }

    pub fn transaction_id(&self) -> Uuid {
        self.transaction_id
    }

    /// Resolve `milestone` successfully.
    ///
    /// Returns `Ok(true)` when the slot was set, `Ok(false)` when it already
    /// held a success (repeated completion is harmless). Fails when an
    /// earlier milestone is not yet resolved or any milestone up to this one
    /// has failed.
    pub fn complete(&self, milestone: Milestone, versions: CommitVersions) -> CommitResult<bool> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);

        for earlier in &Milestone::ALL[..milestone.index()] {
            match &*self.slots[earlier.index()].borrow() {
                None => {
                    return Err(CommitError::premise(format!(
                        "{} completed before {} of transaction {}",
                        milestone, earlier, self.transaction_id
                    )))
                }
                Some(Resolution { outcome: Err(e), .. }) => return Err(e.clone()),
                Some(_) => {}
            }
        }

        let slot = &self.slots[milestone.index()];
        let current = slot.borrow().as_ref().map(|r| r.outcome.clone());
        match current {
            Some(Ok(_)) => Ok(false),
            Some(Err(e)) => Err(e),
            None => {
                slot.send_replace(Some(Resolution {
                    outcome: Ok(versions),
                    resolved_at: Instant::now(),
                }));
                Ok(true)
            }
        }
    }

    /// Fail every milestone that is not resolved yet.
    ///
    /// Returns false when all milestones were already resolved.
    pub fn complete_exceptionally(&self, err: CommitError) -> bool {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let mut changed = false;
        for slot in &self.slots {
            if slot.borrow().is_none() {
                slot.send_replace(Some(Resolution {
                    outcome: Err(err.clone()),
                    resolved_at: now,
                }));
                changed = true;
            }
        }
        changed
    }

    /// Outcome of a milestone if it is resolved
    pub fn outcome(&self, milestone: Milestone) -> Option<CommitResult<CommitVersions>> {
        self.slots[milestone.index()]
            .borrow()
            .as_ref()
            .map(|r| r.outcome.clone())
    }

    /// When a milestone was resolved
    pub fn resolved_at(&self, milestone: Milestone) -> Option<Instant> {
        self.slots[milestone.index()]
            .borrow()
            .as_ref()
            .map(|r| r.resolved_at)
    }

    /// Whether the transaction reached a terminal state
    pub fn is_done(&self) -> bool {
        self.slots[Milestone::ChangesVisible.index()].borrow().is_some()
    }

    /// Wait until `milestone` resolves.
    pub async fn wait(&self, milestone: Milestone) -> CommitResult<CommitVersions> {
        let mut receiver = self.slots[milestone.index()].subscribe();
        let resolved = receiver
            .wait_for(Option::is_some)
            .await
            .map_err(|_| CommitError::PipelineClosed)?;
        match &*resolved {
            Some(resolution) => resolution.outcome.clone(),
            None => Err(CommitError::PipelineClosed),
        }
    }

    /// Wait for the milestone a commit behavior asks for.
    pub async fn on_completion(&self, behavior: CommitBehavior) -> CommitResult<CommitVersions> {
        self.wait(behavior.milestone()).await
    }

    pub async fn on_conflict_resolved(&self) -> CommitResult<CommitVersions> {
        self.wait(Milestone::ConflictResolved).await
    }

    pub async fn on_wal_persisted(&self) -> CommitResult<CommitVersions> {
        self.wait(Milestone::WalPersisted).await
    }

    pub async fn on_changes_visible(&self) -> CommitResult<CommitVersions> {
        self.wait(Milestone::ChangesVisible).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn versions() -> CommitVersions {
        CommitVersions::new(5, 1)
    }

    #[test]
    fn test_milestones_complete_in_order() {
        let progress = CommitProgress::new(Uuid::new_v4());
        for milestone in Milestone::ALL {
            assert!(progress.complete(milestone, versions()).unwrap());
        }
        assert!(progress.is_done());

        let times: Vec<_> = Milestone::ALL
            .iter()
            .map(|m| progress.resolved_at(*m).unwrap())
            .collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_out_of_order_completion_is_refused() {
        let progress = CommitProgress::new(Uuid::new_v4());
        let err = progress
            .complete(Milestone::WalPersisted, versions())
            .unwrap_err();
        assert!(matches!(err, CommitError::PremiseViolation(_)));
        assert!(progress.outcome(Milestone::WalPersisted).is_none());
    }

    #[test]
    fn test_repeated_completion_is_idempotent() {
        let progress = CommitProgress::new(Uuid::new_v4());
        assert!(progress.complete(Milestone::ConflictResolved, versions()).unwrap());
        assert!(!progress.complete(Milestone::ConflictResolved, versions()).unwrap());
    }

    #[test]
    fn test_failure_fills_remaining_slots() {
        let progress = CommitProgress::new(Uuid::new_v4());
        progress.complete(Milestone::ConflictResolved, versions()).unwrap();

        assert!(progress.complete_exceptionally(CommitError::Wal("disk".into())));
        assert_eq!(
            progress.outcome(Milestone::ConflictResolved),
            Some(Ok(versions()))
        );
        for milestone in &Milestone::ALL[1..] {
            assert_eq!(
                progress.outcome(*milestone),
                Some(Err(CommitError::Wal("disk".into())))
            );
        }

        let again = progress.complete(Milestone::WalPersisted, versions());
        assert_eq!(again, Err(CommitError::Wal("disk".into())));
        assert!(!progress.complete_exceptionally(CommitError::PipelineClosed));
    }

    #[test]
    fn test_commit_behavior_maps_to_milestone() {
        assert_eq!(CommitBehavior::default(), CommitBehavior::WaitForChangesVisible);
        assert_eq!(
            CommitBehavior::WaitForConflictResolution.milestone(),
            Milestone::ConflictResolved
        );
        assert_eq!(
            CommitBehavior::WaitForWalPersistence.milestone(),
            Milestone::WalPersisted
        );
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_completion() {
        let progress = Arc::new(CommitProgress::new(Uuid::new_v4()));
        let waiter = {
            let progress = Arc::clone(&progress);
            tokio::spawn(async move { progress.on_wal_persisted().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        progress.complete(Milestone::ConflictResolved, versions()).unwrap();
        progress.complete(Milestone::WalPersisted, versions()).unwrap();

        assert_eq!(waiter.await.unwrap(), Ok(versions()));
    }

    #[tokio::test]
    async fn test_waiter_receives_failure() {
        let progress = Arc::new(CommitProgress::new(Uuid::new_v4()));
        progress.complete_exceptionally(CommitError::Conflict("duplicate key".into()));
        assert_eq!(
            progress.on_changes_visible().await,
            Err(CommitError::Conflict("duplicate key".into()))
        );
    }
}
