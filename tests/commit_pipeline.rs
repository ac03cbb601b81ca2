//! Commit Pipeline Tests
//!
//! End-to-end behavior of the four-stage pipeline through the public API:
//! - Versions are contiguous and follow acceptance order
//! - Milestones resolve in order for every transaction
//! - Greedy trunk incorporation makes every accepted transaction visible
//! - Conflicts fail only the offending transaction
//! - A failed WAL append or a panicking detector never wedges the catalog

use std::collections::BTreeSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aerocommit::catalog::{AttributeChange, Catalog, Mutation};
use aerocommit::transaction::{
    CommitBehavior, CommitError, ConflictResolutionTask, Milestone, TransactionConfig,
    TransactionManager,
};
use aerocommit::wal::{
    decode_mutations, CatalogWal, IsolatedWal, MemoryCatalogWal, TransactionHeader, WalError,
    WalResult, WalTransaction,
};

// =============================================================================
// Test Utilities
// =============================================================================

fn transaction(mutations: &[Mutation]) -> IsolatedWal {
    IsolatedWal::from_mutations(mutations).expect("mutations encode")
}

fn upserts(keys: &[&str]) -> IsolatedWal {
    let mutations: Vec<Mutation> = keys
        .iter()
        .map(|key| Mutation::upsert("product", *key, vec![AttributeChange::set("stock", 1)]))
        .collect();
    transaction(&mutations)
}

async fn open_at(version: u64) -> (TransactionManager, Arc<MemoryCatalogWal>) {
    let wal = Arc::new(MemoryCatalogWal::new());
    let manager = TransactionManager::open(
        Catalog::new("shop").with_versions(version, 0),
        wal.clone(),
        TransactionConfig::default(),
    )
    .await
    .expect("catalog opens");
    (manager, wal)
}

// =============================================================================
// Version assignment
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_commits_get_contiguous_versions() {
    let (manager, _wal) = open_at(100).await;
    let manager = Arc::new(manager);

    let mut handles = Vec::new();
    for writer in 0..5 {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            let mut versions = Vec::new();
            for i in 0..10 {
                let key = format!("w{}-{}", writer, i);
                let committed = manager
                    .commit_and_wait(upserts(&[&key]), CommitBehavior::WaitForChangesVisible)
                    .await
                    .expect("commit succeeds");
                versions.push(committed.catalog_version);
            }
            versions
        }));
    }

    let mut assigned = BTreeSet::new();
    for handle in handles {
        for version in handle.await.expect("writer finished") {
            assert!(assigned.insert(version), "version {} assigned twice", version);
        }
    }

    let expected: BTreeSet<u64> = (101..=150).collect();
    assert_eq!(assigned, expected);
    assert_eq!(manager.live_catalog().version(), 150);
    assert_eq!(manager.live_catalog().entity_count(), 50);
    manager.close().await;
}

#[tokio::test]
async fn test_versions_follow_submission_order() {
    let (manager, wal) = open_at(0).await;

    let progresses: Vec<_> = (0..20)
        .map(|i| manager.commit(upserts(&[format!("p{}", i).as_str()])))
        .collect();

    for (i, progress) in progresses.iter().enumerate() {
        let versions = progress.on_changes_visible().await.expect("visible");
        assert_eq!(versions.catalog_version, i as u64 + 1);
    }

    // The WAL holds the versions in order with the matching transaction ids.
    for (i, progress) in progresses.iter().enumerate() {
        let stored = wal
            .read_transaction(i as u64 + 1)
            .expect("WAL readable")
            .expect("transaction present");
        assert_eq!(stored.header.transaction_id, progress.transaction_id());
    }
    manager.close().await;
}

// =============================================================================
// Milestones
// =============================================================================

#[tokio::test]
async fn test_milestones_resolve_in_order() {
    let (manager, _wal) = open_at(0).await;
    let progress = manager.commit(upserts(&["chair"]));
    progress.on_changes_visible().await.expect("visible");

    let conflict = progress
        .resolved_at(Milestone::ConflictResolved)
        .expect("conflict resolved");
    let persisted = progress
        .resolved_at(Milestone::WalPersisted)
        .expect("WAL persisted");
    let incorporated = progress
        .resolved_at(Milestone::TrunkIncorporated)
        .expect("trunk incorporated");
    let visible = progress
        .resolved_at(Milestone::ChangesVisible)
        .expect("changes visible");

    assert!(conflict <= persisted);
    assert!(persisted <= incorporated);
    assert!(incorporated <= visible);
    manager.close().await;
}

#[tokio::test]
async fn test_every_behavior_reports_the_same_versions() {
    let (manager, _wal) = open_at(9).await;

    for behavior in [
        CommitBehavior::WaitForConflictResolution,
        CommitBehavior::WaitForWalPersistence,
        CommitBehavior::WaitForChangesVisible,
    ] {
        let progress = manager.commit(upserts(&["lamp"]));
        let versions = progress.on_completion(behavior).await.expect("commit");
        assert_eq!(progress.on_changes_visible().await.expect("visible"), versions);
    }
    assert_eq!(manager.live_catalog().version(), 12);
    manager.close().await;
}

#[tokio::test]
async fn test_default_behavior_waits_for_visibility() {
    assert_eq!(CommitBehavior::default(), CommitBehavior::WaitForChangesVisible);

    let (manager, _wal) = open_at(0).await;
    let versions = manager
        .commit_and_wait(upserts(&["desk"]), CommitBehavior::default())
        .await
        .expect("commit");
    assert!(manager.live_catalog().version() >= versions.catalog_version);
    assert!(manager.live_catalog().entity("product", "desk").is_some());
    manager.close().await;
}

// =============================================================================
// Greedy incorporation
// =============================================================================

/// A with three mutations, then B with one, on a catalog at version N.
#[tokio::test]
async fn test_two_transactions_become_visible_together() {
    let n = 7;
    let (manager, _wal) = open_at(n).await;
    let mut live = manager.subscribe();

    let a = manager.commit(transaction(&[
        Mutation::create_collection("product"),
        Mutation::upsert("product", "a1", vec![AttributeChange::set("name", "chair")]),
        Mutation::upsert("product", "a2", vec![AttributeChange::set("name", "table")]),
    ]));
    let b = manager.commit(upserts(&["b1"]));

    let a_versions = a.on_changes_visible().await.expect("A visible");
    let b_versions = b.on_changes_visible().await.expect("B visible");
    assert_eq!(a_versions.catalog_version, n + 1);
    assert_eq!(b_versions.catalog_version, n + 2);
    assert_eq!(a_versions.catalog_schema_version, 1);
    assert_eq!(b_versions.catalog_schema_version, 1);

    let catalog = manager.live_catalog();
    assert_eq!(catalog.version(), n + 2);
    for key in ["a1", "a2", "b1"] {
        assert!(catalog.entity("product", key).is_some(), "{} missing", key);
    }
    assert_eq!(manager.coordinator().last_written_catalog_version(), n + 2);

    live.wait_for(|c| c.version() == n + 2)
        .await
        .expect("subscriber sees the final snapshot");

    let metrics = manager.metrics().snapshot();
    assert_eq!(metrics.transactions_incorporated, 2);
    assert_eq!(metrics.atomic_mutations, 6);
    assert!(metrics.trunk_passes <= 2);
    manager.close().await;
}

// =============================================================================
// Conflicts
// =============================================================================

fn touches_frozen(_: &Catalog, task: &ConflictResolutionTask) -> Result<(), CommitError> {
    let mutations = decode_mutations(task.wal().as_bytes())
        .map_err(|e| CommitError::Internal(e.to_string()))?;
    if mutations.iter().any(|m| m.collection() == "frozen") {
        return Err(CommitError::Conflict("collection frozen is read-only".into()));
    }
    Ok(())
}

#[tokio::test]
async fn test_conflict_fails_only_the_offending_transaction() {
    let manager = TransactionManager::open_with_detector(
        Catalog::new("shop"),
        Arc::new(MemoryCatalogWal::new()),
        Arc::new(touches_frozen),
        TransactionConfig::default(),
    )
    .await
    .expect("catalog opens");

    let first = manager.commit(upserts(&["p1"]));
    let rejected = manager.commit(transaction(&[Mutation::upsert("frozen", "x", vec![])]));
    let last = manager.commit(upserts(&["p2"]));

    assert_eq!(first.on_changes_visible().await.expect("first").catalog_version, 1);
    let err = rejected.on_conflict_resolved().await.unwrap_err();
    assert!(matches!(err, CommitError::Conflict(_)));
    assert!(!err.is_fatal());
    assert_eq!(rejected.on_changes_visible().await.unwrap_err(), err);
    assert_eq!(last.on_changes_visible().await.expect("last").catalog_version, 2);

    let catalog = manager.live_catalog();
    assert!(catalog.collection("frozen").is_none());
    assert_eq!(manager.metrics().snapshot().transactions_failed, 1);
    manager.close().await;
}

#[tokio::test]
async fn test_panicking_detector_keeps_the_pipeline_alive() {
    let detector = |_: &Catalog, task: &ConflictResolutionTask| -> Result<(), CommitError> {
        if task.mutation_count() == 2 {
            panic!("conflict index unavailable");
        }
        Ok(())
    };
    let manager = TransactionManager::open_with_detector(
        Catalog::new("shop"),
        Arc::new(MemoryCatalogWal::new()),
        Arc::new(detector),
        TransactionConfig::default(),
    )
    .await
    .expect("catalog opens");

    let panicking = manager.commit(upserts(&["p1", "p2"]));
    let err = tokio::time::timeout(Duration::from_secs(5), panicking.on_changes_visible())
        .await
        .expect("panicking transaction terminates")
        .unwrap_err();
    assert!(matches!(err, CommitError::Internal(_)));
    assert!(manager.is_pipeline_alive());

    let next = manager
        .commit_and_wait(upserts(&["p3"]), CommitBehavior::WaitForChangesVisible)
        .await
        .expect("commit after panic");
    assert_eq!(next.catalog_version, 1);
    manager.close().await;
}

// =============================================================================
// WAL failures
// =============================================================================

/// WAL that stalls on version 1 and fails the first append of version 2
struct FlakyWal {
    inner: MemoryCatalogWal,
    failed: AtomicBool,
}

impl CatalogWal for FlakyWal {
    fn append(&self, header: &TransactionHeader, body: &[u8]) -> WalResult<u64> {
        match header.catalog_version {
            1 => std::thread::sleep(Duration::from_millis(50)),
            2 if !self.failed.swap(true, Ordering::SeqCst) => {
                return Err(WalError::append_failed(
                    "Failed to write WAL transaction 2",
                    io::Error::new(io::ErrorKind::Other, "no space left on device"),
                ));
            }
            _ => {}
        }
        self.inner.append(header, body)
    }

    fn read_transaction(&self, version: u64) -> WalResult<Option<WalTransaction>> {
        self.inner.read_transaction(version)
    }

    fn first_written_version(&self) -> Option<u64> {
        self.inner.first_written_version()
    }

    fn last_written_version(&self) -> Option<u64> {
        self.inner.last_written_version()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_append_does_not_wedge_queued_successors() {
    let manager = TransactionManager::open(
        Catalog::new("shop"),
        Arc::new(FlakyWal {
            inner: MemoryCatalogWal::new(),
            failed: AtomicBool::new(false),
        }),
        TransactionConfig::default(),
    )
    .await
    .expect("catalog opens");

    // Versions 3 and 4 are queued behind the append that fails.
    let burst: Vec<_> = (0..4)
        .map(|i| manager.commit(upserts(&[format!("p{}", i).as_str()])))
        .collect();

    assert_eq!(burst[0].on_changes_visible().await.expect("first").catalog_version, 1);
    assert!(matches!(
        burst[1].on_wal_persisted().await,
        Err(CommitError::Wal(_))
    ));
    let mut written = vec![1];
    for progress in &burst[2..] {
        match progress.on_changes_visible().await {
            Ok(versions) => written.push(versions.catalog_version),
            Err(err) => assert!(matches!(err, CommitError::PremiseViolation(_)), "{}", err),
        }
    }

    let coordinator = manager.coordinator();
    assert_eq!(
        coordinator.last_assigned_catalog_version(),
        coordinator.last_written_catalog_version()
    );

    // Later commits continue right after the last durable version.
    let mut expected = coordinator.last_written_catalog_version();
    for key in ["q1", "q2", "q3"] {
        let versions = manager
            .commit_and_wait(upserts(&[key]), CommitBehavior::WaitForChangesVisible)
            .await
            .expect("commit after WAL failure");
        expected += 1;
        assert_eq!(versions.catalog_version, expected);
        written.push(versions.catalog_version);
    }

    assert!(written.windows(2).all(|w| w[0] < w[1]), "versions reused: {:?}", written);
    assert_eq!(manager.live_catalog().version(), expected);
    manager.close().await;
}
