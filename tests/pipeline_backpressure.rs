//! Pipeline Backpressure Tests
//!
//! Bounded queues push back on the pipeline, never on the committing caller:
//! - commit() returns immediately even when the entry queue is full
//! - A refused hand-off fails the transaction instead of hanging it
//! - Refused transactions leave no gap in the assigned versions
//! - After close every submitted transaction has a terminal outcome

use std::sync::Arc;

use aerocommit::catalog::{Catalog, Mutation};
use aerocommit::transaction::{
    CommitBehavior, CommitError, CommitProgress, TransactionConfig, TransactionManager,
};
use aerocommit::wal::{IsolatedWal, MemoryCatalogWal};

// =============================================================================
// Test Utilities
// =============================================================================

fn upsert(key: &str) -> IsolatedWal {
    IsolatedWal::from_mutations(&[Mutation::upsert("product", key, vec![])])
        .expect("mutation encodes")
}

async fn open_with_queue(queue_size: usize) -> TransactionManager {
    TransactionManager::open(
        Catalog::new("shop"),
        Arc::new(MemoryCatalogWal::new()),
        TransactionConfig {
            queue_size,
            live_view_timeout_ms: 2000,
            ..TransactionConfig::default()
        },
    )
    .await
    .expect("catalog opens")
}

// =============================================================================
// Entry queue
// =============================================================================

/// On the current-thread runtime no stage runs between two commit() calls,
/// so the second commit finds the single-slot entry queue full.
#[tokio::test]
async fn test_full_entry_queue_rejects_without_blocking() {
    let manager = open_with_queue(1).await;

    let accepted = manager.commit(upsert("p1"));
    let refused = manager.commit(upsert("p2"));

    assert!(refused.is_done());
    let err = refused.on_conflict_resolved().await.unwrap_err();
    assert_eq!(
        err,
        CommitError::Rejected {
            stage: "conflict resolution",
            data_may_be_lost: false
        }
    );
    assert!(err.to_string().contains("conflict resolution queue is full"));
    assert!(!err.data_may_be_lost());

    assert_eq!(accepted.on_changes_visible().await.expect("visible").catalog_version, 1);

    let metrics = manager.metrics().snapshot();
    assert_eq!(metrics.transactions_submitted, 2);
    assert_eq!(metrics.transactions_rejected, 1);
    assert_eq!(metrics.transactions_failed, 1);
    manager.close().await;
}

#[tokio::test]
async fn test_rejections_leave_no_version_gap() {
    let manager = open_with_queue(2).await;

    let burst: Vec<Arc<CommitProgress>> = (0..8)
        .map(|i| manager.commit(upsert(&format!("p{}", i))))
        .collect();

    let mut versions = Vec::new();
    let mut rejected = 0;
    for progress in &burst {
        match progress.on_changes_visible().await {
            Ok(v) => versions.push(v.catalog_version),
            Err(CommitError::Rejected { .. }) => rejected += 1,
            Err(other) => panic!("unexpected failure: {}", other),
        }
    }
    assert_eq!(versions, vec![1, 2]);
    assert_eq!(rejected, 6);

    // The pipeline keeps working and continues right after the last version.
    let next = manager
        .commit_and_wait(upsert("late"), CommitBehavior::WaitForChangesVisible)
        .await
        .expect("commit after burst");
    assert_eq!(next.catalog_version, 3);
    assert_eq!(manager.live_catalog().entity_count(), 3);
    manager.close().await;
}

// =============================================================================
// Termination
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_transaction_terminates() {
    let manager = open_with_queue(4).await;

    let progresses: Vec<Arc<CommitProgress>> = (0..200)
        .map(|i| manager.commit(upsert(&format!("p{}", i))))
        .collect();
    manager.close().await;

    let mut visible = Vec::new();
    for progress in &progresses {
        assert!(progress.is_done(), "transaction {} left pending", progress.transaction_id());
        if let Ok(v) = progress.on_changes_visible().await {
            visible.push(v.catalog_version);
        }
    }

    // No version was handed out twice and every reported one is live.
    let reported = visible.len();
    visible.sort_unstable();
    visible.dedup();
    assert_eq!(visible.len(), reported);
    let live = manager.live_catalog().version();
    assert!(visible.iter().all(|v| *v <= live));
    assert!(live <= manager.coordinator().last_written_catalog_version());
    assert!(!manager.is_pipeline_alive());
}
