//! Metrics registry for the commit pipeline
//!
//! - Counters only, plus a running maximum for visibility lag
//! - Monotonic increase, reset only when the registry is created
//! - Thread-safe and lock-free; every stage writes its own counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Operational counters of one catalog's pipeline.
///
/// Relaxed ordering throughout: the values feed dashboards, never control flow.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    transactions_submitted: AtomicU64,
    transactions_rejected: AtomicU64,
    transactions_failed: AtomicU64,
    versions_assigned: AtomicU64,
    versions_dropped: AtomicU64,
    wal_transactions_written: AtomicU64,
    wal_bytes_written: AtomicU64,
    trunk_passes: AtomicU64,
    transactions_incorporated: AtomicU64,
    atomic_mutations: AtomicU64,
    local_mutations: AtomicU64,
    snapshots_propagated: AtomicU64,
    visibility_lag_observations: AtomicU64,
    visibility_lag_total_us: AtomicU64,
    visibility_lag_max_us: AtomicU64,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_submitted(&self) {
        self.transactions_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rejected(&self) {
        self.transactions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_failed(&self) {
        self.transactions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_versions_assigned(&self) {
        self.versions_assigned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_versions_dropped(&self, count: u64) {
        self.versions_dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Record one transaction appended to the shared WAL.
    pub fn record_wal_append(&self, bytes: u64) {
        self.wal_transactions_written.fetch_add(1, Ordering::Relaxed);
        self.wal_bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record one trunk incorporation pass and what it absorbed.
    pub fn record_trunk_pass(&self, transactions: u64, atomic: u64, local: u64) {
        self.trunk_passes.fetch_add(1, Ordering::Relaxed);
        self.transactions_incorporated
            .fetch_add(transactions, Ordering::Relaxed);
        self.atomic_mutations.fetch_add(atomic, Ordering::Relaxed);
        self.local_mutations.fetch_add(local, Ordering::Relaxed);
    }

    pub fn increment_snapshots_propagated(&self) {
        self.snapshots_propagated.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the time between a transaction's commit and its visibility.
    pub fn observe_visibility_lag(&self, lag: Duration) {
        let us = lag.as_micros().min(u128::from(u64::MAX)) as u64;
        self.visibility_lag_observations
            .fetch_add(1, Ordering::Relaxed);
        self.visibility_lag_total_us.fetch_add(us, Ordering::Relaxed);
        self.visibility_lag_max_us.fetch_max(us, Ordering::Relaxed);
    }

    /// Get all metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transactions_submitted: self.transactions_submitted.load(Ordering::Relaxed),
            transactions_rejected: self.transactions_rejected.load(Ordering::Relaxed),
            transactions_failed: self.transactions_failed.load(Ordering::Relaxed),
            versions_assigned: self.versions_assigned.load(Ordering::Relaxed),
            versions_dropped: self.versions_dropped.load(Ordering::Relaxed),
            wal_transactions_written: self.wal_transactions_written.load(Ordering::Relaxed),
            wal_bytes_written: self.wal_bytes_written.load(Ordering::Relaxed),
            trunk_passes: self.trunk_passes.load(Ordering::Relaxed),
            transactions_incorporated: self.transactions_incorporated.load(Ordering::Relaxed),
            atomic_mutations: self.atomic_mutations.load(Ordering::Relaxed),
            local_mutations: self.local_mutations.load(Ordering::Relaxed),
            snapshots_propagated: self.snapshots_propagated.load(Ordering::Relaxed),
            visibility_lag_observations: self
                .visibility_lag_observations
                .load(Ordering::Relaxed),
            visibility_lag_total_us: self.visibility_lag_total_us.load(Ordering::Relaxed),
            visibility_lag_max_us: self.visibility_lag_max_us.load(Ordering::Relaxed),
        }
    }

    /// Current values as a single JSON object
    pub fn to_json(&self) -> String {
        // Plain integers only; serialization cannot fail.
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub transactions_submitted: u64,
    pub transactions_rejected: u64,
    pub transactions_failed: u64,
    pub versions_assigned: u64,
    pub versions_dropped: u64,
    pub wal_transactions_written: u64,
    pub wal_bytes_written: u64,
    pub trunk_passes: u64,
    pub transactions_incorporated: u64,
    pub atomic_mutations: u64,
    pub local_mutations: u64,
    pub snapshots_propagated: u64,
    pub visibility_lag_observations: u64,
    pub visibility_lag_total_us: u64,
    pub visibility_lag_max_us: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_registry_has_zero_values() {
        let snapshot = MetricsRegistry::new().snapshot();
        assert_eq!(snapshot.transactions_submitted, 0);
        assert_eq!(snapshot.wal_bytes_written, 0);
        assert_eq!(snapshot.trunk_passes, 0);
        assert_eq!(snapshot.visibility_lag_max_us, 0);
    }

    #[test]
    fn test_trunk_pass_accumulates() {
        let registry = MetricsRegistry::new();
        registry.record_trunk_pass(2, 6, 9);
        registry.record_trunk_pass(1, 2, 1);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.trunk_passes, 2);
        assert_eq!(snapshot.transactions_incorporated, 3);
        assert_eq!(snapshot.atomic_mutations, 8);
        assert_eq!(snapshot.local_mutations, 10);
    }

    #[test]
    fn test_visibility_lag_tracks_total_and_max() {
        let registry = MetricsRegistry::new();
        registry.observe_visibility_lag(Duration::from_micros(300));
        registry.observe_visibility_lag(Duration::from_micros(100));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.visibility_lag_observations, 2);
        assert_eq!(snapshot.visibility_lag_total_us, 400);
        assert_eq!(snapshot.visibility_lag_max_us, 300);
    }

    #[test]
    fn test_to_json() {
        let registry = MetricsRegistry::new();
        registry.record_wal_append(1234);
        registry.increment_submitted();

        let parsed: serde_json::Value = serde_json::from_str(&registry.to_json()).unwrap();
        assert_eq!(parsed["wal_bytes_written"], 1234);
        assert_eq!(parsed["wal_transactions_written"], 1);
        assert_eq!(parsed["transactions_submitted"], 1);
    }

    #[test]
    fn test_thread_safety() {
        use std::sync::Arc;
        use std::thread;

        let registry = Arc::new(MetricsRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..100 {
                        reg.increment_versions_assigned();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.snapshot().versions_assigned, 800);
    }
}
