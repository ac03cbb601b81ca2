//! Catalog coordinator
//!
//! One coordinator exists per open catalog. It owns the version counters,
//! the shared WAL, the last finalized snapshot and the live catalog
//! reference; the stages call into it but hold none of this state.
//!
//! Counters and their single writers:
//!
//! | counter          | advanced by          | rolled back by                 |
//! |------------------|----------------------|--------------------------------|
//! | last assigned    | conflict resolution  | dropped or released versions   |
//! | last written     | WAL appending        | WAL mismatch realignment       |
//! | last finalized   | trunk incorporation  | never                          |
//! | live catalog     | snapshot propagation | never                          |
//!
//! Invariant: `live <= last finalized <= last written <= last assigned`.
//!
//! Last assigned and the schema estimate are written by two stages (conflict
//! resolution assigns, WAL appending gives back), so every writer of the
//! pair holds the assignment lock. Readers stay lock-free.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use super::config::TransactionConfig;
use super::conflict::ConflictDetector;
use super::errors::{CommitError, CommitResult, OpenError};
use super::progress::CommitVersions;
use super::task::ConflictResolutionTask;
use crate::catalog::Catalog;
use crate::observability::{log_event_with_fields, Event, Logger, MetricsRegistry};
use crate::wal::{CatalogWal, IsolatedWal, TransactionHeader, WalResult};

/// Outcome of a trunk incorporation pass that absorbed at least one transaction
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub catalog: Arc<Catalog>,
    pub last_transaction_id: Uuid,
    pub processed_transactions: u64,
    pub processed_atomic_mutations: u64,
    pub processed_local_mutations: u64,
    /// Commit times of the absorbed transactions, oldest first
    pub commit_times: Vec<DateTime<Utc>>,
}

/// Catalog-scoped state shared by the pipeline stages
pub struct CatalogCoordinator {
    name: String,
    config: TransactionConfig,
    wal: Arc<dyn CatalogWal>,
    conflict_detector: Arc<dyn ConflictDetector>,
    metrics: Arc<MetricsRegistry>,
    last_assigned: AtomicU64,
    last_written: AtomicU64,
    last_finalized: AtomicU64,
    /// Schema version of the last assigned transaction
    schema_version: AtomicU64,
    assignment: Mutex<()>,
    last_finalized_catalog: Mutex<Arc<Catalog>>,
    live: watch::Sender<Arc<Catalog>>,
}

impl std::fmt::Debug for CatalogCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogCoordinator")
            .field("name", &self.name)
            .field("last_assigned", &self.last_assigned)
            .field("last_written", &self.last_written)
            .field("last_finalized", &self.last_finalized)
            .field("live_version", &self.live_version())
            .finish()
    }
}

impl CatalogCoordinator {
    /// Open the coordinator on `catalog` and bring it up to date with `wal`.
    ///
    /// Transactions the WAL holds beyond the snapshot are replayed and made
    /// live before this returns. A WAL that ends behind the snapshot is
    /// refused.
    pub fn open(
        catalog: Catalog,
        wal: Arc<dyn CatalogWal>,
        conflict_detector: Arc<dyn ConflictDetector>,
        config: TransactionConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, OpenError> {
        config.validate()?;

        let version = catalog.version();
        let schema_version = catalog.schema_version();
        let wal_last = wal.last_written_version();
        if let Some(last) = wal_last {
            if last < version {
                return Err(CommitError::premise(format!(
                    "WAL of catalog {} ends at version {}, behind snapshot version {}",
                    catalog.name(),
                    last,
                    version
                ))
                .into());
            }
        }

        let catalog = Arc::new(catalog);
        let coordinator = Self {
            name: catalog.name().to_string(),
            config,
            wal,
            conflict_detector,
            metrics,
            last_assigned: AtomicU64::new(version),
            last_written: AtomicU64::new(version),
            last_finalized: AtomicU64::new(version),
            schema_version: AtomicU64::new(schema_version),
            assignment: Mutex::new(()),
            last_finalized_catalog: Mutex::new(Arc::clone(&catalog)),
            live: watch::channel(catalog).0,
        };

        if let Some(last) = wal_last.filter(|last| *last > version) {
            coordinator.replay(version, last)?;
        }

        let live_version = coordinator.live_version().to_string();
        log_event_with_fields(
            Event::CatalogOpened,
            &[("catalog", &coordinator.name), ("catalog_version", &live_version)],
        );
        Ok(coordinator)
    }

    /// Merge WAL versions `from + 1 ..= last` into the live catalog.
    fn replay(&self, from: u64, last: u64) -> CommitResult<()> {
        let from_str = from.to_string();
        let last_str = last.to_string();
        log_event_with_fields(
            Event::WalReplayBegin,
            &[("catalog", &self.name), ("from_version", &from_str), ("to_version", &last_str)],
        );

        let result = self
            .process_transactions(from + 1, Duration::MAX, false)?
            .ok_or_else(|| {
                CommitError::premise(format!(
                    "WAL of catalog {} does not contain version {}",
                    self.name,
                    from + 1
                ))
            })?;

        let catalog = Arc::clone(&result.catalog);
        if catalog.version() != last {
            return Err(CommitError::premise(format!(
                "Replay of catalog {} stopped at version {}, WAL ends at {}",
                self.name,
                catalog.version(),
                last
            )));
        }

        self.last_assigned.store(last, Ordering::SeqCst);
        self.last_written.store(last, Ordering::SeqCst);
        self.schema_version
            .store(catalog.schema_version(), Ordering::SeqCst);
        self.propagate_catalog_snapshot(catalog)?;

        let count = result.processed_transactions.to_string();
        log_event_with_fields(
            Event::WalReplayComplete,
            &[("catalog", &self.name), ("catalog_version", &last_str), ("transactions", &count)],
        );
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    // Conflict resolution

    /// Ask the conflict detector about `task` against the live catalog.
    pub fn identify_conflicts(&self, task: &ConflictResolutionTask) -> CommitResult<()> {
        let live = self.live_catalog();
        self.conflict_detector.identify_conflicts(&live, task)
    }

    fn lock_assignment(&self) -> MutexGuard<'_, ()> {
        self.assignment.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve the next catalog version.
    pub fn next_catalog_version_to_assign(&self) -> u64 {
        let _assignment = self.lock_assignment();
        self.assign_next_version()
    }

    /// Add a transaction's schema delta and return the resulting schema version.
    pub fn add_delta_and_estimate_catalog_schema_version(&self, delta: u64) -> u64 {
        let _assignment = self.lock_assignment();
        self.schema_version.fetch_add(delta, Ordering::SeqCst) + delta
    }

    /// Reserve the next catalog version and estimate its schema version in
    /// one step, so no rollback can slip in between the two.
    pub fn assign_catalog_versions(&self, schema_delta: u64) -> CommitVersions {
        let _assignment = self.lock_assignment();
        let catalog_version = self.assign_next_version();
        let schema_version = self.schema_version.fetch_add(schema_delta, Ordering::SeqCst) + schema_delta;
        CommitVersions::new(catalog_version, schema_version)
    }

    fn assign_next_version(&self) -> u64 {
        self.metrics.increment_versions_assigned();
        self.last_assigned.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn last_assigned_catalog_version(&self) -> u64 {
        self.last_assigned.load(Ordering::SeqCst)
    }

    /// Release `count` reserved versions and `schema_delta` schema versions.
    ///
    /// Last assigned never drops below last written; dropping below the live
    /// version is a premise violation and changes nothing. Versions already
    /// given back by [`release_unwritten_versions`](Self::release_unwritten_versions)
    /// are not released twice.
    pub fn notify_catalog_version_dropped(&self, count: u64, schema_delta: u64) -> CommitResult<()> {
        let _assignment = self.lock_assignment();
        let live = self.live_version();
        let floor = self.last_written_catalog_version();
        let assigned = self.last_assigned.load(Ordering::SeqCst);
        let target = assigned.saturating_sub(count);
        if target < live {
            return Err(CommitError::premise(format!(
                "Dropping {} versions from {} would fall below live version {}",
                count, assigned, live
            )));
        }

        let lowered = target.max(floor);
        if lowered == assigned {
            return Ok(());
        }
        self.last_assigned.store(lowered, Ordering::SeqCst);
        let _ = self
            .schema_version
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(schema_delta))
            });

        self.metrics.add_versions_dropped(assigned - lowered);
        let count_str = count.to_string();
        let lowered_str = lowered.to_string();
        log_event_with_fields(
            Event::VersionsDropped,
            &[
                ("catalog", &self.name),
                ("dropped", &count_str),
                ("last_assigned", &lowered_str),
            ],
        );
        Ok(())
    }

    // WAL

    pub fn wal(&self) -> &Arc<dyn CatalogWal> {
        &self.wal
    }

    /// Append a transaction to the shared WAL and release its isolated buffer.
    pub fn append_wal_and_discard(&self, header: &TransactionHeader, wal: IsolatedWal) -> WalResult<u64> {
        let written = self.wal.append(header, wal.as_bytes())?;
        drop(wal);
        Ok(written)
    }

    pub fn last_written_catalog_version(&self) -> u64 {
        self.last_written.load(Ordering::SeqCst)
    }

    /// Record that `version` is durable in the WAL.
    pub fn update_last_written_catalog_version(&self, version: u64) -> CommitResult<()> {
        let last_written = self.last_written_catalog_version();
        let last_assigned = self.last_assigned_catalog_version();
        if version <= last_written {
            return Err(CommitError::premise(format!(
                "Last written version must increase: {} after {}",
                version, last_written
            )));
        }
        if version > last_assigned {
            return Err(CommitError::premise(format!(
                "Written version {} was never assigned (last assigned {})",
                version, last_assigned
            )));
        }
        self.last_written.store(version, Ordering::SeqCst);
        Ok(())
    }

    /// Move last written back to what the WAL actually holds.
    pub(crate) fn realign_last_written_catalog_version(&self, version: u64) {
        self.last_written.store(version, Ordering::SeqCst);
    }

    /// Give back every version that was assigned but never written.
    ///
    /// Called after a failed append and between pipelines. The schema
    /// estimate is reset to the last written transaction's schema version.
    /// Returns the number of versions released.
    pub(crate) fn release_unwritten_versions(&self) -> CommitResult<u64> {
        let _assignment = self.lock_assignment();
        let written = self.last_written_catalog_version();
        let assigned = self.last_assigned_catalog_version();
        if assigned <= written {
            return Ok(0);
        }

        let schema_version = match self.wal.read_transaction(written) {
            Ok(Some(transaction)) => transaction.header.catalog_schema_version,
            Ok(None) => self.last_finalized_catalog().schema_version(),
            Err(e) => return Err(CommitError::Wal(e.to_string())),
        };
        let released = assigned - written;
        self.last_assigned.store(written, Ordering::SeqCst);
        self.schema_version.store(schema_version, Ordering::SeqCst);
        self.metrics.add_versions_dropped(released);

        let released_str = released.to_string();
        let written_str = written.to_string();
        log_event_with_fields(
            Event::VersionsDropped,
            &[
                ("catalog", &self.name),
                ("dropped", &released_str),
                ("last_assigned", &written_str),
            ],
        );
        Ok(released)
    }

    // Trunk

    pub fn last_finalized_catalog_version(&self) -> u64 {
        self.last_finalized.load(Ordering::SeqCst)
    }

    pub fn last_finalized_catalog(&self) -> Arc<Catalog> {
        Arc::clone(
            &self
                .last_finalized_catalog
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    fn update_last_finalized_catalog(&self, catalog: Arc<Catalog>) -> CommitResult<()> {
        let mut current = self
            .last_finalized_catalog
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if catalog.version() <= current.version() {
            return Err(CommitError::premise(format!(
                "Finalized version must increase: {} after {}",
                catalog.version(),
                current.version()
            )));
        }
        self.last_finalized.store(catalog.version(), Ordering::SeqCst);
        *current = catalog;
        Ok(())
    }

    /// Merge WAL-persisted transactions into a new snapshot.
    ///
    /// Starts at the first version after the last finalized one and absorbs
    /// transactions oldest first. With `alive` set only versions already
    /// recorded as written are read and the pass stops once `timeout`
    /// elapses; otherwise it reads until the WAL ends. At least one
    /// available transaction is always absorbed. Returns `None` when nothing
    /// was available.
    pub fn process_transactions(
        &self,
        version: u64,
        timeout: Duration,
        alive: bool,
    ) -> CommitResult<Option<ProcessResult>> {
        let base = self.last_finalized_catalog();
        let mut next = version.min(base.version() + 1);
        let started = Instant::now();

        let mut working: Option<Catalog> = None;
        let mut last_transaction_id = Uuid::nil();
        let mut processed = 0u64;
        let mut atomic = 0u64;
        let mut local = 0u64;
        let mut commit_times = Vec::new();

        loop {
            if alive && next > self.last_written_catalog_version() {
                break;
            }
            let transaction = match self.wal.read_transaction(next) {
                Ok(Some(transaction)) => transaction,
                Ok(None) => break,
                Err(e) => return Err(CommitError::Wal(e.to_string())),
            };

            let header = &transaction.header;
            if header.catalog_version != next {
                return Err(CommitError::premise(format!(
                    "Expected WAL transaction {}, found {}",
                    next, header.catalog_version
                )));
            }
            let mutations = transaction.mutations().map_err(|e| {
                CommitError::premise(format!("Transaction {} cannot be decoded: {}", next, e))
            })?;

            let catalog = working.get_or_insert_with(|| (*base).clone());
            for mutation in &mutations {
                local += catalog.apply(mutation);
            }
            catalog.set_versions(header.catalog_version, header.catalog_schema_version);

            atomic += mutations.len() as u64 + 1;
            processed += 1;
            last_transaction_id = header.transaction_id;
            commit_times.push(header.commit_timestamp);
            next += 1;

            if alive && started.elapsed() >= timeout {
                break;
            }
        }

        let Some(catalog) = working else {
            return Ok(None);
        };
        let catalog = Arc::new(catalog);
        self.update_last_finalized_catalog(Arc::clone(&catalog))?;

        Ok(Some(ProcessResult {
            catalog,
            last_transaction_id,
            processed_transactions: processed,
            processed_atomic_mutations: atomic,
            processed_local_mutations: local,
            commit_times,
        }))
    }

    // Live view

    pub fn live_catalog(&self) -> Arc<Catalog> {
        Arc::clone(&self.live.borrow())
    }

    pub fn live_version(&self) -> u64 {
        self.live.borrow().version()
    }

    /// Receiver observing every swap of the live catalog
    pub fn subscribe(&self) -> watch::Receiver<Arc<Catalog>> {
        self.live.subscribe()
    }

    /// Make `catalog` the live view.
    ///
    /// Returns false when it is the version already live. The live view never
    /// moves backwards.
    pub fn propagate_catalog_snapshot(&self, catalog: Arc<Catalog>) -> CommitResult<bool> {
        let live = self.live_version();
        if catalog.version() == live {
            return Ok(false);
        }
        if catalog.version() < live {
            return Err(CommitError::premise(format!(
                "Live catalog cannot move back from {} to {}",
                live,
                catalog.version()
            )));
        }
        self.live.send_replace(catalog);
        Ok(true)
    }

    /// Wait until the live catalog reaches `version`.
    ///
    /// Bounded by the configured live view timeout.
    pub async fn wait_until_live_version_reaches(&self, version: u64) -> CommitResult<()> {
        let mut receiver = self.subscribe();
        let timeout = self.config.live_view_timeout();
        let reached = tokio::time::timeout(timeout, receiver.wait_for(|c| c.version() >= version))
            .await
            .map(|waited| waited.map(|_| ()));
        match reached {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(CommitError::PipelineClosed),
            Err(_) => {
                let live = self.live_version().to_string();
                let wanted = version.to_string();
                Logger::error(
                    Event::PremiseViolated.as_str(),
                    &[
                        ("catalog", &self.name),
                        ("live_version", &live),
                        ("awaited_version", &wanted),
                    ],
                );
                Err(CommitError::premise(format!(
                    "Live catalog did not reach version {} within {:?}",
                    version, timeout
                )))
            }
        }
    }
}
