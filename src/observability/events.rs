//! Observability events for the commit pipeline
//!
//! Every line the pipeline logs is named by one of these events. Events are
//! side effects only: nothing in the pipeline branches on whether a line was
//! written.

use std::fmt;
use std::time::{Duration, Instant};

use super::logger::{Logger, Severity};

/// Observable events in the commit pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Lifecycle
    /// Catalog coordinator opened
    CatalogOpened,
    /// Catalog coordinator closed
    CatalogClosed,
    /// Configuration loaded
    ConfigLoaded,
    /// Stage worker started
    StageStarted,
    /// Stage worker stopped
    StageStopped,
    /// Stage worker hit a stream-level failure (FATAL)
    PipelineFailed,
    /// Pipeline recreated on request
    PipelineRecreated,

    // Per transaction
    /// Transaction handed to the pipeline
    TransactionSubmitted,
    /// Task taken off a stage queue
    TransactionDequeued,
    /// Catalog version assigned
    ConflictResolved,
    /// Hand-off refused by a full queue
    TransactionRejected,
    /// Transaction completed exceptionally
    TransactionFailed,

    // WAL
    /// Transaction appended to the shared WAL
    WalAppend,
    /// WAL refused an append because of a version gap (carries drop count)
    WalVersionMismatch,
    /// WAL file rotated
    WalRotated,
    /// WAL replay on catalog open begins
    WalReplayBegin,
    /// WAL replay on catalog open complete
    WalReplayComplete,

    // Versions
    /// Reserved catalog versions released
    VersionsDropped,

    // Trunk and live view
    /// WAL-persisted transactions merged into a new snapshot
    TrunkIncorporated,
    /// Trunk pass found nothing to merge
    TrunkIncorporationEmpty,
    /// New snapshot swapped into the live view
    CatalogPropagated,

    /// Internal premise violated (FATAL)
    PremiseViolated,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::CatalogOpened => "CATALOG_OPENED",
            Event::CatalogClosed => "CATALOG_CLOSED",
            Event::ConfigLoaded => "CONFIG_LOADED",
            Event::StageStarted => "TRANSACTION_STAGE_STARTED",
            Event::StageStopped => "TRANSACTION_STAGE_STOPPED",
            Event::PipelineFailed => "TRANSACTION_PIPELINE_FAILED",
            Event::PipelineRecreated => "TRANSACTION_PIPELINE_RECREATED",

            Event::TransactionSubmitted => "TRANSACTION_SUBMITTED",
            Event::TransactionDequeued => "TRANSACTION_DEQUEUED",
            Event::ConflictResolved => "TRANSACTION_CONFLICT_RESOLVED",
            Event::TransactionRejected => "TRANSACTION_REJECTED",
            Event::TransactionFailed => "TRANSACTION_FAILED",

            Event::WalAppend => "WAL_APPEND",
            Event::WalVersionMismatch => "WAL_VERSION_MISMATCH",
            Event::WalRotated => "WAL_ROTATED",
            Event::WalReplayBegin => "WAL_REPLAY_BEGIN",
            Event::WalReplayComplete => "WAL_REPLAY_COMPLETE",

            Event::VersionsDropped => "CATALOG_VERSIONS_DROPPED",

            Event::TrunkIncorporated => "TRUNK_INCORPORATED",
            Event::TrunkIncorporationEmpty => "TRUNK_INCORPORATION_EMPTY",
            Event::CatalogPropagated => "CATALOG_PROPAGATED",

            Event::PremiseViolated => "PREMISE_VIOLATED",
        }
    }

    /// Returns true if this event indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(self, Event::PipelineFailed | Event::PremiseViolated)
    }

    /// Default severity for this event
    pub fn severity(&self) -> Severity {
        match self {
            Event::PipelineFailed | Event::PremiseViolated => Severity::Fatal,
            Event::TransactionFailed | Event::WalVersionMismatch => Severity::Error,
            Event::TransactionRejected | Event::VersionsDropped => Severity::Warn,
            Event::TransactionDequeued | Event::TrunkIncorporationEmpty => Severity::Trace,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Queue bookkeeping carried by every transaction task.
///
/// Created when the task is built (i.e. just before it is offered to a
/// queue) and finished when the consuming stage takes it off the queue.
#[derive(Debug)]
pub struct QueuedEvent {
    catalog: String,
    stage: &'static str,
    enqueued_at: Instant,
}

impl QueuedEvent {
    /// Start measuring the queue wait of a task bound for `stage`.
    pub fn new(catalog: impl Into<String>, stage: &'static str) -> Self {
        Self {
            catalog: catalog.into(),
            stage,
            enqueued_at: Instant::now(),
        }
    }

    /// Stage the task was queued for.
    pub fn stage(&self) -> &'static str {
        self.stage
    }

    /// Record the dequeue and return the time spent waiting.
    pub fn finish(&self) -> Duration {
        let waited = self.enqueued_at.elapsed();
        if Logger::enabled(Severity::Trace) {
            let waited_us = waited.as_micros().to_string();
            Logger::trace(
                Event::TransactionDequeued.as_str(),
                &[
                    ("catalog", &self.catalog),
                    ("stage", self.stage),
                    ("waited_us", &waited_us),
                ],
            );
        }
        waited
    }
}
