//! Pipeline stages
//!
//! Four stages, wired in sequence, each run by one worker task:
//!
//! ```text
//! commit() -> [conflict resolution] -> [WAL appending] -> [trunk incorporation] -> [snapshot propagation]
//! ```
//!
//! A worker takes one task at a time from its bounded queue. Every per-task
//! error and every panic inside `handle_next` is turned into an exceptional
//! completion of that transaction and the worker moves on to the next task.
//! Only a vanished downstream stage stops a worker: it fails the current
//! task and everything still queued for it, then exits.

mod conflict_resolution;
mod snapshot_propagation;
mod trunk_incorporation;
mod wal_appending;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use super::coordinator::CatalogCoordinator;
use super::errors::CommitError;
use super::task::{TaskContext, TransactionTask};
use crate::observability::{log_event_with_fields, Event, Logger, MetricsRegistry, Severity};

pub use conflict_resolution::ConflictResolutionStage;
pub use snapshot_propagation::SnapshotPropagationStage;
pub use trunk_incorporation::TrunkIncorporationStage;
pub use wal_appending::WalAppendingStage;

/// Boxed future returned by stage handlers
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

mod sealed {
    pub trait Sealed {}
}

/// A single-writer pipeline stage.
///
/// Only the four stages of this module implement it.
pub trait TransactionStage: sealed::Sealed + Send + 'static {
    type Input: TransactionTask;

    /// Stage name used in logs
    const NAME: &'static str;

    fn coordinator(&self) -> &Arc<CatalogCoordinator>;

    /// Process one task: push the next task downstream and/or resolve a
    /// milestone.
    fn handle_next(&mut self, task: Self::Input) -> BoxFuture<'_, Result<(), CommitError>>;

    /// React to a failed task. Overrides add compensating actions and then
    /// call [`fail_task`].
    fn handle_exception(&mut self, context: &TaskContext, err: CommitError) {
        fail_task(self.coordinator(), Self::NAME, context, err);
    }
}

/// Fail every open milestone of a transaction and report it.
pub fn fail_task(
    coordinator: &CatalogCoordinator,
    stage: &'static str,
    context: &TaskContext,
    err: CommitError,
) {
    let version = context
        .catalog_version
        .map(|v| v.to_string())
        .unwrap_or_default();
    let transaction_id = context.transaction_id.to_string();
    let message = err.to_string();
    Logger::log(
        err.log_severity(),
        Event::TransactionFailed.as_str(),
        &[
            ("catalog", &context.catalog_name),
            ("catalog_version", &version),
            ("code", err.code()),
            ("message", &message),
            ("stage", stage),
            ("transaction_id", &transaction_id),
        ],
    );

    if context.progress.complete_exceptionally(err) {
        coordinator.metrics().increment_failed();
    }
}

/// Offer `target` to the downstream queue without waiting.
///
/// A full queue fails the source transaction; when the target is not
/// repeatable the error warns that committed data may be lost.
pub fn push<T: TransactionTask>(
    target: T,
    downstream: &mpsc::Sender<T>,
    metrics: &MetricsRegistry,
) -> Result<(), CommitError> {
    match downstream.try_send(target) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(task)) => {
            metrics.increment_rejected();
            let transaction_id = task.transaction_id().to_string();
            let data_may_be_lost = if T::REPEATABLE { "false" } else { "true" };
            log_event_with_fields(
                Event::TransactionRejected,
                &[
                    ("catalog", task.catalog_name()),
                    ("data_may_be_lost", data_may_be_lost),
                    ("stage", T::STAGE),
                    ("transaction_id", &transaction_id),
                ],
            );
            Err(CommitError::Rejected {
                stage: T::STAGE,
                data_may_be_lost: !T::REPEATABLE,
            })
        }
        Err(TrySendError::Closed(_)) => Err(CommitError::PipelineClosed),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("task handler panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("task handler panicked: {}", message)
    } else {
        "task handler panicked".to_string()
    }
}

/// Run `stage` on its own worker until its queue closes or its downstream
/// disappears.
pub fn spawn_stage<S: TransactionStage>(
    mut stage: S,
    mut upstream: mpsc::Receiver<S::Input>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let catalog = stage.coordinator().name().to_string();
        log_event_with_fields(Event::StageStarted, &[("catalog", &catalog), ("stage", S::NAME)]);

        while let Some(task) = upstream.recv().await {
            task.event().finish();
            let context = task.context();

            // Handlers may do their work before returning the future, so the
            // call itself runs inside the guarded block.
            let outcome = AssertUnwindSafe(async { stage.handle_next(task).await })
                .catch_unwind()
                .await;
            let err = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(panic) => CommitError::Internal(panic_message(panic)),
            };

            let stream_failed = err == CommitError::PipelineClosed;
            stage.handle_exception(&context, err);

            if stream_failed {
                Logger::fatal(
                    Event::PipelineFailed.as_str(),
                    &[
                        ("catalog", &catalog),
                        ("reason", "downstream stage is gone"),
                        ("stage", S::NAME),
                    ],
                );
                upstream.close();
                while let Ok(task) = upstream.try_recv() {
                    fail_task(stage.coordinator(), S::NAME, &task.context(), CommitError::PipelineClosed);
                }
                break;
            }
        }

        Logger::log(
            Severity::Info,
            Event::StageStopped.as_str(),
            &[("catalog", &catalog), ("stage", S::NAME)],
        );
    })
}
