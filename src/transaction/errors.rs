//! Commit pipeline errors
//!
//! One `CommitError` value is handed to every unresolved milestone of a
//! failed transaction and to every caller waiting on them, so it is `Clone`.

use std::fmt;

use thiserror::Error;

use super::config::ConfigError;
use crate::observability::Severity;
use crate::wal::{WalError, WalErrorCode};

/// Result type for commit pipeline operations
pub type CommitResult<T> = Result<T, CommitError>;

/// Severity of a commit error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Only the offending transaction fails
    Error,
    /// An internal invariant broke; the catalog needs attention
    Fatal,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Fatal => write!(f, "FATAL"),
        }
    }
}

fn lost_suffix(data_may_be_lost: &bool) -> &'static str {
    if *data_may_be_lost {
        ", some committed data may be lost"
    } else {
        ""
    }
}

/// Transaction commit errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitError {
    /// The transaction's changes collide with an already accepted transaction
    #[error("Transaction conflicts with an accepted transaction: {0}")]
    Conflict(String),

    /// A bounded hand-off queue refused the task
    #[error("Transaction rejected: {stage} queue is full{}", lost_suffix(.data_may_be_lost))]
    Rejected {
        stage: &'static str,
        data_may_be_lost: bool,
    },

    /// The shared WAL does not end where the pipeline expected
    #[error("WAL mismatch appending catalog version {catalog_version}: WAL ends at {last_written}")]
    WalVersionMismatch { catalog_version: u64, last_written: u64 },

    /// Writing to the shared WAL failed
    #[error("WAL failure: {0}")]
    Wal(String),

    /// An internal ordering or bookkeeping premise does not hold
    #[error("Premise violation: {0}")]
    PremiseViolation(String),

    /// The stage that should take the task is no longer running
    #[error("Transaction pipeline is closed")]
    PipelineClosed,

    /// A stage panicked while handling the task
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CommitError {
    pub fn premise(message: impl Into<String>) -> Self {
        CommitError::PremiseViolation(message.into())
    }

    /// Map a WAL failure met while appending `catalog_version`.
    pub fn from_wal(err: &WalError, catalog_version: u64) -> Self {
        match (err.code(), err.mismatch_version()) {
            (WalErrorCode::AeroWalVersionMismatch, Some(last_written)) => {
                CommitError::WalVersionMismatch {
                    catalog_version,
                    last_written,
                }
            }
            _ => CommitError::Wal(err.to_string()),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            CommitError::Conflict(_) => "AERO_TXN_CONFLICT",
            CommitError::Rejected { .. } => "AERO_TXN_REJECTED",
            CommitError::WalVersionMismatch { .. } => "AERO_TXN_WAL_MISMATCH",
            CommitError::Wal(_) => "AERO_TXN_WAL_FAILED",
            CommitError::PremiseViolation(_) => "AERO_TXN_PREMISE_VIOLATION",
            CommitError::PipelineClosed => "AERO_TXN_PIPELINE_CLOSED",
            CommitError::Internal(_) => "AERO_TXN_INTERNAL",
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            CommitError::Conflict(_) | CommitError::Rejected { .. } | CommitError::Wal(_) => {
                ErrorSeverity::Error
            }
            CommitError::WalVersionMismatch { .. }
            | CommitError::PremiseViolation(_)
            | CommitError::PipelineClosed
            | CommitError::Internal(_) => ErrorSeverity::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == ErrorSeverity::Fatal
    }

    /// Whether a durable side effect may have been lost with this failure
    pub fn data_may_be_lost(&self) -> bool {
        matches!(
            self,
            CommitError::Rejected {
                data_may_be_lost: true,
                ..
            }
        )
    }

    /// Log severity for reporting this error
    pub fn log_severity(&self) -> Severity {
        match self.severity() {
            ErrorSeverity::Error => Severity::Error,
            ErrorSeverity::Fatal => Severity::Fatal,
        }
    }
}

/// Errors opening a catalog's commit pipeline
#[derive(Debug, Error)]
pub enum OpenError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    Commit(#[from] CommitError),
}
