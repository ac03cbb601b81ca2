//! WAL error types
//!
//! Error codes:
//! - AERO_WAL_APPEND_FAILED (ERROR)
//! - AERO_WAL_FSYNC_FAILED (FATAL)
//! - AERO_WAL_CORRUPTION (FATAL)
//! - AERO_WAL_VERSION_MISMATCH (ERROR)

use std::fmt;
use std::io;

/// Severity of a WAL error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The append fails, the catalog stays usable
    Error,
    /// The WAL can no longer be trusted; the catalog must be reopened
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// WAL-specific error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalErrorCode {
    /// WAL write failed
    AeroWalAppendFailed,
    /// WAL fsync failed
    AeroWalFsyncFailed,
    /// Checksum or structure failure while reading
    AeroWalCorruption,
    /// Appended transaction does not follow the last written one
    AeroWalVersionMismatch,
}

impl WalErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            WalErrorCode::AeroWalAppendFailed => "AERO_WAL_APPEND_FAILED",
            WalErrorCode::AeroWalFsyncFailed => "AERO_WAL_FSYNC_FAILED",
            WalErrorCode::AeroWalCorruption => "AERO_WAL_CORRUPTION",
            WalErrorCode::AeroWalVersionMismatch => "AERO_WAL_VERSION_MISMATCH",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            WalErrorCode::AeroWalAppendFailed | WalErrorCode::AeroWalVersionMismatch => {
                Severity::Error
            }
            WalErrorCode::AeroWalFsyncFailed | WalErrorCode::AeroWalCorruption => Severity::Fatal,
        }
    }
}

impl fmt::Display for WalErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// WAL error with code, message and optional context
#[derive(Debug)]
pub struct WalError {
    code: WalErrorCode,
    message: String,
    details: Option<String>,
    /// Last version the WAL actually holds (version mismatch only)
    last_written: Option<u64>,
    source: Option<io::Error>,
}

impl WalError {
    fn new(code: WalErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            last_written: None,
            source: None,
        }
    }

    pub fn append_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            source: Some(source),
            ..Self::new(WalErrorCode::AeroWalAppendFailed, message)
        }
    }

    pub fn fsync_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            source: Some(source),
            ..Self::new(WalErrorCode::AeroWalFsyncFailed, message)
        }
    }

    pub fn corruption(message: impl Into<String>) -> Self {
        Self::new(WalErrorCode::AeroWalCorruption, message)
    }

    /// Corruption located at a byte offset of a WAL file
    pub fn corruption_at_offset(file: impl fmt::Display, offset: u64, reason: impl Into<String>) -> Self {
        Self {
            details: Some(format!("file: {}, byte_offset: {}", file, offset)),
            ..Self::corruption(reason)
        }
    }

    /// Corruption attributed to one catalog version
    pub fn corruption_at_version(version: u64, reason: impl Into<String>) -> Self {
        Self {
            details: Some(format!("catalog_version: {}", version)),
            ..Self::corruption(reason)
        }
    }

    /// Append of `attempted` refused because the WAL ends at `last_written`
    pub fn version_mismatch(attempted: u64, last_written: u64) -> Self {
        Self {
            details: Some(format!(
                "attempted_version: {}, last_written_version: {}",
                attempted, last_written
            )),
            last_written: Some(last_written),
            ..Self::new(
                WalErrorCode::AeroWalVersionMismatch,
                "Transaction does not follow the last written WAL transaction",
            )
        }
    }

    pub fn code(&self) -> WalErrorCode {
        self.code
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    /// Last version present in the WAL, for version mismatch errors
    pub fn mismatch_version(&self) -> Option<u64> {
        self.last_written
    }

    /// Returns whether this error leaves the WAL untrustworthy
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl fmt::Display for WalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.code.severity(),
            self.code.code(),
            self.message
        )?;
        if let Some(ref details) = self.details {
            write!(f, " ({})", details)?;
        }
        if let Some(ref source) = self.source {
            write!(f, ": {}", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for WalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Result type for WAL operations
pub type WalResult<T> = Result<T, WalError>;
