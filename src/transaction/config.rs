//! Commit pipeline configuration
//!
//! Loaded from a JSON file; every field has a default so an empty object is
//! a valid configuration.

use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigErrorCode {
    /// File missing or unreadable
    ReadFailed,
    /// Not valid JSON for this structure
    ParseFailed,
    /// A value is out of range
    Invalid,
}

impl ConfigErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ReadFailed => "AERO_CONFIG_READ_FAILED",
            Self::ParseFailed => "AERO_CONFIG_PARSE_FAILED",
            Self::Invalid => "AERO_CONFIG_INVALID",
        }
    }
}

/// Configuration error. Always fatal for the catalog being opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    code: ConfigErrorCode,
    message: String,
}

impl ConfigError {
    pub fn new(code: ConfigErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ConfigErrorCode::Invalid, message)
    }

    pub fn code(&self) -> ConfigErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[FATAL] {}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Commit pipeline settings of one catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Capacity of every inter-stage queue (default: 1024)
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Time budget of one greedy trunk incorporation pass (default: 1000 ms)
    #[serde(default = "default_flush_frequency_ms")]
    pub flush_frequency_ms: u64,

    /// Longest wait for the live view to reach a version (default: 30 s)
    #[serde(default = "default_live_view_timeout_ms")]
    pub live_view_timeout_ms: u64,

    /// Size at which the file WAL starts a new segment (default: 16 MiB)
    #[serde(default = "default_max_wal_file_size_bytes")]
    pub max_wal_file_size_bytes: u64,
}

fn default_queue_size() -> usize {
    1024
}

fn default_flush_frequency_ms() -> u64 {
    1000
}

fn default_live_view_timeout_ms() -> u64 {
    30_000
}

fn default_max_wal_file_size_bytes() -> u64 {
    16 * 1024 * 1024
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            flush_frequency_ms: default_flush_frequency_ms(),
            live_view_timeout_ms: default_live_view_timeout_ms(),
            max_wal_file_size_bytes: default_max_wal_file_size_bytes(),
        }
    }
}

impl TransactionConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| {
            ConfigError::new(
                ConfigErrorCode::ReadFailed,
                format!("Failed to read config {}: {}", path.display(), e),
            )
        })?;
        Self::from_json(&content)
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: TransactionConfig = serde_json::from_str(content).map_err(|e| {
            ConfigError::new(ConfigErrorCode::ParseFailed, format!("Invalid config JSON: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject zero values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_size == 0 {
            return Err(ConfigError::invalid("queue_size must be > 0"));
        }
        if self.flush_frequency_ms == 0 {
            return Err(ConfigError::invalid("flush_frequency_ms must be > 0"));
        }
        if self.live_view_timeout_ms == 0 {
            return Err(ConfigError::invalid("live_view_timeout_ms must be > 0"));
        }
        if self.max_wal_file_size_bytes == 0 {
            return Err(ConfigError::invalid("max_wal_file_size_bytes must be > 0"));
        }
        Ok(())
    }

    pub fn flush_frequency(&self) -> Duration {
        Duration::from_millis(self.flush_frequency_ms)
    }

    pub fn live_view_timeout(&self) -> Duration {
        Duration::from_millis(self.live_view_timeout_ms)
    }
}
