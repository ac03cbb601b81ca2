//! Observability subsystem
//!
//! - Structured logging (JSON lines)
//! - Lock-free metrics counters
//! - Typed pipeline events
//!
//! # Principles
//!
//! 1. Observability is read-only
//! 2. It never gates control flow
//! 3. A failed log write is ignored, never propagated
//!
//! # Usage
//!
//! ```ignore
//! use aerocommit::observability::{log_event_with_fields, Event, MetricsRegistry};
//!
//! log_event_with_fields(Event::WalAppend, &[("catalog_version", "42")]);
//!
//! let metrics = MetricsRegistry::new();
//! metrics.record_wal_append(512);
//! ```

mod events;
mod logger;
mod metrics;

pub use events::{Event, QueuedEvent};
pub use logger::{Logger, Severity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};

/// Log a lifecycle event at its default severity
pub fn log_event(event: Event) {
    Logger::log(event.severity(), event.as_str(), &[]);
}

/// Log a lifecycle event with fields at its default severity
pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    Logger::log(event.severity(), event.as_str(), fields);
}
