//! Structured JSON logger
//!
//! - One log line = one event
//! - Deterministic key ordering (`event`, `severity`, then fields sorted by key)
//! - Explicit severity levels with a process-wide minimum
//! - Synchronous, no buffering
//!
//! ERROR and FATAL lines go to stderr, everything else to stdout.

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU8, Ordering};

use serde_json::Value;

/// Log severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Per-task detail (queue waits, stage hand-offs)
    Trace = 0,
    /// Normal operations
    Info = 1,
    /// Recoverable issues
    Warn = 2,
    /// Operation failures
    Error = 3,
    /// Unrecoverable for the owning pipeline
    Fatal = 4,
}

impl Severity {
    /// Returns the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Trace => "TRACE",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Severity::Trace,
            1 => Severity::Info,
            2 => Severity::Warn,
            3 => Severity::Error,
            _ => Severity::Fatal,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lines below this severity are dropped. TRACE is off unless asked for.
static MIN_SEVERITY: AtomicU8 = AtomicU8::new(Severity::Info as u8);

/// A structured logger that outputs JSON lines
pub struct Logger;

impl Logger {
    /// Set the minimum severity that gets written.
    pub fn set_min_severity(severity: Severity) {
        MIN_SEVERITY.store(severity as u8, Ordering::Relaxed);
    }

    /// Current minimum severity.
    pub fn min_severity() -> Severity {
        Severity::from_u8(MIN_SEVERITY.load(Ordering::Relaxed))
    }

    /// Whether a line of the given severity would be written.
    pub fn enabled(severity: Severity) -> bool {
        severity >= Self::min_severity()
    }

    /// Log an event with the given severity and fields
    pub fn log(severity: Severity, event: &str, fields: &[(&str, &str)]) {
        if !Self::enabled(severity) {
            return;
        }
        if severity >= Severity::Error {
            Self::log_to_writer(severity, event, fields, &mut io::stderr());
        } else {
            Self::log_to_writer(severity, event, fields, &mut io::stdout());
        }
    }

    fn log_to_writer<W: Write>(
        severity: Severity,
        event: &str,
        fields: &[(&str, &str)],
        writer: &mut W,
    ) {
        let line = Self::render(severity, event, fields);
        // Logging must never fail the pipeline.
        let _ = writer.write_all(line.as_bytes());
        let _ = writer.flush();
    }

    fn render(severity: Severity, event: &str, fields: &[(&str, &str)]) -> String {
        let mut sorted: Vec<&(&str, &str)> = fields.iter().collect();
        sorted.sort_by_key(|(k, _)| *k);

        // `event` and `severity` lead every line, ahead of the sorted fields.
        let mut output = String::with_capacity(128 + fields.len() * 32);
        output.push('{');
        push_pair(&mut output, "event", event);
        output.push(',');
        push_pair(&mut output, "severity", severity.as_str());
        for (key, value) in sorted {
            if *key == "event" || *key == "severity" {
                continue;
            }
            output.push(',');
            push_pair(&mut output, key, value);
        }
        output.push_str("}\n");
        output
    }

    /// Log at TRACE level
    pub fn trace(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Trace, event, fields);
    }

    /// Log at INFO level
    pub fn info(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Info, event, fields);
    }

    /// Log at WARN level
    pub fn warn(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Warn, event, fields);
    }

    /// Log at ERROR level
    pub fn error(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Error, event, fields);
    }

    /// Log at FATAL level
    pub fn fatal(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Fatal, event, fields);
    }
}

fn push_pair(output: &mut String, key: &str, value: &str) {
    // Value::String serialization handles all JSON escaping.
    output.push_str(&Value::String(key.to_string()).to_string());
    output.push(':');
    output.push_str(&Value::String(value.to_string()).to_string());
}

/// Render a line without writing it (test helper).
#[cfg(test)]
pub fn capture_log(severity: Severity, event: &str, fields: &[(&str, &str)]) -> String {
    Logger::render(severity, event, fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> serde_json::Map<String, Value> {
        serde_json::from_str(line).unwrap()
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Trace < Severity::Info);
        assert!(Severity::Info < Severity::Warn);
        assert!(Severity::Warn < Severity::Error);
        assert!(Severity::Error < Severity::Fatal);
    }

    #[test]
    fn test_severity_round_trips_through_u8() {
        for severity in [
            Severity::Trace,
            Severity::Info,
            Severity::Warn,
            Severity::Error,
            Severity::Fatal,
        ] {
            assert_eq!(Severity::from_u8(severity as u8), severity);
        }
    }

    #[test]
    fn test_line_is_json_with_event_and_severity() {
        let line = capture_log(Severity::Info, "WAL_APPEND", &[("catalog", "shop")]);
        let parsed = parse(&line);
        assert_eq!(parsed["event"], "WAL_APPEND");
        assert_eq!(parsed["severity"], "INFO");
        assert_eq!(parsed["catalog"], "shop");
    }

    #[test]
    fn test_fields_sorted_after_event_and_severity() {
        let a = capture_log(Severity::Warn, "X", &[("zeta", "1"), ("alpha", "2")]);
        let b = capture_log(Severity::Warn, "X", &[("alpha", "2"), ("zeta", "1")]);
        assert_eq!(a, b);

        let event_pos = a.find("\"event\"").unwrap();
        let severity_pos = a.find("\"severity\"").unwrap();
        let alpha_pos = a.find("\"alpha\"").unwrap();
        let zeta_pos = a.find("\"zeta\"").unwrap();
        assert!(event_pos < severity_pos);
        assert!(severity_pos < alpha_pos);
        assert!(alpha_pos < zeta_pos);
    }

    #[test]
    fn test_reserved_keys_are_not_overridden() {
        let line = capture_log(Severity::Error, "REAL", &[("event", "FAKE")]);
        let parsed = parse(&line);
        assert_eq!(parsed["event"], "REAL");
    }

    #[test]
    fn test_special_characters_escaped() {
        let line = capture_log(
            Severity::Info,
            "TEST",
            &[("reason", "queue \"full\"\nretry later")],
        );
        let parsed = parse(&line);
        assert_eq!(parsed["reason"], "queue \"full\"\nretry later");
        assert_eq!(line.matches('\n').count(), 1);
    }
}
