//! Append-only execution log.
//!
//! [`ExecutionLog`] is the readable log sink shared by the function registry
//! and the CLI. Entries are timestamped and leveled, kept in insertion order,
//! and mirrored to `tracing` so they also show up in the process log.

use std::fmt;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Normal progress
    Info,
    /// Something unexpected that did not fail the operation
    Warn,
    /// A failed operation
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        })
    }
}

/// A single timestamped log entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the entry was appended
    pub timestamp: DateTime<Utc>,
    /// Entry severity
    pub level: LogLevel,
    /// Human-readable message
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.level,
            self.message
        )
    }
}

/// Thread-safe, append-only list of [`LogEntry`] values.
#[derive(Debug, Default)]
pub struct ExecutionLog {
    entries: RwLock<Vec<LogEntry>>,
}

impl ExecutionLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry at the given level.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => tracing::info!(target: "warden::log", "{message}"),
            LogLevel::Warn => tracing::warn!(target: "warden::log", "{message}"),
            LogLevel::Error => tracing::error!(target: "warden::log", "{message}"),
        }
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message,
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    /// Append an info entry.
    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    /// Append a warning entry.
    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    /// Append an error entry.
    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    /// Snapshot of all entries in append order.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of entries appended so far.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if nothing has been logged.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_keep_append_order() {
        let log = ExecutionLog::new();
        log.info("first");
        log.warn("second");
        log.error("third");

        let entries = log.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "first");
        assert_eq!(entries[1].level, LogLevel::Warn);
        assert_eq!(entries[2].level, LogLevel::Error);
        assert!(entries[0].timestamp <= entries[2].timestamp);
    }

    #[test]
    fn test_entry_display_format() {
        let log = ExecutionLog::new();
        log.error("boom");
        let rendered = log.entries()[0].to_string();
        assert!(rendered.starts_with('['));
        assert!(rendered.ends_with("] ERROR: boom"));
    }

    #[test]
    fn test_empty_log() {
        let log = ExecutionLog::new();
        assert!(log.is_empty());
        log.info("x");
        assert_eq!(log.len(), 1);
    }
}
