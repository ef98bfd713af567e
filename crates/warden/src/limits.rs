//! Resource limits for sandboxed execution

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sandbox::{ConsoleLevel, ConsoleLine};

/// Resource limits for one sandbox run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Maximum number of evaluation steps
    pub max_operations: u64,
    /// Maximum depth of nested function calls
    pub max_call_depth: usize,
    /// Maximum length of any single string, in bytes
    pub max_string_bytes: usize,
    /// Maximum number of elements in any single array or object
    pub max_collection_len: usize,
    /// Maximum captured console output in bytes
    pub max_output_bytes: usize,
    /// Wall-clock timeout
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Stack size of the execution thread
    pub stack_size_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_operations: 1_000_000,
            max_call_depth: 200,
            max_string_bytes: 1024 * 1024,      // 1 MB
            max_collection_len: 100_000,
            max_output_bytes: 64 * 1024,        // 64 KB console
            timeout: Duration::from_secs(5),    // 5 second wall clock
            stack_size_bytes: 32 * 1024 * 1024, // 32 MB
        }
    }
}

/// Helper for serializing Duration as milliseconds
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

const TRUNCATION_MARKER: &str = "... [output truncated] ...";

/// Console capture that stops accepting text past a byte limit
#[derive(Debug, Clone)]
pub(crate) struct LimitedBuffer {
    lines: Vec<ConsoleLine>,
    used: usize,
    limit: usize,
    truncated: bool,
}

impl LimitedBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            lines: Vec::new(),
            used: 0,
            limit,
            truncated: false,
        }
    }

    /// Append a line, cutting it at the limit. Returns false once truncated.
    pub(crate) fn push(&mut self, level: ConsoleLevel, text: String) -> bool {
        if self.truncated {
            return false;
        }

        let remaining = self.limit.saturating_sub(self.used);
        if text.len() <= remaining {
            self.used += text.len();
            self.lines.push(ConsoleLine { level, text });
            return true;
        }

        let mut cut = remaining;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut > 0 {
            self.lines.push(ConsoleLine {
                level,
                text: text[..cut].to_string(),
            });
        }
        self.lines.push(ConsoleLine {
            level: ConsoleLevel::Warn,
            text: TRUNCATION_MARKER.to_string(),
        });
        self.used = self.limit;
        self.truncated = true;
        false
    }

    pub(crate) fn was_truncated(&self) -> bool {
        self.truncated
    }

    pub(crate) fn into_lines(self) -> Vec<ConsoleLine> {
        self.lines
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== ResourceLimits Tests ====================

    #[test]
    fn test_default_limits() {
        let limits = ResourceLimits::default();

        assert_eq!(limits.max_operations, 1_000_000);
        assert_eq!(limits.max_call_depth, 200);
        assert_eq!(limits.max_string_bytes, 1024 * 1024);
        assert_eq!(limits.max_output_bytes, 64 * 1024);
        assert_eq!(limits.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_limits_serialization_format() {
        let limits = ResourceLimits {
            timeout: Duration::from_millis(2500),
            ..ResourceLimits::default()
        };

        let json = serde_json::to_string(&limits).unwrap();
        assert!(json.contains("\"timeout\":2500"));

        let back: ResourceLimits = serde_json::from_str(&json).unwrap();
        assert_eq!(back, limits);
    }

    #[test]
    fn test_partial_limits_use_defaults() {
        let limits: ResourceLimits = serde_json::from_str(r#"{"max_operations": 10}"#).unwrap();
        assert_eq!(limits.max_operations, 10);
        assert_eq!(limits.max_call_depth, 200);
    }

    // ==================== LimitedBuffer Tests ====================

    #[test]
    fn test_buffer_under_limit() {
        let mut buffer = LimitedBuffer::new(100);
        assert!(buffer.push(ConsoleLevel::Log, "hello".into()));
        assert!(buffer.push(ConsoleLevel::Error, "world".into()));
        assert!(!buffer.was_truncated());

        let lines = buffer.into_lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].level, ConsoleLevel::Error);
    }

    #[test]
    fn test_buffer_exact_boundary() {
        let mut buffer = LimitedBuffer::new(10);
        assert!(buffer.push(ConsoleLevel::Log, "12345".into()));
        assert!(buffer.push(ConsoleLevel::Log, "67890".into()));
        assert!(!buffer.was_truncated());

        assert!(!buffer.push(ConsoleLevel::Log, "x".into()));
        assert!(buffer.was_truncated());
    }

    #[test]
    fn test_buffer_truncates_and_marks() {
        let mut buffer = LimitedBuffer::new(5);
        assert!(!buffer.push(ConsoleLevel::Log, "hello world".into()));
        assert!(!buffer.push(ConsoleLevel::Log, "ignored".into()));

        let lines = buffer.into_lines();
        assert_eq!(lines[0].text, "hello");
        assert!(lines[1].text.contains("truncated"));
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn test_buffer_cuts_on_char_boundary() {
        let mut buffer = LimitedBuffer::new(2);
        buffer.push(ConsoleLevel::Log, "héllo".into());
        let lines = buffer.into_lines();
        assert_eq!(lines[0].text, "h");
    }

    #[test]
    fn test_zero_limit() {
        let mut buffer = LimitedBuffer::new(0);
        assert!(!buffer.push(ConsoleLevel::Log, "x".into()));
        let lines = buffer.into_lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].text.contains("truncated"));
    }
}
