//! Telemetry event model.
//!
//! Events are created when the runner signals a lifecycle transition and are
//! immutable once handed to the uploader. On the wire they are internally
//! tagged by `event_type`:
//!
//! ```json
//! {"event_type": "TestRunFinished", "test_run": {"uuid": "...", "result": "failed", ...}}
//! ```

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Messages that read like a failed assertion rather than a crash.
static ASSERTION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\bassert(ion)?(error)?\b|\bexpected\b.*\b(to|but)\b)")
        .expect("assertion pattern is a valid regex")
});

/// Outcome of a test or hook run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Passed,
    Failed,
    Skipped,
}

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureType {
    AssertionError,
    UnhandledError,
}

/// Failure detail attached to a finished test or hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<String>,
    pub failure_type: FailureType,
}

impl Failure {
    /// Builds a failure, classifying it from the message text.
    ///
    /// # Example
    ///
    /// ```
    /// use testlens::event::{Failure, FailureType};
    ///
    /// let failure = Failure::classify("AssertionError: expected 1 to equal 2", None);
    /// assert_eq!(failure.failure_type, FailureType::AssertionError);
    ///
    /// let failure = Failure::classify("TypeError: x is undefined", None);
    /// assert_eq!(failure.failure_type, FailureType::UnhandledError);
    /// ```
    pub fn classify(message: impl Into<String>, backtrace: Option<String>) -> Self {
        let message = message.into();
        let is_assertion = ASSERTION_PATTERN.is_match(&message);

        Self {
            message,
            backtrace,
            failure_type: if is_assertion {
                FailureType::AssertionError
            } else {
                FailureType::UnhandledError
            },
        }
    }
}

/// Kind of a log entry inside a `LogCreated` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogKind {
    TestLog,
    Http,
    TestScreenshot,
}

/// One log line, HTTP trace or screenshot reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub kind: LogKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_run_uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_run_uuid: Option<Uuid>,
    pub payload: Value,
}

impl LogEntry {
    pub fn new(kind: LogKind, payload: Value) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            test_run_uuid: None,
            hook_run_uuid: None,
            payload,
        }
    }
}

/// A single test execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRun {
    pub uuid: Uuid,
    pub name: String,
    /// Enclosing suites, outermost first.
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub result: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

/// A single hook execution (before/after each/all).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookRun {
    pub uuid: Uuid,
    pub hook_type: String,
    pub name: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_run_uuid: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub result: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

/// A telemetry event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum Event {
    TestRunStarted { test_run: TestRun },
    TestRunFinished { test_run: TestRun },
    TestRunSkipped { test_run: TestRun },
    HookRunStarted { hook_run: HookRun },
    HookRunFinished { hook_run: HookRun },
    LogCreated { logs: Vec<LogEntry> },
    /// Links a remote browser/device session to a test run. Never batched.
    SessionCreated {
        test_run_uuid: Uuid,
        integration: Value,
    },
}

/// Discriminant of [`Event`], used for batching decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TestRunStarted,
    TestRunFinished,
    TestRunSkipped,
    HookRunStarted,
    HookRunFinished,
    LogCreated,
    SessionCreated,
}

impl EventKind {
    /// Kinds that travel through the batching queue.
    pub fn is_batchable(self) -> bool {
        !matches!(self, EventKind::SessionCreated)
    }
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::TestRunStarted { .. } => EventKind::TestRunStarted,
            Event::TestRunFinished { .. } => EventKind::TestRunFinished,
            Event::TestRunSkipped { .. } => EventKind::TestRunSkipped,
            Event::HookRunStarted { .. } => EventKind::HookRunStarted,
            Event::HookRunFinished { .. } => EventKind::HookRunFinished,
            Event::LogCreated { .. } => EventKind::LogCreated,
            Event::SessionCreated { .. } => EventKind::SessionCreated,
        }
    }

    /// A `LogCreated` event whose sole entry is a screenshot.
    pub fn is_screenshot(&self) -> bool {
        match self {
            Event::LogCreated { logs } => {
                logs.len() == 1 && logs[0].kind == LogKind::TestScreenshot
            }
            _ => false,
        }
    }

    /// The run this event describes, when it describes one.
    pub fn uuid(&self) -> Option<Uuid> {
        match self {
            Event::TestRunStarted { test_run }
            | Event::TestRunFinished { test_run }
            | Event::TestRunSkipped { test_run } => Some(test_run.uuid),
            Event::HookRunStarted { hook_run } | Event::HookRunFinished { hook_run } => {
                Some(hook_run.uuid)
            }
            Event::SessionCreated { test_run_uuid, .. } => Some(*test_run_uuid),
            Event::LogCreated { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_test_run() -> TestRun {
        TestRun {
            uuid: Uuid::new_v4(),
            name: "adds numbers".to_string(),
            scopes: vec!["math".to_string()],
            file_name: Some("tests/math.spec.ts".to_string()),
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            result: RunStatus::Pending,
            failure: None,
        }
    }

    #[test]
    fn test_event_tagged_serialization() {
        let event = Event::TestRunStarted {
            test_run: sample_test_run(),
        };
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["event_type"], "TestRunStarted");
        assert_eq!(value["test_run"]["result"], "pending");
        assert!(value["test_run"].get("failure").is_none());
    }

    #[test]
    fn test_log_kind_wire_names() {
        assert_eq!(serde_json::to_value(LogKind::TestLog).unwrap(), "TEST_LOG");
        assert_eq!(serde_json::to_value(LogKind::Http).unwrap(), "HTTP");
        assert_eq!(
            serde_json::to_value(LogKind::TestScreenshot).unwrap(),
            "TEST_SCREENSHOT"
        );
    }

    #[test]
    fn test_is_screenshot_requires_single_entry() {
        let single = Event::LogCreated {
            logs: vec![LogEntry::new(LogKind::TestScreenshot, json!("base64"))],
        };
        assert!(single.is_screenshot());

        let mixed = Event::LogCreated {
            logs: vec![
                LogEntry::new(LogKind::TestScreenshot, json!("base64")),
                LogEntry::new(LogKind::TestLog, json!("hello")),
            ],
        };
        assert!(!mixed.is_screenshot());

        let log = Event::LogCreated {
            logs: vec![LogEntry::new(LogKind::TestLog, json!("hello"))],
        };
        assert!(!log.is_screenshot());
    }

    #[test]
    fn test_batchable_kinds() {
        assert!(EventKind::LogCreated.is_batchable());
        assert!(EventKind::HookRunFinished.is_batchable());
        assert!(!EventKind::SessionCreated.is_batchable());
    }

    #[test]
    fn test_classify_failures() {
        let assertion = Failure::classify("expected 'a' to equal 'b'", None);
        assert_eq!(assertion.failure_type, FailureType::AssertionError);

        let crash = Failure::classify("ReferenceError: foo is not defined", Some("at x".into()));
        assert_eq!(crash.failure_type, FailureType::UnhandledError);
        assert_eq!(crash.backtrace.as_deref(), Some("at x"));
    }

    #[test]
    fn test_assertion_pattern_compiles() {
        // forcing the lazy pattern panics on an invalid regex
        assert!(ASSERTION_PATTERN.is_match("AssertionError: boom"));
        assert!(ASSERTION_PATTERN.is_match("Expected 3 but got 4"));
        assert!(!ASSERTION_PATTERN.is_match("TypeError: x is undefined"));
    }

    #[test]
    fn test_deserialize_from_wire() {
        let event: Event = serde_json::from_value(json!({
            "event_type": "LogCreated",
            "logs": [{
                "kind": "HTTP",
                "timestamp": "2024-01-01T00:00:00Z",
                "payload": {"url": "https://api.test", "status": 200}
            }]
        }))
        .unwrap();

        assert_eq!(event.kind(), EventKind::LogCreated);
        assert_eq!(event.uuid(), None);
    }
}
