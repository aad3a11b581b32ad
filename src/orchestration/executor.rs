//! Pluggable step executor and error classification.
//!
//! An executor runs one step and reports the outcome as data: ordinary
//! failures come back as an `ExecutionResult` with an error, never as a
//! panic. The error may carry an explicit `ErrorKind`; when it does not, the
//! message is classified against a fixed list of transient substrings.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::node::Payload;
use crate::core::task::TaskStep;

/// Substrings (matched case-insensitively) that mark an error as transient.
pub const TRANSIENT_ERROR_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "rate limit",
    "too many requests",
    "429",
    "502",
    "503",
    "504",
    "service unavailable",
    "temporarily unavailable",
    "connection",
];

/// Whether a failure is worth retrying with the same inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
}

/// A step failure as reported by an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub message: String,
    /// Explicit classification. `None` falls back to message matching.
    #[serde(default)]
    pub kind: Option<ErrorKind>,
}

impl StepError {
    /// An error the engine classifies from its message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: Some(ErrorKind::Transient),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: Some(ErrorKind::Permanent),
        }
    }

    /// The explicit kind if set, else the message classification.
    pub fn classify(&self, extra_patterns: &[String]) -> ErrorKind {
        match self.kind {
            Some(kind) => kind,
            None if is_transient_error(&self.message, extra_patterns) => ErrorKind::Transient,
            None => ErrorKind::Permanent,
        }
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub output: Option<Payload>,
    #[serde(default)]
    pub error: Option<StepError>,
    #[serde(default)]
    pub execution_time_ms: u64,
}

impl ExecutionResult {
    pub fn success(output: Payload, execution_time_ms: u64) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            execution_time_ms,
        }
    }

    pub fn failure(error: StepError, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error),
            execution_time_ms,
        }
    }
}

/// Runs a single step.
///
/// Implementations should watch `cancel` and return promptly once it fires;
/// the engine also stops awaiting the dispatch on cancellation, so a result
/// that arrives afterwards is discarded.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, step: &TaskStep, cancel: CancellationToken) -> ExecutionResult;
}

/// Case-insensitive substring match against `TRANSIENT_ERROR_PATTERNS` and
/// any configured extras.
pub fn is_transient_error(message: &str, extra_patterns: &[String]) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_ERROR_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
        || extra_patterns
            .iter()
            .any(|pattern| !pattern.is_empty() && lower.contains(&pattern.to_lowercase()))
}
