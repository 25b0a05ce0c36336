//! Error taxonomy shared by every backend and the orchestrator.
//!
//! Every failure a caller can observe is a [`SessionError`]: a stable
//! machine-readable [`ErrorCode`], a human-readable message, and optional
//! structured details (command line, output excerpt, provider order, ...).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Stable error codes reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// A session is already running on this orchestrator.
    AlreadyRunning,
    /// Required start arguments are missing or blank.
    InvalidArgs,
    /// The requested engine is not available.
    UnsupportedEngine,
    /// The user aborted the session.
    Cancelled,
    /// The protocol backend failed or a phase timed out.
    NativeTestError,
    /// No usable CLI binary for any provider in the order.
    BinaryMissing,
    /// A CLI binary exists but could not be started.
    BinaryNotExecutable,
    /// A CLI process did not exit within its time limit.
    CliTimeout,
    /// A CLI process exited with a non-zero status.
    CliFailed,
    /// CLI output did not contain a usable result.
    JsonParseFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AlreadyRunning => "already_running",
            ErrorCode::InvalidArgs => "invalid_args",
            ErrorCode::UnsupportedEngine => "unsupported_engine",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::NativeTestError => "native_test_error",
            ErrorCode::BinaryMissing => "binary_missing",
            ErrorCode::BinaryNotExecutable => "binary_not_executable",
            ErrorCode::CliTimeout => "cli_timeout",
            ErrorCode::CliFailed => "cli_failed",
            ErrorCode::JsonParseFailed => "json_parse_failed",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured session failure.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct SessionError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl SessionError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Attach structured details to the error.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn already_running() -> Self {
        Self::new(ErrorCode::AlreadyRunning, "A speed test is already running")
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "Speed test cancelled")
    }

    pub fn native(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NativeTestError, message)
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::Cancelled
    }
}

/// Replace control characters with spaces, trim, and cap the result at `max_chars`
/// characters so output attached to error details stays bounded.
pub fn excerpt(output: &str, max_chars: usize) -> String {
    let normalized: String = output
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    normalized.trim().chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCode::BinaryNotExecutable).unwrap();
        assert_eq!(json, "\"binary_not_executable\"");
        assert_eq!(ErrorCode::JsonParseFailed.to_string(), "json_parse_failed");
    }

    #[test]
    fn test_session_error_skips_empty_details() {
        let err = SessionError::cancelled();
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["code"], "cancelled");
        assert!(value.get("details").is_none());
        assert_eq!(err.to_string(), "cancelled: Speed test cancelled");
    }

    #[test]
    fn test_excerpt_normalizes_and_truncates() {
        let raw = format!("  line one\r\nline two\n{}", "x".repeat(500));
        let out = excerpt(&raw, 400);
        assert!(out.starts_with("line one  line two"));
        assert!(!out.contains('\n'));
        assert_eq!(out.chars().count(), 400);
    }

    #[test]
    fn test_excerpt_replaces_tabs_and_escapes() {
        let raw = "\x1b[32mok\x1b[0m\tdone\u{7f}";
        let out = excerpt(raw, 400);
        assert!(!out.chars().any(char::is_control), "{:?}", out);
        assert_eq!(out, "[32mok [0m done");
    }

    #[test]
    fn test_excerpt_short_input_untouched() {
        assert_eq!(excerpt("ok\n", 400), "ok");
    }
}
