//! Value types describing a measurement session and what it reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{ErrorCode, SessionError};

/// One directional measurement within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Download,
    Upload,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Download => "download",
            Phase::Upload => "upload",
        }
    }

    /// Capitalized label used in phase error messages ("Download timeout").
    pub fn label(&self) -> &'static str {
        match self {
            Phase::Download => "Download",
            Phase::Upload => "Upload",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// NDT7 WebSocket throughput test.
    Ndt7,
    /// Proprietary SDK integration point, served by the protocol flow.
    Nperf,
    /// Bundled or installed speed-test command line tools.
    Cli,
}

impl EngineKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ndt7" => Some(EngineKind::Ndt7),
            "nperf" => Some(EngineKind::Nperf),
            "cli" => Some(EngineKind::Cli),
            _ => None,
        }
    }

    pub fn backend(&self) -> BackendKind {
        match self {
            EngineKind::Ndt7 | EngineKind::Nperf => BackendKind::Protocol,
            EngineKind::Cli => BackendKind::Cli,
        }
    }
}

/// Strategy that executes a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Protocol,
    Cli,
}

/// Lifecycle state of a measurement session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Running,
    Cancelling,
    Completed,
    Failed,
}

/// A `start` command as received from the UI collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub engine: String,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub upload_url: Option<String>,
    #[serde(default)]
    pub provider_order: Option<Vec<String>>,
}

/// Live progress for the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub mbps: f64,
    pub progress: f64,
}

impl ProgressEvent {
    /// Build an event from backend-reported values. `progress` is clamped to
    /// `[0, 1]`; a negative or non-finite `mbps` is reported as zero.
    pub fn new(phase: Phase, mbps: f64, progress: f64) -> Self {
        let progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 1.0)
        };
        let mbps = if mbps.is_finite() && mbps > 0.0 { mbps } else { 0.0 };
        Self {
            phase,
            mbps,
            progress,
        }
    }
}

/// Outcome of a single protocol phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseOutcome {
    pub mbps: f64,
    pub error: Option<String>,
}

impl PhaseOutcome {
    pub fn ok(mbps: f64) -> Self {
        Self { mbps, error: None }
    }

    pub fn failed(mbps: f64, error: impl Into<String>) -> Self {
        Self {
            mbps,
            error: Some(error.into()),
        }
    }
}

/// Normalized successful measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub server_info: Option<String>,
}

/// The single success-or-error outcome that ends a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TerminalResult {
    Success(Measurement),
    Error(SessionError),
}

impl TerminalResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TerminalResult::Success(_))
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            TerminalResult::Success(_) => None,
            TerminalResult::Error(e) => Some(e.code),
        }
    }
}

impl From<Result<Measurement, SessionError>> for TerminalResult {
    fn from(result: Result<Measurement, SessionError>) -> Self {
        match result {
            Ok(m) => TerminalResult::Success(m),
            Err(e) => TerminalResult::Error(e),
        }
    }
}

/// Everything delivered on a session's event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum SessionEvent {
    Progress(ProgressEvent),
    Finished(TerminalResult),
}

/// Read-only view of the active session slot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub engine: EngineKind,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
}
