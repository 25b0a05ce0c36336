//! speedcheck -- speed test orchestration core.
//!
//! Runs one measurement session at a time against either a two-phase
//! throughput protocol (NDT7-style download then upload) or an ordered list of
//! command line speed test providers, streaming progress and exactly one
//! terminal result per session.

pub mod backend;
pub mod bridge;
pub mod cli;
pub mod config;
pub mod report;
pub mod session;

pub use config::SpeedcheckConfig;
pub use session::error::{ErrorCode, SessionError};
pub use session::model::{
    Measurement, Phase, ProgressEvent, SessionEvent, StartRequest, TerminalResult,
};
pub use session::{Orchestrator, SessionHandle};
