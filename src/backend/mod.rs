//! Backend strategies a session can run on.
//!
//! A backend is selected once when the session is created and driven to a
//! single result. Progress goes out through the [`SessionContext`]; the
//! session's cancellation token travels with it.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::session::error::SessionError;
use crate::session::model::{BackendKind, Measurement, Phase, ProgressEvent, SessionEvent};

pub mod cli;
pub mod protocol;

pub use cli::CliBackend;
pub use protocol::{
    CallbackRegistry, ClientResponse, ProtocolBackend, ThroughputClient,
};

/// Per-session handles passed to a backend run.
#[derive(Clone)]
pub struct SessionContext {
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionContext {
    pub fn new(cancel: CancellationToken, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { cancel, events }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Emit a progress event, clamping `progress` to `[0, 1]`.
    pub fn progress(&self, phase: Phase, mbps: f64, progress: f64) {
        // The receiver going away only means nobody is listening anymore.
        let _ = self
            .events
            .send(SessionEvent::Progress(ProgressEvent::new(phase, mbps, progress)));
    }
}

/// A measurement strategy.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Run the whole measurement. Cancellation is observed through
    /// `ctx.cancel_token()`; the orchestrator re-checks it afterwards.
    async fn run(&self, ctx: &SessionContext) -> Result<Measurement, SessionError>;
}
