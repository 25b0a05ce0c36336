//! Session orchestrator.
//!
//! Accepts one `start` at a time, builds the backend for the requested engine,
//! runs it on a dedicated worker task and delivers progress followed by exactly
//! one terminal result on the session's event channel.

pub mod error;
pub mod model;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backend::{Backend, CliBackend, ProtocolBackend, SessionContext, ThroughputClient};
use crate::cli::{provider, BinaryResolver, CliRunner, DirAssetStore};
use crate::config::SpeedcheckConfig;
use error::{ErrorCode, SessionError};
use model::{
    EngineKind, ProgressEvent, SessionEvent, SessionSnapshot, SessionState, StartRequest,
    TerminalResult,
};

// ---------------------------------------------------------------------------
// ActiveSession
// ---------------------------------------------------------------------------

/// The occupant of the single-flight slot.
struct ActiveSession {
    id: Uuid,
    engine: EngineKind,
    state: SessionState,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl ActiveSession {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            engine: self.engine,
            state: self.state,
            started_at: self.started_at,
        }
    }
}

type Slot = Arc<Mutex<Option<ActiveSession>>>;

fn lock(slot: &Slot) -> MutexGuard<'_, Option<ActiveSession>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// SessionHandle
// ---------------------------------------------------------------------------

/// Caller's end of an accepted session.
///
/// Events arrive in emission order; the last one is always
/// [`SessionEvent::Finished`], after which the channel closes.
pub struct SessionHandle {
    id: Uuid,
    engine: EngineKind,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    /// Next event, or `None` once the terminal result has been consumed.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Wait for the terminal result, discarding progress.
    pub async fn wait(self) -> TerminalResult {
        self.wait_with(|_| {}).await
    }

    /// Wait for the terminal result, handing each progress event to `on_progress`.
    pub async fn wait_with(mut self, mut on_progress: impl FnMut(ProgressEvent)) -> TerminalResult {
        while let Some(event) = self.events.recv().await {
            match event {
                SessionEvent::Progress(p) => on_progress(p),
                SessionEvent::Finished(result) => return result,
            }
        }
        TerminalResult::Error(SessionError::native("Session ended without a result"))
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Owns the session slot and the collaborators backends are built from.
pub struct Orchestrator {
    config: SpeedcheckConfig,
    resolver: Arc<BinaryResolver>,
    protocol_client: Option<Arc<dyn ThroughputClient>>,
    slot: Slot,
}

impl Orchestrator {
    /// Build an orchestrator with a directory asset store from `config.cli`.
    /// No protocol client is installed: `ndt7`/`nperf` are rejected until one
    /// is added with [`Orchestrator::with_protocol_client`].
    pub fn new(config: SpeedcheckConfig) -> Self {
        let resolver = BinaryResolver::new(
            Box::new(DirAssetStore::new(config.cli.asset_dir.clone())),
            config.cli.bin_dir.clone(),
            config.cli.supported_abis.clone(),
        );
        Self {
            config,
            resolver: Arc::new(resolver),
            protocol_client: None,
            slot: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_resolver(mut self, resolver: BinaryResolver) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn with_protocol_client(mut self, client: Arc<dyn ThroughputClient>) -> Self {
        self.protocol_client = Some(client);
        self
    }

    pub fn config(&self) -> &SpeedcheckConfig {
        &self.config
    }

    /// Validate `request` and launch a session.
    ///
    /// Rejections (`already_running`, `unsupported_engine`, `invalid_args`)
    /// happen here, before any work starts. Must be called from within a
    /// Tokio runtime.
    pub fn start(&self, request: StartRequest) -> Result<SessionHandle, SessionError> {
        let mut slot = lock(&self.slot);
        if let Some(active) = slot.as_ref() {
            info!(active = %active.id, "start rejected: session already running");
            return Err(SessionError::already_running());
        }

        let engine = EngineKind::parse(&request.engine).ok_or_else(|| {
            SessionError::new(
                ErrorCode::UnsupportedEngine,
                "Selected engine is not implemented on native layer",
            )
        })?;
        let backend = self.build_backend(engine, request)?;

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        *slot = Some(ActiveSession {
            id,
            engine,
            state: SessionState::Running,
            started_at: Utc::now(),
            cancel: cancel.clone(),
        });
        drop(slot);

        info!(session_id = %id, ?engine, backend = ?backend.kind(), "session started");

        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = SessionContext::new(cancel, tx.clone());
        tokio::spawn(run_session(self.slot.clone(), id, backend, ctx, tx));

        Ok(SessionHandle {
            id,
            engine,
            events: rx,
        })
    }

    /// Request cancellation of the running session. Idempotent; returns
    /// whether a session was active.
    pub fn cancel(&self) -> bool {
        let mut slot = lock(&self.slot);
        match slot.as_mut() {
            Some(active) => {
                if active.state == SessionState::Running {
                    info!(session_id = %active.id, "cancelling session");
                    active.state = SessionState::Cancelling;
                }
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Snapshot of the active session, if any.
    pub fn status(&self) -> Option<SessionSnapshot> {
        lock(&self.slot).as_ref().map(ActiveSession::snapshot)
    }

    pub fn state(&self) -> SessionState {
        lock(&self.slot)
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(SessionState::Idle)
    }

    fn build_backend(
        &self,
        engine: EngineKind,
        request: StartRequest,
    ) -> Result<Box<dyn Backend>, SessionError> {
        match engine {
            EngineKind::Ndt7 | EngineKind::Nperf => {
                let client = self.protocol_client.clone().ok_or_else(|| {
                    SessionError::new(
                        ErrorCode::UnsupportedEngine,
                        "No protocol client is available for this engine",
                    )
                })?;
                let (Some(download_url), Some(upload_url)) =
                    (non_blank(request.download_url), non_blank(request.upload_url))
                else {
                    return Err(SessionError::new(
                        ErrorCode::InvalidArgs,
                        "downloadUrl and uploadUrl are required",
                    ));
                };
                Ok(Box::new(ProtocolBackend::new(
                    client,
                    download_url,
                    upload_url,
                    &self.config.protocol,
                )))
            }
            EngineKind::Cli => {
                let order = provider::normalize_order(
                    request.provider_order.as_deref(),
                    &self.config.cli.default_provider,
                );
                Ok(Box::new(CliBackend::new(
                    self.resolver.clone(),
                    CliRunner::from_config(&self.config.cli),
                    order,
                )))
            }
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Worker body: run the backend, settle the outcome, free the slot, deliver.
async fn run_session(
    slot: Slot,
    id: Uuid,
    backend: Box<dyn Backend>,
    ctx: SessionContext,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let started = Instant::now();

    let worker_ctx = ctx.clone();
    let joined = tokio::spawn(async move { backend.run(&worker_ctx).await }).await;
    let result = match joined {
        Ok(result) => result,
        Err(e) => {
            error!(session_id = %id, error = %e, "backend task failed");
            Err(SessionError::native("Unexpected error"))
        }
    };

    // Cancellation observed here wins over whatever the backend reported.
    let result = if ctx.is_cancelled() {
        Err(SessionError::cancelled())
    } else {
        result
    };
    drop(ctx);

    let terminal = TerminalResult::from(result);
    let final_state = if terminal.is_success() {
        SessionState::Completed
    } else {
        SessionState::Failed
    };

    // Free the slot before delivering so a caller that has seen the result
    // can start again immediately.
    {
        let mut guard = lock(&slot);
        if guard.as_ref().map(|s| s.id) == Some(id) {
            *guard = None;
        }
    }

    match &terminal {
        TerminalResult::Success(m) => info!(
            session_id = %id,
            state = ?final_state,
            download_mbps = m.download_mbps,
            upload_mbps = m.upload_mbps,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "session finished"
        ),
        TerminalResult::Error(e) => warn!(
            session_id = %id,
            state = ?final_state,
            code = %e.code,
            error = %e.message,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "session finished"
        ),
    }

    let _ = events.send(SessionEvent::Finished(terminal));
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
