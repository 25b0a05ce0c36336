//! Two-phase protocol backend (NDT7-style download then upload).
//!
//! The wire protocol lives behind [`ThroughputClient`]. The client starts a
//! phase and reports through a [`CallbackRegistry`]; this adapter turns
//! those callbacks into progress events and a [`PhaseOutcome`], bounding each
//! phase with its own timeout and cancellation token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{Backend, SessionContext};
use crate::config::{HttpConfig, ProtocolConfig};
use crate::session::error::SessionError;
use crate::session::model::{BackendKind, Measurement, Phase, PhaseOutcome};

/// Application-level sample reported by the throughput client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientResponse {
    /// Time since the phase started, in microseconds.
    pub elapsed_micros: u64,
    /// Bytes transferred since the phase started.
    pub num_bytes: u64,
}

impl ClientResponse {
    pub fn new(elapsed_micros: u64, num_bytes: u64) -> Self {
        Self {
            elapsed_micros,
            num_bytes,
        }
    }

    /// Mean throughput in megabits per second; zero before any time elapsed.
    pub fn mbps(&self) -> f64 {
        if self.elapsed_micros == 0 {
            return 0.0;
        }
        let elapsed_secs = self.elapsed_micros as f64 / 1_000_000.0;
        (self.num_bytes as f64 * 8.0 / elapsed_secs) / 1_000_000.0
    }

    /// Fraction of the nominal phase length elapsed. Not clamped: slow phases
    /// overshoot 1.0 before they finish, clamping happens on emission.
    pub fn progress(&self, nominal: Duration) -> f64 {
        self.elapsed_micros as f64 / nominal.as_micros().max(1) as f64
    }
}

enum PhaseSignal {
    Progress(ClientResponse),
    Measurement(Value),
    Finished {
        sample: Option<ClientResponse>,
        error: Option<String>,
    },
}

/// Callbacks handed to the client for one phase.
///
/// Calls after the phase has ended (timeout, cancellation, finish) are
/// silently dropped.
#[derive(Clone)]
pub struct CallbackRegistry {
    tx: mpsc::UnboundedSender<PhaseSignal>,
}

impl CallbackRegistry {
    /// Periodic client-side sample.
    pub fn on_progress(&self, sample: ClientResponse) {
        let _ = self.tx.send(PhaseSignal::Progress(sample));
    }

    /// Server-side measurement message; informational only.
    pub fn on_measurement(&self, measurement: Value) {
        let _ = self.tx.send(PhaseSignal::Measurement(measurement));
    }

    /// End of phase. `sample` carries the authoritative final figures.
    pub fn on_finished(&self, sample: Option<ClientResponse>, error: Option<String>) {
        let _ = self.tx.send(PhaseSignal::Finished { sample, error });
    }
}

/// Streaming download/upload throughput capability.
///
/// `begin_*` returns once the phase has been started; results arrive through
/// `callbacks`. Implementations must tear the connection down promptly when
/// `cancel` fires and should drop `callbacks` when they are done with it.
pub trait ThroughputClient: Send + Sync {
    fn begin_download(
        &self,
        url: &str,
        http: &HttpConfig,
        callbacks: CallbackRegistry,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;

    fn begin_upload(
        &self,
        url: &str,
        http: &HttpConfig,
        callbacks: CallbackRegistry,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Runs download then upload against the given endpoints.
pub struct ProtocolBackend {
    client: Arc<dyn ThroughputClient>,
    download_url: String,
    upload_url: String,
    phase_timeout: Duration,
    nominal_phase: Duration,
    http: HttpConfig,
}

impl ProtocolBackend {
    pub fn new(
        client: Arc<dyn ThroughputClient>,
        download_url: impl Into<String>,
        upload_url: impl Into<String>,
        config: &ProtocolConfig,
    ) -> Self {
        Self {
            client,
            download_url: download_url.into(),
            upload_url: upload_url.into(),
            phase_timeout: config.phase_timeout(),
            nominal_phase: config.nominal_phase(),
            http: config.http.clone(),
        }
    }

    async fn run_phase(&self, ctx: &SessionContext, phase: Phase) -> PhaseOutcome {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let callbacks = CallbackRegistry { tx };
        // Own token per phase: tearing down this phase leaves the next intact.
        let phase_token = ctx.cancel_token().child_token();

        let url = match phase {
            Phase::Download => self.download_url.as_str(),
            Phase::Upload => self.upload_url.as_str(),
        };
        info!(%phase, url, timeout_sec = self.phase_timeout.as_secs(), "starting protocol phase");

        let begun = match phase {
            Phase::Download => {
                self.client
                    .begin_download(url, &self.http, callbacks, phase_token.clone())
            }
            Phase::Upload => self
                .client
                .begin_upload(url, &self.http, callbacks, phase_token.clone()),
        };
        if let Err(e) = begun {
            warn!(%phase, error = %e, "protocol phase failed to start");
            return PhaseOutcome::failed(0.0, format!("{} phase failed to start: {}", phase.label(), e));
        }

        let deadline = tokio::time::sleep(self.phase_timeout);
        tokio::pin!(deadline);
        let mut last_mbps = 0.0;

        let outcome = loop {
            tokio::select! {
                // Cancel and deadline first: a client flooding progress keeps
                // the signal arm ready on every poll.
                biased;

                _ = ctx.cancel_token().cancelled() => {
                    debug!(%phase, "cancellation observed while waiting for phase");
                    break PhaseOutcome::failed(last_mbps, "cancelled");
                }

                _ = &mut deadline => {
                    warn!(%phase, last_mbps, "protocol phase timed out");
                    break PhaseOutcome::failed(last_mbps, format!("{} timeout", phase.label()));
                }

                signal = rx.recv() => match signal {
                    Some(PhaseSignal::Progress(sample)) => {
                        let mbps = sample.mbps();
                        last_mbps = mbps;
                        ctx.progress(phase, mbps, sample.progress(self.nominal_phase));
                    }
                    Some(PhaseSignal::Measurement(m)) => {
                        trace!(%phase, measurement = %m, "server measurement");
                    }
                    Some(PhaseSignal::Finished { sample, error }) => {
                        let final_mbps = sample.map(|s| s.mbps()).unwrap_or(last_mbps);
                        ctx.progress(phase, final_mbps, 1.0);
                        break match error {
                            None => PhaseOutcome::ok(final_mbps),
                            Some(e) => PhaseOutcome::failed(final_mbps, e),
                        };
                    }
                    None => {
                        break PhaseOutcome::failed(
                            last_mbps,
                            format!("{} phase ended without a result", phase.label()),
                        );
                    }
                },
            }
        };

        phase_token.cancel();
        info!(%phase, mbps = outcome.mbps, error = ?outcome.error, "protocol phase finished");
        outcome
    }
}

fn phase_error(phase: Phase, outcome: &PhaseOutcome, message: &str) -> SessionError {
    SessionError::native(message).with_details(json!({
        "phase": phase.as_str(),
        "mbps": outcome.mbps,
    }))
}

#[async_trait]
impl Backend for ProtocolBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Protocol
    }

    async fn run(&self, ctx: &SessionContext) -> Result<Measurement, SessionError> {
        let download = self.run_phase(ctx, Phase::Download).await;
        if ctx.is_cancelled() {
            return Err(SessionError::cancelled());
        }
        if let Some(e) = &download.error {
            return Err(phase_error(Phase::Download, &download, e));
        }

        let upload = self.run_phase(ctx, Phase::Upload).await;
        if ctx.is_cancelled() {
            return Err(SessionError::cancelled());
        }
        if let Some(e) = &upload.error {
            return Err(phase_error(Phase::Upload, &upload, e));
        }

        let server_info = url::Url::parse(&self.download_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));

        Ok(Measurement {
            download_mbps: download.mbps,
            upload_mbps: upload.mbps,
            server_info,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
