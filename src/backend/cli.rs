//! CLI provider backend: ordered fallback across speed test command line tools.

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use super::{Backend, SessionContext};
use crate::cli::{parser, BinaryResolver, CliRunner};
use crate::session::error::{ErrorCode, SessionError};
use crate::session::model::{BackendKind, Measurement, Phase};

/// Tries each resolved provider in order until one yields a usable result.
pub struct CliBackend {
    resolver: std::sync::Arc<BinaryResolver>,
    runner: CliRunner,
    provider_order: Vec<String>,
}

impl CliBackend {
    pub fn new(
        resolver: std::sync::Arc<BinaryResolver>,
        runner: CliRunner,
        provider_order: Vec<String>,
    ) -> Self {
        Self {
            resolver,
            runner,
            provider_order,
        }
    }

    pub fn provider_order(&self) -> &[String] {
        &self.provider_order
    }
}

#[async_trait]
impl Backend for CliBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cli
    }

    async fn run(&self, ctx: &SessionContext) -> Result<Measurement, SessionError> {
        ctx.progress(Phase::Download, 0.0, 0.05);
        if ctx.is_cancelled() {
            return Err(SessionError::cancelled());
        }

        let candidates = self.resolver.candidates(&self.provider_order);
        if candidates.is_empty() {
            return Err(SessionError::new(
                ErrorCode::BinaryMissing,
                format!(
                    "No CLI binary available for providers: {}",
                    self.provider_order.join(", ")
                ),
            )
            .with_details(json!({
                "providerOrder": self.provider_order,
                "supportedAbis": self.resolver.abis(),
            })));
        }

        let total = candidates.len();
        let mut last_error: Option<SessionError> = None;

        for (index, candidate) in candidates.iter().enumerate() {
            if ctx.is_cancelled() {
                return Err(SessionError::cancelled());
            }

            // Coarse progress: position in the fallback list.
            let fraction = 0.2 + 0.6 * (index as f64 / total as f64);
            ctx.progress(Phase::Download, 0.0, fraction);

            let output = match self.runner.execute(&candidate.command, ctx.cancel_token()).await {
                Ok(output) => output,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(
                        provider = candidate.meta.id,
                        code = %e.code,
                        error = %e.message,
                        "CLI provider failed, trying next"
                    );
                    last_error = Some(e);
                    continue;
                }
            };

            match parser::parse(candidate.meta.shape, &output, self.runner.excerpt_chars()) {
                Ok(measurement) => {
                    info!(
                        provider = candidate.meta.id,
                        download_mbps = measurement.download_mbps,
                        upload_mbps = measurement.upload_mbps,
                        "CLI provider succeeded"
                    );
                    ctx.progress(Phase::Upload, measurement.upload_mbps, 1.0);
                    return Ok(measurement);
                }
                Err(e) => {
                    warn!(
                        provider = candidate.meta.id,
                        error = %e.message,
                        "CLI output unusable, trying next"
                    );
                    last_error = Some(e);
                }
            }
        }

        if ctx.is_cancelled() {
            return Err(SessionError::cancelled());
        }
        Err(last_error.unwrap_or_else(|| {
            SessionError::new(ErrorCode::CliFailed, "All CLI providers failed")
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
