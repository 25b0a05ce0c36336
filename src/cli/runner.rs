//! CLI provider process wrapper -- spawn, capture merged output, enforce timeouts.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::assets::CliCommand;
use crate::config::CliConfig;
use crate::session::error::{excerpt, ErrorCode, SessionError};

/// Runs one provider command at a time.
#[derive(Debug, Clone)]
pub struct CliRunner {
    /// Limit on the process lifetime.
    timeout: Duration,
    /// Bound on output readback once the process is gone, so a pipe held open
    /// by a grandchild cannot stall timeout handling.
    output_grace: Duration,
    excerpt_chars: usize,
}

impl CliRunner {
    pub fn new(timeout: Duration, output_grace: Duration, excerpt_chars: usize) -> Self {
        Self {
            timeout,
            output_grace,
            excerpt_chars,
        }
    }

    pub fn from_config(config: &CliConfig) -> Self {
        Self::new(config.timeout(), config.output_grace(), config.excerpt_chars)
    }

    pub fn excerpt_chars(&self) -> usize {
        self.excerpt_chars
    }

    /// Run `command` to completion and return its merged stdout/stderr.
    ///
    /// The process is killed outright on timeout or when `cancel` fires.
    pub async fn execute(
        &self,
        command: &CliCommand,
        cancel: &CancellationToken,
    ) -> Result<String, SessionError> {
        let command_display = command.display();
        info!(
            provider = command.provider.as_str(),
            command = command_display.as_str(),
            timeout_sec = self.timeout.as_secs(),
            "starting CLI provider"
        );

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SessionError::new(
                    ErrorCode::BinaryNotExecutable,
                    format!("Failed to start CLI process: {}", e),
                )
                .with_details(json!({ "command": command_display, "cause": e.to_string() }))
            })?;

        let capture = OutputCapture::start(&mut child);

        let waited = tokio::select! {
            biased;

            _ = cancel.cancelled() => None,

            res = tokio::time::timeout(self.timeout, child.wait()) => Some(res),
        };

        match waited {
            None => {
                debug!(provider = command.provider.as_str(), "cancelled, killing CLI process");
                force_kill(&mut child).await;
                capture.abort();
                Err(SessionError::cancelled())
            }
            Some(Err(_elapsed)) => {
                warn!(
                    provider = command.provider.as_str(),
                    timeout_sec = self.timeout.as_secs(),
                    "CLI provider timed out, killing"
                );
                force_kill(&mut child).await;
                let output = capture.finish(self.output_grace).await;
                Err(
                    SessionError::new(ErrorCode::CliTimeout, "Speedtest CLI timed out").with_details(
                        json!({
                            "command": command_display,
                            "output": excerpt(&output, self.excerpt_chars),
                        }),
                    ),
                )
            }
            Some(Ok(Err(e))) => {
                force_kill(&mut child).await;
                capture.abort();
                Err(SessionError::new(
                    ErrorCode::CliFailed,
                    format!("failed to wait for CLI process: {}", e),
                )
                .with_details(json!({ "command": command_display })))
            }
            Some(Ok(Ok(status))) => {
                let output = capture.finish(self.output_grace).await;
                info!(
                    provider = command.provider.as_str(),
                    exit_code = status.code(),
                    output_bytes = output.len(),
                    "CLI provider exited"
                );
                if status.success() {
                    return Ok(output);
                }
                let summary = excerpt(&output, self.excerpt_chars);
                let code = status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                Err(SessionError::new(
                    ErrorCode::CliFailed,
                    format!("CLI exited with {}: {}", code, summary),
                )
                .with_details(json!({
                    "command": command_display,
                    "exitCode": status.code(),
                    "output": summary,
                })))
            }
        }
    }
}

async fn force_kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill CLI process");
    }
}

/// Collects stdout and stderr into one buffer in arrival order.
struct OutputCapture {
    buf: Arc<Mutex<Vec<u8>>>,
    readers: Vec<JoinHandle<()>>,
}

impl OutputCapture {
    fn start(child: &mut Child) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, buf.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, buf.clone()));
        }
        Self { buf, readers }
    }

    /// Wait up to `grace` for both streams to hit EOF, then return whatever
    /// was captured.
    async fn finish(self, grace: Duration) -> String {
        let mut readers = self.readers;
        let drained = tokio::time::timeout(grace, async {
            for reader in readers.iter_mut() {
                let _ = reader.await;
            }
        })
        .await;
        if drained.is_err() {
            debug!(grace_ms = grace.as_millis() as u64, "output readback timed out");
        }
        for reader in &readers {
            reader.abort();
        }
        let bytes = match self.buf.lock() {
            Ok(buf) => buf.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn abort(self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

fn spawn_reader<R>(mut reader: R, buf: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut out) = buf.lock() {
                        out.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
