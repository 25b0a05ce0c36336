//! Line-delimited JSON bridge between a UI process and the orchestrator.
//!
//! Commands arrive one JSON object per line (`{"method":"start",...}`,
//! `{"method":"cancel"}`, `{"method":"status"}`). Responses and session events
//! leave one JSON object per line. A single writer task owns the output, so
//! events from concurrent sources are never interleaved mid-line.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::session::error::SessionError;
use crate::session::model::{
    ProgressEvent, SessionEvent, SessionSnapshot, StartRequest, TerminalResult,
};
use crate::session::Orchestrator;

/// Inbound command.
#[derive(Debug, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum BridgeCommand {
    #[serde(alias = "startTest")]
    Start(StartRequest),
    #[serde(alias = "cancelTest")]
    Cancel,
    Status,
}

/// Outbound message.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum BridgeEvent {
    #[serde(rename_all = "camelCase")]
    Accepted { session_id: Uuid },
    Rejected(SessionError),
    Progress(ProgressEvent),
    Finished(TerminalResult),
    CancelAck { active: bool },
    Status { session: Option<SessionSnapshot> },
    Invalid { message: String },
}

impl From<SessionEvent> for BridgeEvent {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::Progress(p) => BridgeEvent::Progress(p),
            SessionEvent::Finished(t) => BridgeEvent::Finished(t),
        }
    }
}

/// Serve commands from `input` until EOF, writing events to `output`.
///
/// On EOF any running session is allowed to finish and its remaining events
/// are flushed before returning.
pub async fn serve<R, W>(orchestrator: Arc<Orchestrator>, input: R, output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel::<BridgeEvent>();
    let writer = tokio::spawn(write_events(out_rx, output));
    let mut forwarders: JoinSet<()> = JoinSet::new();

    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let command = match serde_json::from_str::<BridgeCommand>(line) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "invalid bridge command");
                let _ = out_tx.send(BridgeEvent::Invalid {
                    message: e.to_string(),
                });
                continue;
            }
        };
        debug!(?command, "bridge command");
        reap_finished(&mut forwarders);

        match command {
            BridgeCommand::Start(request) => match orchestrator.start(request) {
                Ok(mut handle) => {
                    let _ = out_tx.send(BridgeEvent::Accepted {
                        session_id: handle.id(),
                    });
                    let tx = out_tx.clone();
                    forwarders.spawn(async move {
                        while let Some(event) = handle.next_event().await {
                            if tx.send(event.into()).is_err() {
                                break;
                            }
                        }
                    });
                }
                Err(e) => {
                    let _ = out_tx.send(BridgeEvent::Rejected(e));
                }
            },
            BridgeCommand::Cancel => {
                let active = orchestrator.cancel();
                let _ = out_tx.send(BridgeEvent::CancelAck { active });
            }
            BridgeCommand::Status => {
                let _ = out_tx.send(BridgeEvent::Status {
                    session: orchestrator.status(),
                });
            }
        }
    }

    while forwarders.join_next().await.is_some() {}
    drop(out_tx);
    writer.await??;
    Ok(())
}

/// Drop forwarders whose session has already delivered its last event.
fn reap_finished(forwarders: &mut JoinSet<()>) {
    while let Some(joined) = forwarders.try_join_next() {
        if let Err(e) = joined {
            warn!(error = %e, "bridge forwarder failed");
        }
    }
}

async fn write_events<W>(mut rx: mpsc::UnboundedReceiver<BridgeEvent>, mut output: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = rx.recv().await {
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        output.write_all(line.as_bytes()).await?;
        output.flush().await?;
    }
    output.shutdown().await?;
    Ok(())
}
