//! End-to-end session behaviour through the public orchestrator API.

mod common;

use std::time::Duration;

use common::{fast_config, orchestrator, Bundle, PhaseScript, ScriptedClient};
use speedcheck::backend::ClientResponse;
use speedcheck::session::model::{SessionEvent, SessionState};
use speedcheck::{ErrorCode, Orchestrator, Phase, StartRequest, TerminalResult};

fn protocol_request() -> StartRequest {
    StartRequest {
        engine: "ndt7".to_string(),
        download_url: Some("wss://ndt.example.net/ndt/v7/download".to_string()),
        upload_url: Some("wss://ndt.example.net/ndt/v7/upload".to_string()),
        provider_order: None,
    }
}

fn cli_request(order: &[&str]) -> StartRequest {
    StartRequest {
        engine: "cli".to_string(),
        download_url: None,
        upload_url: None,
        provider_order: Some(order.iter().map(|s| s.to_string()).collect()),
    }
}

const OOKLA_JSON: &str = r#"echo '{"download":{"bandwidth":12500000},"upload":{"bandwidth":6250000},"server":{"name":"X","location":"Y","country":"Z"}}'"#;

/// Drain every event of a session.
async fn collect(mut handle: speedcheck::SessionHandle) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        events.push(event);
    }
    events
}

fn terminal(events: &[SessionEvent]) -> &TerminalResult {
    match events.last() {
        Some(SessionEvent::Finished(t)) => t,
        other => panic!("last event is not terminal: {:?}", other),
    }
}

fn assert_single_terminal_last(events: &[SessionEvent]) {
    let finished = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::Finished(_)))
        .count();
    assert_eq!(finished, 1, "expected exactly one terminal event");
    assert!(matches!(events.last(), Some(SessionEvent::Finished(_))));
}

#[tokio::test]
async fn test_protocol_session_success() {
    let client = ScriptedClient::new(
        PhaseScript::steady(100.0, 4, Duration::from_millis(10)),
        PhaseScript::steady(40.0, 4, Duration::from_millis(10)),
    );
    let bundle = Bundle::new();
    let orch = orchestrator(fast_config(5, 5), &bundle).with_protocol_client(client.clone());

    let handle = orch.start(protocol_request()).unwrap();
    let events = collect(handle).await;

    assert_single_terminal_last(&events);
    match terminal(&events) {
        TerminalResult::Success(m) => {
            assert!((m.download_mbps - 100.0).abs() < 0.01);
            assert!((m.upload_mbps - 40.0).abs() < 0.01);
            assert_eq!(m.server_info.as_deref(), Some("ndt.example.net"));
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(client.started(), vec![Phase::Download, Phase::Upload]);

    // Every download event precedes every upload event.
    let phases: Vec<Phase> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Progress(p) => Some(p.phase),
            _ => None,
        })
        .collect();
    let first_upload = phases.iter().position(|p| *p == Phase::Upload).unwrap();
    assert!(phases[..first_upload].iter().all(|p| *p == Phase::Download));
    assert!(phases[first_upload..].iter().all(|p| *p == Phase::Upload));

    assert_eq!(orch.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_progress_values_stay_in_range() {
    // Samples past the nominal phase length would exceed 1.0 unclamped.
    let client = ScriptedClient::new(
        PhaseScript::steady(10.0, 14, Duration::from_millis(1)),
        PhaseScript::steady(10.0, 2, Duration::from_millis(1)),
    );
    let bundle = Bundle::new();
    let orch = orchestrator(fast_config(5, 5), &bundle).with_protocol_client(client);

    let events = collect(orch.start(protocol_request()).unwrap()).await;
    for event in &events {
        if let SessionEvent::Progress(p) = event {
            assert!((0.0..=1.0).contains(&p.progress), "progress {}", p.progress);
            assert!(p.mbps >= 0.0);
        }
    }
    assert!(terminal(&events).is_success());
}

#[tokio::test]
async fn test_second_start_rejected_while_running() {
    let client = ScriptedClient::new(
        PhaseScript::steady(50.0, 5, Duration::from_millis(40)),
        PhaseScript::steady(20.0, 2, Duration::from_millis(10)),
    );
    let bundle = Bundle::new();
    let orch = orchestrator(fast_config(5, 5), &bundle).with_protocol_client(client);

    let first = orch.start(protocol_request()).unwrap();
    let err = orch.start(protocol_request()).err().unwrap();
    assert_eq!(err.code, ErrorCode::AlreadyRunning);
    assert_eq!(err.message, "A speed test is already running");

    // The rejection leaves the first session untouched.
    let events = collect(first).await;
    assert_single_terminal_last(&events);
    assert!(terminal(&events).is_success());
}

#[tokio::test]
async fn test_cancel_right_after_start() {
    let client = ScriptedClient::new(
        PhaseScript::Hang {
            samples: vec![ClientResponse::new(500_000, 1_000_000)],
        },
        PhaseScript::steady(20.0, 2, Duration::from_millis(10)),
    );
    let bundle = Bundle::new();
    let orch = orchestrator(fast_config(5, 5), &bundle).with_protocol_client(client.clone());

    let handle = orch.start(protocol_request()).unwrap();
    assert!(orch.cancel());
    // Idempotent while the session is winding down.
    orch.cancel();

    let events = collect(handle).await;
    assert_single_terminal_last(&events);
    assert_eq!(terminal(&events).error_code(), Some(ErrorCode::Cancelled));
    assert!(!client.started().contains(&Phase::Upload));
    assert_eq!(orch.state(), SessionState::Idle);
    assert!(!orch.cancel());
}

#[tokio::test]
async fn test_download_timeout_reports_last_rate() {
    let client = ScriptedClient::new(
        PhaseScript::Hang {
            samples: vec![ClientResponse::new(1_000_000, 1_250_000)],
        },
        PhaseScript::steady(20.0, 2, Duration::from_millis(10)),
    );
    let bundle = Bundle::new();
    let orch = orchestrator(fast_config(1, 5), &bundle).with_protocol_client(client.clone());

    let events = collect(orch.start(protocol_request()).unwrap()).await;
    match terminal(&events) {
        TerminalResult::Error(e) => {
            assert_eq!(e.code, ErrorCode::NativeTestError);
            assert_eq!(e.message, "Download timeout");
            let details = e.details.as_ref().unwrap();
            assert_eq!(details["phase"], "download");
            assert!((details["mbps"].as_f64().unwrap() - 10.0).abs() < 1e-9);
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(client.started(), vec![Phase::Download]);
}

#[tokio::test]
async fn test_upload_failure_surfaces_client_error() {
    let client = ScriptedClient::new(
        PhaseScript::steady(30.0, 2, Duration::from_millis(5)),
        PhaseScript::Fail {
            samples: vec![],
            error: "connection reset by peer".to_string(),
        },
    );
    let bundle = Bundle::new();
    let orch = orchestrator(fast_config(5, 5), &bundle).with_protocol_client(client);

    let events = collect(orch.start(protocol_request()).unwrap()).await;
    match terminal(&events) {
        TerminalResult::Error(e) => {
            assert_eq!(e.code, ErrorCode::NativeTestError);
            assert_eq!(e.message, "connection reset by peer");
            assert_eq!(e.details.as_ref().unwrap()["phase"], "upload");
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_restart_after_completion() {
    let client = ScriptedClient::new(
        PhaseScript::steady(10.0, 2, Duration::from_millis(5)),
        PhaseScript::steady(5.0, 2, Duration::from_millis(5)),
    );
    let bundle = Bundle::new();
    let orch = orchestrator(fast_config(5, 5), &bundle).with_protocol_client(client);

    let first = orch.start(protocol_request()).unwrap();
    assert!(first.wait().await.is_success());

    let second = orch.start(protocol_request()).unwrap();
    assert!(second.wait().await.is_success());
}

#[tokio::test]
async fn test_protocol_engine_validation() {
    let orch = Orchestrator::new(fast_config(5, 5));
    let err = orch.start(protocol_request()).err().unwrap();
    assert_eq!(err.code, ErrorCode::UnsupportedEngine);

    let client = ScriptedClient::new(
        PhaseScript::steady(10.0, 2, Duration::from_millis(5)),
        PhaseScript::steady(5.0, 2, Duration::from_millis(5)),
    );
    let orch = Orchestrator::new(fast_config(5, 5)).with_protocol_client(client);
    let mut request = protocol_request();
    request.upload_url = Some("   ".to_string());
    let err = orch.start(request).err().unwrap();
    assert_eq!(err.code, ErrorCode::InvalidArgs);
    assert_eq!(orch.state(), SessionState::Idle);
}

#[cfg(unix)]
mod cli_sessions {
    use super::*;

    #[tokio::test]
    async fn test_cli_session_success() {
        let bundle = Bundle::new();
        bundle.script("speedtest", OOKLA_JSON);
        let orch = orchestrator(fast_config(5, 5), &bundle);

        let events = collect(orch.start(cli_request(&["ookla"])).unwrap()).await;
        assert_single_terminal_last(&events);
        match terminal(&events) {
            TerminalResult::Success(m) => {
                assert_eq!(m.download_mbps, 100.0);
                assert_eq!(m.upload_mbps, 50.0);
                assert_eq!(m.server_info.as_deref(), Some("X / Y / Z"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_provider_is_skipped() {
        let bundle = Bundle::new();
        bundle.script("speedtest", "echo boom >&2; exit 3");
        let orch = orchestrator(fast_config(5, 5), &bundle);

        let events =
            collect(orch.start(cli_request(&["ookla", "missingprovider"])).unwrap()).await;
        match terminal(&events) {
            TerminalResult::Error(e) => {
                assert_eq!(e.code, ErrorCode::CliFailed);
                assert!(e.message.contains("boom"), "message: {}", e.message);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fallback_to_second_provider() {
        let bundle = Bundle::new();
        bundle
            .script("speedtest", "echo 'not json at all'")
            .script(
                "speedtest-cli",
                r#"echo '{"download":80000000,"upload":20000000,"server":{"sponsor":"ISP","name":"Town","country":"NL"}}'"#,
            );
        let orch = orchestrator(fast_config(5, 5), &bundle);

        let result = orch
            .start(cli_request(&["ookla", "speedtest-cli"]))
            .unwrap()
            .wait()
            .await;
        match result {
            TerminalResult::Success(m) => {
                assert_eq!(m.download_mbps, 80.0);
                assert_eq!(m.upload_mbps, 20.0);
                assert_eq!(m.server_info.as_deref(), Some("ISP / Town / NL"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_binaries_is_binary_missing() {
        let bundle = Bundle::new();
        let orch = orchestrator(fast_config(5, 5), &bundle);

        let result = orch.start(cli_request(&["ookla"])).unwrap().wait().await;
        assert_eq!(result.error_code(), Some(ErrorCode::BinaryMissing));
    }

    #[tokio::test]
    async fn test_cli_timeout() {
        let bundle = Bundle::new();
        bundle.script("speedtest", "echo partial; sleep 30");
        let orch = orchestrator(fast_config(5, 1), &bundle);

        let result = orch.start(cli_request(&["ookla"])).unwrap().wait().await;
        match result {
            TerminalResult::Error(e) => {
                assert_eq!(e.code, ErrorCode::CliTimeout);
                assert_eq!(e.message, "Speedtest CLI timed out");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_cli_session() {
        let bundle = Bundle::new();
        bundle.script("speedtest", "sleep 30");
        let orch = orchestrator(fast_config(5, 60), &bundle);

        let handle = orch.start(cli_request(&["ookla"])).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(orch.cancel());

        let result = tokio::time::timeout(Duration::from_secs(10), handle.wait())
            .await
            .expect("cancelled session should finish promptly");
        assert_eq!(result.error_code(), Some(ErrorCode::Cancelled));
    }
}
