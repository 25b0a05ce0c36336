//! Shared fixtures: a scripted throughput client and bundled fake providers.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use speedcheck::backend::{CallbackRegistry, ClientResponse, ThroughputClient};
use speedcheck::cli::{BinaryResolver, DirAssetStore};
use speedcheck::config::HttpConfig;
use speedcheck::session::model::Phase;
use speedcheck::{Orchestrator, SpeedcheckConfig};
use tokio_util::sync::CancellationToken;

/// What the fake client does for one phase.
#[derive(Clone)]
pub enum PhaseScript {
    /// Report `samples` spaced by `step`, then finish with `last`.
    Finish {
        samples: Vec<ClientResponse>,
        step: Duration,
        last: ClientResponse,
    },
    /// Report `samples`, then fail with `error`.
    Fail {
        samples: Vec<ClientResponse>,
        error: String,
    },
    /// Report `samples`, then wait until cancelled.
    Hang { samples: Vec<ClientResponse> },
}

impl PhaseScript {
    /// Steady phase at `mbps`, sampled every simulated second for `secs`.
    pub fn steady(mbps: f64, secs: u64, step: Duration) -> Self {
        let bytes_per_sec = (mbps * 1_000_000.0 / 8.0) as u64;
        let samples = (1..secs)
            .map(|s| ClientResponse::new(s * 1_000_000, s * bytes_per_sec))
            .collect();
        PhaseScript::Finish {
            samples,
            step,
            last: ClientResponse::new(secs * 1_000_000, secs * bytes_per_sec),
        }
    }
}

pub struct ScriptedClient {
    download: PhaseScript,
    upload: PhaseScript,
    pub started: Mutex<Vec<Phase>>,
    pub urls: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub fn new(download: PhaseScript, upload: PhaseScript) -> Arc<Self> {
        Arc::new(Self {
            download,
            upload,
            started: Mutex::new(Vec::new()),
            urls: Mutex::new(Vec::new()),
        })
    }

    pub fn started(&self) -> Vec<Phase> {
        self.started.lock().unwrap().clone()
    }

    fn play(script: PhaseScript, callbacks: CallbackRegistry, cancel: CancellationToken) {
        tokio::spawn(async move {
            match script {
                PhaseScript::Finish {
                    samples,
                    step,
                    last,
                } => {
                    for s in samples {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(step) => {}
                        }
                        callbacks.on_progress(s);
                    }
                    callbacks.on_finished(Some(last), None);
                }
                PhaseScript::Fail { samples, error } => {
                    for s in samples {
                        callbacks.on_progress(s);
                    }
                    callbacks.on_finished(None, Some(error));
                }
                PhaseScript::Hang { samples } => {
                    for s in samples {
                        callbacks.on_progress(s);
                    }
                    cancel.cancelled().await;
                }
            }
        });
    }

    fn record(&self, phase: Phase, url: &str) {
        self.started.lock().unwrap().push(phase);
        self.urls.lock().unwrap().push(url.to_string());
    }
}

impl ThroughputClient for ScriptedClient {
    fn begin_download(
        &self,
        url: &str,
        _http: &HttpConfig,
        callbacks: CallbackRegistry,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        self.record(Phase::Download, url);
        Self::play(self.download.clone(), callbacks, cancel);
        Ok(())
    }

    fn begin_upload(
        &self,
        url: &str,
        _http: &HttpConfig,
        callbacks: CallbackRegistry,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        self.record(Phase::Upload, url);
        Self::play(self.upload.clone(), callbacks, cancel);
        Ok(())
    }
}

/// Temp asset store plus extraction directory.
pub struct Bundle {
    pub assets: tempfile::TempDir,
    pub bin: tempfile::TempDir,
}

impl Bundle {
    pub fn new() -> Self {
        Self {
            assets: tempfile::tempdir().unwrap(),
            bin: tempfile::tempdir().unwrap(),
        }
    }

    /// Bundle a shell script as the `binary` for the `x86_64` ABI.
    pub fn script(&self, binary: &str, body: &str) -> &Self {
        write_script(self.assets.path(), binary, body);
        self
    }

    pub fn resolver(&self) -> BinaryResolver {
        BinaryResolver::new(
            Box::new(DirAssetStore::new(self.assets.path())),
            self.bin.path(),
            vec!["x86_64".to_string()],
        )
        .without_path_lookup()
    }
}

fn write_script(assets: &Path, binary: &str, body: &str) {
    let dir = assets.join("cli").join("x86_64");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(binary), format!("#!/bin/sh\n{}\n", body)).unwrap();
}

/// Config with short timeouts suitable for tests.
pub fn fast_config(phase_timeout_secs: u64, cli_timeout_secs: u64) -> SpeedcheckConfig {
    let mut config = SpeedcheckConfig::default();
    config.protocol.phase_timeout_secs = phase_timeout_secs;
    config.cli.timeout_secs = cli_timeout_secs;
    config.cli.output_grace_secs = 1;
    config
}

pub fn orchestrator(config: SpeedcheckConfig, bundle: &Bundle) -> Orchestrator {
    Orchestrator::new(config).with_resolver(bundle.resolver())
}
