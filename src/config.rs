//! TOML configuration for speedcheck.
//!
//! Every section has compiled-in defaults: 25 s protocol phases, 90 s CLI
//! runs and 3 s of output readback.
//! The config file is looked up through an explicit path, the
//! `SPEEDCHECK_CONFIG` environment variable, and a system location.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeedcheckConfig {
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub cli: CliConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SpeedcheckConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded speedcheck configuration");
        Ok(config)
    }

    /// Resolve configuration from, in order:
    /// 1. `explicit` (a `--config` flag); failure to load it is an error.
    /// 2. The path in the `SPEEDCHECK_CONFIG` environment variable.
    /// 3. `/etc/speedcheck/speedcheck.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var("SPEEDCHECK_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "SPEEDCHECK_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new("/etc/speedcheck/speedcheck.toml");
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

/// Settings for the two-phase protocol backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Upper bound on each phase, download and upload independently.
    pub phase_timeout_secs: u64,
    /// Phase length the progress fraction is scaled against.
    pub nominal_phase_secs: u64,
    pub http: HttpConfig,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            phase_timeout_secs: 25,
            nominal_phase_secs: 10,
            http: HttpConfig::default(),
        }
    }
}

impl ProtocolConfig {
    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.phase_timeout_secs)
    }

    pub fn nominal_phase(&self) -> Duration {
        Duration::from_secs(self.nominal_phase_secs.max(1))
    }
}

/// Connection timeouts handed to the throughput client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            write_timeout_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// CLI providers
// ---------------------------------------------------------------------------

/// Settings for the CLI provider backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Limit on a single provider invocation.
    pub timeout_secs: u64,
    /// How long to wait for captured output after the process ends or is killed.
    pub output_grace_secs: u64,
    /// Provider used when the request carries no usable order.
    pub default_provider: String,
    /// Read-only directory holding bundled binaries as `cli/<abi>/<binary>`.
    pub asset_dir: PathBuf,
    /// Writable directory bundled binaries are extracted into.
    pub bin_dir: PathBuf,
    /// ABIs to look for in the asset store, most preferred first.
    pub supported_abis: Vec<String>,
    /// Maximum characters of process output attached to error details.
    pub excerpt_chars: usize,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 90,
            output_grace_secs: 3,
            default_provider: "ookla".to_string(),
            asset_dir: PathBuf::from("assets"),
            bin_dir: PathBuf::from("data/cli"),
            supported_abis: host_abis(),
            excerpt_chars: 400,
        }
    }
}

impl CliConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn output_grace(&self) -> Duration {
        Duration::from_secs(self.output_grace_secs)
    }
}

/// ABI directory names matching the host architecture.
pub fn host_abis() -> Vec<String> {
    let abis: &[&str] = match std::env::consts::ARCH {
        "aarch64" => &["arm64-v8a", "armeabi-v7a"],
        "arm" => &["armeabi-v7a"],
        "x86_64" => &["x86_64", "x86"],
        "x86" => &["x86"],
        _ => &[],
    };
    abis.iter().map(|s| s.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON log lines instead of the human format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
