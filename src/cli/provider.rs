use serde::Serialize;

/// JSON layout a provider prints, selecting how the parser reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputShape {
    /// `download.bandwidth` in bytes/s, top-level bits/s as a fallback.
    BandwidthBytes,
    /// Top-level `download` / `upload` in bits/s.
    BitsPerSecond,
}

/// Metadata describing a CLI speed test provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderMeta {
    pub id: &'static str,               // "ookla", "speedtest-cli"
    pub display_name: &'static str,     // "Speedtest.net (Ookla)"
    pub binary: &'static str,           // file name in assets and on PATH
    pub args: &'static [&'static str],  // fixed license / format flags
    pub shape: OutputShape,
    pub description: &'static str,
    pub install_hint: &'static str,
    pub licensing_note: Option<&'static str>,
}

const PROVIDERS: &[ProviderMeta] = &[
    ProviderMeta {
        id: "ookla",
        display_name: "Speedtest.net (Ookla)",
        binary: "speedtest",
        args: &[
            "--accept-license",
            "--accept-gdpr",
            "--format=json",
            "--progress=no",
        ],
        shape: OutputShape::BandwidthBytes,
        description: "The official Speedtest CLI. Broad server network, reports bandwidth in bytes per second.",
        install_hint: "Install the official CLI: https://www.speedtest.net/apps/cli",
        licensing_note: Some("Personal Non-Commercial Use Only (EULA)."),
    },
    ProviderMeta {
        id: "speedtest-cli",
        display_name: "speedtest-cli (Python)",
        binary: "speedtest-cli",
        args: &["--json", "--secure"],
        shape: OutputShape::BitsPerSecond,
        description: "Community client for speedtest.net servers. Reports bits per second.",
        install_hint: "Install via pip: pip install speedtest-cli",
        licensing_note: None, // Apache 2.0
    },
];

/// All built-in providers, in their default preference order.
pub fn all() -> &'static [ProviderMeta] {
    PROVIDERS
}

/// Look up a provider by its lower-case identifier.
pub fn lookup(id: &str) -> Option<&'static ProviderMeta> {
    PROVIDERS.iter().find(|p| p.id == id)
}

/// Normalize a requested provider order: trim, lower-case, drop blanks,
/// keep the first occurrence of duplicates, and fall back to `default` when
/// nothing is left.
pub fn normalize_order(requested: Option<&[String]>, default: &str) -> Vec<String> {
    let mut order: Vec<String> = Vec::new();
    for raw in requested.unwrap_or_default() {
        let id = raw.trim().to_lowercase();
        if !id.is_empty() && !order.contains(&id) {
            order.push(id);
        }
    }
    if order.is_empty() {
        order.push(default.trim().to_lowercase());
    }
    order
}
