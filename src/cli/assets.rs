//! Bundled binary resolution.
//!
//! Provider binaries ship in a read-only asset store under
//! `cli/<abi>/<binary>`. Before use they are copied into a private writable
//! directory and marked executable. A provider without a bundled binary falls
//! back to a same-named command on `PATH`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::provider::{self, ProviderMeta};

/// Read-only store of packaged files.
pub trait AssetStore: Send + Sync {
    /// Contents of the asset at `path`, or `None` if it is not packaged.
    fn open(&self, path: &str) -> Result<Option<Vec<u8>>>;
}

/// Asset store backed by a directory on disk.
#[derive(Debug, Clone)]
pub struct DirAssetStore {
    root: PathBuf,
}

impl DirAssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl AssetStore for DirAssetStore {
    fn open(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let full = self.root.join(path);
        if !full.is_file() {
            return Ok(None);
        }
        let bytes = std::fs::read(&full)
            .with_context(|| format!("failed to read asset {}", full.display()))?;
        Ok(Some(bytes))
    }
}

/// One runnable provider invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliCommand {
    pub provider: String,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CliCommand {
    pub fn new(meta: &ProviderMeta, program: PathBuf) -> Self {
        Self {
            provider: meta.id.to_string(),
            program,
            args: meta.args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Command line as a single string, for logs and error details.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// A candidate in the fallback list: a command plus the provider it came from.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub meta: &'static ProviderMeta,
    pub command: CliCommand,
}

/// Builds the ordered candidate list for a provider order.
pub struct BinaryResolver {
    assets: Box<dyn AssetStore>,
    bin_dir: PathBuf,
    abis: Vec<String>,
    search_path: bool,
}

impl BinaryResolver {
    pub fn new(assets: Box<dyn AssetStore>, bin_dir: impl Into<PathBuf>, abis: Vec<String>) -> Self {
        Self {
            assets,
            bin_dir: bin_dir.into(),
            abis,
            search_path: true,
        }
    }

    /// Disable the `PATH` fallback, leaving only bundled binaries.
    pub fn without_path_lookup(mut self) -> Self {
        self.search_path = false;
        self
    }

    pub fn abis(&self) -> &[String] {
        &self.abis
    }

    /// Resolve `order` into runnable candidates. Unknown providers and
    /// providers without a bundled or installed binary are skipped.
    pub fn candidates(&self, order: &[String]) -> Vec<Candidate> {
        let mut out = Vec::new();
        for id in order {
            let Some(meta) = provider::lookup(id) else {
                debug!(provider = %id, "unknown provider, skipping");
                continue;
            };
            if let Some(program) = self.bundled(meta) {
                out.push(Candidate {
                    meta,
                    command: CliCommand::new(meta, program),
                });
                continue;
            }
            if let Some(program) = self.on_path(meta) {
                out.push(Candidate {
                    meta,
                    command: CliCommand::new(meta, program),
                });
                continue;
            }
            debug!(provider = %id, binary = meta.binary, "no bundled or installed binary");
        }
        out
    }

    fn bundled(&self, meta: &ProviderMeta) -> Option<PathBuf> {
        for abi in &self.abis {
            let asset_path = format!("cli/{}/{}", abi, meta.binary);
            let bytes = match self.assets.open(&asset_path) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    warn!(asset = %asset_path, error = %e, "failed to read bundled binary");
                    continue;
                }
            };
            let target = self.bin_dir.join(abi).join(meta.binary);
            match materialize(&bytes, &target) {
                Ok(()) => {
                    debug!(provider = meta.id, %abi, path = %target.display(), "extracted bundled binary");
                    return Some(target);
                }
                Err(e) => {
                    warn!(provider = meta.id, %abi, error = %e, "bundled binary is not executable");
                }
            }
        }
        None
    }

    fn on_path(&self, meta: &ProviderMeta) -> Option<PathBuf> {
        if !self.search_path {
            return None;
        }
        which::which(meta.binary).ok()
    }
}

/// Write `bytes` to `target` and make it executable by the owner.
fn materialize(bytes: &[u8], target: &Path) -> Result<()> {
    if let Some(dir) = target.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    std::fs::write(target, bytes)
        .with_context(|| format!("failed to write {}", target.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(target, std::fs::Permissions::from_mode(0o755))
            .with_context(|| format!("failed to mark {} executable", target.display()))?;
        let mode = std::fs::metadata(target)?.permissions().mode();
        if mode & 0o100 == 0 {
            anyhow::bail!("{} is not executable after chmod", target.display());
        }
    }

    Ok(())
}
