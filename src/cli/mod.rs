//! Command line speed test providers: registry, binary resolution, process
//! execution and output parsing.

pub mod assets;
pub mod parser;
pub mod provider;
pub mod runner;

pub use assets::{AssetStore, BinaryResolver, Candidate, CliCommand, DirAssetStore};
pub use provider::{OutputShape, ProviderMeta};
pub use runner::CliRunner;
