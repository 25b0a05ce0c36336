use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use speedcheck::config::LoggingConfig;
use speedcheck::session::model::SessionEvent;
use speedcheck::{report, Orchestrator, SpeedcheckConfig, StartRequest, TerminalResult};

#[derive(Parser)]
#[command(
    name = "speedcheck",
    about = "Speed test orchestration with NDT7-style phases and CLI provider fallback",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single speed test session
    Run {
        /// Engine: ndt7, nperf or cli
        #[arg(long, default_value = "cli")]
        engine: String,

        /// Download endpoint (protocol engines)
        #[arg(long)]
        download_url: Option<String>,

        /// Upload endpoint (protocol engines)
        #[arg(long)]
        upload_url: Option<String>,

        /// CLI provider to try, in order (repeatable)
        #[arg(long = "provider")]
        providers: Vec<String>,

        /// Emit events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Serve line-delimited JSON commands on stdin, events on stdout
    Bridge,

    /// List the built-in CLI providers
    Providers {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

fn env_filter(default_level: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level))
}

/// Resolve the config under a plain stderr subscriber so fallback warnings
/// are visible before the configured one is installed.
fn resolve_config(explicit: Option<&Path>) -> Result<SpeedcheckConfig> {
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(env_filter("info"))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::with_default(bootstrap, || SpeedcheckConfig::resolve(explicit))
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = env_filter(&logging.level);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = resolve_config(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Run {
            engine,
            download_url,
            upload_url,
            providers,
            json,
        } => {
            tracing::info!(%engine, ?providers, "Running speed test");
            let orchestrator = Orchestrator::new(config);
            let request = StartRequest {
                engine,
                download_url,
                upload_url,
                provider_order: if providers.is_empty() {
                    None
                } else {
                    Some(providers)
                },
            };

            let result = match orchestrator.start(request) {
                Ok(mut handle) => {
                    let mut terminal = None;
                    while let Some(event) = handle.next_event().await {
                        if json {
                            println!("{}", serde_json::to_string(&event)?);
                        }
                        match event {
                            SessionEvent::Progress(p) => {
                                if !json {
                                    println!("{}", report::format_progress(&p));
                                }
                            }
                            SessionEvent::Finished(t) => terminal = Some(t),
                        }
                    }
                    terminal.unwrap_or_else(|| {
                        TerminalResult::Error(speedcheck::SessionError::native(
                            "Session ended without a result",
                        ))
                    })
                }
                Err(e) => {
                    let rejected = TerminalResult::Error(e);
                    if json {
                        println!("{}", serde_json::to_string(&SessionEvent::Finished(rejected.clone()))?);
                    }
                    rejected
                }
            };

            if !json {
                println!("\n{}", report::format_summary(&result));
            }
            if !result.is_success() {
                std::process::exit(1);
            }
        }
        Commands::Bridge => {
            tracing::info!("Serving bridge on stdin/stdout");
            let orchestrator = Arc::new(Orchestrator::new(config));
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            speedcheck::bridge::serve(orchestrator, stdin, tokio::io::stdout()).await?;
        }
        Commands::Providers { json } => {
            let providers = speedcheck::cli::provider::all();
            if json {
                println!("{}", serde_json::to_string_pretty(providers)?);
            } else {
                println!("{:<15} | {:<25} | Binary", "ID", "Name");
                println!("{:-<15}-|-{:-<25}-|-{:-<15}", "", "", "");
                for p in providers {
                    println!("{:<15} | {:<25} | {}", p.id, p.display_name, p.binary);
                    println!("{:<15} | {:<25} |   -> {}", "", "", p.install_hint);
                    if let Some(note) = p.licensing_note {
                        println!("{:<15} | {:<25} |   -> License: {}", "", "", note);
                    }
                }
            }
        }
    }

    Ok(())
}
