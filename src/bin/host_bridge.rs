//! Headless concierge host binary.
//!
//! Reads `CommandEnvelope` messages as newline-delimited JSON from stdin,
//! drives the voice pipeline, and writes `ResponseEnvelope` and
//! `EventEnvelope` messages to stdout.
//!
//! All tracing/diagnostic output goes to stderr so that stdout remains a
//! clean JSON protocol channel.

use clap::{Parser, Subcommand};
use concierge::audio::cpal_backend::{list_input_devices, list_output_devices};
use concierge::host::{HostRouter, run_stdio_bridge};
use concierge::pipeline::{AudioDevices, spawn};
use concierge::ConciergeConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Voice concierge pipeline host.
#[derive(Parser)]
#[command(name = "concierge-host", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long, env = "CONCIERGE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the stdin/stdout JSON bridge (default).
    Bridge,
    /// List available audio devices.
    Devices,
    /// Write the default configuration to a file.
    InitConfig {
        /// Destination (defaults to the standard config path).
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Bridge) {
        Command::Bridge => run_bridge(load_config(cli.config)?).await,
        Command::Devices => list_devices(),
        Command::InitConfig { path } => {
            let path = path.unwrap_or_else(ConciergeConfig::default_config_path);
            ConciergeConfig::default().save_to_file(&path)?;
            eprintln!("wrote {}", path.display());
            Ok(())
        }
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<ConciergeConfig> {
    let config = match path {
        Some(path) => {
            let mut config = ConciergeConfig::from_file(&path)?;
            config.apply_env_overrides();
            config.validate()?;
            config
        }
        None => ConciergeConfig::load()?,
    };
    Ok(config)
}

async fn run_bridge(config: ConciergeConfig) -> anyhow::Result<()> {
    tracing::info!(backend = ?config.exchange.backend, "concierge-host starting");

    let handle = spawn(config, AudioDevices::system())?;
    let result = run_stdio_bridge(HostRouter::new(handle.clone())).await;
    handle.shutdown().await?;

    result.map_err(|e| {
        tracing::error!(error = %e, "concierge-host exited with error");
        anyhow::anyhow!("concierge-host failed: {e}")
    })?;
    tracing::info!("concierge-host shut down cleanly");
    Ok(())
}

fn list_devices() -> anyhow::Result<()> {
    println!("Input devices:");
    for name in list_input_devices()? {
        println!("  {name}");
    }
    println!("Output devices:");
    for name in list_output_devices()? {
        println!("  {name}");
    }
    Ok(())
}
