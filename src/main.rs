//! Kromosynth Orchestrator - evolution-run management daemon
//!
//! Supervises the compute process and auxiliary service cluster of each
//! evolutionary-search run, schedules runs across templates in time
//! slices, and replicates run outputs to a central service.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cmd;

#[derive(Parser)]
#[command(name = "kromosynth-orchestrator")]
#[command(about = "Orchestration daemon for kromosynth evolution runs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<cmd::Commands>,

    /// Path to configuration file
    #[arg(short, long, default_value = "orchestrator.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("kromosynth_orchestrator={}", log_level).into()),
        )
        .init();

    info!(
        "Starting Kromosynth Orchestrator v{}",
        env!("CARGO_PKG_VERSION")
    );

    match cli.command {
        Some(cmd::Commands::Diagnostics) => {
            cmd::diagnostics::run(&cli.config).await?;
        }
        None => {
            // Default: run the daemon
            if let Err(e) = cmd::root::run(&cli.config).await {
                error!("Daemon error: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
