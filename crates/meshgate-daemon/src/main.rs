//! Meshgate Daemon - Main entry point
//!
//! Runs the gateway core against a simulated mesh network described in the
//! configuration file.

mod config;
mod on_off;
mod state;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "meshgate")]
#[command(about = "Mesh network gateway daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "meshgate.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enumerate the configured nodes, print the result and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Meshgate v{}", env!("CARGO_PKG_VERSION"));

    let config = config::load_config(&args.config)?;

    info!(
        local_endpoint = config.gateway.local_endpoint,
        simulated_nodes = config.simulated_nodes.len(),
        "Configuration loaded"
    );

    let state = state::AppState::new(config).await?;
    state.join_simulated_nodes().await?;

    if args.once {
        if !state.wait_idle(Duration::from_secs(60)).await {
            warn!("Enumeration still running, reporting partial results");
        }
        let devices = state.devices().await;
        println!("Known {} devices:", devices.len());
        for device in devices {
            let info = device.info().await;
            println!("  - {} endpoints {:?}", device.id(), info.endpoints);
            for capability in &info.capabilities {
                println!("    {}", capability);
            }
            if let Some(on) = state.on_off.state(device.id()) {
                println!("    state: {}", if on { "on" } else { "off" });
            }
        }
        state.save().await?;
    } else {
        let autosave = tokio::spawn(state.clone().autosave());
        tokio::signal::ctrl_c().await?;
        info!("Shutting down");
        autosave.abort();
        state.save().await?;
    }

    state.stop();
    Ok(())
}
