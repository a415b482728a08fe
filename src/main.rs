//! dockhand: a local dev-server supervisor.
//!
//! This is the entry point of the daemon. It loads the settings document,
//! builds the manager, exposes the loopback control API, and waits for a
//! shutdown signal before tearing everything down.

mod api;
mod config;
mod events;
mod health;
mod manager;
mod output;
mod runner;
mod shutdown;
mod state;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::manager::Manager;
use crate::shutdown::ShutdownCoordinator;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(name = "dockhand", version, about = "Local dev-server supervisor")]
struct Cli {
    /// Path to the settings file (default: ~/.servers/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the control API port from the settings file.
    #[arg(long)]
    api_port: Option<u16>,
    /// Do not start servers marked autoStart on boot.
    #[arg(long)]
    no_autostart: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(config::default_path);
    info!(path = %config_path.display(), "loading settings");

    let manager = Manager::new(config_path);
    if let Some(err) = manager.config_error().await {
        warn!("running with an empty server set: {err}");
    }

    let api_port = match cli.api_port {
        Some(port) => port,
        None => manager.api_port().await,
    };
    let (api_stop_tx, api_stop_rx) = oneshot::channel();
    match api::bind(api_port) {
        Ok(listener) => {
            info!("control API listening on 127.0.0.1:{api_port}");
            tokio::spawn(api::serve(listener, manager.clone(), api_stop_rx));
        }
        Err(err) => {
            // The supervisor still runs; only external control is lost.
            error!("control API unavailable: {err:#}");
            drop(api_stop_rx);
        }
    }

    if !cli.no_autostart {
        manager.start_autostart().await;
    }

    let (signal_tx, mut signal_rx) = mpsc::channel(1);
    shutdown::spawn_signal_listener(signal_tx);
    let coordinator = ShutdownCoordinator::new(manager, api_stop_tx);

    let _ = signal_rx.recv().await;
    coordinator.run().await;
    Ok(())
}
