//! Property Verification Toolkit - mock server daemon
//!
//! Serves the control API on a Unix socket and reports instrumented
//! state to a verification driver over the rendezvous channel.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use pvt_common::config::suite::DEFAULT_LOCATION;
use pvt_common::{LogConfig, init_logging};
use pvtd::{
    DEFAULT_SOCKET, Observer, ObserverConfig, PropertyStore, ServerState, serve, spawn_updater,
};
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "pvtd")]
#[command(author, version, about = "Mock instrumented control-system server")]
struct Cli {
    /// Path to the control socket
    #[arg(short, long, env = "PVTD_SOCKET", default_value = DEFAULT_SOCKET)]
    socket: PathBuf,

    /// Rendezvous address of the verification driver
    #[arg(short, long, default_value = "127.0.0.1:3497")]
    rendezvous: String,

    /// Run without reporting to a driver
    #[arg(long)]
    no_rendezvous: bool,

    /// How long to keep retrying the rendezvous connection
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    connect_timeout: Duration,

    /// Location (FACILITY/DEVICE/LOCATION) hosting the properties
    #[arg(short, long, default_value = DEFAULT_LOCATION)]
    location: String,

    /// Directory holding array source files
    #[arg(short, long, default_value = "fixtures")]
    fixtures_dir: PathBuf,

    /// Period of TARGET_* to MONITOR_* propagation
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    update_interval: Duration,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _guards = init_logging(&log_config)?;

    info!("Starting pvtd...");
    let store = PropertyStore::standard(&cli.location, &cli.fixtures_dir)
        .with_context(|| format!("invalid location {:?}", cli.location))?;
    info!(
        "Serving {} properties at {} (fixtures: {:?})",
        store.len(),
        cli.location,
        cli.fixtures_dir
    );
    let mut state = ServerState::new(store);

    // Remove existing socket if present
    if cli.socket.exists() {
        std::fs::remove_file(&cli.socket)?;
    }

    // Bind before announcing the pid: the driver starts issuing client
    // calls as soon as the handshake completes.
    let listener = UnixListener::bind(&cli.socket)
        .with_context(|| format!("binding control socket {:?}", cli.socket))?;
    info!("Listening on {:?}", cli.socket);

    let _observer = if cli.no_rendezvous {
        info!("Rendezvous disabled");
        None
    } else {
        let observer = Observer::spawn(ObserverConfig {
            address: cli.rendezvous.clone(),
            connect_timeout: cli.connect_timeout,
            ack_timeout: None,
            pid: state.pid,
        })?;
        state = state.with_observer(observer.sender(), observer.sent(), cli.rendezvous.as_str());
        Some(observer)
    };

    let updater = spawn_updater(state.store.clone(), cli.update_interval);

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = serve(listener, state) => {}
        _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
    }

    updater.abort();
    if let Err(e) = std::fs::remove_file(&cli.socket) {
        debug!("Could not remove {:?}: {}", cli.socket, e);
    }
    Ok(())
}
