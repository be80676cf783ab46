//! Peerwire client
//!
//! Runs the peering engine against a local configuration. Real control,
//! signal, tunnel, and firewall integrations are injected by platform
//! packages; this binary wires loopback collaborators so the engine can be
//! exercised end-to-end on a single host.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod config;
mod loopback;

use config::ClientConfig;
use loopback::{FileControl, LogDns, LogRoutes, LogTunnel, MemoryState, SilentSignal};
use peerwire_engine::{Collaborators, Engine, ShutdownReason, UdpNegotiator};

/// Peerwire - mesh VPN peering engine client
#[derive(Parser)]
#[command(name = "peerwire")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "peerwire.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine
    Start {
        /// Optional network map (JSON) replayed once on startup
        #[arg(short, long)]
        map: Option<PathBuf>,
    },

    /// Validate the configuration and exit
    CheckConfig,
}

fn init_logging(level: &str) -> Result<()> {
    let level: Level = level.parse().context("invalid log level")?;
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).context("setting tracing subscriber")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let client_config = ClientConfig::load(&cli.config)?;

    match cli.command {
        Commands::CheckConfig => {
            client_config.local_key()?;
            client_config
                .engine_config()
                .validate()
                .context("engine config rejected")?;
            println!("configuration ok");
            Ok(())
        }
        Commands::Start { map } => run(client_config, map).await,
    }
}

async fn run(client_config: ClientConfig, map: Option<PathBuf>) -> Result<()> {
    let local_key = client_config.local_key()?;
    let engine_config = client_config.engine_config();

    let control = match &map {
        Some(path) => FileControl::from_file(path)?,
        None => {
            warn!("no map file given; the engine will idle until interrupted");
            FileControl::empty()
        }
    };

    let collab = Collaborators {
        tunnel: Arc::new(LogTunnel::default()),
        firewall: None,
        routes: Arc::new(LogRoutes),
        dns: Arc::new(LogDns),
        dns_forwarder: None,
        ingress: None,
        ssh: None,
        key_agreement: None,
        relay: None,
        flow: None,
        control: Arc::new(control),
        signal: Arc::new(SilentSignal),
        network_watcher: None,
        state_store: Arc::new(MemoryState::default()),
        negotiator: Arc::new(UdpNegotiator::default()),
    };

    let (engine, mut reasons) = Engine::new(engine_config, local_key, collab)
        .context("building engine")?;
    engine.start().await.context("starting engine")?;
    info!("engine running; ctrl-c to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            engine.stop().await.context("stopping engine")?;
        }
        reason = reasons.recv() => {
            match reason {
                Some(ShutdownReason::GracefulStop) | None => info!("engine stopped"),
                Some(reason) => {
                    warn!(?reason, "engine requested reset, restarting");
                    engine.restart_after_reset().await.context("restarting engine")?;
                }
            }
        }
    }

    let snapshot = engine.status().snapshot();
    info!(
        peers = snapshot.peers.len(),
        offline = snapshot.offline_peers.len(),
        "final status"
    );
    Ok(())
}
