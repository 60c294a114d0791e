//! Stathaul Binary Entry Point
//!
//! This binary runs the complete relay agent. Core functionality is
//! provided by the `stathaul` library crate.

use std::time::Duration;

use clap::Parser;
use stathaul::{Agent, AgentConfig, ConfigError, MinerClient, SpoolStore, Uploader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long shutdown waits for the agent tasks to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Stathaul - miner telemetry relay agent
#[derive(Parser, Debug)]
#[command(name = "stathaul", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "configs/config.yaml",
        env = "STATHAUL_CONFIG"
    )]
    config: String,

    /// Miner address (host:port, overrides config file)
    #[arg(long, env = "STATHAUL_MINER_ADDR")]
    miner_addr: Option<String>,

    /// Collector address (host:port, overrides config file)
    #[arg(long, env = "STATHAUL_SERVER_ADDR")]
    server_addr: Option<String>,

    /// Device name stamped on every reading (overrides config file)
    #[arg(long, env = "STATHAUL_DEVICE_NAME")]
    device_name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,stathaul=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Stathaul - Miner Telemetry Relay Agent");

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration from file
    tracing::info!("Loading configuration from: {}", cli.config);
    let mut config = AgentConfig::load(&cli.config)?;

    // Apply CLI/env overrides (CLI > ENV > config file)
    if let Some(addr) = cli.miner_addr {
        let (host, port) = split_addr(&addr)?;
        config.miner_host = host;
        config.miner_port = port;
    }
    if let Some(addr) = cli.server_addr {
        let (host, port) = split_addr(&addr)?;
        config.server_host = host;
        config.server_port = port;
    }
    if let Some(name) = cli.device_name {
        config.device_name = name;
    }
    config.validate()?;

    tracing::info!(
        "Collector: {}:{}, miner: {}:{} ({}), polling every {}s",
        config.server_host,
        config.server_port,
        config.miner_host,
        config.miner_port,
        config.device_name,
        config.interval,
    );

    // Build components
    let spool = SpoolStore::open(&config.spool_dir).await?;
    tracing::info!("Spool directory: {}", spool.dir().display());

    let uploader = Uploader::new(
        &config.server_host,
        config.server_port,
        &config.server_password,
        config.upload_timeout,
    )?;
    let miner =
        MinerClient::new(&config.miner_host, config.miner_port).with_timeout(config.query_timeout);

    // Start the agent tasks
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let agent = Agent::new(
        miner,
        spool,
        uploader,
        config.device_name.clone(),
        config.poll_interval(),
        config.sweep_interval,
    );
    let handles = agent.start(shutdown_rx);

    tracing::info!("Agent running, press Ctrl+C to shutdown");
    shutdown_signal().await;

    tracing::info!("Shutting down agent...");
    let _ = shutdown_tx.send(true);
    handles.join(SHUTDOWN_GRACE).await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Split a `host:port` override into its parts.
fn split_addr(addr: &str) -> Result<(String, u16), ConfigError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::Validation(format!("invalid address '{addr}', want host:port")))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| ConfigError::Validation(format!("invalid port in address '{addr}'")))?;
    Ok((host.to_string(), port))
}

/// Wait for a shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }
}
