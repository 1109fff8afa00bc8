mod automation;
mod ban;
mod cache;
mod capabilities;
mod config;
mod device;
mod error;
mod events;
mod gateway;
mod groups;
mod handlers;
mod ieee;
mod mqtt;
mod mqtt_queue;
mod overrides;
mod radio;
mod resilience;
mod stats;
mod storage;
mod zones;

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

use config::GatewayConfig;
use gateway::Gateway;
use radio::{DriverFactory, SimulatedFactory};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,waggle=debug")),
        )
        .init();

    tracing::info!("Starting waggle v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::var("WAGGLE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./config.yaml"));
    let config = GatewayConfig::load(&config_path)?;

    let simulate = std::env::args().any(|a| a == "--simulate")
        || std::env::var("WAGGLE_SIMULATE").map(|v| v == "1").unwrap_or(false);

    let gateway = Gateway::new(config);

    // MQTT first so the LWT/birth contract is in place before devices
    // start reporting.
    let commands = gateway.mqtt.start();
    gateway.run_command_loop(commands);

    // Radio: the simulated backend for dry runs, the vendor adapter seam
    // otherwise.
    let factory: Box<dyn DriverFactory> = if simulate {
        tracing::warn!("Running with a simulated radio (--simulate)");
        Box::new(SimulatedFactory)
    } else {
        Box::new(radio::UnlinkedFactory)
    };

    if let Err(e) = gateway.start(factory.as_ref()).await {
        tracing::error!("Gateway startup failed: {e}");
        gateway.shutdown().await;
        return Err(e);
    }

    shutdown_signal().await;
    gateway.shutdown().await;
    tracing::info!("waggle shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => { tracing::info!("Received SIGINT, shutting down"); }
        _ = terminate => { tracing::info!("Received SIGTERM, shutting down"); }
    }
}
