use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mqtt_humidifier::Config;
use mqtt_humidifier::Engine;
use mqtt_humidifier::api;
use tokio::sync::oneshot;
use tracing::error;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Bridge MQTT humidifiers to a small home-automation engine.
#[derive(Parser, Debug)]
#[command(name = "mqtt-humidifier")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(default_value = "mqtt_humidifier.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(config.logging.filter())
        .init();

    info!("mqtt-humidifier starting");
    info!("Loaded config from: {}", args.config.display());

    let engine = Arc::new(Engine::new());
    engine.register_integrations_from_config(&config).await;

    let runner = engine.clone();
    let engine_task = tokio::spawn(async move { runner.run().await });

    let api_server = if config.api.enabled {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let listen = config.api.listen.clone();
        let port = config.api.port;
        let engine = engine.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = api::serve(listen, port, engine, shutdown_rx).await {
                error!("HTTP API server failed: {}", e);
            }
        });
        Some((shutdown_tx, handle))
    } else {
        info!("HTTP API disabled");
        None
    };

    info!("Press Ctrl+C to exit");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    if let Some((shutdown_tx, handle)) = api_server {
        let _ = shutdown_tx.send(());
        if let Err(e) = handle.await {
            error!("HTTP API task ended abnormally: {}", e);
        }
    }

    // Integrations remove their entities (and unsubscribe) on shutdown
    engine.shutdown().await;
    engine_task.abort();

    info!("mqtt-humidifier shutdown complete");
    Ok(())
}
