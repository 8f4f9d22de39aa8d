//! hublink - hub invocation server
//!
//! Hosts the built-in echo hub over TCP with JSON and CBOR payloads.

use hublink_server::{Config, EchoHub, Server, ServerConfig};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if HUBLINK_CONFIG is set, then env overrides)
    let config_path = std::env::var("HUBLINK_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(path) = &config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    if let Err(e) = config.validate() {
        tracing::error!("{}", e);
        return Err(e.into());
    }

    tracing::info!("Starting hublink server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    tracing::info!("  Max message size: {} bytes", config.network.max_message_size);
    tracing::info!("  Protocols: {}", config.protocol.enabled.join(", "));
    if config.pipe.pause_writer_threshold == 0 {
        tracing::info!("  Backpressure: disabled");
    } else {
        tracing::info!(
            "  Backpressure: pause at {} bytes, resume below {} bytes",
            config.pipe.pause_writer_threshold,
            config.pipe.resume_writer_threshold
        );
    }

    let server = Arc::new(Server::new(
        ServerConfig::from(&config),
        Arc::new(EchoHub::new()),
    ));

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    let stats = server.stats();
    tracing::info!(
        "Server stopped ({} connections served, {} rejected, {} errors)",
        stats
            .connections_total
            .load(std::sync::atomic::Ordering::Relaxed),
        stats
            .connections_rejected
            .load(std::sync::atomic::Ordering::Relaxed),
        stats.errors_total.load(std::sync::atomic::Ordering::Relaxed)
    );
    Ok(())
}
