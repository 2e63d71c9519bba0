//! TideKV server entry point.
//!
//! Parses the command line, sets up logging, the storage engine and the
//! expiry sweeper, then accepts connections until Ctrl+C.

use clap::Parser;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tidekv::commands::CommandHandler;
use tidekv::connection::{handle_connection, ConnectionStats};
use tidekv::protocol::DecoderLimits;
use tidekv::storage::{ExpirySweeper, StorageEngine};
use tidekv::ServerConfig;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(version = tidekv::VERSION, "TideKV starting");

    // Shared across all connections
    let storage = Arc::new(StorageEngine::with_mode(config.expiry_mode));
    info!(expiry_mode = %config.expiry_mode, "Storage engine initialized with 64 shards");

    let _sweeper = ExpirySweeper::start(Arc::clone(&storage), config.expiry_config());

    let stats = Arc::new(ConnectionStats::new());

    let listener = TcpListener::bind(config.bind_address()).await?;
    info!("Listening on {}", config.bind_address());

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, stopping server...");
    };

    tokio::select! {
        _ = accept_loop(listener, Arc::clone(&storage), Arc::clone(&stats), config.decoder_limits()) => {}
        _ = shutdown => {}
    }

    let store = storage.stats();
    info!(
        connections = stats.connections_accepted.load(Ordering::Relaxed),
        commands = stats.commands_processed.load(Ordering::Relaxed),
        protocol_errors = stats.protocol_errors.load(Ordering::Relaxed),
        keys = store.keys,
        expired = store.expired,
        "Server shutdown complete"
    );
    Ok(())
}

/// Main loop that accepts incoming connections
async fn accept_loop(
    listener: TcpListener,
    storage: Arc<StorageEngine>,
    stats: Arc<ConnectionStats>,
    limits: DecoderLimits,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let handler = CommandHandler::new(Arc::clone(&storage));
                let stats = Arc::clone(&stats);

                tokio::spawn(handle_connection(stream, addr, handler, stats, limits));
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
