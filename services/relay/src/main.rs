//! tcprelay
//!
//! Multi-worker TCP relay.
//!
//! This service:
//! - Accepts TCP connections on a local endpoint
//! - Spreads them round-robin over a fixed pool of worker threads
//! - Relays each connection's bytes, unmodified, to one fixed upstream server
//! - Records every completed read and write as a diagnostics record

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tcprelay::{diagnostics, Cli, RelayConfig, RelayServer};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config = RelayConfig::from(Cli::parse());

    // Initialize tracing (prefer RUST_LOG, fallback to TCPRELAY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_filter())))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        listen_host = %config.listen_host,
        listen_port = config.listen_port,
        upstream_host = %config.upstream_host,
        upstream_port = config.upstream_port,
        workers = config.workers,
        buffer_size = config.buffer_size,
        diagnostics_file = ?config.diagnostics_file,
        "Configuration loaded"
    );

    let sink = diagnostics::open_sink(config.diagnostics_file.as_deref())?;

    let server = match RelayServer::start(&config, sink).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, reason = e.reason_code(), "Failed to start relay");
            return Err(e.into());
        }
    };

    // Run until Ctrl+C
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    } else {
        info!("Received shutdown signal");
    }

    server.shutdown().await;
    Ok(())
}
