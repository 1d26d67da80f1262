//! Relay server: worker pool plus acceptor, with ordered shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use tcprelay_networking::Endpoint;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::RelayConfig;
use crate::diagnostics::DiagnosticsSink;
use crate::error::RelayError;
use crate::proxy::{Acceptor, AcceptorStats, BridgeConfig, WorkerPool};

/// A running relay.
pub struct RelayServer {
    local_addr: SocketAddr,
    upstream: Endpoint,
    pool: Arc<WorkerPool>,
    acceptor_stats: Arc<AcceptorStats>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl RelayServer {
    /// Parse the endpoints, start the worker pool, bind and start accepting.
    pub async fn start(
        config: &RelayConfig,
        sink: Arc<dyn DiagnosticsSink>,
    ) -> Result<Self, RelayError> {
        config.validate()?;
        let listen = Endpoint::parse(&config.listen_host, config.listen_port)?;
        let upstream = Endpoint::parse(&config.upstream_host, config.upstream_port)?;

        let bridge_config = BridgeConfig {
            upstream: upstream.socket_addr(),
            buffer_size: config.buffer_size,
            excerpt_len: config.excerpt_len,
        };
        let pool = Arc::new(WorkerPool::start(config.workers, bridge_config, sink)?);

        let acceptor = Acceptor::bind(listen, Arc::clone(&pool)).await?;
        let local_addr = acceptor
            .local_addr()
            .map_err(|source| RelayError::Bind {
                addr: listen.socket_addr(),
                source,
            })?;
        let acceptor_stats = acceptor.stats();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(acceptor.run(shutdown_rx));

        info!(
            listen = %local_addr,
            upstream = %upstream,
            workers = pool.size(),
            "Relay started"
        );

        Ok(Self {
            local_addr,
            upstream,
            pool,
            acceptor_stats,
            shutdown_tx,
            accept_task,
        })
    }

    /// Address the acceptor is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Upstream server endpoint.
    pub fn upstream(&self) -> Endpoint {
        self.upstream
    }

    /// The worker pool.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Acceptor statistics.
    pub fn acceptor_stats(&self) -> &AcceptorStats {
        &self.acceptor_stats
    }

    /// Stop accepting, close every open session, then join all workers.
    pub async fn shutdown(self) {
        info!("Relay shutting down");

        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.accept_task.await {
            error!(error = %e, "Acceptor task failed");
        }

        let pool = Arc::clone(&self.pool);
        if let Err(e) = tokio::task::spawn_blocking(move || pool.shutdown()).await {
            error!(error = %e, "Worker pool shutdown failed");
        }

        info!("Relay shutdown complete");
    }
}
