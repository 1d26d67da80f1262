//! TCP acceptor.
//!
//! Binds the listening endpoint and accepts connections until shutdown,
//! handing each one to the worker pool. The hand-off runs between two
//! accepts but never waits on a worker: it is a non-blocking channel send,
//! and connections arriving meanwhile queue in the listen backlog.
//!
//! A bind failure is fatal. A failed accept is logged, followed by a short
//! pause, and the loop goes on.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tcprelay_networking::Endpoint;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::pool::WorkerPool;
use crate::error::RelayError;

/// Pause after a failed accept so a persistent fault (e.g. EMFILE) does not spin.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Statistics for the acceptor.
#[derive(Debug, Default)]
pub struct AcceptorStats {
    /// Connections accepted.
    pub accepted: AtomicU64,
    /// Failed accept attempts.
    pub accept_errors: AtomicU64,
    /// Accepted connections that could not be handed to a worker.
    pub dispatch_failures: AtomicU64,
}

/// Source of inbound connections.
pub trait AcceptSource {
    /// Wait for the next inbound connection.
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;

    /// Address connections arrive on.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl AcceptSource for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// The listening side of the relay.
pub struct Acceptor<L = TcpListener> {
    /// Where connections come from.
    listener: L,
    /// Pool receiving accepted connections.
    pool: Arc<WorkerPool>,
    /// Statistics.
    stats: Arc<AcceptorStats>,
}

impl Acceptor<TcpListener> {
    /// Bind the listening endpoint.
    pub async fn bind(endpoint: Endpoint, pool: Arc<WorkerPool>) -> Result<Self, RelayError> {
        let addr = endpoint.socket_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| RelayError::Bind { addr, source })?;

        info!(
            bind_addr = %local_addr,
            workers = pool.size(),
            "Acceptor bound"
        );

        Ok(Self::with_listener(listener, pool))
    }
}

impl<L: AcceptSource> Acceptor<L> {
    /// Accept from an already bound source.
    pub fn with_listener(listener: L, pool: Arc<WorkerPool>) -> Self {
        Self {
            listener,
            pool,
            stats: Arc::new(AcceptorStats::default()),
        }
    }

    /// Get the local address this acceptor is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get acceptor statistics.
    pub fn stats(&self) -> Arc<AcceptorStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until `true` is published on `shutdown` (or its
    /// sender is dropped).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let local_addr = self.listener.local_addr().ok();
        info!(bind_addr = ?local_addr, "Acceptor started");

        loop {
            let accepted = tokio::select! {
                result = self.listener.accept() => result,
                _ = stop_requested(&mut shutdown) => break,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                    self.hand_off(stream, peer_addr);
                }
                Err(e) => {
                    self.stats.accept_errors.fetch_add(1, Ordering::Relaxed);
                    let err = RelayError::Accept(e);
                    warn!(error = %err, reason = err.reason_code(), "Accept error");

                    tokio::select! {
                        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                        _ = stop_requested(&mut shutdown) => break,
                    }
                }
            }
        }

        info!(
            accepted = self.stats.accepted.load(Ordering::Relaxed),
            "Acceptor stopped"
        );
    }

    fn hand_off(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let result = stream
            .into_std()
            .and_then(|stream| self.pool.dispatch(stream, peer_addr));

        match result {
            Ok(worker) => {
                debug!(peer_addr = %peer_addr, worker, "Connection handed off");
            }
            Err(e) => {
                self.stats.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                warn!(peer_addr = %peer_addr, error = %e, "Failed to hand off connection");
            }
        }
    }
}

/// Resolve once shutdown is signalled or its sender is gone.
async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
