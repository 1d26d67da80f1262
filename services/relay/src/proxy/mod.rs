//! Connection-bridging engine.
//!
//! This module provides:
//! - The per-connection `Bridge` state machine
//! - `Worker` threads, each hosting the sessions affinitized to it
//! - The round-robin `WorkerPool`
//! - The `Acceptor` feeding new connections to the pool
//!
//! ## Architecture
//!
//! ```text
//! Client -> Acceptor -> WorkerPool::select_worker -> Worker -> Bridge -> Upstream
//! ```
//!
//! Each worker runs its own single-threaded event loop. A session's sockets,
//! buffers and counters are only ever touched by the worker that created it.

mod acceptor;
mod bridge;
mod pool;
mod worker;

use tokio::sync::watch;

pub use acceptor::{AcceptSource, Acceptor, AcceptorStats, ACCEPT_ERROR_BACKOFF};
pub use bridge::{
    Bridge, BridgeState, BridgeSummary, Leg, StateCell, TeardownCause, DEFAULT_BUFFER_SIZE,
};
pub use pool::WorkerPool;
pub use worker::{BridgeConfig, SessionEntry, SessionRegistry, WorkerHandle, WorkerStats};

/// Resolve once `true` is published on a shutdown channel.
///
/// Never resolves if the sender is gone without having signalled.
pub(crate) async fn drained(rx: &mut watch::Receiver<bool>) {
    let signalled = rx.wait_for(|drain| *drain).await.is_ok();
    if !signalled {
        std::future::pending::<()>().await;
    }
}
