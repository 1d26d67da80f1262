//! Worker threads.
//!
//! A worker is one OS thread running a single-threaded tokio runtime with a
//! `LocalSet`. Sessions are spawned as local tasks, so their state is never
//! shared with another thread and needs no locking.
//!
//! Connections arrive as `std::net::TcpStream` over an unbounded channel and
//! are registered with the worker's own reactor. Finished sessions are reaped
//! through a `JoinSet` and removed from the per-worker `SessionRegistry` by
//! task id, so a panicked session is removed without touching any other.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;
use std::time::Instant;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::{self, JoinError, JoinSet, LocalSet};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::bridge::{Bridge, BridgeState, BridgeSummary, StateCell, TeardownCause};
use super::drained;
use crate::diagnostics::{DiagnosticsSink, SessionId, SessionTap};
use crate::error::RelayError;

/// Settings every bridge of a pool shares.
#[derive(Debug, Clone, Copy)]
pub struct BridgeConfig {
    /// Upstream server address.
    pub upstream: SocketAddr,
    /// Per-direction relay buffer size.
    pub buffer_size: usize,
    /// Payload bytes captured per diagnostics record.
    pub excerpt_len: usize,
}

/// Statistics for a worker, readable from any thread.
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Connections handed to this worker.
    pub sessions_assigned: AtomicU64,
    /// Sessions currently alive on this worker.
    pub sessions_active: AtomicU64,
    /// Sessions finished (any outcome).
    pub sessions_completed: AtomicU64,
    /// Sessions that never reached `Active`.
    pub upstream_connect_failures: AtomicU64,
    /// Bytes written to the upstream server.
    pub bytes_up: AtomicU64,
    /// Bytes written to clients.
    pub bytes_down: AtomicU64,
}

pub(crate) enum WorkerCommand {
    Assign {
        stream: std::net::TcpStream,
        peer_addr: SocketAddr,
    },
}

/// Cross-thread handle to a worker.
#[derive(Debug)]
pub struct WorkerHandle {
    index: usize,
    tx: mpsc::UnboundedSender<WorkerCommand>,
    stats: Arc<WorkerStats>,
}

impl WorkerHandle {
    /// Position of this worker in the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Worker statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Hand a connection to this worker.
    pub(crate) fn assign(&self, stream: std::net::TcpStream, peer_addr: SocketAddr) -> io::Result<()> {
        // The worker registers the socket with its own reactor.
        stream.set_nonblocking(true)?;
        self.tx
            .send(WorkerCommand::Assign { stream, peer_addr })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "worker stopped"))?;
        self.stats.sessions_assigned.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl std::fmt::Debug for WorkerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerCommand::Assign { peer_addr, .. } => {
                f.debug_struct("Assign").field("peer_addr", peer_addr).finish()
            }
        }
    }
}

// =============================================================================
// Session registry
// =============================================================================

/// A live session as seen by its worker.
#[derive(Debug)]
pub struct SessionEntry {
    /// Client address.
    pub peer_addr: SocketAddr,
    /// When the connection was accepted by the worker.
    pub started_at: Instant,
    state: StateCell,
    task: Option<task::Id>,
}

impl SessionEntry {
    /// Current bridge state.
    pub fn state(&self) -> BridgeState {
        self.state.get()
    }
}

/// Per-worker arena of live sessions, addressed by `SessionId`.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    entries: HashMap<SessionId, SessionEntry>,
    tasks: HashMap<task::Id, SessionId>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, id: SessionId, peer_addr: SocketAddr, state: StateCell) {
        self.entries.insert(
            id,
            SessionEntry {
                peer_addr,
                started_at: Instant::now(),
                state,
                task: None,
            },
        );
    }

    /// Associate the task driving a session with its entry.
    pub(crate) fn bind_task(&mut self, id: SessionId, task: task::Id) {
        if let Some(entry) = self.entries.get_mut(&id) {
            if let Some(previous) = entry.task.replace(task) {
                self.tasks.remove(&previous);
            }
            self.tasks.insert(task, id);
        }
    }

    /// Remove a finished session.
    pub fn remove(&mut self, id: &SessionId) -> Option<SessionEntry> {
        let entry = self.entries.remove(id)?;
        if let Some(task) = entry.task {
            self.tasks.remove(&task);
        }
        Some(entry)
    }

    /// Remove the session driven by `task`, whether it finished or failed.
    pub fn remove_task(&mut self, task: task::Id) -> Option<(SessionId, SessionEntry)> {
        let id = self.tasks.remove(&task)?;
        let entry = self.entries.remove(&id)?;
        Some((id, entry))
    }

    /// Look a session up by handle.
    pub fn get(&self, id: &SessionId) -> Option<&SessionEntry> {
        self.entries.get(id)
    }

    /// Number of sessions currently in `state`.
    pub fn count_in(&self, state: BridgeState) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.state() == state)
            .count()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no session is live.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Worker
// =============================================================================

struct Worker {
    index: usize,
    config: BridgeConfig,
    sink: Arc<dyn DiagnosticsSink>,
    stats: Arc<WorkerStats>,
    drain: watch::Receiver<bool>,
    registry: SessionRegistry,
    sessions: JoinSet<BridgeSummary>,
    next_seq: u64,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WorkerCommand>) {
        info!(worker = self.index, "Worker started");

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(WorkerCommand::Assign { stream, peer_addr }) => {
                        self.start_session(stream, peer_addr);
                    }
                    None => break,
                },
                Some(joined) = self.sessions.join_next_with_id(), if !self.sessions.is_empty() => {
                    self.complete(joined);
                }
                _ = drained(&mut self.drain) => break,
            }
        }

        // Stop taking connections; queued ones are closed by dropping them.
        drop(rx);

        info!(
            worker = self.index,
            connecting = self.registry.count_in(BridgeState::Connecting),
            active = self.registry.count_in(BridgeState::Active),
            "Worker draining"
        );

        // Every bridge watches the same drain signal and closes its sockets.
        while let Some(joined) = self.sessions.join_next_with_id().await {
            self.complete(joined);
        }

        info!(
            worker = self.index,
            completed = self.stats.sessions_completed.load(Ordering::Relaxed),
            "Worker stopped"
        );
    }

    fn start_session(&mut self, stream: std::net::TcpStream, peer_addr: SocketAddr) {
        let stream = match TcpStream::from_std(stream) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    worker = self.index,
                    peer_addr = %peer_addr,
                    error = %e,
                    "Failed to register connection with worker"
                );
                return;
            }
        };

        self.next_seq += 1;
        let id = SessionId::new(self.index, self.next_seq);
        let tap = SessionTap::new(id, Arc::clone(&self.sink), self.config.excerpt_len);
        let bridge: Bridge<TcpStream> = Bridge::new(id, stream, self.config.buffer_size, tap);

        self.registry.insert(id, peer_addr, bridge.state_cell());
        self.stats.sessions_active.fetch_add(1, Ordering::Relaxed);

        debug!(worker = self.index, session = %id, peer_addr = %peer_addr, "Session created");

        let span = info_span!("session", session = %id, peer = %peer_addr);
        let handle = self.sessions.spawn_local(
            bridge
                .run(self.config.upstream, self.drain.clone())
                .instrument(span),
        );
        self.registry.bind_task(id, handle.id());
    }

    fn complete(&mut self, joined: Result<(task::Id, BridgeSummary), JoinError>) {
        self.stats.sessions_active.fetch_sub(1, Ordering::Relaxed);
        self.stats.sessions_completed.fetch_add(1, Ordering::Relaxed);

        let (task_id, summary) = match joined {
            Ok(joined) => joined,
            Err(e) => {
                let session = self.registry.remove_task(e.id()).map(|(id, _)| id);
                error!(
                    worker = self.index,
                    session = ?session,
                    error = %e,
                    "Session task failed"
                );
                return;
            }
        };

        let entry = self
            .registry
            .remove_task(task_id)
            .map(|(_, entry)| entry)
            .or_else(|| self.registry.remove(&summary.session));
        if !summary.reached_active {
            self.stats
                .upstream_connect_failures
                .fetch_add(1, Ordering::Relaxed);
        }
        self.stats
            .bytes_up
            .fetch_add(summary.bytes_up, Ordering::Relaxed);
        self.stats
            .bytes_down
            .fetch_add(summary.bytes_down, Ordering::Relaxed);

        let cause = summary
            .cause
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        let duration_ms = entry
            .as_ref()
            .map(|e| e.started_at.elapsed().as_millis() as u64)
            .unwrap_or(0);

        match &summary.cause {
            Some(TeardownCause::Fault(err)) if !summary.reached_active => {
                warn!(
                    worker = self.index,
                    session = %summary.session,
                    error = %err,
                    reason = err.reason_code(),
                    "Session failed before activation"
                );
            }
            _ => {
                debug!(
                    worker = self.index,
                    session = %summary.session,
                    bytes_up = summary.bytes_up,
                    bytes_down = summary.bytes_down,
                    duration_ms,
                    cause = %cause,
                    "Session closed"
                );
            }
        }
    }
}

/// Start a worker thread.
///
/// Returns once the worker's runtime is up, or with the error that prevented
/// it from starting.
pub(crate) fn spawn(
    index: usize,
    config: BridgeConfig,
    sink: Arc<dyn DiagnosticsSink>,
    drain: watch::Receiver<bool>,
) -> Result<(WorkerHandle, thread::JoinHandle<()>), RelayError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = std_mpsc::sync_channel::<io::Result<()>>(1);
    let stats = Arc::new(WorkerStats::default());
    let worker_stats = Arc::clone(&stats);

    let thread = thread::Builder::new()
        .name(format!("tcprelay-worker-{}", index))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            let worker = Worker {
                index,
                config,
                sink,
                stats: worker_stats,
                drain,
                registry: SessionRegistry::new(),
                sessions: JoinSet::new(),
                next_seq: 0,
            };

            let local = LocalSet::new();
            local.block_on(&runtime, worker.run(rx));
        })
        .map_err(|source| RelayError::WorkerSpawn { index, source })?;

    let ready = ready_rx.recv().unwrap_or_else(|_| {
        Err(io::Error::other("worker thread exited before start"))
    });
    if let Err(source) = ready {
        let _ = thread.join();
        return Err(RelayError::WorkerSpawn { index, source });
    }

    Ok((WorkerHandle { index, tx, stats }, thread))
}
