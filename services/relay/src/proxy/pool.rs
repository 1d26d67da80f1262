//! Worker pool and connection dispatch.
//!
//! The pool owns a fixed set of workers and hands each accepted connection to
//! the next one in round-robin order. Over any run of M connections where M is
//! a multiple of the pool size N, every worker receives exactly M/N of them.
//!
//! The pool never owns sessions; each worker owns the ones it created.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tokio::sync::watch;
use tracing::{debug, error, info};

use super::worker::{self, BridgeConfig, WorkerHandle};
use crate::diagnostics::DiagnosticsSink;
use crate::error::RelayError;

/// A fixed set of worker threads.
pub struct WorkerPool {
    /// Workers, indexed by position.
    workers: Vec<WorkerHandle>,
    /// Round-robin cursor.
    rr_counter: AtomicUsize,
    /// Worker threads, taken on shutdown.
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    /// Drain signal observed by every worker and session.
    drain_tx: watch::Sender<bool>,
}

impl WorkerPool {
    /// Start `size` workers.
    pub fn start(
        size: usize,
        config: BridgeConfig,
        sink: Arc<dyn DiagnosticsSink>,
    ) -> Result<Self, RelayError> {
        if size == 0 {
            return Err(RelayError::Config("worker pool size must be at least 1".into()));
        }

        let (drain_tx, drain_rx) = watch::channel(false);
        let mut workers = Vec::with_capacity(size);
        let mut threads = Vec::with_capacity(size);

        for index in 0..size {
            match worker::spawn(index, config, Arc::clone(&sink), drain_rx.clone()) {
                Ok((handle, thread)) => {
                    workers.push(handle);
                    threads.push(thread);
                }
                Err(e) => {
                    // Stop whatever already started before reporting.
                    drain_tx.send_replace(true);
                    for thread in threads {
                        let _ = thread.join();
                    }
                    return Err(e);
                }
            }
        }

        info!(
            workers = size,
            upstream = %config.upstream,
            buffer_size = config.buffer_size,
            "Worker pool started"
        );

        Ok(Self {
            workers,
            rr_counter: AtomicUsize::new(0),
            threads: Mutex::new(threads),
            drain_tx,
        })
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// All workers, in index order.
    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    /// Get a worker by index.
    pub fn worker(&self, index: usize) -> Option<&WorkerHandle> {
        self.workers.get(index)
    }

    /// Pick the next worker in round-robin order.
    pub fn select_worker(&self) -> &WorkerHandle {
        let idx = self.rr_counter.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[idx]
    }

    /// Hand a connection to the next worker. Returns the worker's index.
    pub fn dispatch(&self, stream: std::net::TcpStream, peer_addr: SocketAddr) -> io::Result<usize> {
        let worker = self.select_worker();
        worker.assign(stream, peer_addr)?;
        debug!(peer_addr = %peer_addr, worker = worker.index(), "Connection dispatched");
        Ok(worker.index())
    }

    /// Signal every worker to drain and wait for all of them to exit.
    ///
    /// Workers close the sockets of their open sessions before exiting.
    /// Calling this again is a no-op. Blocks the calling thread.
    pub fn shutdown(&self) {
        self.drain_tx.send_replace(true);

        let threads: Vec<_> = self
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if threads.is_empty() {
            return;
        }

        info!(workers = threads.len(), "Draining worker pool");
        for thread in threads {
            let name = thread.thread().name().map(str::to_owned);
            if thread.join().is_err() {
                error!(thread = ?name, "Worker thread panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Detached workers still drain on their own.
        self.drain_tx.send_replace(true);
    }
}
