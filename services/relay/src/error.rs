//! Error types for the relay.
//!
//! Startup faults abort the process. Every other class is contained to the
//! session (or, for accept faults, to the single accept attempt) that raised it.

use std::io;
use std::net::SocketAddr;

use tcprelay_networking::NetworkError;
use thiserror::Error;

use crate::proxy::Leg;

/// Relay errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A configured address could not be parsed.
    #[error("invalid_endpoint: {0}")]
    InvalidEndpoint(#[from] NetworkError),

    /// Invalid startup configuration.
    #[error("config_invalid: {0}")]
    Config(String),

    /// The listening socket could not be bound.
    #[error("bind_failed: {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A worker thread or its runtime could not be started.
    #[error("worker_spawn_failed: worker {index}: {source}")]
    WorkerSpawn {
        index: usize,
        #[source]
        source: io::Error,
    },

    /// A single accept attempt failed.
    #[error("accept_failed: {0}")]
    Accept(#[source] io::Error),

    /// The connection to the upstream server failed.
    #[error("upstream_connect_failed: {addr}: {source}")]
    UpstreamConnect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A read or write on an active session failed.
    #[error("relay_io_failed: {leg} leg: {source}")]
    RelayIo {
        leg: Leg,
        #[source]
        source: io::Error,
    },

    /// The diagnostics store rejected a write.
    #[error("diagnostics_write_failed: {0}")]
    DiagnosticsWrite(#[source] io::Error),
}

impl RelayError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RelayError::InvalidEndpoint(_) => "invalid_endpoint",
            RelayError::Config(_) => "config_invalid",
            RelayError::Bind { .. } => "bind_failed",
            RelayError::WorkerSpawn { .. } => "worker_spawn_failed",
            RelayError::Accept(_) => "accept_failed",
            RelayError::UpstreamConnect { .. } => "upstream_connect_failed",
            RelayError::RelayIo { .. } => "relay_io_failed",
            RelayError::DiagnosticsWrite(_) => "diagnostics_write_failed",
        }
    }

    /// Whether this error class aborts the process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::InvalidEndpoint(_)
                | RelayError::Config(_)
                | RelayError::Bind { .. }
                | RelayError::WorkerSpawn { .. }
        )
    }
}
