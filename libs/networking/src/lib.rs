//! Networking primitives for the relay.
//!
//! This library provides:
//! - The immutable `Endpoint` (address, port) pair
//! - Parsing of IP literals and `host:port` strings
//!
//! Host names are never resolved here; only literal addresses are accepted.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address literal.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid or missing port.
    #[error("invalid port: {0}")]
    InvalidPort(String),
}

// ============================================================================
// Endpoint
// ============================================================================

/// An immutable (address, port) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    address: IpAddr,
    port: u16,
}

impl Endpoint {
    /// Create a new endpoint.
    pub const fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }

    /// Parse an endpoint from an address literal and a port.
    ///
    /// Accepts IPv4 (`127.0.0.1`), IPv6 (`::1`) and bracketed IPv6 (`[::1]`).
    pub fn parse(host: &str, port: u16) -> Result<Self, NetworkError> {
        let trimmed = host.trim();
        let literal = trimmed
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(trimmed);

        let address = IpAddr::from_str(literal)
            .map_err(|_| NetworkError::InvalidAddress(host.to_string()))?;

        Ok(Self { address, port })
    }

    /// The IP address.
    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// The port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the socket address for this endpoint.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = NetworkError;

    /// Parse from `host:port` (e.g., "127.0.0.1:9000" or "[::1]:9000").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((host, port_str)) = s.rsplit_once(':') else {
            return Err(NetworkError::InvalidPort(format!("missing ':' in {}", s)));
        };

        // An unbracketed IPv6 literal also contains ':'; require brackets so
        // the port boundary is unambiguous.
        if host.contains(':') && !host.starts_with('[') {
            return Err(NetworkError::InvalidAddress(s.to_string()));
        }

        let port = port_str
            .parse::<u16>()
            .map_err(|_| NetworkError::InvalidPort(port_str.to_string()))?;

        Self::parse(host, port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}
