//! Error Types
//!
//! Typed failures for setup, listening, connecting and per-connection
//! operations. Application plumbing (config files, the binary) uses
//! `anyhow` on top of these.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::connection::ConnectionId;

/// Configuration rejected before any socket is created
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("port {port} is outside 1..=65535")]
    InvalidPort { port: u16 },

    #[error("receive buffer of {size} bytes is too small (minimum {min})")]
    BufferTooSmall { size: usize, min: usize },

    #[error("no listen addresses configured")]
    NoAddresses,

    #[error("endpoint {0} is configured more than once")]
    DuplicateEndpoint(SocketAddr),
}

/// Failure to bring up one listening endpoint
#[derive(Debug, Error)]
pub enum ListenError {
    #[error("failed to create socket for {endpoint}: {source}")]
    Socket {
        endpoint: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to listen on {endpoint}: {source}")]
    Listen {
        endpoint: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("already listening on {0}")]
    AlreadyListening(SocketAddr),

    #[error("port {port} is outside 1..=65535")]
    InvalidPort { port: u16 },
}

/// Failure to open an outbound connection
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to create socket: {0}")]
    Socket(#[source] io::Error),

    #[error("failed to bind local address {local}: {source}")]
    Bind {
        local: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {remote}: {source}")]
    Connect {
        remote: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("connect to {remote} timed out")]
    Timeout { remote: SocketAddr },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failure of an operation addressed to a single connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection {0} not found")]
    NotFound(ConnectionId),

    #[error("byte range {start}..{end} is out of bounds for a {len} byte buffer")]
    InvalidRange { start: usize, end: usize, len: usize },

    #[error("I/O error on connection {id}: {source}")]
    Io {
        id: ConnectionId,
        #[source]
        source: io::Error,
    },
}

impl ConnectionError {
    /// True when the connection was unknown or already gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, ConnectionError::NotFound(_))
    }
}
