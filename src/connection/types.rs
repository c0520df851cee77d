//! Connection Types

use std::fmt;
use std::net::SocketAddr;
use std::os::raw::c_int;

/// An (IP address, port) pair identifying one listening socket
pub type Endpoint = SocketAddr;

/// Identifier of one connection, unique for the lifetime of its registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<ConnectionId> for u64 {
    fn from(id: ConnectionId) -> Self {
        id.0
    }
}

/// Raw flags handed to `send(2)` untouched (`MSG_OOB`, `MSG_DONTROUTE`, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendFlags(pub c_int);

impl SendFlags {
    pub const NONE: SendFlags = SendFlags(0);

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Why a receive loop left the `Receiving` state
#[derive(Debug)]
pub enum CloseReason {
    /// Zero-length read
    PeerClosed,
    ReadError(std::io::Error),
    /// Liveness probe reported the socket as dead
    ProbeFailed(std::io::Error),
    /// Close requested through the registry (`close`, `stop`)
    LocalClose,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed the connection"),
            CloseReason::ReadError(e) => write!(f, "read failed: {}", e),
            CloseReason::ProbeFailed(e) => write!(f, "liveness probe failed: {}", e),
            CloseReason::LocalClose => write!(f, "closed locally"),
        }
    }
}

/// Connection statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    pub active_connections: usize,
    pub total_connections_served: u64,
    pub listening_endpoints: usize,
}
