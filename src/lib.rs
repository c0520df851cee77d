//! TcpLink Library
//!
//! Raw TCP connection manager. A [`Server`] listens on any number of
//! (IP, port) endpoints, a [`Client`] opens outbound connections, and both
//! report connected / message / disconnected events for every connection to
//! a consumer-supplied sink. Bytes are delivered exactly as read; no framing
//! is applied.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod server;
pub mod shutdown;

pub use client::{Client, ConnectOptions};
pub use config::Config;
pub use connection::{Connection, ConnectionId, ConnectionRegistry, Endpoint, SendFlags};
pub use error::{ConfigError, ConnectError, ConnectionError, ListenError};
pub use events::{ChannelSink, ClientEvents, LinkEvent, LoggingSink, ServerEvents};
pub use server::{Server, StartReport};
pub use shutdown::ShutdownCoordinator;

/// Common error type for application-level plumbing
pub type Result<T> = anyhow::Result<T>;
