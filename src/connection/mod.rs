//! Connection Management Module
//!
//! Connection ids, the shared registry, the registry-side connection handle
//! and the receive loop that drives every connection's lifecycle.

pub mod handle;
pub(crate) mod handler;
pub mod registry;
pub mod types;

pub use handle::Connection;
pub use registry::ConnectionRegistry;
pub use types::{CloseReason, ConnectionId, ConnectionStats, Endpoint, SendFlags};
