//! Server Module
//!
//! Multi-endpoint listeners feeding one server-wide connection registry.

pub mod listener;
pub mod manager;

pub use listener::LISTEN_BACKLOG;
pub use manager::{Server, StartReport};
