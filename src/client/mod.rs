//! Client Module
//!
//! Outbound connections sharing the server's receive loop.

pub mod connector;

pub use connector::{Client, ConnectOptions};
