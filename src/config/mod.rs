//! Configuration Module
//!
//! Handles configuration loading, validation, and management.

pub mod manager;
pub mod types;

pub use manager::{validate_buffer_size, ConfigManager};
pub use types::*;
