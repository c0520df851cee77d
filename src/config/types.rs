//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Smallest receive buffer a listener or connection accepts
pub const MIN_BUFFER_SIZE: usize = 10;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: ListenMode,
    pub buffer_size: usize,
    /// Nagle's algorithm on accepted connections (`false` sets TCP_NODELAY)
    pub nagle: bool,
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
}

/// Which endpoints the server listens on
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ListenMode {
    /// One port on each of several addresses
    SinglePort { ips: Vec<IpAddr>, port: u16 },
    /// Every address crossed with every port
    MultiPort { ips: Vec<IpAddr>, ports: Vec<u16> },
}

impl ListenMode {
    /// Expand to endpoints, ordered by port then address
    pub fn endpoints(&self) -> Vec<SocketAddr> {
        match self {
            ListenMode::SinglePort { ips, port } => {
                ips.iter().map(|ip| SocketAddr::new(*ip, *port)).collect()
            }
            ListenMode::MultiPort { ips, ports } => ports
                .iter()
                .flat_map(|port| ips.iter().map(move |ip| SocketAddr::new(*ip, *port)))
                .collect(),
        }
    }

    pub fn ips(&self) -> &[IpAddr] {
        match self {
            ListenMode::SinglePort { ips, .. } | ListenMode::MultiPort { ips, .. } => ips,
        }
    }

    pub fn ports(&self) -> Vec<u16> {
        match self {
            ListenMode::SinglePort { port, .. } => vec![*port],
            ListenMode::MultiPort { ports, .. } => ports.clone(),
        }
    }

    /// Build the mode that fits the number of ports given
    pub fn from_parts(ips: Vec<IpAddr>, ports: Vec<u16>) -> Self {
        match ports.as_slice() {
            [port] => ListenMode::SinglePort { ips, port: *port },
            _ => ListenMode::MultiPort { ips, ports },
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub buffer_size: usize,
    pub nagle: bool,
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Grace period used by `close_all`
    #[serde(with = "humantime_serde")]
    pub close_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: ListenMode::SinglePort {
                ips: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
                port: 9000,
            },
            buffer_size: 8192,
            nagle: false,
            probe_timeout: Duration::from_millis(1),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            buffer_size: 8192,
            nagle: false,
            probe_timeout: Duration::from_millis(1),
            close_grace: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
