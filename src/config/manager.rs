//! Configuration Manager

use super::{ClientConfig, Config, ListenMode, ServerConfig, MIN_BUFFER_SIZE};
use crate::error::ConfigError;
use crate::Result;
use anyhow::{bail, Context};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        let ips = match std::env::var("TCPLINK_LISTEN_IPS") {
            Ok(raw) => parse_list::<IpAddr>(&raw)
                .with_context(|| format!("Invalid TCPLINK_LISTEN_IPS: {}", raw))?,
            Err(_) => config.server.listen.ips().to_vec(),
        };

        let ports = match std::env::var("TCPLINK_PORTS") {
            Ok(raw) => parse_list::<u16>(&raw)
                .with_context(|| format!("Invalid TCPLINK_PORTS: {}", raw))?,
            Err(_) => config.server.listen.ports(),
        };

        config.server.listen = ListenMode::from_parts(ips, ports);

        if let Ok(buffer_size) = std::env::var("TCPLINK_BUFFER_SIZE") {
            let size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid TCPLINK_BUFFER_SIZE: {}", buffer_size))?;
            config.server.buffer_size = size;
            config.client.buffer_size = size;
        }

        if let Ok(nagle) = std::env::var("TCPLINK_NAGLE") {
            let nagle = nagle
                .parse::<bool>()
                .with_context(|| format!("Invalid TCPLINK_NAGLE: {}", nagle))?;
            config.server.nagle = nagle;
            config.client.nagle = nagle;
        }

        if let Ok(grace) = std::env::var("TCPLINK_CLOSE_GRACE") {
            config.client.close_grace = humantime::parse_duration(&grace)
                .with_context(|| format!("Invalid TCPLINK_CLOSE_GRACE: {}", grace))?;
        }

        if let Ok(log_level) = std::env::var("TCPLINK_LOG_LEVEL") {
            config.logging.level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_list<T>(raw: &str) -> Result<Vec<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| item.parse::<T>().map_err(anyhow::Error::from))
        .collect()
}

/// Reject receive buffers below the minimum
pub fn validate_buffer_size(size: usize) -> std::result::Result<(), ConfigError> {
    if size < MIN_BUFFER_SIZE {
        return Err(ConfigError::BufferTooSmall {
            size,
            min: MIN_BUFFER_SIZE,
        });
    }
    Ok(())
}

impl ServerConfig {
    /// Check the listen set and buffer before any socket is created
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        validate_buffer_size(self.buffer_size)?;

        let endpoints = self.listen.endpoints();
        if endpoints.is_empty() {
            return Err(ConfigError::NoAddresses);
        }

        let mut seen = HashSet::new();
        for endpoint in endpoints {
            if endpoint.port() == 0 {
                return Err(ConfigError::InvalidPort { port: 0 });
            }
            if !seen.insert(endpoint) {
                return Err(ConfigError::DuplicateEndpoint(endpoint));
            }
        }

        Ok(())
    }
}

impl ClientConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        validate_buffer_size(self.buffer_size)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.server
            .validate()
            .with_context(|| "Server configuration validation failed")?;

        self.client
            .validate()
            .with_context(|| "Client configuration validation failed")?;

        self.validate_logging_config()
            .with_context(|| "Logging configuration validation failed")?;

        Ok(())
    }

    fn validate_logging_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!(
                "logging.level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        ips: &[IpAddr],
        ports: &[u16],
        buffer_size: Option<usize>,
        nagle: Option<bool>,
    ) {
        if !ips.is_empty() || !ports.is_empty() {
            let ips = if ips.is_empty() {
                self.server.listen.ips().to_vec()
            } else {
                ips.to_vec()
            };
            let ports = if ports.is_empty() {
                self.server.listen.ports()
            } else {
                ports.to_vec()
            };
            self.server.listen = ListenMode::from_parts(ips, ports);
            tracing::info!("CLI override: listen set to {:?}", self.server.listen);
        }

        if let Some(buffer_size) = buffer_size {
            self.server.buffer_size = buffer_size;
            self.client.buffer_size = buffer_size;
            tracing::info!("CLI override: buffer size set to {} bytes", buffer_size);
        }

        if let Some(nagle) = nagle {
            self.server.nagle = nagle;
            self.client.nagle = nagle;
            tracing::info!("CLI override: nagle set to {}", nagle);
        }
    }
}
