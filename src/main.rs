//! TcpLink - raw TCP connection manager
//!
//! Listens on the configured endpoints and logs every connection's
//! lifecycle; with `--echo` each received chunk is written back.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tcplink::config::ConfigManager;
use tcplink::{ChannelSink, LinkEvent, LoggingSink, Server, ServerEvents, ShutdownCoordinator};

/// CLI arguments for TcpLink
#[derive(Parser, Debug)]
#[command(name = "tcplink")]
#[command(about = "TcpLink - raw TCP connection manager")]
#[command(version)]
#[command(long_about = "
TcpLink - raw TCP connection manager

Listens on one port across several addresses, or on every address/port
combination, and reports connections, received byte chunks and disconnects.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  TCPLINK_LISTEN_IPS    - Comma separated listen addresses
  TCPLINK_PORTS         - Comma separated listen ports
  TCPLINK_BUFFER_SIZE   - Receive buffer size in bytes (minimum 10)
  TCPLINK_NAGLE         - Enable Nagle's algorithm (true/false)
  TCPLINK_CLOSE_GRACE   - Client close grace period (e.g., 1s, 250ms)
  TCPLINK_LOG_LEVEL     - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "tcplink.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Listen address, may be repeated (overrides config file)
    #[arg(short, long = "ip", help = "Listen address (repeatable)")]
    pub ips: Vec<IpAddr>,

    /// Listen port, may be repeated (overrides config file)
    #[arg(short, long = "port", help = "Listen port (repeatable)")]
    pub ports: Vec<u16>,

    /// Receive buffer size in bytes
    #[arg(long, help = "Receive buffer size in bytes")]
    pub buffer_size: Option<usize>,

    /// Enable Nagle's algorithm on accepted connections
    #[arg(long, help = "Enable Nagle's algorithm")]
    pub nagle: Option<bool>,

    /// Write every received chunk back to its sender
    #[arg(long, help = "Echo received data back")]
    pub echo: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };

    config.merge_with_cli_args(&args.ips, &args.ports, args.buffer_size, args.nagle);
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    init_tracing(&args, &config.logging.level)?;

    config
        .validate()
        .context("Final configuration validation failed")?;

    info!("Starting TcpLink v{}", env!("CARGO_PKG_VERSION"));

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Endpoints: {:?}", config.server.listen.endpoints());
        info!("  Buffer size: {} bytes", config.server.buffer_size);
        info!(
            "  Nagle: {}",
            if config.server.nagle { "enabled" } else { "disabled" }
        );
        return Ok(());
    }

    let (echo_sink, mut echo_rx) = ChannelSink::new();
    let sink: Arc<dyn ServerEvents> = if args.echo {
        Arc::new(EchoSink { channel: echo_sink })
    } else {
        Arc::new(LoggingSink)
    };

    let server = Arc::new(Server::new(config.server.clone(), sink)?);
    let report = server.start().await;
    for (endpoint, reason) in &report.failed {
        error!("Endpoint {} failed: {}", endpoint, reason);
    }
    if report.started.is_empty() {
        anyhow::bail!("No endpoint could be started");
    }

    let echo_handle = args.echo.then(|| {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            while let Some(event) = echo_rx.recv().await {
                if let LinkEvent::Message {
                    endpoint: Some(endpoint),
                    id,
                    chunk,
                } = event
                {
                    if let Err(e) = server.send(endpoint, id, &chunk).await {
                        warn!("Echo to connection {} failed: {}", id, e);
                    }
                }
            }
        })
    });

    info!("TcpLink started on {} endpoint(s)", report.started.len());

    let shutdown_coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
    if let Err(e) = shutdown_coordinator.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
    }

    shutdown_coordinator.shutdown_server(&server).await?;

    if let Some(handle) = echo_handle {
        handle.abort();
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Logs like [`LoggingSink`] and forwards events for echoing
struct EchoSink {
    channel: ChannelSink,
}

impl ServerEvents for EchoSink {
    fn on_connected(&self, endpoint: tcplink::Endpoint, id: tcplink::ConnectionId) {
        LoggingSink.on_connected(endpoint, id);
    }

    fn on_message(&self, endpoint: tcplink::Endpoint, id: tcplink::ConnectionId, chunk: bytes::Bytes) {
        LoggingSink.on_message(endpoint, id, chunk.clone());
        self.channel.on_message(endpoint, id, chunk);
    }

    fn on_disconnected(&self, endpoint: tcplink::Endpoint, id: tcplink::ConnectionId) {
        LoggingSink.on_disconnected(endpoint, id);
    }
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, config_level: &str) -> Result<()> {
    let log_level = if args.verbose { "debug" } else { config_level };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
