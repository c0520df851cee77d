//! Outbound Connections
//!
//! Opens connections to remote endpoints and tracks them in one flat
//! registry. Each connection gets the same receive loop the server uses.

use std::net::SocketAddr;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpSocket;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{validate_buffer_size, ClientConfig};
use crate::connection::handler::{ConnectionHandler, ConnectionScope, ReceiveSettings};
use crate::connection::{Connection, ConnectionId, ConnectionRegistry, SendFlags};
use crate::error::{ConfigError, ConnectError, ConnectionError};
use crate::events::ClientEvents;

/// Per-connection overrides; unset fields fall back to [`ClientConfig`]
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub local_addr: Option<SocketAddr>,
    pub buffer_size: Option<usize>,
    pub nagle: Option<bool>,
}

impl ConnectOptions {
    pub fn local_addr(mut self, local_addr: SocketAddr) -> Self {
        self.local_addr = Some(local_addr);
        self
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    pub fn nagle(mut self, nagle: bool) -> Self {
        self.nagle = Some(nagle);
        self
    }
}

/// Reports client connections to the sink
struct ClientScope {
    registry: Arc<ConnectionRegistry<()>>,
    sink: Arc<dyn ClientEvents>,
}

impl ConnectionScope for ClientScope {
    fn on_message(&self, id: ConnectionId, chunk: Bytes) {
        self.sink.on_message(id, chunk);
    }

    fn release(&self, id: ConnectionId) {
        if let Some(connection) = self.registry.remove((), id) {
            debug!(
                "Connection {} to {} released after {:?}",
                id,
                connection.peer_addr(),
                connection.age()
            );
        }
    }

    fn on_disconnected(&self, id: ConnectionId) {
        self.sink.on_disconnected(id);
    }
}

/// Outbound TCP connection manager
pub struct Client {
    config: ClientConfig,
    registry: Arc<ConnectionRegistry<()>>,
    sink: Arc<dyn ClientEvents>,
}

impl Client {
    pub fn new(config: ClientConfig, sink: Arc<dyn ClientEvents>) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            sink,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connect with the configured defaults
    pub async fn connect(&self, remote: SocketAddr) -> Result<ConnectionId, ConnectError> {
        self.connect_with(remote, ConnectOptions::default()).await
    }

    /// Connect, optionally from a specific local address
    ///
    /// The id is only allocated once the connection is established.
    pub async fn connect_with(
        &self,
        remote: SocketAddr,
        options: ConnectOptions,
    ) -> Result<ConnectionId, ConnectError> {
        let buffer_size = options.buffer_size.unwrap_or(self.config.buffer_size);
        validate_buffer_size(buffer_size)?;
        let nagle = options.nagle.unwrap_or(self.config.nagle);

        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(ConnectError::Socket)?;

        if let Some(local) = options.local_addr {
            socket
                .bind(local)
                .map_err(|source| ConnectError::Bind { local, source })?;
        }

        let stream = timeout(self.config.connect_timeout, socket.connect(remote))
            .await
            .map_err(|_| ConnectError::Timeout { remote })?
            .map_err(|source| ConnectError::Connect { remote, source })?;

        if let Err(e) = stream.set_nodelay(!nagle) {
            warn!("Failed to set TCP_NODELAY for {}: {}", remote, e);
        }
        let peer = stream.peer_addr().unwrap_or(remote);

        let (reader, writer) = stream.into_split();
        let (id, signals) = self.registry.register((), |id| {
            let (connection, signals) = Connection::new(id, None, peer, writer);
            (Arc::new(connection), signals)
        });

        info!("Connection {} established to {}", id, peer);

        let scope = ClientScope {
            registry: Arc::clone(&self.registry),
            sink: Arc::clone(&self.sink),
        };
        let settings = ReceiveSettings {
            buffer_size,
            probe_timeout: self.config.probe_timeout,
        };
        ConnectionHandler::new(id, reader, signals, scope, settings).spawn();

        Ok(id)
    }

    /// Write `data` to one connection, returning the bytes sent
    pub async fn send(&self, id: ConnectionId, data: &[u8]) -> Result<usize, ConnectionError> {
        self.lookup(id)?.send(data).await
    }

    /// Write `data[range]` with raw transport flags
    pub async fn send_with(
        &self,
        id: ConnectionId,
        data: &[u8],
        range: Option<Range<usize>>,
        flags: SendFlags,
    ) -> Result<usize, ConnectionError> {
        self.lookup(id)?.send_with(data, range, flags).await
    }

    /// Close one connection, allowing up to `grace` for outbound data to drain
    pub async fn close(&self, id: ConnectionId, grace: Duration) -> Result<(), ConnectionError> {
        let connection = self
            .registry
            .remove((), id)
            .ok_or(ConnectionError::NotFound(id))?;

        debug!("Closing connection {} with grace {:?}", id, grace);
        connection.close(grace).await;
        Ok(())
    }

    /// Close every connection with the configured grace period
    pub async fn close_all(&self) {
        let grace = self.config.close_grace;
        let mut closing = JoinSet::new();

        for ((), connection) in self.registry.snapshot() {
            if self.registry.remove((), connection.id()).is_some() {
                closing.spawn(async move { connection.close(grace).await });
            }
        }

        if !closing.is_empty() {
            info!("Closing {} connection(s)", closing.len());
        }
        while closing.join_next().await.is_some() {}
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.registry.lookup((), id)
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.registry.snapshot().iter().map(|(_, c)| c.id()).collect()
    }

    /// Get the number of active connections
    pub fn get_active_connections(&self) -> usize {
        self.registry.len()
    }

    fn lookup(&self, id: ConnectionId) -> Result<Arc<Connection>, ConnectionError> {
        self.registry.lookup((), id).ok_or(ConnectionError::NotFound(id))
    }
}
