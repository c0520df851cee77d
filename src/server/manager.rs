//! Server Lifecycle
//!
//! Owns the listeners, the endpoint-scoped registry and the event sink, and
//! orchestrates start/stop across all endpoints and connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::listener::{self, EndpointListener};
use crate::config::ServerConfig;
use crate::connection::handler::{ConnectionHandler, ConnectionScope, ReceiveSettings};
use crate::connection::{
    Connection, ConnectionId, ConnectionRegistry, ConnectionStats, Endpoint, SendFlags,
};
use crate::error::{ConfigError, ConnectionError, ListenError};
use crate::events::ServerEvents;

/// Outcome of starting a set of endpoints; failures do not block the rest
#[derive(Debug, Default)]
pub struct StartReport {
    pub started: Vec<Endpoint>,
    pub failed: HashMap<Endpoint, ListenError>,
}

impl StartReport {
    /// True when every requested endpoint came up
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// State shared between the server handle, accept loops and receive loops
pub(crate) struct ServerShared {
    registry: ConnectionRegistry<Endpoint>,
    sink: Arc<dyn ServerEvents>,
    settings: ReceiveSettings,
    nagle: bool,
}

impl ServerShared {
    /// Register an accepted socket and start its receive loop
    pub(crate) fn admit(self: &Arc<Self>, endpoint: Endpoint, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(!self.nagle) {
            warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let (reader, writer) = stream.into_split();
        let (id, signals) = self.registry.register(endpoint, |id| {
            let (connection, signals) = Connection::new(id, Some(endpoint), peer, writer);
            (Arc::new(connection), signals)
        });

        info!("Started handling connection {} from {} on {}", id, peer, endpoint);

        let scope = EndpointScope {
            shared: Arc::clone(self),
            endpoint,
        };
        ConnectionHandler::new(id, reader, signals, scope, self.settings).spawn();
    }
}

/// Reports one endpoint's connections to the sink
struct EndpointScope {
    shared: Arc<ServerShared>,
    endpoint: Endpoint,
}

impl ConnectionScope for EndpointScope {
    fn on_open(&self, id: ConnectionId) {
        self.shared.sink.on_connected(self.endpoint, id);
    }

    fn on_message(&self, id: ConnectionId, chunk: Bytes) {
        self.shared.sink.on_message(self.endpoint, id, chunk);
    }

    fn release(&self, id: ConnectionId) {
        if let Some(connection) = self.shared.registry.remove(self.endpoint, id) {
            debug!(
                "Connection {} from {} released after {:?}",
                id,
                connection.peer_addr(),
                connection.age()
            );
        }
    }

    fn on_disconnected(&self, id: ConnectionId) {
        self.shared.sink.on_disconnected(self.endpoint, id);
    }
}

/// Multi-endpoint TCP server
pub struct Server {
    config: ServerConfig,
    shared: Arc<ServerShared>,
    listeners: Mutex<HashMap<Endpoint, EndpointListener>>,
}

impl Server {
    /// Validate the configuration and build an idle server
    pub fn new(config: ServerConfig, sink: Arc<dyn ServerEvents>) -> Result<Self, ConfigError> {
        config.validate()?;

        let shared = Arc::new(ServerShared {
            registry: ConnectionRegistry::new(),
            sink,
            settings: ReceiveSettings {
                buffer_size: config.buffer_size,
                probe_timeout: config.probe_timeout,
            },
            nagle: config.nagle,
        });

        Ok(Self {
            config,
            shared,
            listeners: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Listen on every configured endpoint
    pub async fn start(&self) -> StartReport {
        let mut report = StartReport::default();

        for endpoint in self.config.listen.endpoints() {
            match self.add_endpoint(endpoint).await {
                Ok(()) => report.started.push(endpoint),
                Err(e) => {
                    warn!("Failed to start listener on {}: {}", endpoint, e);
                    report.failed.insert(endpoint, e);
                }
            }
        }

        info!(
            "Server started: {} endpoint(s) listening, {} failed",
            report.started.len(),
            report.failed.len()
        );
        report
    }

    /// Start listening on one more endpoint while running
    pub async fn add_endpoint(&self, endpoint: Endpoint) -> Result<(), ListenError> {
        if endpoint.port() == 0 {
            return Err(ListenError::InvalidPort { port: 0 });
        }

        let mut listeners = self.listeners.lock();
        if listeners.contains_key(&endpoint) {
            return Err(ListenError::AlreadyListening(endpoint));
        }

        let listener = EndpointListener::start(endpoint, Arc::clone(&self.shared))?;
        listeners.insert(endpoint, listener);
        Ok(())
    }

    /// Stop one listener and close the connections accepted on it
    pub async fn stop_endpoint(&self, endpoint: Endpoint) -> bool {
        let Some(listener) = self.listeners.lock().remove(&endpoint) else {
            return false;
        };
        listener.stop().await;

        for connection in self.shared.registry.remove_scope(endpoint) {
            connection.close(Duration::ZERO).await;
        }

        info!("Stopped listening on {}", endpoint);
        true
    }

    /// Write `data` to one connection
    pub async fn send(
        &self,
        endpoint: Endpoint,
        id: ConnectionId,
        data: &[u8],
    ) -> Result<usize, ConnectionError> {
        self.lookup(endpoint, id)?.send(data).await
    }

    /// Write `data[range]` to one connection with raw transport flags
    pub async fn send_with(
        &self,
        endpoint: Endpoint,
        id: ConnectionId,
        data: &[u8],
        range: Option<Range<usize>>,
        flags: SendFlags,
    ) -> Result<usize, ConnectionError> {
        self.lookup(endpoint, id)?.send_with(data, range, flags).await
    }

    /// Close one connection; its receive loop still reports the disconnect
    pub async fn close(&self, endpoint: Endpoint, id: ConnectionId) -> Result<(), ConnectionError> {
        let connection = self
            .shared
            .registry
            .remove(endpoint, id)
            .ok_or(ConnectionError::NotFound(id))?;

        debug!("Closing connection {} on {}", id, endpoint);
        connection.close(Duration::ZERO).await;
        Ok(())
    }

    /// Stop all listeners, then close every registered connection
    ///
    /// Safe to call more than once.
    pub async fn stop(&self) {
        let listeners: Vec<_> = self.listeners.lock().drain().collect();
        if !listeners.is_empty() {
            info!("Stopping {} listener(s)", listeners.len());
        }

        let pending: Vec<_> = listeners
            .into_iter()
            .map(|(endpoint, listener)| (endpoint, listener.signal()))
            .collect();
        for (endpoint, task) in pending {
            listener::join(endpoint, task).await;
        }

        let connections = self.shared.registry.snapshot();
        if !connections.is_empty() {
            info!("Closing {} active connection(s)", connections.len());
        }
        for (endpoint, connection) in connections {
            self.shared.registry.remove(endpoint, connection.id());
            connection.close(Duration::ZERO).await;
        }
    }

    /// Look up a live connection
    pub fn connection(&self, endpoint: Endpoint, id: ConnectionId) -> Option<Arc<Connection>> {
        self.shared.registry.lookup(endpoint, id)
    }

    /// Ids of the live connections accepted on `endpoint`
    pub fn connections(&self, endpoint: Endpoint) -> Vec<ConnectionId> {
        self.shared
            .registry
            .snapshot_scope(endpoint)
            .iter()
            .map(|c| c.id())
            .collect()
    }

    pub fn listening_endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<_> = self.listeners.lock().keys().copied().collect();
        endpoints.sort();
        endpoints
    }

    /// Address the listener for `endpoint` is actually bound to
    pub fn local_addr(&self, endpoint: Endpoint) -> Option<SocketAddr> {
        self.listeners.lock().get(&endpoint).map(|l| l.local_addr())
    }

    /// Get the number of active connections
    pub fn get_active_connections(&self) -> usize {
        self.shared.registry.len()
    }

    /// Get connection statistics
    pub fn get_connection_stats(&self) -> ConnectionStats {
        ConnectionStats {
            active_connections: self.shared.registry.len(),
            total_connections_served: self.shared.registry.total_allocated(),
            listening_endpoints: self.listeners.lock().len(),
        }
    }

    fn lookup(&self, endpoint: Endpoint, id: ConnectionId) -> Result<Arc<Connection>, ConnectionError> {
        self.shared
            .registry
            .lookup(endpoint, id)
            .ok_or(ConnectionError::NotFound(id))
    }
}
