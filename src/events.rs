//! Event Sinks
//!
//! Callback contracts invoked by the server and client. Sinks are passed in at
//! construction and called from the connection's own task, so a slow sink
//! only delays its own connection.
//!
//! A message chunk is delivered exactly as read from the socket; its length
//! is `chunk.len()`. Chunk boundaries are not sender write boundaries.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::connection::{ConnectionId, Endpoint};

/// Server-side lifecycle callbacks
pub trait ServerEvents: Send + Sync + 'static {
    fn on_connected(&self, endpoint: Endpoint, id: ConnectionId);

    fn on_message(&self, endpoint: Endpoint, id: ConnectionId, chunk: Bytes);

    fn on_disconnected(&self, endpoint: Endpoint, id: ConnectionId);
}

/// Client-side lifecycle callbacks; the connect call's return is the
/// "connected" signal
pub trait ClientEvents: Send + Sync + 'static {
    fn on_message(&self, id: ConnectionId, chunk: Bytes);

    fn on_disconnected(&self, id: ConnectionId);
}

/// Sink that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

impl ServerEvents for LoggingSink {
    fn on_connected(&self, endpoint: Endpoint, id: ConnectionId) {
        info!("Connection {} opened on {}", id, endpoint);
    }

    fn on_message(&self, endpoint: Endpoint, id: ConnectionId, chunk: Bytes) {
        debug!("Connection {} on {} received {} bytes", id, endpoint, chunk.len());
    }

    fn on_disconnected(&self, endpoint: Endpoint, id: ConnectionId) {
        info!("Connection {} on {} disconnected", id, endpoint);
    }
}

impl ClientEvents for LoggingSink {
    fn on_message(&self, id: ConnectionId, chunk: Bytes) {
        debug!("Connection {} received {} bytes", id, chunk.len());
    }

    fn on_disconnected(&self, id: ConnectionId) {
        info!("Connection {} disconnected", id);
    }
}

/// One lifecycle event; `endpoint` is `None` for client connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected {
        endpoint: Endpoint,
        id: ConnectionId,
    },
    Message {
        endpoint: Option<Endpoint>,
        id: ConnectionId,
        chunk: Bytes,
    },
    Disconnected {
        endpoint: Option<Endpoint>,
        id: ConnectionId,
    },
}

impl LinkEvent {
    pub fn id(&self) -> ConnectionId {
        match self {
            LinkEvent::Connected { id, .. }
            | LinkEvent::Message { id, .. }
            | LinkEvent::Disconnected { id, .. } => *id,
        }
    }
}

/// Sink that forwards every event into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: LinkEvent) {
        // receiver gone means nobody is listening anymore
        let _ = self.tx.send(event);
    }
}

impl ServerEvents for ChannelSink {
    fn on_connected(&self, endpoint: Endpoint, id: ConnectionId) {
        self.forward(LinkEvent::Connected { endpoint, id });
    }

    fn on_message(&self, endpoint: Endpoint, id: ConnectionId, chunk: Bytes) {
        self.forward(LinkEvent::Message {
            endpoint: Some(endpoint),
            id,
            chunk,
        });
    }

    fn on_disconnected(&self, endpoint: Endpoint, id: ConnectionId) {
        self.forward(LinkEvent::Disconnected {
            endpoint: Some(endpoint),
            id,
        });
    }
}

impl ClientEvents for ChannelSink {
    fn on_message(&self, id: ConnectionId, chunk: Bytes) {
        self.forward(LinkEvent::Message {
            endpoint: None,
            id,
            chunk,
        });
    }

    fn on_disconnected(&self, id: ConnectionId) {
        self.forward(LinkEvent::Disconnected { endpoint: None, id });
    }
}
