//! Connection Handle
//!
//! The registry-side view of a live connection. The receive loop owns the
//! read half of the socket; everything callers do from the outside (send,
//! close) goes through this handle and its write half.

use std::net::SocketAddr;
use std::ops::Range;
use std::time::{Duration, Instant};

use socket2::SockRef;
use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::debug;

use super::types::{ConnectionId, Endpoint, SendFlags};
use crate::error::ConnectionError;

/// A live connection as seen by Send/Close callers
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    endpoint: Option<Endpoint>,
    peer_addr: SocketAddr,
    opened_at: Instant,
    writer: Mutex<OwnedWriteHalf>,
    close_tx: watch::Sender<bool>,
    finished_rx: watch::Receiver<bool>,
}

/// Receive-loop side of the close/finished handshake
#[derive(Debug)]
pub(crate) struct TeardownSignals {
    pub(crate) close_rx: watch::Receiver<bool>,
    pub(crate) finished_tx: watch::Sender<bool>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        endpoint: Option<Endpoint>,
        peer_addr: SocketAddr,
        writer: OwnedWriteHalf,
    ) -> (Self, TeardownSignals) {
        let (close_tx, close_rx) = watch::channel(false);
        let (finished_tx, finished_rx) = watch::channel(false);

        let connection = Self {
            id,
            endpoint,
            peer_addr,
            opened_at: Instant::now(),
            writer: Mutex::new(writer),
            close_tx,
            finished_rx,
        };

        (connection, TeardownSignals { close_rx, finished_tx })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Listening endpoint the connection was accepted on (server side only)
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// True once the receive loop has finished its cleanup
    pub fn is_finished(&self) -> bool {
        *self.finished_rx.borrow()
    }

    /// Whether `TCP_NODELAY` is set, i.e. Nagle's algorithm is off
    pub async fn nodelay(&self) -> Result<bool, ConnectionError> {
        let writer = self.writer.lock().await;
        let stream: &TcpStream = (*writer).as_ref();
        stream
            .nodelay()
            .map_err(|source| ConnectionError::Io { id: self.id, source })
    }

    /// Write all of `data`, returning the number of bytes sent
    pub async fn send(&self, data: &[u8]) -> Result<usize, ConnectionError> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .await
            .map_err(|source| ConnectionError::Io { id: self.id, source })?;
        Ok(data.len())
    }

    /// Write `data[range]` with raw transport flags
    ///
    /// Without flags this is a plain `send`. With flags every chunk goes
    /// through `send(2)` directly so the flags reach the kernel unchanged.
    pub async fn send_with(
        &self,
        data: &[u8],
        range: Option<Range<usize>>,
        flags: SendFlags,
    ) -> Result<usize, ConnectionError> {
        let chunk = match range {
            Some(range) => {
                if range.start > range.end || range.end > data.len() {
                    return Err(ConnectionError::InvalidRange {
                        start: range.start,
                        end: range.end,
                        len: data.len(),
                    });
                }
                &data[range]
            }
            None => data,
        };

        if flags.is_empty() {
            return self.send(chunk).await;
        }

        let writer = self.writer.lock().await;
        let stream: &TcpStream = (*writer).as_ref();
        let mut sent = 0;
        while sent < chunk.len() {
            stream
                .writable()
                .await
                .map_err(|source| ConnectionError::Io { id: self.id, source })?;

            let result = stream.try_io(Interest::WRITABLE, || {
                SockRef::from(stream).send_with_flags(&chunk[sent..], flags.0)
            });

            match result {
                Ok(n) => sent += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(source) => return Err(ConnectionError::Io { id: self.id, source }),
            }
        }

        Ok(sent)
    }

    /// Close the connection, giving queued outbound data up to `grace` to drain
    ///
    /// With a non-zero grace the write side is shut down first and the call
    /// waits for the peer to finish the close; once the grace runs out the
    /// receive loop is told to drop the socket. Calling this more than once is
    /// harmless.
    pub async fn close(&self, grace: Duration) {
        if !grace.is_zero() && !self.is_finished() {
            let deadline = tokio::time::Instant::now() + grace;

            let shutdown = tokio::time::timeout_at(deadline, async {
                let mut writer = self.writer.lock().await;
                writer.shutdown().await
            })
            .await;

            if let Ok(Err(e)) = shutdown {
                debug!("Connection {} write shutdown failed: {}", self.id, e);
            }

            if tokio::time::timeout_at(deadline, self.closed()).await.is_err() {
                debug!("Connection {} grace period of {:?} elapsed, forcing close", self.id, grace);
            }
        }

        self.close_tx.send_replace(true);
    }

    /// Wait until the receive loop has torn the connection down
    pub async fn closed(&self) {
        let mut finished = self.finished_rx.clone();
        wait_for_flag(&mut finished).await;
    }
}

/// Resolve once the flag is set or its sender is gone
pub(crate) async fn wait_for_flag(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
