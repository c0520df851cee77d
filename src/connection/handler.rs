//! Connection Handler
//!
//! Per-connection receive loop shared by the server (one per accepted socket)
//! and the client (one per outbound socket).
//!
//! `Open -> Receiving -> Closing -> Closed`: the loop reads fixed-size chunks
//! and reports each one, probes writability after every read, and leaves
//! through a single cleanup path that releases the socket, drops the registry
//! entry and reports the disconnect exactly once.

use std::net::Shutdown;
use std::time::Duration;

use bytes::Bytes;
use socket2::SockRef;
use tokio::io::{AsyncReadExt, Interest};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, instrument};

use super::handle::{wait_for_flag, TeardownSignals};
use super::types::{CloseReason, ConnectionId};

/// Where a receive loop reports to and deregisters from
pub(crate) trait ConnectionScope: Send + Sync + 'static {
    /// Called on the connection's own task before the first read
    fn on_open(&self, _id: ConnectionId) {}

    fn on_message(&self, id: ConnectionId, chunk: Bytes);

    /// Drop the registry entry; must tolerate the entry already being gone
    fn release(&self, id: ConnectionId);

    fn on_disconnected(&self, id: ConnectionId);
}

/// Receive-loop settings
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReceiveSettings {
    pub(crate) buffer_size: usize,
    pub(crate) probe_timeout: Duration,
}

pub(crate) struct ConnectionHandler<S> {
    id: ConnectionId,
    reader: OwnedReadHalf,
    signals: TeardownSignals,
    scope: S,
    settings: ReceiveSettings,
}

impl<S: ConnectionScope> ConnectionHandler<S> {
    pub(crate) fn new(
        id: ConnectionId,
        reader: OwnedReadHalf,
        signals: TeardownSignals,
        scope: S,
        settings: ReceiveSettings,
    ) -> Self {
        Self {
            id,
            reader,
            signals,
            scope,
            settings,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    #[instrument(skip(self), fields(connection_id = %self.id))]
    async fn run(mut self) {
        self.scope.on_open(self.id);

        let reason = self.receive().await;
        debug!("Connection {} closing: {}", self.id, reason);

        let ConnectionHandler {
            id,
            reader,
            signals,
            scope,
            ..
        } = self;

        // other holders of the handle must not keep the socket alive
        let stream: &TcpStream = reader.as_ref();
        if let Err(e) = SockRef::from(stream).shutdown(Shutdown::Both) {
            debug!("Connection {} shutdown: {}", id, e);
        }
        drop(reader);
        scope.release(id);
        scope.on_disconnected(id);
        signals.finished_tx.send_replace(true);
    }

    async fn receive(&mut self) -> CloseReason {
        let mut buffer = vec![0u8; self.settings.buffer_size];

        loop {
            let read = tokio::select! {
                biased;
                _ = wait_for_flag(&mut self.signals.close_rx) => return CloseReason::LocalClose,
                read = self.reader.read(&mut buffer) => read,
            };

            match read {
                Ok(0) => return CloseReason::PeerClosed,
                Ok(n) => {
                    self.scope
                        .on_message(self.id, Bytes::copy_from_slice(&buffer[..n]));
                }
                Err(e) => return CloseReason::ReadError(e),
            }

            if let Err(reason) = self.probe().await {
                return reason;
            }
        }
    }

    /// Short writability check after a read
    ///
    /// Only a hang-up or a pending socket error counts as a failure; a socket
    /// that is merely not writable within the timeout (full send buffer) is
    /// left alone and the next read decides.
    async fn probe(&self) -> Result<(), CloseReason> {
        let stream: &TcpStream = self.reader.as_ref();

        match timeout(self.settings.probe_timeout, stream.ready(Interest::WRITABLE)).await {
            Ok(Ok(ready)) if ready.is_write_closed() => Err(CloseReason::ProbeFailed(
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "write side closed"),
            )),
            Ok(Ok(_)) => match stream.take_error() {
                Ok(None) => Ok(()),
                Ok(Some(e)) | Err(e) => Err(CloseReason::ProbeFailed(e)),
            },
            Ok(Err(e)) => Err(CloseReason::ProbeFailed(e)),
            Err(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::handle::Connection;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[derive(Debug, PartialEq)]
    enum Seen {
        Open,
        Message(Vec<u8>),
        Released,
        Disconnected,
    }

    #[derive(Clone, Default)]
    struct RecordingScope {
        seen: Arc<Mutex<Vec<Seen>>>,
    }

    impl ConnectionScope for RecordingScope {
        fn on_open(&self, _id: ConnectionId) {
            self.seen.lock().push(Seen::Open);
        }

        fn on_message(&self, _id: ConnectionId, chunk: Bytes) {
            self.seen.lock().push(Seen::Message(chunk.to_vec()));
        }

        fn release(&self, _id: ConnectionId) {
            self.seen.lock().push(Seen::Released);
        }

        fn on_disconnected(&self, _id: ConnectionId) {
            self.seen.lock().push(Seen::Disconnected);
        }
    }

    async fn build_handler(
        scope: RecordingScope,
    ) -> (Arc<Connection>, TcpStream, ConnectionHandler<RecordingScope>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        let (reader, writer) = server.into_split();
        let id = ConnectionId::new(1);
        let (conn, signals) = Connection::new(id, Some(addr), peer, writer);
        let settings = ReceiveSettings {
            buffer_size: 64,
            probe_timeout: Duration::from_millis(1),
        };
        let handler = ConnectionHandler::new(id, reader, signals, scope, settings);
        (Arc::new(conn), client, handler)
    }

    async fn spawn_handler(
        scope: RecordingScope,
    ) -> (Arc<Connection>, TcpStream, JoinHandle<()>) {
        let (conn, client, handler) = build_handler(scope).await;
        (conn, client, handler.spawn())
    }

    /// Close with `SO_LINGER` 0 so the peer sends RST instead of FIN
    fn reset(client: TcpStream) {
        SockRef::from(&client)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(client);
    }

    #[tokio::test]
    async fn test_zero_length_read_is_graceful_close() {
        let scope = RecordingScope::default();
        let (conn, client, task) = spawn_handler(scope.clone()).await;

        drop(client);
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        assert_eq!(
            *scope.seen.lock(),
            vec![Seen::Open, Seen::Released, Seen::Disconnected]
        );
        assert!(conn.is_finished());
    }

    #[tokio::test]
    async fn test_messages_arrive_before_disconnect() {
        let scope = RecordingScope::default();
        let (_conn, mut client, task) = spawn_handler(scope.clone()).await;

        client.write_all(b"ping").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(client);
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        let seen = scope.seen.lock();
        assert_eq!(seen.first(), Some(&Seen::Open));
        assert_eq!(seen.last(), Some(&Seen::Disconnected));
        let payload: Vec<u8> = seen
            .iter()
            .filter_map(|s| match s {
                Seen::Message(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(payload, b"ping");
        assert!(!seen.contains(&Seen::Message(Vec::new())));
    }

    #[tokio::test]
    async fn test_chunks_never_exceed_buffer_size() {
        let scope = RecordingScope::default();
        let (_conn, mut client, task) = spawn_handler(scope.clone()).await;

        client.write_all(&[7u8; 1000]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(client);
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        let seen = scope.seen.lock();
        let mut total = 0;
        for s in seen.iter() {
            if let Seen::Message(bytes) = s {
                assert!(!bytes.is_empty() && bytes.len() <= 64);
                total += bytes.len();
            }
        }
        assert_eq!(total, 1000);
    }

    #[tokio::test]
    async fn test_local_close_runs_cleanup_once() {
        let scope = RecordingScope::default();
        let (conn, _client, task) = spawn_handler(scope.clone()).await;

        conn.close(Duration::ZERO).await;
        conn.close(Duration::ZERO).await;
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        timeout(Duration::from_secs(1), conn.closed()).await.unwrap();

        let seen = scope.seen.lock();
        assert_eq!(seen.iter().filter(|s| **s == Seen::Disconnected).count(), 1);
        assert_eq!(seen.iter().filter(|s| **s == Seen::Released).count(), 1);
    }

    #[tokio::test]
    async fn test_writability_check_detects_reset_peer() {
        let (_conn, client, handler) = build_handler(RecordingScope::default()).await;
        assert!(handler.probe().await.is_ok());

        reset(client);
        tokio::time::sleep(Duration::from_millis(100)).await;

        match handler.probe().await {
            Err(CloseReason::ProbeFailed(_)) => {}
            other => panic!("expected probe failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reset_after_data_runs_cleanup_once() {
        let scope = RecordingScope::default();
        let (conn, mut client, task) = spawn_handler(scope.clone()).await;

        client.write_all(b"bye").await.unwrap();
        reset(client);
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        let seen = scope.seen.lock();
        assert_eq!(seen.first(), Some(&Seen::Open));
        assert_eq!(seen.last(), Some(&Seen::Disconnected));
        assert_eq!(seen.iter().filter(|s| **s == Seen::Disconnected).count(), 1);
        assert_eq!(seen.iter().filter(|s| **s == Seen::Released).count(), 1);
        assert!(conn.is_finished());
    }

    #[tokio::test]
    async fn test_cleanup_closes_socket_for_other_holders() {
        let scope = RecordingScope::default();
        let (conn, mut client, task) = spawn_handler(scope.clone()).await;

        conn.close(Duration::ZERO).await;
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        // `conn` still holds the write half
        let mut buf = [0u8; 4];
        let read = timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(conn.send(b"late").await.is_err());
    }
}
