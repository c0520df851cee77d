//! Endpoint Listener
//!
//! One bound, listening socket per endpoint plus the task running its accept
//! loop. Stopping signals the loop, which drops the socket, and then joins
//! the task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::manager::ServerShared;
use crate::connection::Endpoint;
use crate::error::ListenError;

/// Pending-connection queue length handed to `listen(2)`
pub const LISTEN_BACKLOG: u32 = 1000;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// A running listener for one endpoint
#[derive(Debug)]
pub(crate) struct EndpointListener {
    endpoint: Endpoint,
    local_addr: SocketAddr,
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl EndpointListener {
    /// Bind, listen and start the accept loop
    pub(crate) fn start(endpoint: Endpoint, shared: Arc<ServerShared>) -> Result<Self, ListenError> {
        let listener = bind_listener(endpoint)?;
        let local_addr = listener.local_addr().unwrap_or(endpoint);

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(endpoint, listener, stop_rx, shared));

        info!("Listening on {}", local_addr);

        Ok(Self {
            endpoint,
            local_addr,
            stop_tx,
            task,
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signal the accept loop and hand back its task
    ///
    /// Pair with [`join`] so several listeners can be signalled before any of
    /// them is awaited.
    pub(crate) fn signal(self) -> JoinHandle<()> {
        // the loop may already be gone; dropping the sender stops it too
        let _ = self.stop_tx.send(());
        self.task
    }

    pub(crate) async fn stop(self) {
        let endpoint = self.endpoint;
        join(endpoint, self.signal()).await;
    }
}

pub(crate) async fn join(endpoint: Endpoint, task: JoinHandle<()>) {
    if let Err(e) = task.await {
        if !e.is_cancelled() {
            error!("Accept loop for {} failed: {}", endpoint, e);
        }
    }
}

/// Create, bind and listen; bind and listen failures stay distinct
pub(crate) fn bind_listener(endpoint: Endpoint) -> Result<TcpListener, ListenError> {
    let socket = if endpoint.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|source| ListenError::Socket { endpoint, source })?;

    #[cfg(unix)]
    socket
        .set_reuseaddr(true)
        .map_err(|source| ListenError::Socket { endpoint, source })?;

    socket
        .bind(endpoint)
        .map_err(|source| ListenError::Bind { endpoint, source })?;

    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|source| ListenError::Listen { endpoint, source })
}

async fn accept_loop(
    endpoint: Endpoint,
    listener: TcpListener,
    mut stop_rx: oneshot::Receiver<()>,
    shared: Arc<ServerShared>,
) {
    debug!("Starting connection acceptance loop on {}", endpoint);

    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                info!("Stopping connection acceptance on {}", endpoint);
                break;
            }
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {} on {}", peer, endpoint);
                        shared.admit(endpoint, stream, peer);
                    }
                    Err(e) => {
                        warn!("Error accepting connection on {}: {}", endpoint, e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        }
    }

    drop(listener);
    debug!("Connection acceptance loop on {} stopped", endpoint);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_listener_reports_bind_failure() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = occupied.local_addr().unwrap();

        match bind_listener(endpoint) {
            Err(ListenError::Bind { endpoint: failed, .. }) => assert_eq!(failed, endpoint),
            other => panic!("expected bind failure, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_bind_listener_accepts_connections() {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = probe.local_addr().unwrap();
        drop(probe);

        let listener = bind_listener(endpoint).unwrap();
        let client = tokio::net::TcpStream::connect(endpoint).await.unwrap();
        let (_stream, peer) = listener.accept().await.unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
    }
}
