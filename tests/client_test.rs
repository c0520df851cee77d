//! Integration tests for outbound connections

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tcplink::config::ClientConfig;
use tcplink::{
    ChannelSink, Client, ConnectError, ConnectOptions, ConnectionError, ConnectionId, LinkEvent,
    SendFlags,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn next_event(rx: &mut UnboundedReceiver<LinkEvent>) -> LinkEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event sink dropped")
}

fn client() -> (Client, UnboundedReceiver<LinkEvent>) {
    let (sink, rx) = ChannelSink::new();
    let config = ClientConfig {
        close_grace: Duration::from_millis(500),
        connect_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    (Client::new(config, Arc::new(sink)).unwrap(), rx)
}

async fn peer_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

async fn read_to_end(stream: &mut TcpStream) -> Vec<u8> {
    let mut data = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut data))
        .await
        .expect("peer read timed out")
        .expect("peer read failed");
    data
}

#[tokio::test]
async fn test_connect_receive_and_peer_close() {
    let (client, mut rx) = client();
    let (listener, addr) = peer_listener().await;

    let id = client.connect(addr).await.unwrap();
    assert_eq!(id, ConnectionId::new(1));
    let (mut peer, _) = listener.accept().await.unwrap();

    peer.write_all(b"hello").await.unwrap();
    let mut received = Vec::new();
    while received.len() < 5 {
        match next_event(&mut rx).await {
            LinkEvent::Message { endpoint, id: msg_id, chunk } => {
                assert_eq!(endpoint, None);
                assert_eq!(msg_id, id);
                received.extend_from_slice(&chunk);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(received, b"hello");

    drop(peer);
    assert_eq!(
        next_event(&mut rx).await,
        LinkEvent::Disconnected { endpoint: None, id }
    );

    assert!(assert_err!(client.send(id, b"late").await).is_not_found());
    assert_eq!(client.get_active_connections(), 0);
}

#[tokio::test]
async fn test_ids_are_sequential() {
    let (client, _rx) = client();
    let (listener, addr) = peer_listener().await;

    let first = client.connect(addr).await.unwrap();
    let second = client.connect(addr).await.unwrap();
    let _a = listener.accept().await.unwrap();
    let _b = listener.accept().await.unwrap();

    assert_eq!(first.as_u64(), 1);
    assert_eq!(second.as_u64(), 2);
    assert_eq!(client.connection_ids(), vec![first, second]);
}

#[tokio::test]
async fn test_failed_connect_consumes_no_id() {
    let (client, _rx) = client();
    let refused = SocketAddr::from(([127, 0, 0, 1], free_port()));

    let err = assert_err!(client.connect(refused).await);
    assert!(matches!(err, ConnectError::Connect { remote, .. } if remote == refused));
    assert_eq!(client.get_active_connections(), 0);

    let (listener, addr) = peer_listener().await;
    let id = client.connect(addr).await.unwrap();
    let _peer = listener.accept().await.unwrap();
    assert_eq!(id, ConnectionId::new(1));
}

#[tokio::test]
async fn test_graceful_close_flushes_pending_data() {
    let (client, mut rx) = client();
    let (listener, addr) = peer_listener().await;

    let id = client.connect(addr).await.unwrap();
    let (mut peer, _) = listener.accept().await.unwrap();

    let payload = vec![7u8; 64 * 1024];
    assert_eq!(client.send(id, &payload).await.unwrap(), payload.len());

    let reader = tokio::spawn(async move {
        let data = read_to_end(&mut peer).await;
        drop(peer);
        data
    });

    assert_ok!(client.close(id, Duration::from_secs(2)).await);
    assert_eq!(reader.await.unwrap(), payload);

    assert_eq!(
        next_event(&mut rx).await,
        LinkEvent::Disconnected { endpoint: None, id }
    );
    assert!(assert_err!(client.close(id, Duration::ZERO).await).is_not_found());
}

#[tokio::test]
async fn test_close_grace_expires_when_peer_lingers() {
    let (client, mut rx) = client();
    let (listener, addr) = peer_listener().await;

    let id = client.connect(addr).await.unwrap();
    // peer never closes its side
    let (_peer, _) = listener.accept().await.unwrap();

    let started = std::time::Instant::now();
    assert_ok!(client.close(id, Duration::from_millis(200)).await);
    assert!(started.elapsed() >= Duration::from_millis(200));

    assert_eq!(
        next_event(&mut rx).await,
        LinkEvent::Disconnected { endpoint: None, id }
    );
}

#[tokio::test]
async fn test_close_all() {
    let (client, mut rx) = client();
    let (listener, addr) = peer_listener().await;

    let mut peers = Vec::new();
    for _ in 0..3 {
        client.connect(addr).await.unwrap();
        peers.push(listener.accept().await.unwrap().0);
    }

    // peers close as soon as they see the client's FIN
    let drains: Vec<_> = peers
        .into_iter()
        .map(|mut peer| tokio::spawn(async move { read_to_end(&mut peer).await }))
        .collect();

    client.close_all().await;
    assert_eq!(client.get_active_connections(), 0);

    let mut disconnected = Vec::new();
    for _ in 0..3 {
        match next_event(&mut rx).await {
            LinkEvent::Disconnected { id, .. } => disconnected.push(id.as_u64()),
            other => panic!("unexpected event {:?}", other),
        }
    }
    disconnected.sort_unstable();
    assert_eq!(disconnected, vec![1, 2, 3]);

    for drain in drains {
        assert!(drain.await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_connect_from_local_address() {
    let (client, _rx) = client();
    let (listener, addr) = peer_listener().await;
    let local = SocketAddr::from(([127, 0, 0, 1], free_port()));

    let id = client
        .connect_with(addr, ConnectOptions::default().local_addr(local))
        .await
        .unwrap();
    let (_peer, peer_seen) = listener.accept().await.unwrap();

    assert_eq!(peer_seen, local);
    assert_eq!(client.connection(id).unwrap().peer_addr(), addr);
}

#[tokio::test]
async fn test_connect_rejects_tiny_buffer() {
    let (client, _rx) = client();
    let (_listener, addr) = peer_listener().await;

    let err = assert_err!(
        client
            .connect_with(addr, ConnectOptions::default().buffer_size(4))
            .await
    );
    assert!(matches!(err, ConnectError::Config(_)));
}

#[tokio::test]
async fn test_send_with_range_and_flags() {
    let (client, _rx) = client();
    let (listener, addr) = peer_listener().await;

    let id = client.connect(addr).await.unwrap();
    let (mut peer, _) = listener.accept().await.unwrap();

    let sent = client
        .send_with(id, b"hello world", Some(6..11), SendFlags::NONE)
        .await
        .unwrap();
    assert_eq!(sent, 5);

    let err = assert_err!(
        client
            .send_with(id, b"hello", Some(3..9), SendFlags::NONE)
            .await
    );
    assert!(matches!(
        err,
        ConnectionError::InvalidRange { start: 3, end: 9, len: 5 }
    ));

    let mut buf = [0u8; 5];
    timeout(Duration::from_secs(5), peer.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"world");
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_send_with_raw_flags() {
    // MSG_DONTROUTE
    const DONT_ROUTE: SendFlags = SendFlags(0x4);

    let (client, _rx) = client();
    let (listener, addr) = peer_listener().await;

    let id = client.connect(addr).await.unwrap();
    let (mut peer, _) = listener.accept().await.unwrap();

    assert_eq!(
        client.send_with(id, b"flagged", None, DONT_ROUTE).await.unwrap(),
        7
    );

    let mut buf = [0u8; 7];
    timeout(Duration::from_secs(5), peer.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"flagged");
}

#[tokio::test]
async fn test_nagle_setting_and_override() {
    let (listener, addr) = peer_listener().await;

    let (default_client, _rx) = client();
    let id = default_client.connect(addr).await.unwrap();
    let _a = listener.accept().await.unwrap();
    let conn = default_client.connection(id).unwrap();
    assert!(conn.nodelay().await.unwrap());

    let id = default_client
        .connect_with(addr, ConnectOptions::default().nagle(true))
        .await
        .unwrap();
    let _b = listener.accept().await.unwrap();
    let conn = default_client.connection(id).unwrap();
    assert!(!conn.nodelay().await.unwrap());

    let (sink, _rx) = ChannelSink::new();
    let nagle_client = Client::new(
        ClientConfig {
            nagle: true,
            ..Default::default()
        },
        Arc::new(sink),
    )
    .unwrap();
    let id = nagle_client.connect(addr).await.unwrap();
    let _c = listener.accept().await.unwrap();
    assert!(!nagle_client.connection(id).unwrap().nodelay().await.unwrap());

    let id = nagle_client
        .connect_with(addr, ConnectOptions::default().nagle(false))
        .await
        .unwrap();
    let _d = listener.accept().await.unwrap();
    assert!(nagle_client.connection(id).unwrap().nodelay().await.unwrap());
}
