//! End-to-end integration tests for backhaul.
//!
//! These tests run a real relay server, a real client and a loopback service,
//! or stand in for one of the roles with raw sockets to check the wire.

use backhaul::{
    ClientConfig, Dialer, Frame, FrameDecoder, Framing, Identity, Payload, RelayClient,
    RelayServer, ServerConfig, Shutdown, Transport, Verifier, PAIRED_SIGNAL,
};
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const TIMEOUT: Duration = Duration::from_secs(5);

/// A running relay role.
struct Running {
    shutdown: Shutdown,
    handle: JoinHandle<backhaul::Result<()>>,
}

impl Running {
    async fn stop(self) {
        self.shutdown.trigger();
        tokio::time::timeout(TIMEOUT, self.handle)
            .await
            .expect("role did not stop in time")
            .unwrap()
            .unwrap();
    }
}

/// Starts a TCP echo service.
async fn spawn_echo_service() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// Server configuration on ephemeral loopback ports.
fn server_config(transport: Transport, framing: Framing, verifier: Option<Verifier>) -> ServerConfig {
    ServerConfig {
        upstream_addr: "127.0.0.1:0".parse().unwrap(),
        downstream_addr: "127.0.0.1:0".parse().unwrap(),
        transport,
        framing,
        verifier,
        max_pending_downstream: 5,
        auth_timeout: Duration::from_millis(500),
    }
}

/// Starts a relay server on ephemeral loopback ports.
async fn start_server(
    transport: Transport,
    framing: Framing,
    verifier: Option<Verifier>,
) -> (SocketAddr, SocketAddr, Running) {
    spawn_server(server_config(transport, framing, verifier)).await
}

/// Binds and runs a relay server.
async fn spawn_server(config: ServerConfig) -> (SocketAddr, SocketAddr, Running) {
    let server = RelayServer::bind(config).await.unwrap();
    let upstream = server.upstream_addr();
    let downstream = server.downstream_addr();

    let shutdown = Shutdown::new();
    let handle = tokio::spawn(server.run(shutdown.subscribe()));
    (upstream, downstream, Running { shutdown, handle })
}

/// Client configuration connecting `relay` to `service`.
fn client_config(
    relay: SocketAddr,
    service: SocketAddr,
    transport: Transport,
    framing: Framing,
    identity: Option<Identity>,
) -> ClientConfig {
    ClientConfig {
        relay_host: relay.ip().to_string(),
        relay_port: relay.port(),
        service_host: service.ip().to_string(),
        service_port: service.port(),
        dialer: Dialer::direct(),
        identity,
        transport,
        framing,
        max_pending_downstream: 3,
        reconnect_interval: Duration::from_millis(50),
        connect_timeout: Duration::from_secs(1),
        auth_timeout: Duration::from_millis(500),
    }
}

/// Starts a client connecting `relay` to `service`.
fn start_client(
    relay: SocketAddr,
    service: SocketAddr,
    transport: Transport,
    framing: Framing,
    identity: Option<Identity>,
) -> Running {
    spawn_client(client_config(relay, service, transport, framing, identity))
}

/// Runs a client.
fn spawn_client(config: ClientConfig) -> Running {
    let shutdown = Shutdown::new();
    let handle = tokio::spawn(RelayClient::new(config).run(shutdown.subscribe()));
    Running { shutdown, handle }
}

/// Sends `message` through the tunnel and reads the same number of bytes back.
async fn roundtrip(upstream: SocketAddr, message: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(upstream).await.unwrap();
    stream.write_all(message).await.unwrap();
    let mut buf = vec![0u8; message.len()];
    tokio::time::timeout(TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("no reply through tunnel")
        .unwrap();
    buf
}

/// Reads the next frame from a raw control link.
async fn read_frame(stream: &mut TcpStream, decoder: &mut FrameDecoder) -> Frame {
    loop {
        if let Some(frame) = decoder.next_frame().unwrap() {
            return frame;
        }
        let mut buf = vec![0u8; 4096];
        let n = tokio::time::timeout(TIMEOUT, stream.read(&mut buf))
            .await
            .expect("no frame on control link")
            .unwrap();
        assert!(n > 0, "control link closed");
        decoder.extend(Bytes::copy_from_slice(&buf[..n]));
    }
}

/// Returns true if the peer closes `stream` within the timeout.
async fn closed_by_peer(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    loop {
        match tokio::time::timeout(TIMEOUT, stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => return true,
            Ok(Ok(_)) => continue,
            Err(_) => return false,
        }
    }
}

#[tokio::test]
async fn test_mux_tunnel_concurrent_connections() {
    let service = spawn_echo_service().await;
    let (upstream, downstream, server) =
        start_server(Transport::Mux, Framing::LengthPrefixed, None).await;
    let client = start_client(downstream, service, Transport::Mux, Framing::LengthPrefixed, None);

    let (a, b, c) = tokio::join!(
        roundtrip(upstream, b"first connection"),
        roundtrip(upstream, b"second connection"),
        roundtrip(upstream, &[0xabu8; 100_000]),
    );
    assert_eq!(a, b"first connection");
    assert_eq!(b, b"second connection");
    assert_eq!(c, vec![0xabu8; 100_000]);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_mux_tunnel_with_auth_and_sentinel_framing() {
    let service = spawn_echo_service().await;
    let identity = Identity::generate().unwrap();
    let (upstream, downstream, server) =
        start_server(Transport::Mux, Framing::Sentinel, Some(identity.verifier())).await;
    let client = start_client(
        downstream,
        service,
        Transport::Mux,
        Framing::Sentinel,
        Some(identity),
    );

    assert_eq!(roundtrip(upstream, b"hello").await, b"hello");
    assert_eq!(roundtrip(upstream, b"second request").await, b"second request");

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_pool_tunnel_with_auth() {
    let service = spawn_echo_service().await;
    let identity = Identity::generate().unwrap();
    let (upstream, downstream, server) =
        start_server(Transport::Pool, Framing::LengthPrefixed, Some(identity.verifier())).await;
    let client = start_client(
        downstream,
        service,
        Transport::Pool,
        Framing::LengthPrefixed,
        Some(identity),
    );

    // More connections than pooled links: consumed links are replaced
    for i in 0..6 {
        let message = format!("pooled message {}", i);
        assert_eq!(roundtrip(upstream, message.as_bytes()).await, message.as_bytes());
    }

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_pool_rejects_wrong_key() {
    let service = spawn_echo_service().await;
    let trusted = Identity::generate().unwrap();
    let intruder = Identity::generate().unwrap();
    let (upstream, downstream, server) =
        start_server(Transport::Pool, Framing::LengthPrefixed, Some(trusted.verifier())).await;
    let client = start_client(
        downstream,
        service,
        Transport::Pool,
        Framing::LengthPrefixed,
        Some(intruder),
    );

    let mut stream = TcpStream::connect(upstream).await.unwrap();
    stream.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    let reply = tokio::time::timeout(Duration::from_secs(1), stream.read(&mut buf)).await;
    assert!(reply.is_err(), "unauthenticated client must never be paired");

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_unanswered_challenge_is_dropped() {
    let verifier = Identity::generate().unwrap().verifier();
    let (_upstream, downstream, server) =
        start_server(Transport::Pool, Framing::LengthPrefixed, Some(verifier)).await;

    let mut silent = TcpStream::connect(downstream).await.unwrap();
    let mut challenge = [0u8; 32];
    silent.read_exact(&mut challenge).await.unwrap();
    assert!(closed_by_peer(&mut silent).await);

    server.stop().await;
}

#[tokio::test]
async fn test_pool_pairs_waiting_upstream_with_raw_bytes() {
    let (upstream, downstream, server) =
        start_server(Transport::Pool, Framing::LengthPrefixed, None).await;

    // Requester arrives first; its bytes wait for a pooled link
    let mut requester = TcpStream::connect(upstream).await.unwrap();
    requester.write_all(b"hello").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut pooled = TcpStream::connect(downstream).await.unwrap();
    let mut paired = [0u8; 6];
    tokio::time::timeout(TIMEOUT, pooled.read_exact(&mut paired))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(paired[0], PAIRED_SIGNAL);
    assert_eq!(&paired[1..], b"hello");

    let mut buf = [0u8; 5];
    pooled.write_all(b"world").await.unwrap();
    tokio::time::timeout(TIMEOUT, requester.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"world");

    // Closing the pooled link closes the requester
    drop(pooled);
    assert!(closed_by_peer(&mut requester).await);

    server.stop().await;
}

#[tokio::test]
async fn test_server_rejects_second_control_link() {
    let (upstream, downstream, server) =
        start_server(Transport::Mux, Framing::LengthPrefixed, None).await;

    let mut link = TcpStream::connect(downstream).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut second = TcpStream::connect(downstream).await.unwrap();
    assert!(closed_by_peer(&mut second).await);

    let mut requester = TcpStream::connect(upstream).await.unwrap();
    requester.write_all(b"hi").await.unwrap();

    let mut decoder = FrameDecoder::new(Framing::LengthPrefixed);
    let frame = read_frame(&mut link, &mut decoder).await;
    assert_ne!(frame.id, 0);
    assert_eq!(frame.payload, Payload::Data(Bytes::from_static(b"hi")));

    // Requester close becomes a close frame for the same id
    drop(requester);
    let close = read_frame(&mut link, &mut decoder).await;
    assert_eq!(close, Frame::close(frame.id));

    server.stop().await;
}

#[tokio::test]
async fn test_mux_buffers_while_control_link_absent() {
    let (upstream, downstream, server) =
        start_server(Transport::Mux, Framing::LengthPrefixed, None).await;

    let mut requester = TcpStream::connect(upstream).await.unwrap();
    requester.write_all(b"early").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut link = TcpStream::connect(downstream).await.unwrap();
    let mut decoder = FrameDecoder::new(Framing::LengthPrefixed);
    let frame = read_frame(&mut link, &mut decoder).await;
    assert_eq!(frame.payload, Payload::Data(Bytes::from_static(b"early")));

    link.write_all(&Frame::data(frame.id, "reply").to_bytes(Framing::LengthPrefixed))
        .await
        .unwrap();
    let mut buf = [0u8; 5];
    tokio::time::timeout(TIMEOUT, requester.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"reply");

    server.stop().await;
}

#[tokio::test]
async fn test_client_reconnects_and_flushes_once() {
    // The test plays the relay
    let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = relay.local_addr().unwrap();

    // Service answers after the first control link is gone
    let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let service_addr = service.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = service.accept().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        tokio::time::sleep(Duration::from_millis(300)).await;
        stream.write_all(b"pong").await.unwrap();
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
    });

    let client = start_client(
        relay_addr,
        service_addr,
        Transport::Mux,
        Framing::LengthPrefixed,
        None,
    );

    let (mut first, _) = tokio::time::timeout(TIMEOUT, relay.accept())
        .await
        .unwrap()
        .unwrap();
    first
        .write_all(&Frame::data(1, "ping").to_bytes(Framing::LengthPrefixed))
        .await
        .unwrap();
    drop(first);

    let (mut second, _) = tokio::time::timeout(TIMEOUT, relay.accept())
        .await
        .unwrap()
        .unwrap();
    let mut decoder = FrameDecoder::new(Framing::LengthPrefixed);
    let frame = read_frame(&mut second, &mut decoder).await;
    assert_eq!(frame, Frame::data(1, "pong"));

    // Delivered exactly once
    let mut buf = [0u8; 64];
    let extra = tokio::time::timeout(Duration::from_millis(300), second.read(&mut buf)).await;
    assert!(extra.is_err(), "unexpected bytes after flush");

    client.stop().await;
}

#[tokio::test]
async fn test_requester_close_reaches_service() {
    let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let service_addr = service.local_addr().unwrap();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = service.accept().await.unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        let _ = done_tx.send(received);
    });

    let (upstream, downstream, server) =
        start_server(Transport::Mux, Framing::LengthPrefixed, None).await;
    let client = start_client(downstream, service_addr, Transport::Mux, Framing::LengthPrefixed, None);

    let mut requester = TcpStream::connect(upstream).await.unwrap();
    requester.write_all(b"bye").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(requester);

    let received = tokio::time::timeout(TIMEOUT, done_rx).await.unwrap().unwrap();
    assert_eq!(received, b"bye");

    client.stop().await;
    server.stop().await;
}

/// Starts a service that greets every connection before reading anything.
async fn spawn_banner_service(banner: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                stream.write_all(banner).await.unwrap();
                let mut rest = Vec::new();
                let _ = stream.read_to_end(&mut rest).await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_pool_tunnel_service_speaks_first() {
    let service = spawn_banner_service(b"220 banner\r\n").await;
    let (upstream, downstream, server) =
        start_server(Transport::Pool, Framing::LengthPrefixed, None).await;
    let client = start_client(downstream, service, Transport::Pool, Framing::LengthPrefixed, None);

    // The requester only reads
    let mut requester = TcpStream::connect(upstream).await.unwrap();
    let mut banner = [0u8; 12];
    tokio::time::timeout(TIMEOUT, requester.read_exact(&mut banner))
        .await
        .expect("banner never reached the requester")
        .unwrap();
    assert_eq!(&banner, b"220 banner\r\n");

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_pool_full_after_handshake_rejects_socket() {
    let identity = Identity::generate().unwrap();
    let mut config = server_config(Transport::Pool, Framing::LengthPrefixed, Some(identity.verifier()));
    config.max_pending_downstream = 1;
    let (upstream, downstream, server) = spawn_server(config).await;

    // Both pass the early check while the pool is still empty
    let mut first = TcpStream::connect(downstream).await.unwrap();
    let mut second = TcpStream::connect(downstream).await.unwrap();
    let mut first_challenge = [0u8; 32];
    let mut second_challenge = [0u8; 32];
    first.read_exact(&mut first_challenge).await.unwrap();
    second.read_exact(&mut second_challenge).await.unwrap();

    first.write_all(&identity.sign(&first_challenge)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    second.write_all(&identity.sign(&second_challenge)).await.unwrap();

    // The pool filled during the second handshake
    assert!(closed_by_peer(&mut second).await);

    let mut requester = TcpStream::connect(upstream).await.unwrap();
    requester.write_all(b"x").await.unwrap();
    let mut paired = [0u8; 2];
    tokio::time::timeout(TIMEOUT, first.read_exact(&mut paired))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(paired, [PAIRED_SIGNAL, b'x']);

    server.stop().await;
}

/// Accepts the next pooled connection on a stand-in relay.
async fn accept_pooled(relay: &TcpListener) -> TcpStream {
    tokio::time::timeout(TIMEOUT, relay.accept())
        .await
        .expect("pooled connection was not opened")
        .unwrap()
        .0
}

#[tokio::test]
async fn test_pool_consumption_opens_exactly_one_replacement() {
    let service = spawn_echo_service().await;
    // The test plays the relay
    let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = relay.local_addr().unwrap();

    let mut config = client_config(relay_addr, service, Transport::Pool, Framing::LengthPrefixed, None);
    config.max_pending_downstream = 2;
    let client = spawn_client(config);

    let mut first = accept_pooled(&relay).await;
    let _second = accept_pooled(&relay).await;

    // Pair the first link; the echo service answers through it
    first.write_all(&[PAIRED_SIGNAL]).await.unwrap();
    first.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    tokio::time::timeout(TIMEOUT, first.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");

    let _replacement = accept_pooled(&relay).await;
    let extra = tokio::time::timeout(Duration::from_millis(500), relay.accept()).await;
    assert!(extra.is_err(), "more than one replacement was opened");

    client.stop().await;
}
