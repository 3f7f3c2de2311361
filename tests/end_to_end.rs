//! Requests over real sockets against a running channel server

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use peerwire::config::{ConnectionConfig, NetworkConfig};
use peerwire::core::message::{commands, MessageType};
use peerwire::core::peer::{PeerAddress, PeerId};
use peerwire::core::signature::{Ed25519SignatureFactory, SignatureFactory};
use peerwire::error::{AbortCause, PeerException, ProtocolError};
use peerwire::protocol::dispatcher::Dispatcher;
use peerwire::protocol::request::{PeerBean, PeerStatusListener};
use peerwire::protocol::sender::{await_with_timeout, ChannelCreator, MessageIdSource};
use peerwire::transport::ChannelServer;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Counts {
    found: AtomicUsize,
    failed: Mutex<Vec<AbortCause>>,
}

impl PeerStatusListener for Counts {
    fn peer_found(&self, _remote: &PeerAddress) {
        self.found.fetch_add(1, Ordering::SeqCst);
    }

    fn peer_failed(&self, _remote: &PeerAddress, exception: &PeerException) {
        self.failed.lock().unwrap().push(exception.cause);
    }
}

fn signatures() -> Arc<dyn SignatureFactory> {
    Arc::new(Ed25519SignatureFactory)
}

fn loopback_config() -> NetworkConfig {
    NetworkConfig::default_with_overrides(|c| {
        c.server.listen_any = false;
        c.server.addresses = vec!["127.0.0.1".into()];
        c.server.tcp_port = 0;
        c.server.udp_port = 0;
    })
}

struct Node {
    server: ChannelServer,
    address: PeerAddress,
    ff_hits: Arc<AtomicUsize>,
}

async fn start_node(config: NetworkConfig) -> Node {
    let identity = PeerAddress::new(PeerId::from_u64(2), "127.0.0.1".parse().unwrap(), 0, 0);
    let dispatcher = Dispatcher::new(identity, config.connection.version);
    let ff_hits = Arc::new(AtomicUsize::new(0));

    dispatcher
        .register(commands::PING, |_req, reply| Ok(reply))
        .unwrap();
    dispatcher
        .register(commands::PUT, |_req, _reply| {
            Err(ProtocolError::State("storage unavailable".into()))
        })
        .unwrap();
    let hits = ff_hits.clone();
    dispatcher
        .register(commands::BROADCAST, move |_req, reply| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(reply)
        })
        .unwrap();

    let mut server = ChannelServer::new(config, Arc::new(dispatcher), signatures());
    assert!(server.startup().await);

    let tcp = server.tcp_local_addrs()[0];
    let udp = server.udp_local_addrs()[0];
    Node {
        server,
        address: PeerAddress::new(PeerId::from_u64(2), tcp.ip(), tcp.port(), udp.port()),
        ff_hits,
    }
}

fn creator(connection: ConnectionConfig) -> (ChannelCreator, Arc<Counts>) {
    let local = PeerAddress::from_socket(PeerId::from_u64(1), "127.0.0.1:7000".parse().unwrap());
    let bean = Arc::new(PeerBean::new(local));
    let counts = Arc::new(Counts::default());
    bean.add_listener(counts.clone());
    let creator = ChannelCreator::new(connection, bean, signatures())
        .with_id_source(MessageIdSource::with_seed(11));
    (creator, counts)
}

#[tokio::test]
async fn test_udp_ping() {
    let mut node = start_node(loopback_config()).await;
    let (creator, counts) = creator(ConnectionConfig::default());

    let request = creator.new_request(node.address.clone(), commands::PING, MessageType::Request1);
    let id = request.message_id();
    let future = creator.send_udp(request);

    let reply = await_with_timeout(&future, WAIT).await.unwrap().unwrap();
    assert_eq!(reply.message_type(), MessageType::Ok);
    assert_eq!(reply.message_id(), id);
    assert_eq!(reply.sender().peer_id(), PeerId::from_u64(2));
    assert!(reply.is_udp());
    assert_eq!(counts.found.load(Ordering::SeqCst), 1);

    node.server.shutdown().await;
}

#[tokio::test]
async fn test_tcp_ping() {
    let mut node = start_node(loopback_config()).await;
    let (creator, counts) = creator(ConnectionConfig::default());

    let request = creator.new_request(node.address.clone(), commands::PING, MessageType::Request1);
    let future = creator.send_tcp(request);

    let reply = await_with_timeout(&future, WAIT).await.unwrap().unwrap();
    assert_eq!(reply.message_type(), MessageType::Ok);
    assert!(!reply.is_udp());
    assert_eq!(counts.found.load(Ordering::SeqCst), 1);

    node.server.shutdown().await;
}

#[tokio::test]
async fn test_several_tcp_requests_in_parallel() {
    let mut node = start_node(loopback_config()).await;
    let (creator, counts) = creator(ConnectionConfig::default());

    let futures: Vec<_> = (0..8)
        .map(|_| {
            creator.send_tcp(creator.new_request(
                node.address.clone(),
                commands::PING,
                MessageType::Request1,
            ))
        })
        .collect();
    for future in &futures {
        let reply = await_with_timeout(future, WAIT).await.unwrap().unwrap();
        assert_eq!(reply.message_type(), MessageType::Ok);
    }
    assert_eq!(counts.found.load(Ordering::SeqCst), 8);

    node.server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_command_fails_as_peer_abort() {
    let mut node = start_node(loopback_config()).await;
    let (creator, counts) = creator(ConnectionConfig::default());

    let future = creator.send_udp(creator.new_request(
        node.address.clone(),
        commands::SYNC,
        MessageType::Request1,
    ));
    let err = await_with_timeout(&future, WAIT).await.unwrap_err();
    assert_eq!(err.cause, AbortCause::PeerAbort);
    assert_eq!(counts.failed.lock().unwrap().as_slice(), &[AbortCause::PeerAbort]);

    node.server.shutdown().await;
}

#[tokio::test]
async fn test_failing_handler_fails_as_peer_abort() {
    let mut node = start_node(loopback_config()).await;
    let (creator, _counts) = creator(ConnectionConfig::default());

    let future = creator.send_tcp(creator.new_request(
        node.address.clone(),
        commands::PUT,
        MessageType::Request1,
    ));
    let err = await_with_timeout(&future, WAIT).await.unwrap_err();
    assert_eq!(err.cause, AbortCause::PeerAbort);

    node.server.shutdown().await;
}

#[tokio::test]
async fn test_version_mismatch_fails() {
    let mut node = start_node(loopback_config()).await;
    let (creator, _counts) = creator(ConnectionConfig {
        version: 9,
        ..ConnectionConfig::default()
    });

    let future = creator.send_udp(creator.new_request(
        node.address.clone(),
        commands::PING,
        MessageType::Request1,
    ));
    let err = await_with_timeout(&future, WAIT).await.unwrap_err();
    assert_eq!(err.cause, AbortCause::PeerAbort);

    node.server.shutdown().await;
}

#[tokio::test]
async fn test_fire_and_forget_reaches_handler() {
    let mut node = start_node(loopback_config()).await;
    let (creator, counts) = creator(ConnectionConfig::default());

    let future = creator.fire_and_forget_udp(creator.new_request(
        node.address.clone(),
        commands::BROADCAST,
        MessageType::RequestFf1,
    ));
    let outcome = await_with_timeout(&future, WAIT).await.unwrap();
    assert!(outcome.is_none());

    let deadline = tokio::time::Instant::now() + WAIT;
    while node.ff_hits.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(node.ff_hits.load(Ordering::SeqCst), 1);
    assert_eq!(counts.found.load(Ordering::SeqCst), 0);

    node.server.shutdown().await;
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = silent.local_addr().unwrap().port();
    let target = PeerAddress::new(PeerId::from_u64(3), "127.0.0.1".parse().unwrap(), port, port);

    let (creator, counts) = creator(ConnectionConfig {
        idle_udp: Duration::from_millis(200),
        ..ConnectionConfig::default()
    });
    let future = creator.send_udp(creator.new_request(target, commands::PING, MessageType::Request1));

    let err = await_with_timeout(&future, WAIT).await.unwrap_err();
    assert_eq!(err.cause, AbortCause::Timeout);
    assert_eq!(counts.failed.lock().unwrap().as_slice(), &[AbortCause::Timeout]);
}

#[tokio::test]
async fn test_refused_connection_is_peer_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let target = PeerAddress::new(PeerId::from_u64(3), "127.0.0.1".parse().unwrap(), port, port);

    let (creator, _counts) = creator(ConnectionConfig::default());
    let future = creator.send_tcp(creator.new_request(target, commands::PING, MessageType::Request1));

    let err = await_with_timeout(&future, WAIT).await.unwrap_err();
    assert_eq!(err.cause, AbortCause::PeerError);
}

#[tokio::test]
async fn test_shutdown_aborts_outstanding_requests() {
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = silent.local_addr().unwrap().port();
    let target = PeerAddress::new(PeerId::from_u64(3), "127.0.0.1".parse().unwrap(), port, port);

    let (creator, counts) = creator(ConnectionConfig {
        idle_udp: Duration::from_secs(60),
        ..ConnectionConfig::default()
    });
    let future = creator.send_udp(creator.new_request(target, commands::PING, MessageType::Request1));
    tokio::time::sleep(Duration::from_millis(50)).await;
    creator.shutdown();

    let err = await_with_timeout(&future, WAIT).await.unwrap_err();
    assert_eq!(err.cause, AbortCause::UserAbort);
    assert!(counts.failed.lock().unwrap().is_empty());
    assert!(creator.is_shutdown());
}

#[tokio::test]
async fn test_startup_fails_on_taken_port() {
    let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.listen_any = false;
        c.server.addresses = vec!["127.0.0.1".into()];
        c.server.tcp_port = 0;
        c.server.udp_port = port;
    });
    let mut server = ChannelServer::new(
        config,
        Arc::new(Dispatcher::new(PeerAddress::unknown(), 1)),
        signatures(),
    );
    assert!(!server.startup().await);
    // the TCP endpoint bound before the failure stays up until shutdown
    assert_eq!(server.tcp_local_addrs().len(), 1);
    assert!(server.udp_local_addrs().is_empty());
    server.shutdown().await;
}

#[tokio::test]
async fn test_disabled_bind_starts_nothing() {
    let config = NetworkConfig::default_with_overrides(|c| c.server.disable_bind = true);
    let mut server = ChannelServer::new(
        config,
        Arc::new(Dispatcher::new(PeerAddress::unknown(), 1)),
        signatures(),
    );
    assert!(server.startup().await);
    assert!(server.tcp_local_addrs().is_empty());
    assert!(!server.is_running());
}

#[tokio::test]
async fn test_startup_without_addresses_fails() {
    for addresses in [vec![], vec!["not-an-ip".to_string()]] {
        let config = NetworkConfig::default_with_overrides(|c| {
            c.server.listen_any = false;
            c.server.addresses = addresses.clone();
        });
        let mut server = ChannelServer::new(
            config,
            Arc::new(Dispatcher::new(PeerAddress::unknown(), 1)),
            signatures(),
        );
        assert!(!server.startup().await, "{addresses:?}");
        assert!(server.tcp_local_addrs().is_empty());
        assert!(server.udp_local_addrs().is_empty());
        assert!(!server.is_running());
    }
}

#[tokio::test]
async fn test_server_shutdown_stops_answering() {
    let mut node = start_node(loopback_config()).await;
    let addr: SocketAddr = node.server.udp_local_addrs()[0];
    node.server.shutdown().await;
    assert!(!node.server.is_running());

    let (creator, _counts) = creator(ConnectionConfig {
        idle_udp: Duration::from_millis(200),
        ..ConnectionConfig::default()
    });
    let target = PeerAddress::new(PeerId::from_u64(2), addr.ip(), addr.port(), addr.port());
    let future = creator.send_udp(creator.new_request(target, commands::PING, MessageType::Request1));
    let err = await_with_timeout(&future, WAIT).await.unwrap_err();
    // either nobody listens (ICMP refusal) or the datagram is dropped
    assert!(matches!(err.cause, AbortCause::Timeout | AbortCause::PeerError));
}
