//! Integration tests for the Node public API.
//!
//! These tests drive real nodes over loopback UDP. Nodes are single-threaded
//! and only handle datagrams while pumped, so every peer that must answer is
//! pumped concurrently with the operation under test via `tokio::join!`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Once;
use std::time::Duration;

use crnode::{Node, NodeConfig, NodeError};
use tokio::net::UdpSocket;
use tokio::time::timeout;

static INIT: Once = Once::new();

/// Use RUST_LOG=debug or RUST_LOG=trace for verbose output.
fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("warn")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Atomic port counter for unique port allocation across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(41000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const PUMP: Duration = Duration::from_millis(300);
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn test_config() -> NodeConfig {
    NodeConfig {
        port_range: 41000..=41999,
        bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        bootstrap: None,
        query_timeout: Duration::from_millis(400),
        poll_interval: Duration::from_millis(20),
        ..NodeConfig::default()
    }
}

async fn start_node(name: &str) -> Node {
    start_node_with(name, test_config()).await
}

async fn start_node_with(name: &str, config: NodeConfig) -> Node {
    let mut node = Node::new(config);
    node.set_node_name(name).expect("set name");
    node.open_port(next_port()).await.expect("open port");
    node
}

/// Greet `b` from `a` and pump both until the reply has been handled.
async fn introduce(a: &mut Node, b: &mut Node) {
    let b_addr = b.local_addr().expect("b open");
    a.greet(b_addr).await.expect("greet");
    let (ra, rb) = tokio::join!(a.handle_incoming_messages(PUMP), b.handle_incoming_messages(PUMP));
    ra.expect("pump a");
    rb.expect("pump b");
}

async fn raw_socket() -> UdpSocket {
    UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.expect("bind raw socket")
}

async fn recv_text(socket: &UdpSocket) -> Option<String> {
    let mut buf = vec![0u8; 2048];
    let (len, _) = timeout(RECV_TIMEOUT, socket.recv_from(&mut buf)).await.ok()?.ok()?;
    String::from_utf8(buf[..len].to_vec()).ok()
}

#[tokio::test]
async fn configuration_errors_surface_before_network_use() {
    init_tracing();
    let mut node = Node::new(test_config());

    assert!(matches!(node.set_node_name(""), Err(NodeError::InvalidName(_))));
    assert!(matches!(node.set_node_name("alice"), Err(NodeError::InvalidName(_))));
    assert!(matches!(
        node.open_port(20110).await,
        Err(NodeError::PortOutOfRange { port: 20110, .. })
    ));
    assert!(matches!(
        node.handle_incoming_messages(Duration::from_millis(10)).await,
        Err(NodeError::PortNotOpen)
    ));

    let port = next_port();
    let addr = node.open_port(port).await.expect("open port");
    assert_eq!(addr.port(), port);
    assert_eq!(node.local_addr(), Some(addr));
}

#[tokio::test]
async fn two_node_greeting_and_local_operations() {
    init_tracing();
    let result = timeout(TEST_TIMEOUT, async {
        let mut a = start_node("N:a").await;
        let mut b = start_node("N:b").await;

        introduce(&mut a, &mut b).await;

        assert!(a.is_active("N:b"));
        assert_eq!(a.peer_addr("N:b"), b.local_addr());
        assert_eq!(a.peer_addr("N:a"), None);
        assert!(!b.is_active("N:a"));
        assert_eq!(
            a.known_node_names().iter().map(|n| n.as_str()).collect::<Vec<_>>(),
            vec!["N:b"]
        );

        // b knows nobody and has no bootstrap peer.
        assert_eq!(b.read("k").await.unwrap(), None);
        assert!(!b.exists("k").await.unwrap());

        assert!(a.write("k", "v").unwrap());
        assert_eq!(a.read("k").await.unwrap().as_deref(), Some("v"));
        assert!(a.exists("k").await.unwrap());
    })
    .await;
    assert!(result.is_ok(), "test timed out");
}

#[tokio::test]
async fn remote_read_and_exists_reach_peer_store() {
    init_tracing();
    let result = timeout(TEST_TIMEOUT, async {
        let mut a = start_node("N:reader").await;
        let mut d = start_node("N:holder").await;
        introduce(&mut a, &mut d).await;
        d.write("colour", "deep blue").unwrap();

        let (value, pumped) = tokio::join!(a.read("colour"), d.handle_incoming_messages(PUMP));
        pumped.unwrap();
        assert_eq!(value.unwrap().as_deref(), Some("deep blue"));

        let (found, pumped) = tokio::join!(a.exists("colour"), d.handle_incoming_messages(PUMP));
        pumped.unwrap();
        assert!(found.unwrap());

        // Remote values are not cached locally.
        let (missing, pumped) = tokio::join!(
            a.read("shape"),
            d.handle_incoming_messages(Duration::from_millis(1500))
        );
        pumped.unwrap();
        assert_eq!(missing.unwrap(), None);
    })
    .await;
    assert!(result.is_ok(), "test timed out");
}

#[tokio::test]
async fn lookup_follows_nearest_node_replies() {
    init_tracing();
    let result = timeout(TEST_TIMEOUT, async {
        let mut a = start_node("N:origin").await;
        let mut b = start_node("N:middle").await;
        let mut d = start_node("N:far").await;

        introduce(&mut a, &mut b).await;
        introduce(&mut b, &mut d).await;
        assert!(!a.is_active("N:far"));
        d.write("treasure", "gold").unwrap();

        // a only knows b; b's nearest-node reply leads a to d.
        let (value, rb, rd) = tokio::join!(
            a.read("treasure"),
            b.handle_incoming_messages(Duration::from_secs(3)),
            d.handle_incoming_messages(Duration::from_secs(3)),
        );
        rb.unwrap();
        rd.unwrap();
        assert_eq!(value.unwrap().as_deref(), Some("gold"));
        assert!(a.is_active("N:far"));
        assert_eq!(a.peer_addr("N:far"), d.local_addr());
    })
    .await;
    assert!(result.is_ok(), "test timed out");
}

#[tokio::test]
async fn malformed_datagrams_are_ignored() {
    init_tracing();
    let mut a = start_node("N:sturdy").await;
    let a_addr = a.local_addr().unwrap();
    let raw = raw_socket().await;

    let junk: [&[u8]; 6] = [b"", b"X", b"AB", b"ABC G", b"AB ? x", b"\xff\xfe G"];
    for junk in junk {
        raw.send_to(junk, a_addr).await.unwrap();
    }
    a.handle_incoming_messages(PUMP).await.unwrap();

    assert!(a.known_node_names().is_empty());
    assert!(a.info_messages().is_empty());

    // Still answering afterwards.
    raw.send_to(b"OK G", a_addr).await.unwrap();
    let (_, reply) = tokio::join!(a.handle_incoming_messages(PUMP), recv_text(&raw));
    assert_eq!(reply.as_deref(), Some("OK H 0 N:sturdy "));
}

#[tokio::test]
async fn duplicate_transactions_get_one_reply() {
    init_tracing();
    let mut a = start_node("N:once").await;
    let a_addr = a.local_addr().unwrap();
    let raw = raw_socket().await;

    raw.send_to(b"DD G", a_addr).await.unwrap();
    raw.send_to(b"DD G", a_addr).await.unwrap();
    a.handle_incoming_messages(PUMP).await.unwrap();

    assert_eq!(recv_text(&raw).await.as_deref(), Some("DD H 0 N:once "));
    let mut buf = [0u8; 64];
    let second = timeout(Duration::from_millis(200), raw.recv_from(&mut buf)).await;
    assert!(second.is_err(), "duplicate transaction answered twice");
}

#[tokio::test]
async fn write_request_from_peer_is_stored_and_acknowledged() {
    init_tracing();
    let mut a = start_node("N:store").await;
    let a_addr = a.local_addr().unwrap();
    let raw = raw_socket().await;
    let raw_addr: SocketAddr = raw.local_addr().unwrap();

    let record = format!("W1 W 0 N:peer 0 {} ", raw_addr);
    raw.send_to(record.as_bytes(), a_addr).await.unwrap();
    raw.send_to(b"W2 W 0 fruit 1 ripe pear ", a_addr).await.unwrap();
    raw.send_to(b"W3 W 0 fruit 0 apple ", a_addr).await.unwrap();
    a.handle_incoming_messages(PUMP).await.unwrap();

    assert_eq!(recv_text(&raw).await.as_deref(), Some("W1 X A"));
    assert_eq!(recv_text(&raw).await.as_deref(), Some("W2 X A"));
    assert_eq!(recv_text(&raw).await.as_deref(), Some("W3 X R"));

    assert!(a.is_active("N:peer"));
    assert_eq!(a.read("fruit").await.unwrap().as_deref(), Some("apple"));
    assert_eq!(a.read("N:peer").await.unwrap(), Some(raw_addr.to_string()));
}

#[tokio::test]
async fn information_messages_are_kept() {
    init_tracing();
    let mut a = start_node("N:listener").await;
    let a_addr = a.local_addr().unwrap();
    let raw = raw_socket().await;

    raw.send_to(b"I1 I 2 hello over there ", a_addr).await.unwrap();
    raw.send_to(b"I2 I 0 bye ", a_addr).await.unwrap();
    a.handle_incoming_messages(PUMP).await.unwrap();

    assert_eq!(a.info_messages(), vec!["hello over there", "bye"]);
}

#[tokio::test]
async fn full_drop_rate_ignores_everything() {
    init_tracing();
    let config = NodeConfig {
        drop_rate: 1.0,
        ..test_config()
    };
    let mut lossy = start_node_with("N:lossy", config).await;
    let mut a = start_node("N:sender").await;

    introduce(&mut a, &mut lossy).await;
    assert!(!a.is_active("N:lossy"));
}

#[tokio::test]
async fn partial_drop_rate_loses_some_pings() {
    init_tracing();
    let config = NodeConfig {
        drop_rate: 0.5,
        ..test_config()
    };
    let mut lossy = start_node_with("N:flaky", config).await;
    let lossy_addr = lossy.local_addr().unwrap();
    let raw = raw_socket().await;

    for i in 0..100u8 {
        let tx = [b'!' + i / 94, b'!' + i % 94];
        let mut ping = tx.to_vec();
        ping.extend_from_slice(b" G");
        raw.send_to(&ping, lossy_addr).await.unwrap();
    }
    lossy.handle_incoming_messages(Duration::from_millis(500)).await.unwrap();

    let mut answered = 0;
    let mut buf = [0u8; 64];
    while timeout(Duration::from_millis(200), raw.recv_from(&mut buf)).await.is_ok() {
        answered += 1;
    }
    assert!((15..=85).contains(&answered), "answered {} of 100", answered);
}
