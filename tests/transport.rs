//! Transport integration tests: two buses in one process on ephemeral ports.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use litebus::{Aid, BusConfig, Litebus, MessageBase, MsgType, TlsConfig};
use tokio::sync::mpsc;

fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "litebus=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// A bus whose handler forwards every message into a channel.
struct CollectorBus {
    bus: Litebus,
    rx: mpsc::UnboundedReceiver<MessageBase>,
    addr: SocketAddr,
}

impl CollectorBus {
    async fn start(config: BusConfig) -> Self {
        Self::start_on("127.0.0.1:0", config).await
    }

    async fn start_on(url: &str, config: BusConfig) -> Self {
        let bus = Litebus::initialize(config);
        let addr = bus.start_server(url, "").await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        bus.register_msg_handler(Arc::new(move |msg| {
            let _ = tx.send(msg);
        }));
        Self { bus, rx, addr }
    }

    fn aid(&self, name: &str) -> Aid {
        Aid::new(name, format!("tcp://{}", self.addr))
    }

    async fn recv_kind(&mut self, kind: MsgType, within: Duration) -> Option<MessageBase> {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            if left.is_zero() {
                return None;
            }
            match tokio::time::timeout(left, self.rx.recv()).await {
                Ok(Some(msg)) if msg.kind == kind => return Some(msg),
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return None,
            }
        }
    }
}

/// A bus that answers every wire message with one reply.
async fn start_echo_bus(url: &str, config: BusConfig) -> (Litebus, SocketAddr) {
    let bus = Litebus::initialize(config);
    let addr = bus.start_server(url, "").await.unwrap();
    let transport = bus.transport().clone();
    let advertise = bus.advertise_url();
    bus.register_msg_handler(Arc::new(move |msg| {
        if msg.kind == MsgType::Kmsg {
            let reply = MessageBase::new(
                Aid::new("testserver", advertise.clone()),
                msg.from.clone(),
                "reply",
                msg.body.clone(),
            );
            let _ = transport.send(reply, false, false);
        }
    }));
    (bus, addr)
}

fn server_aid(addr: SocketAddr) -> Aid {
    Aid::new("testserver", format!("tcp://{addr}"))
}

#[tokio::test]
async fn round_trip() {
    init_logs();
    let mut a = CollectorBus::start(BusConfig::default()).await;
    let (b, b_addr) = start_echo_bus("127.0.0.1:0", BusConfig::default()).await;

    let msg = MessageBase::new(
        a.aid("testserver"),
        server_aid(b_addr),
        "testname",
        vec![b'A'; 100],
    );
    a.bus.send(msg, false, false).unwrap();

    let reply = a
        .recv_kind(MsgType::Kmsg, Duration::from_secs(5))
        .await
        .expect("reply within 5s");
    assert_eq!(reply.name, "reply");
    assert_eq!(reply.body, vec![b'A'; 100]);
    assert_eq!(reply.from.name(), "testserver");

    a.bus.finalize().await;
    b.finalize().await;
}

#[tokio::test]
async fn batch_of_ten() {
    init_logs();
    let mut a = CollectorBus::start(BusConfig::default()).await;
    let (b, b_addr) = start_echo_bus("127.0.0.1:0", BusConfig::default()).await;

    for i in 0..10 {
        let msg = MessageBase::new(
            a.aid("testserver"),
            server_aid(b_addr),
            format!("testname-{i}"),
            vec![b'B'; 64],
        );
        a.bus.send(msg, false, false).unwrap();
    }

    for i in 0..10 {
        let reply = a.recv_kind(MsgType::Kmsg, Duration::from_secs(10)).await;
        assert!(reply.is_some(), "missing reply {i}");
    }

    a.bus.finalize().await;
    b.finalize().await;
}

#[tokio::test]
async fn per_link_fifo() {
    init_logs();
    let mut a = CollectorBus::start(BusConfig::default()).await;
    let (b, b_addr) = start_echo_bus("127.0.0.1:0", BusConfig::default()).await;

    for i in 0u32..50 {
        let msg = MessageBase::new(
            a.aid("testserver"),
            server_aid(b_addr),
            "seq",
            i.to_be_bytes().to_vec(),
        );
        a.bus.send(msg, false, false).unwrap();
    }

    // the echo replies observe the sends in order, and arrive in order
    for i in 0u32..50 {
        let reply = a
            .recv_kind(MsgType::Kmsg, Duration::from_secs(10))
            .await
            .expect("reply");
        assert_eq!(reply.body, i.to_be_bytes().to_vec());
    }

    a.bus.finalize().await;
    b.finalize().await;
}

#[tokio::test]
async fn link_then_server_dies() {
    init_logs();
    let mut a = CollectorBus::start(BusConfig::default()).await;
    let (b, b_addr) = start_echo_bus("127.0.0.1:0", BusConfig::default()).await;
    let b_aid = server_aid(b_addr);

    a.bus.link(a.aid("testserver"), b_aid.clone()).unwrap();

    // prove the link is up before killing the server
    let msg = MessageBase::new(a.aid("testserver"), b_aid.clone(), "ping", vec![1]);
    a.bus.send(msg, false, false).unwrap();
    a.recv_kind(MsgType::Kmsg, Duration::from_secs(5))
        .await
        .expect("reply before server death");

    b.finalize().await;

    let exit = a
        .recv_kind(MsgType::Exit, Duration::from_secs(5))
        .await
        .expect("exit within 5s");
    assert_eq!(exit.from, b_aid);
    assert_eq!(exit.to, a.aid("testserver"));

    a.bus.finalize().await;
}

#[tokio::test]
async fn unlink_is_idempotent() {
    init_logs();
    let mut a = CollectorBus::start(BusConfig::default()).await;
    let (b, b_addr) = start_echo_bus("127.0.0.1:0", BusConfig::default()).await;
    let b_aid = server_aid(b_addr);

    // plain send, no linker subscription
    let msg = MessageBase::new(a.aid("testserver"), b_aid.clone(), "ping", vec![1]);
    a.bus.send(msg, false, false).unwrap();
    a.recv_kind(MsgType::Kmsg, Duration::from_secs(5))
        .await
        .expect("reply");

    a.bus.unlink(b_aid.clone()).unwrap();
    a.bus.unlink(b_aid.clone()).unwrap();

    // no subscriber, so neither unlink produces an exit
    assert!(a
        .recv_kind(MsgType::Exit, Duration::from_secs(1))
        .await
        .is_none());

    a.bus.finalize().await;
    b.finalize().await;
}

#[tokio::test]
async fn reconnect_after_server_restart() {
    init_logs();
    let mut a = CollectorBus::start(BusConfig::default()).await;
    let (b, b_addr) = start_echo_bus("127.0.0.1:0", BusConfig::default()).await;
    let b_aid = server_aid(b_addr);
    let a_aid = a.aid("testserver");

    a.bus.link(a_aid.clone(), b_aid.clone()).unwrap();
    let msg = MessageBase::new(a_aid.clone(), b_aid.clone(), "ping", vec![1]);
    a.bus.send(msg, false, false).unwrap();
    a.recv_kind(MsgType::Kmsg, Duration::from_secs(5))
        .await
        .expect("reply before restart");

    b.finalize().await;
    a.recv_kind(MsgType::Exit, Duration::from_secs(5))
        .await
        .expect("exit after server death");

    // restart the server on the same port, then reconnect and resend
    let (b2, _) = start_echo_bus(&b_addr.to_string(), BusConfig::default()).await;
    a.bus.reconnect(a_aid.clone(), b_aid.clone()).unwrap();

    let msg = MessageBase::new(a_aid.clone(), b_aid.clone(), "after-restart", vec![2]);
    a.bus.send(msg, false, false).unwrap();
    let reply = a
        .recv_kind(MsgType::Kmsg, Duration::from_secs(5))
        .await
        .expect("reply after reconnect");
    assert_eq!(reply.body, vec![2]);

    // the subscription survived the reconnect: the restarted server's death
    // produces exactly one more exit
    b2.finalize().await;
    a.recv_kind(MsgType::Exit, Duration::from_secs(5))
        .await
        .expect("exit after second death");
    assert!(a
        .recv_kind(MsgType::Exit, Duration::from_secs(1))
        .await
        .is_none());

    a.bus.finalize().await;
}

#[tokio::test]
async fn reconnect_while_peer_alive_keeps_one_subscription() {
    init_logs();
    let mut a = CollectorBus::start(BusConfig::default()).await;
    let (b, b_addr) = start_echo_bus("127.0.0.1:0", BusConfig::default()).await;
    let b_aid = server_aid(b_addr);
    let a_aid = a.aid("testserver");

    a.bus.link(a_aid.clone(), b_aid.clone()).unwrap();
    let msg = MessageBase::new(a_aid.clone(), b_aid.clone(), "ping", vec![1]);
    a.bus.send(msg, false, false).unwrap();
    a.recv_kind(MsgType::Kmsg, Duration::from_secs(5))
        .await
        .expect("reply");

    a.bus.reconnect(a_aid.clone(), b_aid.clone()).unwrap();
    let msg = MessageBase::new(a_aid.clone(), b_aid.clone(), "ping2", vec![2]);
    a.bus.send(msg, false, false).unwrap();
    a.recv_kind(MsgType::Kmsg, Duration::from_secs(5))
        .await
        .expect("reply after reconnect");

    // exactly one exit: the swapped and re-added subscriptions deduplicated
    b.finalize().await;
    a.recv_kind(MsgType::Exit, Duration::from_secs(5))
        .await
        .expect("exit");
    assert!(a
        .recv_kind(MsgType::Exit, Duration::from_secs(1))
        .await
        .is_none());

    a.bus.finalize().await;
}

#[tokio::test]
async fn queue_cap_bounds_buffering_and_drops_silently() {
    init_logs();
    let mut a = CollectorBus::start(BusConfig::default()).await;

    // a blackholed peer: the connect pends (or fails), it never accepts
    let dead = Aid::parse("testserver@10.255.255.1:9");
    for i in 0..2000 {
        let msg = MessageBase::new(a.aid("testserver"), dead.clone(), format!("m{i}"), vec![0]);
        a.bus.send(msg, false, false).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    for stat in a.bus.transport().stats() {
        assert!(
            stat.queued <= litebus::net::SENDMSG_QUEUE_LEN,
            "queue overran the cap: {}",
            stat.queued
        );
    }
    // dropped sends never synthesize an exit
    assert!(a
        .recv_kind(MsgType::Exit, Duration::from_secs(1))
        .await
        .is_none());

    a.bus.finalize().await;
}

#[tokio::test]
async fn double_link_mode_round_trip() {
    init_logs();
    let config = BusConfig {
        double_link: Some(true),
        ..Default::default()
    };
    let mut a = CollectorBus::start(config.clone()).await;
    let (b, b_addr) = start_echo_bus("127.0.0.1:0", config).await;

    let msg = MessageBase::new(a.aid("testserver"), server_aid(b_addr), "dbl", vec![7]);
    a.bus.send(msg, false, false).unwrap();
    let reply = a
        .recv_kind(MsgType::Kmsg, Duration::from_secs(5))
        .await
        .expect("reply in double-link mode");
    assert_eq!(reply.body, vec![7]);

    a.bus.finalize().await;
    b.finalize().await;
}

#[tokio::test]
async fn finalize_is_idempotent() {
    init_logs();
    let a = CollectorBus::start(BusConfig::default()).await;
    a.bus.finalize().await;
    a.bus.finalize().await;
    assert!(a
        .bus
        .send(
            MessageBase::new("a@127.0.0.1:1", "b@127.0.0.1:2", "m", vec![]),
            false,
            false,
        )
        .is_err());
}

// =============================================================================
// TLS
// =============================================================================

fn test_tls_config() -> TlsConfig {
    let cert = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])
    .unwrap();
    let cert_der = cert.serialize_der().unwrap();
    let key_der = cert.serialize_private_key_der();

    let server = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(
            vec![rustls::Certificate(cert_der.clone())],
            rustls::PrivateKey(key_der),
        )
        .unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(&rustls::Certificate(cert_der)).unwrap();
    let client = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();

    TlsConfig {
        server: Arc::new(server),
        client: Arc::new(client),
    }
}

#[tokio::test]
async fn tls_round_trip() {
    init_logs();
    let tls = test_tls_config();
    let config = BusConfig {
        tls: Some(tls.clone()),
        ..Default::default()
    };
    let mut a = CollectorBus::start(config.clone()).await;
    let (b, b_addr) = start_echo_bus("127.0.0.1:0", config).await;

    let msg = MessageBase::new(
        a.aid("testserver"),
        server_aid(b_addr),
        "secure",
        vec![b'S'; 2048],
    );
    a.bus.send(msg, false, false).unwrap();

    let reply = a
        .recv_kind(MsgType::Kmsg, Duration::from_secs(5))
        .await
        .expect("tls reply");
    assert_eq!(reply.body.len(), 2048);
    assert!(a
        .bus
        .transport()
        .stats()
        .iter()
        .all(|stat| stat.kind == litebus::net::StreamKind::Tls));

    a.bus.finalize().await;
    b.finalize().await;
}

#[tokio::test]
async fn half_open_tls_connection_holds_a_counted_slot() {
    init_logs();
    let config = BusConfig {
        tls: Some(test_tls_config()),
        ..Default::default()
    };
    let a = CollectorBus::start(config).await;

    // raw TCP connection that never starts the handshake
    let stalled = tokio::net::TcpStream::connect(a.addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = a.bus.transport().stats();
    assert_eq!(stats.len(), 1);
    assert!(stats[0].is_remote);
    assert_eq!(stats[0].state, litebus::ConnState::Connecting);

    drop(stalled);
    a.bus.finalize().await;
}
