//! Integration tests for the dispatcher public API.
//!
//! These drive real nodes over loopback TCP: sessions go through the full
//! setup handshake, the S/Kademlia authentication exchange, and the X25519
//! key exchange before any assertion runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use lattica::{
    Config, ConnectionAdapter, MessageBody, Node, NodeError, NodeIdentity, PeerId, Service,
    ServiceMessage, TcpDialer,
};

const ECHO_SERVICE_ID: u32 = 42;
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Low-difficulty puzzles keep identity generation fast in tests while
/// still exercising the verification path.
fn test_config() -> Config {
    Config {
        c1: 8,
        c2: 8,
        ping_timeout: Duration::from_millis(500),
        ..Config::default()
    }
}

struct TestNode {
    node: Arc<Node>,
    adapter: Arc<ConnectionAdapter>,
}

impl TestNode {
    async fn start(config: Config) -> Self {
        let identity = Arc::new(NodeIdentity::generate(config.c1, config.c2));
        Self::start_with_identity(config, identity).await
    }

    async fn start_with_identity(config: Config, identity: Arc<NodeIdentity>) -> Self {
        let node = Node::new(identity, config);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
        let adapter = ConnectionAdapter::new(listener, Arc::new(TcpDialer::default()), &node)
            .expect("adapter setup failed");
        node.start();
        Self { node, adapter }
    }

    fn peer_id(&self) -> PeerId {
        self.node.identity().peer_id(self.adapter.local_addr())
    }
}

/// Records every payload it sees; optionally answers with the uppercased
/// payload (only to lowercase input, so two echoes never ping-pong
/// forever).
struct EchoService {
    seen: mpsc::UnboundedSender<Vec<u8>>,
    reply: bool,
}

impl EchoService {
    fn register(node: &Arc<Node>, reply: bool) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        node.add_service(Arc::new(EchoService { seen: tx, reply }));
        rx
    }
}

#[async_trait]
impl Service for EchoService {
    async fn receive(&self, message: &ServiceMessage) -> anyhow::Result<Option<MessageBody>> {
        if message.body.service != ECHO_SERVICE_ID {
            return Ok(None);
        }
        let _ = self.seen.send(message.body.payload.clone());

        let upper = message.body.payload.to_ascii_uppercase();
        if self.reply && upper != message.body.payload {
            Ok(Some(MessageBody::new(ECHO_SERVICE_ID, upper)))
        } else {
            Ok(None)
        }
    }
}

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Sends can land in the window where a racing connection is being torn
/// down; real callers retry, so the tests do too.
async fn send_with_retry(node: &Arc<Node>, to: &lattica::PublicKey, body: MessageBody) {
    let mut last = None;
    for _ in 0..20 {
        match node.send(to, body.clone()).await {
            Ok(()) => return,
            Err(e) => {
                last = Some(e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
    panic!("send did not succeed: {:?}", last);
}

#[tokio::test]
async fn two_node_ping_pong() {
    let a = TestNode::start(test_config()).await;
    let b = TestNode::start(test_config()).await;

    let mut a_seen = EchoService::register(&a.node, false);
    let _b_seen = EchoService::register(&b.node, true);

    a.adapter
        .bootstrap(&a.node, &[b.peer_id()])
        .await
        .expect("bootstrap failed");

    a.node
        .send(
            &b.node.public_key(),
            MessageBody::new(ECHO_SERVICE_ID, b"hi".to_vec()),
        )
        .await
        .expect("send failed");

    let reply = timeout(Duration::from_secs(1), a_seen.recv())
        .await
        .expect("no echo within 1s")
        .expect("channel closed");
    assert_eq!(reply, b"HI");

    // Both routing tables learned the other side through discovery.
    let a_routes = a.adapter.routes();
    let b_routes = b.adapter.routes();
    eventually("routing tables to converge", || {
        a_routes
            .get_peer_by_public_key(&b.node.public_key())
            .is_some()
            && b_routes
                .get_peer_by_public_key(&a.node.public_key())
                .is_some()
    })
    .await;
}

#[tokio::test]
async fn request_returns_correlated_reply() {
    let a = TestNode::start(test_config()).await;
    let b = TestNode::start(test_config()).await;
    let _b_seen = EchoService::register(&b.node, true);

    a.adapter
        .add_remote_id(b.node.public_key(), &b.peer_id().address)
        .await;

    let reply = timeout(
        TEST_TIMEOUT,
        a.node.request(
            &b.node.public_key(),
            MessageBody::new(ECHO_SERVICE_ID, b"request me".to_vec()),
            Duration::from_secs(5),
        ),
    )
    .await
    .expect("test timeout")
    .expect("request failed");

    assert_eq!(reply.payload, b"REQUEST ME");
    assert_eq!(reply.service, ECHO_SERVICE_ID);
    assert_ne!(reply.request_nonce, 0);

    assert_eq!(
        a.node.pending_requests(),
        0,
        "request state must be removed after a reply"
    );
}

#[tokio::test]
async fn request_times_out_and_cleans_up() {
    let a = TestNode::start(test_config()).await;
    // B has no echo service: requests are dispatched and silently ignored.
    let b = TestNode::start(test_config()).await;

    a.adapter
        .add_remote_id(b.node.public_key(), &b.peer_id().address)
        .await;

    let result = a
        .node
        .request(
            &b.node.public_key(),
            MessageBody::new(ECHO_SERVICE_ID, b"anyone there".to_vec()),
            Duration::from_millis(250),
        )
        .await;

    assert!(matches!(result, Err(NodeError::Timeout)));
    assert_eq!(
        a.node.pending_requests(),
        0,
        "request state must be removed after a timeout"
    );
}

#[tokio::test]
async fn send_argument_errors() {
    let a = TestNode::start(test_config()).await;
    let b = TestNode::start(test_config()).await;

    let empty = a
        .node
        .send(&b.node.public_key(), MessageBody::new(ECHO_SERVICE_ID, Vec::new()))
        .await;
    assert!(matches!(empty, Err(NodeError::EmptyBody)));

    let missing = a
        .node
        .send(&b.node.public_key(), MessageBody::new(0, b"x".to_vec()))
        .await;
    assert!(matches!(missing, Err(NodeError::MissingService)));

    let self_addressed = a
        .node
        .send(
            &a.node.public_key(),
            MessageBody::new(ECHO_SERVICE_ID, b"x".to_vec()),
        )
        .await;
    assert!(matches!(self_addressed, Err(NodeError::SelfAddressed)));
}

#[tokio::test]
async fn send_to_unknown_peer_fails_to_dial() {
    let a = TestNode::start(test_config()).await;
    let b = TestNode::start(test_config()).await;

    // B was never added to A's routing table.
    let result = a
        .node
        .send(
            &b.node.public_key(),
            MessageBody::new(ECHO_SERVICE_ID, b"x".to_vec()),
        )
        .await;

    assert!(matches!(result, Err(NodeError::DialFailed(_))));
    assert_eq!(a.node.peer_count(), 0, "failed dial must not leak a slot");
}

#[tokio::test]
async fn concurrent_dial_race_converges_to_one_session() {
    let a = TestNode::start(test_config()).await;
    let b = TestNode::start(test_config()).await;

    let _a_seen = EchoService::register(&a.node, false);
    let _b_seen = EchoService::register(&b.node, false);

    a.adapter
        .add_remote_id(b.node.public_key(), &b.peer_id().address)
        .await;
    b.adapter
        .add_remote_id(a.node.public_key(), &a.peer_id().address)
        .await;

    let body = MessageBody::new(ECHO_SERVICE_ID, b"race".to_vec());
    let b_pub = b.node.public_key();
    let a_pub = a.node.public_key();
    tokio::join!(
        send_with_retry(&a.node, &b_pub, body.clone()),
        send_with_retry(&b.node, &a_pub, body.clone()),
    );

    // Exactly one surviving slot per side.
    let (a_node, b_node) = (a.node.clone(), b.node.clone());
    eventually("registries to converge to one slot each", move || {
        a_node.peer_count() == 1
            && b_node.peer_count() == 1
            && a_node.established_peers() == vec![b_node.public_key()]
            && b_node.established_peers() == vec![a_node.public_key()]
    })
    .await;

    // The surviving session still carries traffic in both directions.
    send_with_retry(&a.node, &b.node.public_key(), body.clone()).await;
    send_with_retry(&b.node, &a.node.public_key(), body).await;
}

#[tokio::test]
async fn invalid_puzzle_identity_is_rejected() {
    // A's identity satisfies only trivial puzzles; B requires c1 = c2 = 8
    // and must refuse the handshake.
    let weak_identity = Arc::new(NodeIdentity::generate(0, 0));
    let a = TestNode::start_with_identity(
        Config {
            c1: 0,
            c2: 0,
            ..test_config()
        },
        weak_identity,
    )
    .await;
    let b = TestNode::start(test_config()).await;

    a.adapter
        .add_remote_id(b.node.public_key(), &b.peer_id().address)
        .await;

    let result = a
        .node
        .send(
            &b.node.public_key(),
            MessageBody::new(ECHO_SERVICE_ID, b"let me in".to_vec()),
        )
        .await;
    assert!(matches!(result, Err(NodeError::KxFailed)));

    // B neither established a session nor learned A's address.
    assert_eq!(b.node.peer_count(), 0);
    assert!(b
        .adapter
        .routes()
        .get_peer_by_public_key(&a.node.public_key())
        .is_none());
}

#[tokio::test]
async fn broadcast_reaches_all_known_peers() {
    let a = TestNode::start(test_config()).await;
    let b = TestNode::start(test_config()).await;
    let c = TestNode::start(test_config()).await;

    let mut b_seen = EchoService::register(&b.node, false);
    let mut c_seen = EchoService::register(&c.node, false);

    a.adapter
        .add_remote_id(b.node.public_key(), &b.peer_id().address)
        .await;
    a.adapter
        .add_remote_id(c.node.public_key(), &c.peer_id().address)
        .await;

    a.node
        .broadcast(MessageBody::new(ECHO_SERVICE_ID, b"fanout".to_vec()))
        .await
        .expect("broadcast failed");

    let b_payload = timeout(TEST_TIMEOUT, b_seen.recv())
        .await
        .expect("b timed out")
        .expect("b channel closed");
    let c_payload = timeout(TEST_TIMEOUT, c_seen.recv())
        .await
        .expect("c timed out")
        .expect("c channel closed");
    assert_eq!(b_payload, b"fanout");
    assert_eq!(c_payload, b"fanout");
}

#[tokio::test]
async fn broadcast_randomly_respects_limit() {
    let a = TestNode::start(test_config()).await;
    let b = TestNode::start(test_config()).await;
    let c = TestNode::start(test_config()).await;

    let mut b_seen = EchoService::register(&b.node, false);
    let mut c_seen = EchoService::register(&c.node, false);

    // Establish sessions to both first (broadcast_randomly samples the
    // registry, not the routing table).
    for peer in [&b, &c] {
        a.adapter
            .add_remote_id(peer.node.public_key(), &peer.peer_id().address)
            .await;
        a.node
            .send(
                &peer.node.public_key(),
                MessageBody::new(ECHO_SERVICE_ID, b"warmup".to_vec()),
            )
            .await
            .expect("warmup send failed");
    }
    let _ = timeout(TEST_TIMEOUT, b_seen.recv()).await;
    let _ = timeout(TEST_TIMEOUT, c_seen.recv()).await;

    a.node
        .broadcast_randomly(MessageBody::new(ECHO_SERVICE_ID, b"sampled".to_vec()), 1)
        .await
        .expect("broadcast_randomly failed");

    // Exactly one of the two peers sees the sampled payload.
    let mut hits = 0;
    if let Ok(Some(payload)) = timeout(Duration::from_secs(1), b_seen.recv()).await {
        assert_eq!(payload, b"sampled");
        hits += 1;
    }
    if let Ok(Some(payload)) = timeout(Duration::from_secs(1), c_seen.recv()).await {
        assert_eq!(payload, b"sampled");
        hits += 1;
    }
    assert_eq!(hits, 1, "exactly one peer must receive the sample");
}

#[tokio::test]
async fn remove_peer_fires_disconnect_once() {
    struct DisconnectCounter {
        count: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl Service for DisconnectCounter {
        async fn receive(&self, _message: &ServiceMessage) -> anyhow::Result<Option<MessageBody>> {
            Ok(None)
        }
        async fn peer_disconnect(&self, _remote: &lattica::PublicKey) {
            self.count
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    let a = TestNode::start(test_config()).await;
    let b = TestNode::start(test_config()).await;
    let _b_seen = EchoService::register(&b.node, false);

    let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    a.node.add_service(Arc::new(DisconnectCounter {
        count: count.clone(),
    }));

    a.adapter
        .add_remote_id(b.node.public_key(), &b.peer_id().address)
        .await;
    a.node
        .send(
            &b.node.public_key(),
            MessageBody::new(ECHO_SERVICE_ID, b"hello".to_vec()),
        )
        .await
        .expect("send failed");
    assert_eq!(a.node.peer_count(), 1);

    a.node.remove_peer(&b.node.public_key()).await;
    a.node.remove_peer(&b.node.public_key()).await;

    assert_eq!(a.node.peer_count(), 0);
    assert_eq!(
        count.load(std::sync::atomic::Ordering::SeqCst),
        1,
        "peer_disconnect must fire exactly once"
    );
}

#[tokio::test]
async fn stop_tears_down_all_sessions() {
    let a = TestNode::start(test_config()).await;
    let b = TestNode::start(test_config()).await;
    let c = TestNode::start(test_config()).await;
    let _b_seen = EchoService::register(&b.node, false);
    let _c_seen = EchoService::register(&c.node, false);

    for peer in [&b, &c] {
        a.adapter
            .add_remote_id(peer.node.public_key(), &peer.peer_id().address)
            .await;
        a.node
            .send(
                &peer.node.public_key(),
                MessageBody::new(ECHO_SERVICE_ID, b"up".to_vec()),
            )
            .await
            .expect("send failed");
    }
    assert_eq!(a.node.peer_count(), 2);

    a.node.stop().await;
    assert_eq!(a.node.peer_count(), 0);

    // A fresh send re-establishes from scratch.
    send_with_retry(
        &a.node,
        &b.node.public_key(),
        MessageBody::new(ECHO_SERVICE_ID, b"again".to_vec()),
    )
    .await;
}
