//! Integration tests for the discovery layer: bootstrap, iterative
//! lookups, and the bucket-full eviction probes, all over real loopback
//! sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use lattica::{
    Config, ConnectionAdapter, Keypair, Node, NodeIdentity, PeerId, RoutingTable, TcpDialer,
};

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

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Mine a keypair whose node id lands in the given bucket of `routes`.
fn same_bucket_peer(routes: &RoutingTable, bucket: usize, addr: &str) -> PeerId {
    loop {
        let peer = PeerId::new(addr, Keypair::generate().public_key());
        if routes.bucket_index(&peer.node_id) == bucket {
            return peer;
        }
    }
}

#[tokio::test]
async fn bootstrap_populates_both_tables() {
    let a = TestNode::start(test_config()).await;
    let b = TestNode::start(test_config()).await;

    a.adapter
        .bootstrap(&a.node, &[b.peer_id()])
        .await
        .expect("bootstrap failed");

    let a_routes = a.adapter.routes();
    let b_routes = b.adapter.routes();
    let (a_key, b_key) = (a.node.public_key(), b.node.public_key());

    eventually("both tables to contain the other node", move || {
        a_routes.get_peer_by_public_key(&b_key).is_some()
            && b_routes.get_peer_by_public_key(&a_key).is_some()
    })
    .await;
}

#[tokio::test]
async fn bootstrap_with_no_seeds_is_a_no_op() {
    let a = TestNode::start(test_config()).await;
    a.adapter
        .bootstrap(&a.node, &[])
        .await
        .expect("empty bootstrap failed");
    assert_eq!(a.adapter.routes().len(), 0);
}

#[tokio::test]
async fn lookup_discovers_peers_transitively() {
    let a = TestNode::start(test_config()).await;
    let b = TestNode::start(test_config()).await;
    let c = TestNode::start(test_config()).await;

    // A joins via B, then C joins via B. C must learn about A through the
    // PONG-triggered FIND_NODE, and A about C through C's lookup queries.
    a.adapter
        .bootstrap(&a.node, &[b.peer_id()])
        .await
        .expect("a bootstrap failed");

    {
        let b_routes = b.adapter.routes();
        let a_key = a.node.public_key();
        eventually("b to learn a", move || {
            b_routes.get_peer_by_public_key(&a_key).is_some()
        })
        .await;
    }

    c.adapter
        .bootstrap(&c.node, &[b.peer_id()])
        .await
        .expect("c bootstrap failed");

    let c_routes = c.adapter.routes();
    let (a_key, b_key) = (a.node.public_key(), b.node.public_key());
    eventually("c to learn both a and b", move || {
        c_routes.get_peer_by_public_key(&a_key).is_some()
            && c_routes.get_peer_by_public_key(&b_key).is_some()
    })
    .await;

    let a_routes = a.adapter.routes();
    let c_key = c.node.public_key();
    eventually("a to learn c", move || {
        a_routes.get_peer_by_public_key(&c_key).is_some()
    })
    .await;
}

#[tokio::test]
async fn full_bucket_with_live_lru_keeps_old_peer() {
    // Two-entry buckets make the full-bucket path reachable with a handful
    // of mined keys.
    let a = TestNode::start(Config {
        bucket_size: 2,
        ..test_config()
    })
    .await;
    let live = TestNode::start(test_config()).await;

    let routes = a.adapter.routes();
    let live_peer = live.peer_id();
    let bucket = routes.bucket_index(&live_peer.node_id);

    let p2 = same_bucket_peer(&routes, bucket, "127.0.0.1:9902");
    let p3 = same_bucket_peer(&routes, bucket, "127.0.0.1:9903");

    // Oldest first: the live node becomes the LRU entry.
    a.adapter
        .add_remote_id(live_peer.public_key, &live_peer.address)
        .await;
    a.adapter.add_remote_id(p2.public_key, &p2.address).await;
    assert_eq!(routes.len(), 2);

    // Bucket full; the probe reaches the live LRU, which answers PONG.
    a.adapter.add_remote_id(p3.public_key, &p3.address).await;

    assert_eq!(routes.len(), 2, "table size must not change");
    assert!(routes.get_peer(&live_peer.node_id).is_some());
    assert!(routes.get_peer(&p2.node_id).is_some());
    assert!(
        routes.get_peer(&p3.node_id).is_none(),
        "newcomer must be discarded when the LRU answers"
    );

    // The confirmed LRU moved to the front; p2 is now least recent.
    assert_eq!(routes.least_recent(&p3.node_id), Some(p2));
}

#[tokio::test]
async fn full_bucket_with_dead_lru_evicts_and_inserts() {
    let a = TestNode::start(Config {
        bucket_size: 2,
        ..test_config()
    })
    .await;

    let routes = a.adapter.routes();

    // Nothing listens on port 1: the probe dial fails immediately.
    let dead = same_bucket_peer(&routes, 0, "127.0.0.1:1");
    let p2 = same_bucket_peer(&routes, 0, "127.0.0.1:9902");
    let p3 = same_bucket_peer(&routes, 0, "127.0.0.1:9903");

    a.adapter
        .add_remote_id(dead.public_key, &dead.address)
        .await;
    a.adapter.add_remote_id(p2.public_key, &p2.address).await;
    a.adapter.add_remote_id(p3.public_key, &p3.address).await;

    assert!(
        routes.get_peer(&dead.node_id).is_none(),
        "unresponsive LRU must be evicted"
    );
    assert!(routes.get_peer(&p2.node_id).is_some());
    assert!(
        routes.get_peer(&p3.node_id).is_some(),
        "newcomer must take the evicted slot"
    );
    assert_eq!(routes.len(), 2);

    // The newcomer entered at the front; p2 remains least recent.
    assert_eq!(routes.least_recent(&p3.node_id), Some(p2));
}

#[tokio::test]
async fn disconnect_removes_peer_from_table() {
    let a = TestNode::start(test_config()).await;
    let b = TestNode::start(test_config()).await;

    a.adapter
        .bootstrap(&a.node, &[b.peer_id()])
        .await
        .expect("bootstrap failed");

    {
        let a_routes = a.adapter.routes();
        let b_key = b.node.public_key();
        eventually("a to learn b", move || {
            a_routes.get_peer_by_public_key(&b_key).is_some()
        })
        .await;
    }

    a.node.remove_peer(&b.node.public_key()).await;

    assert!(
        a.adapter
            .routes()
            .get_peer_by_public_key(&b.node.public_key())
            .is_none(),
        "discovery must drop disconnected peers from the table"
    );
}

#[tokio::test]
async fn observed_address_is_recorded_on_self() {
    let a = TestNode::start(test_config()).await;
    let b = TestNode::start(test_config()).await;

    let b_before = b.adapter.routes().self_peer();
    assert_eq!(b_before.address, b.adapter.local_addr());

    a.adapter
        .bootstrap(&a.node, &[b.peer_id()])
        .await
        .expect("bootstrap failed");

    let b_routes = b.adapter.routes();
    let b_id = b_before.node_id;
    eventually("b to record the dialer-announced address", move || {
        // The dialer announced the address it used to reach B, which is
        // exactly the listener address here; the node id never changes.
        let self_peer = b_routes.self_peer();
        self_peer.node_id == b_id && !self_peer.address.is_empty()
    })
    .await;
}
