//! # Lattica - Peer-to-Peer Overlay Networking Library
//!
//! Lattica lets autonomous nodes identified by long-lived public keys
//! locate one another on a structured overlay, establish authenticated
//! encrypted sessions over plain TCP, and exchange service-multiplexed
//! messages with request/response semantics and best-effort broadcast.
//!
//! - **Identity**: Ed25519 keypairs bound to S/Kademlia cryptopuzzles
//!   (Sybil-resistant node ids, O(1) verification)
//! - **Routing**: XOR-metric prefix buckets with per-bucket LRU and
//!   liveness-probe eviction
//! - **Sessions**: pluggable authenticated handshake + ephemeral X25519,
//!   ChaCha20-Poly1305 framing afterwards
//! - **Dispatch**: per-peer sessions multiplexing any number of services,
//!   with correlated request/response over one-way streams
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `identity` | Keypairs, cryptopuzzle identities, `PeerId`, XOR metric |
//! | `routing` | Prefix-bucketed routing table |
//! | `messages` | Wire types and the bounded codec |
//! | `transport` | Message adapter: setup handshake + varuint framing |
//! | `session` | Peer session state machine, S/Kademlia handshake |
//! | `protocols` | `Service`, `HandshakeProcessor`, `Dialer` seams |
//! | `node` | Dispatcher: registry, send/request/broadcast |
//! | `discovery` | Ping/pong/lookup, iterative FIND_NODE, eviction |
//! | `connection` | Listener + dialer glue, bootstrap |
//!
//! ## Quick Start
//!
//! ```ignore
//! let identity = Arc::new(NodeIdentity::generate(16, 16));
//! let node = Node::new(identity, Config::default());
//!
//! let listener = TcpListener::bind("0.0.0.0:0").await?;
//! let adapter = ConnectionAdapter::new(listener, Arc::new(TcpDialer::default()), &node)?;
//! node.start();
//!
//! adapter.bootstrap(&node, &seeds).await?;
//! node.send(&peer_key, MessageBody::new(MY_SERVICE, payload)).await?;
//! ```

mod connection;
mod discovery;
mod identity;
mod messages;
mod node;
mod protocols;
mod routing;
mod session;
mod transport;

pub use connection::ConnectionAdapter;
pub use discovery::{DiscoveryService, DISCOVERY_SERVICE_ID};
pub use identity::{
    distance_cmp, prefix_diff, prefix_len, sign_with_domain, verify_puzzle, verify_with_domain,
    Keypair, NodeId, NodeIdentity, PeerId, PublicKey, PuzzleError, SignatureError, DEFAULT_C1,
    DEFAULT_C2, ID_BITS, ID_LEN,
};
pub use messages::{
    deserialize_bounded, parse_message_body, to_message_body, DiscoveryEnvelope, LookupRequest,
    LookupResponse, MessageBody, Ping, Pong, OPCODE_LOOKUP_REQUEST, OPCODE_LOOKUP_RESPONSE,
    OPCODE_PING, OPCODE_PONG,
};
pub use node::{Config, Node, NodeError};
pub use protocols::{
    Dialer, HandshakeAction, HandshakeExchange, HandshakeProcessor, Service, ServiceMessage,
    TcpDialer,
};
pub use routing::{BucketFull, RoutingTable, DEFAULT_BUCKET_SIZE};
pub use session::{PeerSession, SessionError, SessionOrigin, SessionState, SkademliaHandshake};
pub use transport::{MessageAdapter, ProtocolError, DEFAULT_MAX_PAYLOAD_LEN};
