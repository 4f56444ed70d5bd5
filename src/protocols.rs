//! Trait definitions for Lattica's networking seams.
//!
//! | Seam | Trait | Purpose |
//! |------|-------|---------|
//! | Services | [`Service`] | receive multiplexed messages, lifecycle hooks |
//! | Handshake | [`HandshakeProcessor`] | pluggable authenticated handshake |
//! | Transport | [`Dialer`] | open outbound TCP streams |
//!
//! Traits live here, away from their implementations, so services can
//! depend on the dispatcher seam without pulling in the discovery layer and
//! vice versa.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::identity::PublicKey;
use crate::messages::MessageBody;
use crate::node::Node;

// ============================================================================
// Services
// ============================================================================

/// A message delivered to services: the decrypted body plus authenticated
/// sender context.
#[derive(Clone, Debug)]
pub struct ServiceMessage {
    /// Public key of the authenticated sender.
    pub sender: PublicKey,
    /// Public key of the local node.
    pub recipient: PublicKey,
    /// Transport address the sender announced for itself.
    pub sender_addr: String,
    pub body: MessageBody,
}

/// A service registered on a [`Node`].
///
/// `receive` is invoked for every inbound message that is not claimed by
/// request/response correlation, in service registration order. Returning a
/// body sends it back to the sender with the incoming request nonce copied
/// over. Errors are logged by the dispatcher and never close the session.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Called once when the node starts, with a handle for sending.
    async fn startup(&self, _node: Arc<Node>) {}

    async fn receive(&self, message: &ServiceMessage) -> anyhow::Result<Option<MessageBody>>;

    /// A new inbound session with `_remote` was established.
    async fn peer_connect(&self, _remote: &PublicKey) {}

    /// The session with `_remote` was torn down. Invoked exactly once per
    /// peer lifetime.
    async fn peer_disconnect(&self, _remote: &PublicKey) {}
}

// ============================================================================
// Handshake
// ============================================================================

/// Outcome of processing one inbound handshake frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeAction {
    /// Transmit these bytes. The active side then awaits the next frame;
    /// the passive side's handshake is complete after sending.
    SendMessage(Vec<u8>),
    /// The handshake completed without producing a final reply.
    DoNothing,
    /// The peer failed authentication; the session must fail.
    Invalid,
}

/// One in-flight handshake. Implementations own whatever state the exchange
/// needs; the session layer only feeds frames through [`process`].
///
/// [`process`]: HandshakeExchange::process
pub trait HandshakeExchange: Send {
    fn process(&mut self, incoming: &[u8]) -> HandshakeAction;
}

/// Factory for per-session handshake exchanges.
///
/// The session layer drives the exchange turn-by-turn over the wire:
/// the active side transmits the `actively_init` bytes first, then both
/// sides feed inbound frames to the exchange until it reports completion
/// ([`HandshakeAction::DoNothing`], or the passive side's final
/// [`HandshakeAction::SendMessage`]) or failure.
///
/// `remote` is the public key the transport setup exchanged for the peer;
/// processors authenticating identities must verify the handshake binds to
/// exactly this key.
pub trait HandshakeProcessor: Send + Sync + 'static {
    /// Per-session exchange state, private to the implementation.
    type Exchange: HandshakeExchange + 'static;

    /// Begin as the active (dialing) side: the first outgoing frame plus
    /// the exchange state.
    fn actively_init(&self, remote: &PublicKey) -> (Vec<u8>, Self::Exchange);

    /// Begin as the passive (accepting) side.
    fn passively_init(&self, remote: &PublicKey) -> Self::Exchange;
}

/// Object-safe view of a [`HandshakeProcessor`], used by the dispatcher so
/// nodes are not generic over the handshake type.
pub(crate) trait DynHandshakeProcessor: Send + Sync {
    fn actively_init_dyn(&self, remote: &PublicKey) -> (Vec<u8>, Box<dyn HandshakeExchange>);
    fn passively_init_dyn(&self, remote: &PublicKey) -> Box<dyn HandshakeExchange>;
}

impl<P: HandshakeProcessor> DynHandshakeProcessor for P {
    fn actively_init_dyn(&self, remote: &PublicKey) -> (Vec<u8>, Box<dyn HandshakeExchange>) {
        let (first, exchange) = self.actively_init(remote);
        (first, Box::new(exchange))
    }

    fn passively_init_dyn(&self, remote: &PublicKey) -> Box<dyn HandshakeExchange> {
        Box::new(self.passively_init(remote))
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Opens outbound streams for the connection adapter.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, address: &str) -> std::io::Result<TcpStream>;
}

/// Plain TCP dialer with a connect timeout.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    pub connect_timeout: Duration,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, address: &str) -> std::io::Result<TcpStream> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            )),
        }
    }
}
