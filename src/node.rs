//! # Node Dispatcher
//!
//! The [`Node`] owns the peer registry and multiplexes services over
//! authenticated sessions. It implements:
//!
//! - `send` / `request` / `broadcast` / `broadcast_randomly` with the
//!   request-nonce correlation that turns one-way message streams into
//!   request/response.
//! - The dial-vs-accept race: a *load-or-store* on the peer registry picks
//!   exactly one dialer per remote; concurrent inbound sessions are
//!   resolved deterministically (the session dialed by the
//!   lexicographically higher public key survives, on both sides).
//! - Inbound dispatch: request-correlated replies are delivered to their
//!   waiters, everything else fans out to registered services in
//!   registration order, with returned bodies sent back as replies.
//!
//! ## Registry
//!
//! `public_key → PeerSlot` where a slot is either `Pending` (carrying a
//! completion signal all racers wait on) or `Established` (the live
//! session). Transitions Pending→Established are one-way; removal is
//! permitted from any state and fires each service's `peer_disconnect`
//! exactly once per peer lifetime.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, RwLock as StdRwLock};
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::connection::ConnectionAdapter;
use crate::identity::{NodeIdentity, PublicKey, DEFAULT_C1, DEFAULT_C2};
use crate::messages::MessageBody;
use crate::protocols::{DynHandshakeProcessor, HandshakeProcessor, Service, ServiceMessage};
use crate::routing::DEFAULT_BUCKET_SIZE;
use crate::session::{PeerSession, SessionOrigin, SkademliaHandshake};
use crate::transport::{MessageAdapter, DEFAULT_MAX_PAYLOAD_LEN};

/// Upper bound on the two-phase session setup (handshake + DH).
pub(crate) const KX_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Configuration
// ============================================================================

/// Tunable parameters, applied node-wide. All knobs the protocol exposes
/// programmatically; the defaults match the reference constants.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Static cryptopuzzle prefix length.
    pub c1: u32,
    /// Dynamic cryptopuzzle prefix length.
    pub c2: u32,
    /// Peers per routing-table bucket (Kademlia `k`).
    pub bucket_size: usize,
    /// Deadline for discovery eviction probes.
    pub ping_timeout: Duration,
    /// Maximum transport frame payload.
    pub max_payload_len: usize,
    /// Bits compared by the anti-flooding gate.
    pub prefix_diff_length: usize,
    /// Minimum differing bits required by the anti-flooding gate.
    pub prefix_diff_min: u32,
    /// Concurrency of iterative lookups.
    pub alpha: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            c1: DEFAULT_C1,
            c2: DEFAULT_C2,
            bucket_size: DEFAULT_BUCKET_SIZE,
            ping_timeout: Duration::from_secs(4),
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            prefix_diff_length: 128,
            prefix_diff_min: 32,
            alpha: 8,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by the dispatcher's public operations.
#[derive(Debug, Clone)]
pub enum NodeError {
    /// The message body carried no payload.
    EmptyBody,
    /// `body.service` was zero (reserved).
    MissingService,
    /// The recipient is the local node.
    SelfAddressed,
    /// An outbound connection could not be set up.
    DialFailed(String),
    /// The key exchange with the remote failed; every waiter on that peer
    /// receives this.
    KxFailed,
    /// The session went away while the operation was in flight.
    SessionClosed,
    /// `request` hit its deadline before a reply arrived.
    Timeout,
    /// The body could not be serialized.
    Serialization,
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeError::EmptyBody => write!(f, "message body was empty"),
            NodeError::MissingService => write!(f, "missing service in message body"),
            NodeError::SelfAddressed => write!(f, "message addressed to the local node"),
            NodeError::DialFailed(reason) => write!(f, "dial failed: {}", reason),
            NodeError::KxFailed => write!(f, "key exchange failed"),
            NodeError::SessionClosed => write!(f, "session closed"),
            NodeError::Timeout => write!(f, "request timed out"),
            NodeError::Serialization => write!(f, "message body serialization failed"),
        }
    }
}

impl std::error::Error for NodeError {}

// ============================================================================
// Peer registry
// ============================================================================

type KxOutcome = Option<Result<(), NodeError>>;

enum PeerSlot {
    /// A dial is in flight; the channel resolves exactly once, on the first
    /// transition out of the key exchange.
    Pending(watch::Receiver<KxOutcome>),
    Established(Arc<PeerSession>),
}

/// Deterministic dial-race tie-break: the surviving session is the one
/// dialed by the lexicographically higher public key. Both sides apply the
/// same rule, so exactly one session survives.
fn inbound_wins(local: &PublicKey, remote: &PublicKey) -> bool {
    remote > local
}

// ============================================================================
// Node
// ============================================================================

pub struct Node {
    identity: Arc<NodeIdentity>,
    config: Config,
    handshake: Arc<dyn DynHandshakeProcessor>,
    connection: OnceLock<Arc<ConnectionAdapter>>,
    services: StdRwLock<Vec<Arc<dyn Service>>>,
    peers: StdMutex<HashMap<PublicKey, PeerSlot>>,
    requests: StdMutex<HashMap<(PublicKey, u64), oneshot::Sender<MessageBody>>>,
    request_nonce: AtomicU64,
}

impl Node {
    /// Create a node using the built-in S/Kademlia handshake.
    pub fn new(identity: Arc<NodeIdentity>, config: Config) -> Arc<Self> {
        let handshake = SkademliaHandshake::new(identity.clone());
        Self::with_handshake(identity, config, handshake)
    }

    /// Create a node with a custom handshake processor.
    pub fn with_handshake(
        identity: Arc<NodeIdentity>,
        config: Config,
        handshake: impl HandshakeProcessor,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            config,
            handshake: Arc::new(handshake),
            connection: OnceLock::new(),
            services: StdRwLock::new(Vec::new()),
            peers: StdMutex::new(HashMap::new()),
            requests: StdMutex::new(HashMap::new()),
            request_nonce: AtomicU64::new(0),
        })
    }

    pub fn identity(&self) -> &Arc<NodeIdentity> {
        &self.identity
    }

    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    pub fn config(&self) -> Config {
        self.config
    }

    /// Register a service. Services receive messages in registration order.
    pub fn add_service(&self, service: Arc<dyn Service>) {
        self.services.write().unwrap().push(service);
    }

    pub(crate) fn set_connection(&self, adapter: Arc<ConnectionAdapter>) -> anyhow::Result<()> {
        self.connection
            .set(adapter)
            .map_err(|_| anyhow::anyhow!("connection adapter already configured"))
    }

    pub fn connection(&self) -> Option<&Arc<ConnectionAdapter>> {
        self.connection.get()
    }

    /// Start listening: runs every service's `startup` hook, then accepts
    /// inbound connections until the process ends.
    pub fn start(self: &Arc<Self>) {
        let node = self.clone();
        tokio::spawn(async move {
            let services = node.services_snapshot();
            for service in services {
                service.startup(node.clone()).await;
            }
            match node.connection.get().cloned() {
                Some(connection) => connection.accept_loop(node.clone()).await,
                None => warn!("node started without a connection adapter"),
            }
        });
    }

    /// Tear down every session, firing `peer_disconnect` for each peer.
    pub async fn stop(self: &Arc<Self>) {
        let remotes: Vec<PublicKey> = self.peers.lock().unwrap().keys().copied().collect();
        for remote in remotes {
            self.remove_peer(&remote).await;
        }
    }

    fn services_snapshot(&self) -> Vec<Arc<dyn Service>> {
        self.services.read().unwrap().clone()
    }

    /// Number of registry slots (pending or established). Test hook.
    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// Public keys of currently established sessions.
    pub fn established_peers(&self) -> Vec<PublicKey> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, slot)| matches!(slot, PeerSlot::Established(_)))
            .map(|(pk, _)| *pk)
            .collect()
    }

    /// Number of in-flight request states. Test hook.
    pub fn pending_requests(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    // ------------------------------------------------------------------
    // Send / request / broadcast
    // ------------------------------------------------------------------

    fn validate_body(&self, recipient: &PublicKey, body: &MessageBody) -> Result<(), NodeError> {
        if body.payload.is_empty() {
            return Err(NodeError::EmptyBody);
        }
        if body.service == 0 {
            return Err(NodeError::MissingService);
        }
        if *recipient == self.public_key() {
            return Err(NodeError::SelfAddressed);
        }
        Ok(())
    }

    /// Deliver one message to `recipient`, establishing a session first if
    /// none exists.
    pub async fn send(
        self: &Arc<Self>,
        recipient: &PublicKey,
        body: MessageBody,
    ) -> Result<(), NodeError> {
        self.validate_body(recipient, &body)?;

        let session = self.ensure_session(*recipient).await?;
        let bytes = body.encode().map_err(|_| NodeError::Serialization)?;

        if let Err(e) = session.send_message(&bytes).await {
            debug!(
                peer = %hex::encode(&recipient.as_bytes()[..8]),
                error = %e,
                "send failed, removing peer"
            );
            self.remove_peer(recipient).await;
            return Err(NodeError::SessionClosed);
        }
        Ok(())
    }

    /// Send a request and await its correlated reply, up to `deadline`.
    ///
    /// The request state is removed on every exit path: reply, timeout,
    /// send failure, session loss, or caller cancellation.
    pub async fn request(
        self: &Arc<Self>,
        recipient: &PublicKey,
        mut body: MessageBody,
        deadline: Duration,
    ) -> Result<MessageBody, NodeError> {
        self.validate_body(recipient, &body)?;

        let nonce = self.request_nonce.fetch_add(1, Ordering::SeqCst) + 1;
        body.request_nonce = nonce;

        let (tx, rx) = oneshot::channel();
        let key = (*recipient, nonce);
        self.requests.lock().unwrap().insert(key, tx);
        let _guard = RequestGuard { node: self, key };

        // The deadline spans the whole operation, including any dial and
        // key exchange the send needs.
        let exchange = async {
            self.send(recipient, body).await?;
            match rx.await {
                Ok(reply) => Ok(reply),
                Err(_) => Err(NodeError::SessionClosed),
            }
        };
        match timeout(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => Err(NodeError::Timeout),
        }
    }

    /// Best-effort delivery to every reachable remote; per-peer failures
    /// are logged and swallowed.
    pub async fn broadcast(self: &Arc<Self>, body: MessageBody) -> Result<(), NodeError> {
        let Some(connection) = self.connection.get() else {
            return Ok(());
        };
        for remote in connection.get_remote_ids() {
            if remote == self.public_key() {
                continue;
            }
            if let Err(e) = self.send(&remote, body.clone()).await {
                warn!(
                    peer = %hex::encode(&remote.as_bytes()[..8]),
                    error = %e,
                    "unable to broadcast"
                );
            }
        }
        Ok(())
    }

    /// Deliver to up to `max_peers` random established peers. Samples up to
    /// `3 * max_peers` candidates, shuffles, and stops on the first
    /// per-peer failure.
    pub async fn broadcast_randomly(
        self: &Arc<Self>,
        body: MessageBody,
        max_peers: usize,
    ) -> Result<(), NodeError> {
        let mut candidates: Vec<PublicKey> = {
            let peers = self.peers.lock().unwrap();
            peers
                .iter()
                .filter(|(_, slot)| matches!(slot, PeerSlot::Established(_)))
                .map(|(pk, _)| *pk)
                .take(max_peers.saturating_mul(3))
                .collect()
        };

        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(max_peers);

        for remote in &candidates {
            self.send(remote, body.clone()).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Peer registry
    // ------------------------------------------------------------------

    /// Resolve the session for `remote`, dialing if necessary.
    ///
    /// The registry insert is the serialization point: exactly one caller
    /// becomes the dialer, everyone else waits on the pending slot's
    /// completion signal.
    async fn ensure_session(
        self: &Arc<Self>,
        remote: PublicKey,
    ) -> Result<Arc<PeerSession>, NodeError> {
        let mut wait_rx = {
            let mut peers = self.peers.lock().unwrap();
            match peers.entry(remote) {
                Entry::Occupied(entry) => match entry.get() {
                    PeerSlot::Established(session) => return Ok(session.clone()),
                    PeerSlot::Pending(rx) => rx.clone(),
                },
                Entry::Vacant(entry) => {
                    let (tx, rx) = watch::channel::<KxOutcome>(None);
                    entry.insert(PeerSlot::Pending(rx.clone()));
                    let node = self.clone();
                    tokio::spawn(async move {
                        node.dial_task(remote, tx).await;
                    });
                    rx
                }
            }
        };

        let outcome = match wait_rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(value) => value.clone().expect("checked by wait_for"),
            Err(_) => return Err(NodeError::KxFailed),
        };
        outcome?;

        let peers = self.peers.lock().unwrap();
        match peers.get(&remote) {
            Some(PeerSlot::Established(session)) => Ok(session.clone()),
            _ => Err(NodeError::KxFailed),
        }
    }

    /// Winner path of the dial race. Runs detached so caller cancellation
    /// can never leave a pending slot unresolved.
    async fn dial_task(self: Arc<Self>, remote: PublicKey, tx: watch::Sender<KxOutcome>) {
        let outcome = match self.dial_and_establish(remote).await {
            Ok((session, frames)) => {
                let installed = {
                    let mut peers = self.peers.lock().unwrap();
                    // An inbound session may have beaten us; keep it then.
                    let inbound_won =
                        matches!(peers.get(&remote), Some(PeerSlot::Established(_)));
                    if !inbound_won {
                        peers.insert(remote, PeerSlot::Established(session.clone()));
                    }
                    !inbound_won
                };
                if installed {
                    tokio::spawn(self.clone().run_session(session, frames));
                } else {
                    debug!(
                        peer = %hex::encode(&remote.as_bytes()[..8]),
                        "inbound session won the dial race"
                    );
                    session.close().await;
                }
                Ok(())
            }
            Err(e) => {
                debug!(
                    peer = %hex::encode(&remote.as_bytes()[..8]),
                    error = %e,
                    "unable to establish connection actively"
                );
                let mut peers = self.peers.lock().unwrap();
                if matches!(peers.get(&remote), Some(PeerSlot::Pending(_))) {
                    peers.remove(&remote);
                }
                Err(e)
            }
        };
        let _ = tx.send(Some(outcome));
    }

    async fn dial_and_establish(
        &self,
        remote: PublicKey,
    ) -> Result<(Arc<PeerSession>, mpsc::Receiver<Vec<u8>>), NodeError> {
        let connection = self
            .connection
            .get()
            .ok_or_else(|| NodeError::DialFailed("connection adapter not set up".into()))?;

        let (adapter, mut frames) = connection.dial(&remote).await?;

        let establish = PeerSession::establish(
            adapter.clone(),
            &mut frames,
            self.handshake.as_ref(),
            SessionOrigin::Dialer,
        );
        match timeout(KX_TIMEOUT, establish).await {
            Ok(Ok(session)) => Ok((Arc::new(session), frames)),
            Ok(Err(e)) => {
                debug!(error = %e, "key exchange failed");
                Err(NodeError::KxFailed)
            }
            Err(_) => {
                adapter.close().await;
                Err(NodeError::KxFailed)
            }
        }
    }

    /// Install an inbound, already-established session, applying the dial
    /// race tie-break. Called from the connection adapter's accept path.
    pub(crate) async fn handle_inbound(
        self: &Arc<Self>,
        adapter: Arc<MessageAdapter>,
        mut frames: mpsc::Receiver<Vec<u8>>,
    ) {
        let remote = adapter.remote_public_key();
        if remote == self.public_key() {
            adapter.close().await;
            return;
        }

        let establish = PeerSession::establish(
            adapter.clone(),
            &mut frames,
            self.handshake.as_ref(),
            SessionOrigin::Listener,
        );
        let session = match timeout(KX_TIMEOUT, establish).await {
            Ok(Ok(session)) => Arc::new(session),
            Ok(Err(e)) => {
                warn!(
                    peer = %hex::encode(&remote.as_bytes()[..8]),
                    error = %e,
                    "cannot establish inbound peer"
                );
                return;
            }
            Err(_) => {
                warn!(
                    peer = %hex::encode(&remote.as_bytes()[..8]),
                    "inbound key exchange timed out"
                );
                adapter.close().await;
                return;
            }
        };

        let (installed, displaced) = {
            let mut peers = self.peers.lock().unwrap();
            let install = match peers.get(&remote) {
                None => true,
                // A dead session not yet reaped never blocks a live one.
                Some(PeerSlot::Established(existing)) => {
                    !existing.is_established() || inbound_wins(&self.public_key(), &remote)
                }
                Some(PeerSlot::Pending(_)) => inbound_wins(&self.public_key(), &remote),
            };
            if install {
                let old = peers.insert(remote, PeerSlot::Established(session.clone()));
                (true, old)
            } else {
                (false, None)
            }
        };

        if !installed {
            debug!(
                peer = %hex::encode(&remote.as_bytes()[..8]),
                "rejecting inbound session, local dial wins the race"
            );
            session.close().await;
            return;
        }

        if let Some(PeerSlot::Established(old)) = displaced {
            old.close().await;
        }

        tokio::spawn(self.clone().run_session(session, frames));

        for service in self.services_snapshot() {
            service.peer_connect(&remote).await;
        }
    }

    /// Per-session receive task: decrypt frames in order, dispatch each
    /// message, and reap the peer when the stream ends.
    async fn run_session(
        self: Arc<Self>,
        session: Arc<PeerSession>,
        mut frames: mpsc::Receiver<Vec<u8>>,
    ) {
        let remote = session.remote_public_key();
        let remote_addr = session.remote_addr().to_string();

        while let Some(frame) = frames.recv().await {
            let plaintext = match session.open_message(&frame) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    warn!(
                        peer = %hex::encode(&remote.as_bytes()[..8]),
                        error = %e,
                        "cannot unwrap message, dropping session"
                    );
                    break;
                }
            };

            let body = match MessageBody::decode(&plaintext) {
                Ok(body) => body,
                Err(e) => {
                    warn!(
                        peer = %hex::encode(&remote.as_bytes()[..8]),
                        error = %e,
                        "cannot deserialize message body"
                    );
                    continue;
                }
            };

            self.dispatch_incoming(remote, remote_addr.clone(), body);
        }

        self.remove_peer_session(&remote, &session).await;
    }

    /// Route one decoded message: correlated replies go to their request
    /// slot, everything else to the services. Service dispatch runs in its
    /// own task so messages from different sessions proceed concurrently.
    fn dispatch_incoming(self: &Arc<Self>, sender: PublicKey, sender_addr: String, body: MessageBody) {
        if body.request_nonce != 0 {
            let waiter = self
                .requests
                .lock()
                .unwrap()
                .remove(&(sender, body.request_nonce));
            if let Some(tx) = waiter {
                let _ = tx.send(body);
                return;
            }
        }

        let node = self.clone();
        tokio::spawn(async move {
            let message = ServiceMessage {
                sender,
                recipient: node.public_key(),
                sender_addr,
                body,
            };
            for service in node.services_snapshot() {
                match service.receive(&message).await {
                    Ok(Some(mut reply)) => {
                        reply.request_nonce = message.body.request_nonce;
                        if let Err(e) = node.send(&sender, reply).await {
                            warn!(
                                service = message.body.service,
                                error = %e,
                                "error replying to request"
                            );
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            service = message.body.service,
                            error = %e,
                            "error processing request"
                        );
                    }
                }
            }
        });
    }

    /// Disconnect `remote`: close its session, evict the registry slot, and
    /// fire `peer_disconnect` on every service. Idempotent.
    pub async fn remove_peer(self: &Arc<Self>, remote: &PublicKey) {
        let slot = self.peers.lock().unwrap().remove(remote);
        let Some(slot) = slot else {
            return;
        };
        self.teardown_slot(remote, slot).await;
    }

    /// Remove `remote` only if the registry still holds this exact session;
    /// a replacement session installed by the dial race is left untouched.
    async fn remove_peer_session(self: &Arc<Self>, remote: &PublicKey, session: &Arc<PeerSession>) {
        let slot = {
            let mut peers = self.peers.lock().unwrap();
            let is_current = matches!(
                peers.get(remote),
                Some(PeerSlot::Established(current)) if Arc::ptr_eq(current, session)
            );
            if is_current {
                peers.remove(remote)
            } else {
                None
            }
        };
        match slot {
            Some(slot) => self.teardown_slot(remote, slot).await,
            None => session.close().await,
        }
    }

    async fn teardown_slot(self: &Arc<Self>, remote: &PublicKey, slot: PeerSlot) {
        if let PeerSlot::Established(session) = slot {
            session.close().await;
        }

        // Wake request waiters with a session loss.
        self.requests
            .lock()
            .unwrap()
            .retain(|(peer, _), _| peer != remote);

        for service in self.services_snapshot() {
            service.peer_disconnect(remote).await;
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("public_key", &self.public_key())
            .field("peers", &self.peer_count())
            .finish()
    }
}

/// Removes the request state when the `request` future exits by any path,
/// including cancellation.
struct RequestGuard<'a> {
    node: &'a Node,
    key: (PublicKey, u64),
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.node.requests.lock().unwrap().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn config_defaults_match_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.bucket_size, 16);
        assert_eq!(config.ping_timeout, Duration::from_secs(4));
        assert_eq!(config.prefix_diff_length, 128);
        assert_eq!(config.prefix_diff_min, 32);
        assert_eq!(config.alpha, 8);
    }

    #[test]
    fn dial_race_tie_break_is_antisymmetric() {
        let a = Keypair::generate().public_key();
        let b = Keypair::generate().public_key();

        // Exactly one side lets the inbound session win.
        assert_ne!(inbound_wins(&a, &b), inbound_wins(&b, &a));
    }

    #[test]
    fn validate_body_rejects_bad_arguments() {
        let identity = Arc::new(crate::identity::NodeIdentity::generate(0, 0));
        let node = Node::new(identity.clone(), Config::default());

        let other = Keypair::generate().public_key();

        assert!(matches!(
            node.validate_body(&other, &MessageBody::new(1, Vec::new())),
            Err(NodeError::EmptyBody)
        ));
        assert!(matches!(
            node.validate_body(&other, &MessageBody::new(0, b"x".to_vec())),
            Err(NodeError::MissingService)
        ));
        assert!(matches!(
            node.validate_body(&identity.public_key(), &MessageBody::new(1, b"x".to_vec())),
            Err(NodeError::SelfAddressed)
        ));
        assert!(node
            .validate_body(&other, &MessageBody::new(1, b"x".to_vec()))
            .is_ok());
    }
}
