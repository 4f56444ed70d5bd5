//! # Peer Session
//!
//! Turns a raw [`MessageAdapter`] plus the local identity into an
//! authenticated, encrypted channel (or a failure).
//!
//! ## Two-phase setup
//!
//! **Phase A, authenticated handshake (pluggable).** The session drives a
//! [`HandshakeProcessor`] turn-by-turn over the wire. The built-in
//! [`SkademliaHandshake`] exchanges each side's `(public_key, node_id,
//! nonce)` triple together with a transcript-binding Ed25519 signature,
//! verifies the S/Kademlia cryptopuzzles on the received triple, and checks
//! that the declared key matches the one the transport setup exchanged.
//!
//! **Phase B, ephemeral Diffie-Hellman.** Both sides generate ephemeral
//! X25519 keypairs and exchange the public values as single frames. The
//! shared secret is hashed under a domain-separated context into the
//! session key; subsequent frames are ChaCha20-Poly1305 sealed with a
//! monotonically increasing per-direction nonce. A decryption failure after
//! establishment is fatal to the session.
//!
//! ## States
//!
//! `Pending → KeyExchangeInProgress → Established` on success, `→ Failed`
//! on any I/O, verification, puzzle, or decryption error, and
//! `Established → Closed` on explicit close or unrecoverable I/O. The
//! dispatcher's pending-slot completion signal fires exactly once, on the
//! first transition out of `KeyExchangeInProgress`.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{trace, warn};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};

use crate::identity::{
    sign_with_domain, verify_puzzle, verify_with_domain, NodeId, NodeIdentity, PublicKey,
};
use crate::messages::deserialize_bounded;
use crate::protocols::{
    DynHandshakeProcessor, HandshakeAction, HandshakeExchange, HandshakeProcessor,
};
use crate::transport::{MessageAdapter, ProtocolError};

/// Domain prefix for handshake challenge signatures.
const HANDSHAKE_SIGNATURE_DOMAIN: &[u8] = b"lattica-handshake-v1:";

/// Context string for deriving the session key from the X25519 shared
/// secret.
const SESSION_KEY_CONTEXT: &str = "lattica 2025-04 session key";

/// Which side of the connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOrigin {
    /// We dialed the remote (active side).
    Dialer,
    /// The remote dialed us (passive side).
    Listener,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    KeyExchangeInProgress,
    Established,
    Failed,
    Closed,
}

/// Session-level errors. All of these are fatal to the one session and
/// never propagate beyond it.
#[derive(Debug)]
pub enum SessionError {
    /// The handshake processor rejected the peer (bad puzzle, signature,
    /// or protocol violation; the processor logs the specific reason).
    HandshakeInvalid,
    /// Malformed or missing key-exchange material.
    KeyExchange(&'static str),
    /// AEAD sealing failed (nonce space exhausted).
    Encrypt,
    /// AEAD opening failed after establishment.
    Decrypt,
    /// The frame stream ended before setup completed.
    StreamClosed,
    /// The session is not established.
    Closed,
    Io(ProtocolError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::HandshakeInvalid => write!(f, "handshake rejected"),
            SessionError::KeyExchange(what) => write!(f, "key exchange failed: {}", what),
            SessionError::Encrypt => write!(f, "encryption failed"),
            SessionError::Decrypt => write!(f, "decryption failed"),
            SessionError::StreamClosed => write!(f, "stream closed during setup"),
            SessionError::Closed => write!(f, "session is closed"),
            SessionError::Io(e) => write!(f, "session i/o error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        SessionError::Io(e)
    }
}

// ============================================================================
// Per-direction AEAD
// ============================================================================

/// One direction of the encrypted channel. The 12-byte nonce is the
/// direction tag followed by a little-endian frame counter, so the two
/// directions never reuse a nonce under the shared key.
struct DirectionCipher {
    cipher: ChaCha20Poly1305,
    direction: u8,
    counter: u64,
}

impl DirectionCipher {
    fn new(key: &[u8; 32], direction: u8) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            direction,
            counter: 0,
        }
    }

    fn next_nonce(&mut self) -> Result<Nonce, SessionError> {
        let mut nonce = [0u8; 12];
        nonce[0] = self.direction;
        nonce[4..].copy_from_slice(&self.counter.to_le_bytes());
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(SessionError::Encrypt)?;
        Ok(*Nonce::from_slice(&nonce))
    }

    fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let nonce = self.next_nonce()?;
        self.cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| SessionError::Encrypt)
    }

    fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let nonce = self.next_nonce()?;
        self.cipher
            .decrypt(&nonce, ciphertext)
            .map_err(|_| SessionError::Decrypt)
    }
}

const DIRECTION_DIALER_TO_LISTENER: u8 = 0x01;
const DIRECTION_LISTENER_TO_DIALER: u8 = 0x02;

// ============================================================================
// PeerSession
// ============================================================================

/// An authenticated, encrypted channel to one remote node.
pub struct PeerSession {
    adapter: Arc<MessageAdapter>,
    state: StdMutex<SessionState>,
    send: Mutex<DirectionCipher>,
    recv: StdMutex<DirectionCipher>,
}

impl PeerSession {
    /// Run both setup phases over the adapter. Frames are consumed from
    /// `frames`, which afterwards carries only post-establishment traffic.
    pub(crate) async fn establish(
        adapter: Arc<MessageAdapter>,
        frames: &mut mpsc::Receiver<Vec<u8>>,
        processor: &dyn DynHandshakeProcessor,
        origin: SessionOrigin,
    ) -> Result<Self, SessionError> {
        let remote = adapter.remote_public_key();

        let result = Self::run_key_exchange(&adapter, frames, processor, origin, &remote).await;
        match result {
            Ok(key) => {
                let (send_dir, recv_dir) = match origin {
                    SessionOrigin::Dialer => {
                        (DIRECTION_DIALER_TO_LISTENER, DIRECTION_LISTENER_TO_DIALER)
                    }
                    SessionOrigin::Listener => {
                        (DIRECTION_LISTENER_TO_DIALER, DIRECTION_DIALER_TO_LISTENER)
                    }
                };
                trace!(
                    remote = %hex::encode(&remote.as_bytes()[..8]),
                    "session established"
                );
                Ok(Self {
                    adapter,
                    state: StdMutex::new(SessionState::Established),
                    send: Mutex::new(DirectionCipher::new(&key, send_dir)),
                    recv: StdMutex::new(DirectionCipher::new(&key, recv_dir)),
                })
            }
            Err(e) => {
                adapter.close().await;
                Err(e)
            }
        }
    }

    async fn run_key_exchange(
        adapter: &MessageAdapter,
        frames: &mut mpsc::Receiver<Vec<u8>>,
        processor: &dyn DynHandshakeProcessor,
        origin: SessionOrigin,
        remote: &PublicKey,
    ) -> Result<[u8; 32], SessionError> {
        // Phase A: pluggable authenticated handshake, one frame per turn.
        match origin {
            SessionOrigin::Dialer => {
                let (first, mut exchange) = processor.actively_init_dyn(remote);
                adapter.send(&first).await?;
                loop {
                    let frame = next_frame(frames).await?;
                    match exchange.process(&frame) {
                        HandshakeAction::SendMessage(reply) => {
                            adapter.send(&reply).await?;
                        }
                        HandshakeAction::DoNothing => break,
                        HandshakeAction::Invalid => return Err(SessionError::HandshakeInvalid),
                    }
                }
            }
            SessionOrigin::Listener => {
                let mut exchange = processor.passively_init_dyn(remote);
                loop {
                    let frame = next_frame(frames).await?;
                    match exchange.process(&frame) {
                        HandshakeAction::SendMessage(reply) => {
                            adapter.send(&reply).await?;
                            break;
                        }
                        HandshakeAction::DoNothing => break,
                        HandshakeAction::Invalid => return Err(SessionError::HandshakeInvalid),
                    }
                }
            }
        }

        // Phase B: ephemeral X25519, public values as single frames.
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        adapter.send(public.as_bytes()).await?;

        let peer_frame = next_frame(frames).await?;
        let peer_bytes: [u8; 32] = peer_frame
            .as_slice()
            .try_into()
            .map_err(|_| SessionError::KeyExchange("bad public value length"))?;
        let shared = secret.diffie_hellman(&X25519PublicKey::from(peer_bytes));
        if !shared.was_contributory() {
            return Err(SessionError::KeyExchange("low-order public value"));
        }

        Ok(blake3::derive_key(SESSION_KEY_CONTEXT, shared.as_bytes()))
    }

    pub fn remote_public_key(&self) -> PublicKey {
        self.adapter.remote_public_key()
    }

    pub fn remote_addr(&self) -> &str {
        self.adapter.remote_addr()
    }

    pub fn local_addr(&self) -> &str {
        self.adapter.local_addr()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn is_established(&self) -> bool {
        self.state() == SessionState::Established
    }

    /// Seal and transmit one message. The cipher lock is held across the
    /// write so counter order always matches wire order.
    pub async fn send_message(&self, plaintext: &[u8]) -> Result<(), SessionError> {
        if !self.is_established() {
            return Err(SessionError::Closed);
        }
        let mut cipher = self.send.lock().await;
        let sealed = cipher.seal(plaintext)?;
        self.adapter.send(&sealed).await.map_err(|e| {
            *self.state.lock().unwrap() = SessionState::Closed;
            SessionError::Io(e)
        })
    }

    /// Open one inbound frame. Called only from the session's receive
    /// task, in arrival order. A failure poisons the session.
    pub fn open_message(&self, ciphertext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let result = self.recv.lock().unwrap().open(ciphertext);
        if result.is_err() {
            *self.state.lock().unwrap() = SessionState::Failed;
        }
        result
    }

    /// Close the channel and wake the receiver. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == SessionState::Established {
                *state = SessionState::Closed;
            }
        }
        self.adapter.close().await;
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("remote", &self.remote_public_key())
            .field("state", &self.state())
            .finish()
    }
}

async fn next_frame(frames: &mut mpsc::Receiver<Vec<u8>>) -> Result<Vec<u8>, SessionError> {
    frames.recv().await.ok_or(SessionError::StreamClosed)
}

// ============================================================================
// S/Kademlia handshake processor
// ============================================================================

/// Wire form of one side's authentication message.
///
/// `challenge` is fresh randomness making each hello unique; the peer's
/// reply signature binds the hash of the exact hello frame it answers, so
/// a reply recorded from one session does not verify in another.
#[derive(Serialize, Deserialize)]
struct HandshakeHello {
    public_key: PublicKey,
    node_id: NodeId,
    nonce: [u8; 32],
    challenge: [u8; 32],
    signature: Vec<u8>,
}

fn challenge_payload(hello: &HandshakeHello, transcript: Option<&[u8; 32]>) -> Vec<u8> {
    let mut payload = Vec::with_capacity(128 + 32);
    payload.extend_from_slice(hello.public_key.as_bytes());
    payload.extend_from_slice(hello.node_id.as_bytes());
    payload.extend_from_slice(&hello.nonce);
    payload.extend_from_slice(&hello.challenge);
    if let Some(hash) = transcript {
        payload.extend_from_slice(hash);
    }
    payload
}

/// The default handshake: each side sends its signed S/Kademlia triple and
/// verifies the peer's.
///
/// The active hello signs the sender's own triple; the passive reply
/// additionally binds the BLAKE3 hash of the active hello frame, tying the
/// reply to this session's transcript.
pub struct SkademliaHandshake {
    identity: Arc<NodeIdentity>,
}

impl SkademliaHandshake {
    pub fn new(identity: Arc<NodeIdentity>) -> Self {
        Self { identity }
    }

    fn hello(&self, transcript: Option<&[u8; 32]>) -> Vec<u8> {
        let mut challenge = [0u8; 32];
        rand::RngCore::fill_bytes(&mut OsRng, &mut challenge);
        let mut hello = HandshakeHello {
            public_key: self.identity.public_key(),
            node_id: self.identity.node_id(),
            nonce: *self.identity.nonce(),
            challenge,
            signature: Vec::new(),
        };
        let payload = challenge_payload(&hello, transcript);
        hello.signature = sign_with_domain(
            self.identity.keypair(),
            HANDSHAKE_SIGNATURE_DOMAIN,
            &payload,
        );
        bincode::serialize(&hello).expect("hello serialization cannot fail")
    }
}

impl HandshakeProcessor for SkademliaHandshake {
    type Exchange = SkademliaExchange;

    fn actively_init(&self, remote: &PublicKey) -> (Vec<u8>, SkademliaExchange) {
        let hello = self.hello(None);
        let exchange = SkademliaExchange {
            identity: self.identity.clone(),
            expected: *remote,
            role: ExchangeRole::Active {
                sent_hello: hello.clone(),
            },
        };
        (hello, exchange)
    }

    fn passively_init(&self, remote: &PublicKey) -> SkademliaExchange {
        SkademliaExchange {
            identity: self.identity.clone(),
            expected: *remote,
            role: ExchangeRole::Passive,
        }
    }
}

enum ExchangeRole {
    Active { sent_hello: Vec<u8> },
    Passive,
}

pub struct SkademliaExchange {
    identity: Arc<NodeIdentity>,
    expected: PublicKey,
    role: ExchangeRole,
}

impl SkademliaExchange {
    fn verify_hello(&self, hello: &HandshakeHello, transcript: Option<&[u8; 32]>) -> bool {
        let peer = hex::encode(&self.expected.as_bytes()[..8]);

        if hello.public_key != self.expected {
            warn!(%peer, "handshake declared a different public key");
            return false;
        }

        let (c1, c2) = self.identity.puzzle_params();
        if !verify_puzzle(&hello.public_key, &hello.node_id, &hello.nonce, c1, c2) {
            warn!(%peer, "puzzle invalid, dropping peer");
            return false;
        }

        let payload = challenge_payload(hello, transcript);
        if verify_with_domain(
            &hello.public_key,
            HANDSHAKE_SIGNATURE_DOMAIN,
            &payload,
            &hello.signature,
        )
        .is_err()
        {
            warn!(%peer, "signature invalid, dropping peer");
            return false;
        }

        true
    }
}

impl HandshakeExchange for SkademliaExchange {
    fn process(&mut self, incoming: &[u8]) -> HandshakeAction {
        let hello: HandshakeHello = match deserialize_bounded(incoming) {
            Ok(hello) => hello,
            Err(e) => {
                warn!(error = %e, "malformed handshake frame");
                return HandshakeAction::Invalid;
            }
        };

        match &self.role {
            ExchangeRole::Active { sent_hello } => {
                let transcript = *blake3::hash(sent_hello).as_bytes();
                if !self.verify_hello(&hello, Some(&transcript)) {
                    return HandshakeAction::Invalid;
                }
                HandshakeAction::DoNothing
            }
            ExchangeRole::Passive => {
                if !self.verify_hello(&hello, None) {
                    return HandshakeAction::Invalid;
                }
                let transcript = *blake3::hash(incoming).as_bytes();
                let reply = SkademliaHandshake {
                    identity: self.identity.clone(),
                }
                .hello(Some(&transcript));
                HandshakeAction::SendMessage(reply)
            }
        }
    }
}
