//! # Identity and Cryptographic Primitives
//!
//! This module defines the core identity types used throughout Lattica:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`NodeIdentity`]: a keypair bound to an S/Kademlia-valid node id and nonce
//! - [`PeerId`]: routing-layer identifier `(node_id, public_key, address)`
//!
//! ## Identity Model
//!
//! The node id is the BLAKE3 hash of the Ed25519 public key. Creating an
//! identity requires solving two cryptopuzzles (S/Kademlia):
//!
//! - **Static puzzle**: `prefix_len(H(node_id)) >= c1` binds work to the
//!   keypair itself, so bulk identity generation is expensive.
//! - **Dynamic puzzle**: `prefix_len(H(node_id XOR nonce)) >= c2` binds
//!   additional work to a nonce that is costly to find.
//!
//! Verification of both puzzles is O(1); see [`verify_puzzle`].
//!
//! ## XOR Metric
//!
//! All routing operations use the Kademlia XOR metric over node ids.
//! [`NodeId::xor_distance`] yields the raw distance, [`prefix_len`] counts
//! leading zero bits, and [`prefix_diff`] is the Hamming distance over a
//! bit prefix (used by the discovery anti-flooding gate).

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Width of node ids, public keys, and puzzle nonces, in bytes.
pub const ID_LEN: usize = 32;

/// Number of buckets in a routing table (= bits in a node id).
pub const ID_BITS: usize = ID_LEN * 8;

// ============================================================================
// Keypair
// ============================================================================

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh Ed25519 keypair.
    ///
    /// The result is not yet a valid overlay identity; use
    /// [`NodeIdentity::generate`] to obtain a keypair that satisfies the
    /// cryptopuzzles.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key
            .verifying_key()
            .verify(message, signature)
            .is_ok()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key().to_hex())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// PublicKey / NodeId
// ============================================================================

/// Raw Ed25519 public key. Peers are addressed by public key at the
/// dispatcher layer; the routing layer uses the derived [`NodeId`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Routing-layer node id: `BLAKE3(public_key)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    #[inline]
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Self(*blake3::hash(public_key.as_bytes()).as_bytes())
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Count leading zero bits. Returns [`ID_BITS`] for the all-zero input.
#[inline]
pub fn prefix_len(bytes: &[u8; 32]) -> usize {
    let mut zeros = 0usize;
    for byte in bytes {
        if *byte == 0 {
            zeros += 8;
        } else {
            zeros += byte.leading_zeros() as usize;
            break;
        }
    }
    zeros
}

/// Hamming distance over the first `bits` bits of `a` and `b`.
///
/// Bits beyond the end of either input are treated as zero, so comparing
/// against a shorter prefix is well defined.
pub fn prefix_diff(a: &[u8], b: &[u8], bits: usize) -> u32 {
    let byte_at = |s: &[u8], i: usize| -> u8 { s.get(i).copied().unwrap_or(0) };

    let full = bits / 8;
    let rem = bits % 8;
    let mut diff = 0u32;
    for i in 0..full {
        diff += (byte_at(a, i) ^ byte_at(b, i)).count_ones();
    }
    if rem > 0 {
        let mask = 0xFFu8 << (8 - rem);
        diff += ((byte_at(a, full) ^ byte_at(b, full)) & mask).count_ones();
    }
    diff
}

/// Compare two XOR distances as unsigned big-endian integers.
#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    a.cmp(b)
}

// ============================================================================
// PeerId
// ============================================================================

/// Routing-layer peer identifier.
///
/// Two `PeerId`s are equal iff their node ids are equal; the address is a
/// transport-level endpoint (`host:port` for TCP) and does not participate
/// in equality or ordering.
#[derive(Clone, Serialize, Deserialize)]
pub struct PeerId {
    pub node_id: NodeId,
    pub public_key: PublicKey,
    pub address: String,
}

impl PeerId {
    /// Create a peer id, deriving the node id from the public key.
    pub fn new(address: impl Into<String>, public_key: PublicKey) -> Self {
        Self {
            node_id: NodeId::from_public_key(&public_key),
            public_key,
            address: address.into(),
        }
    }
}

impl PartialEq for PeerId {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }
}

impl Eq for PeerId {}

impl PartialOrd for PeerId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.node_id.cmp(&other.node_id)
    }
}

impl std::hash::Hash for PeerId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.node_id.hash(state);
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerId")
            .field("node_id", &self.node_id)
            .field("address", &self.address)
            .finish()
    }
}

// ============================================================================
// Cryptopuzzles (S/Kademlia)
// ============================================================================

/// Default prefix length for the static cryptopuzzle.
pub const DEFAULT_C1: u32 = 16;
/// Default prefix length for the dynamic cryptopuzzle.
pub const DEFAULT_C2: u32 = 16;

/// Error type for identities that do not satisfy the cryptopuzzles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PuzzleError {
    /// The keypair's node id does not satisfy the static puzzle for `c1`.
    StaticUnsatisfied { c1: u32 },
}

impl std::fmt::Display for PuzzleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PuzzleError::StaticUnsatisfied { c1 } => {
                write!(f, "keypair does not generate a valid node id for c1={}", c1)
            }
        }
    }
}

impl std::error::Error for PuzzleError {}

#[inline]
fn hashed_prefix_ok(input: &[u8; 32], c: u32) -> bool {
    let hashed = *blake3::hash(input).as_bytes();
    prefix_len(&hashed) >= c as usize
}

#[inline]
fn dynamic_puzzle_ok(node_id: &NodeId, nonce: &[u8; 32], c2: u32) -> bool {
    let mut xored = [0u8; 32];
    for (i, byte) in xored.iter_mut().enumerate() {
        *byte = node_id.as_bytes()[i] ^ nonce[i];
    }
    hashed_prefix_ok(&xored, c2)
}

/// Verify that `(public_key, node_id, nonce)` is a valid S/Kademlia triple
/// for the cryptopuzzle constants `c1` and `c2`.
///
/// Checks, byte-exactly:
/// 1. `node_id == BLAKE3(public_key)`
/// 2. static puzzle: `prefix_len(BLAKE3(node_id)) >= c1`
/// 3. dynamic puzzle: `prefix_len(BLAKE3(node_id XOR nonce)) >= c2`
pub fn verify_puzzle(
    public_key: &PublicKey,
    node_id: &NodeId,
    nonce: &[u8; 32],
    c1: u32,
    c2: u32,
) -> bool {
    *node_id == NodeId::from_public_key(public_key)
        && hashed_prefix_ok(node_id.as_bytes(), c1)
        && dynamic_puzzle_ok(node_id, nonce, c2)
}

fn solve_nonce(node_id: &NodeId, c2: u32) -> [u8; 32] {
    let mut nonce = [0u8; 32];
    loop {
        OsRng.fill_bytes(&mut nonce);
        if dynamic_puzzle_ok(node_id, &nonce, c2) {
            return nonce;
        }
    }
}

/// A node's long-lived identity: keypair, derived node id, and the nonce
/// solving the dynamic cryptopuzzle. Immutable for the node's lifetime.
#[derive(Clone)]
pub struct NodeIdentity {
    keypair: Keypair,
    node_id: NodeId,
    nonce: [u8; 32],
    c1: u32,
    c2: u32,
}

impl NodeIdentity {
    /// Generate a new identity satisfying both cryptopuzzles.
    ///
    /// Repeatedly samples fresh keypairs until the static puzzle holds, then
    /// samples random nonces until the dynamic puzzle holds. Pure CPU work,
    /// expected once at node startup; with `c1 = c2 = 16` this takes tens of
    /// milliseconds on a modern core.
    pub fn generate(c1: u32, c2: u32) -> Self {
        loop {
            let keypair = Keypair::generate();
            let node_id = NodeId::from_public_key(&keypair.public_key());
            if hashed_prefix_ok(node_id.as_bytes(), c1) {
                let nonce = solve_nonce(&node_id, c2);
                return Self {
                    keypair,
                    node_id,
                    nonce,
                    c1,
                    c2,
                };
            }
        }
    }

    /// Build an identity from an existing keypair.
    ///
    /// Fails if the keypair does not satisfy the static puzzle; the dynamic
    /// puzzle nonce is (re)solved here.
    pub fn from_keypair(keypair: Keypair, c1: u32, c2: u32) -> Result<Self, PuzzleError> {
        let node_id = NodeId::from_public_key(&keypair.public_key());
        if !hashed_prefix_ok(node_id.as_bytes(), c1) {
            return Err(PuzzleError::StaticUnsatisfied { c1 });
        }
        let nonce = solve_nonce(&node_id, c2);
        Ok(Self {
            keypair,
            node_id,
            nonce,
            c1,
            c2,
        })
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn nonce(&self) -> &[u8; 32] {
        &self.nonce
    }

    pub fn puzzle_params(&self) -> (u32, u32) {
        (self.c1, self.c2)
    }

    /// The routing-layer peer id for this identity at `address`.
    pub fn peer_id(&self, address: impl Into<String>) -> PeerId {
        PeerId {
            node_id: self.node_id,
            public_key: self.public_key(),
            address: address.into(),
        }
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.keypair.sign(message)
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &self.node_id)
            .field("c1", &self.c1)
            .field("c2", &self.c2)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Domain-Separated Signature Helpers
// ============================================================================
//
// Domain separation prevents cross-protocol signature replay: a signature
// produced for one context cannot be presented in another.

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Sign `data` with a domain prefix.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a domain-separated signature against the claimed public key.
pub fn verify_with_domain(
    public_key: &PublicKey,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    if signature.len() != 64 {
        return Err(SignatureError::InvalidLength);
    }

    let verifying_key = VerifyingKey::try_from(public_key.as_bytes().as_slice())
        .map_err(|_| SignatureError::InvalidPublicKey)?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}
