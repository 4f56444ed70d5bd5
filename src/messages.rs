//! # Wire Protocol Messages
//!
//! Serializable message types exchanged over established sessions. Messages
//! are encoded with bincode; all deserialization of network input goes
//! through [`deserialize_bounded`] so oversized or malformed payloads cannot
//! exhaust memory.
//!
//! ## Layers
//!
//! | Type | Layer | Purpose |
//! |------|-------|---------|
//! | [`MessageBody`] | dispatcher | service-multiplexed envelope |
//! | [`DiscoveryEnvelope`] | discovery | opcode + opaque payload |
//! | [`LookupRequest`] / [`LookupResponse`] | discovery | FIND_NODE exchange |
//!
//! The encoding is deterministic (bincode with fixed-width integers), so a
//! body serializes to the same bytes on every node.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::identity::{NodeId, PeerId};

/// Upper bound for a single deserialized message. Slightly above the
/// default transport frame limit to allow for envelope overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (4 * 1024 * 1024) + 4096;

/// Returns bincode options with size limits enforced.
/// Always use this for network input.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

// ============================================================================
// Dispatcher envelope
// ============================================================================

/// Service-multiplexed message envelope.
///
/// `service` identifies the registered service the payload belongs to
/// (zero is reserved and rejected by the dispatcher). `request_nonce`
/// correlates a request with its reply; zero means the message is not part
/// of a request/response exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    pub service: u32,
    pub request_nonce: u64,
    pub payload: Vec<u8>,
}

impl MessageBody {
    pub fn new(service: u32, payload: Vec<u8>) -> Self {
        Self {
            service,
            request_nonce: 0,
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        deserialize_bounded(bytes)
    }
}

// ============================================================================
// Discovery wire types
// ============================================================================

pub const OPCODE_PING: u32 = 1;
pub const OPCODE_PONG: u32 = 2;
pub const OPCODE_LOOKUP_REQUEST: u32 = 3;
pub const OPCODE_LOOKUP_RESPONSE: u32 = 4;

/// Discovery-layer envelope: an opcode plus the opcode-specific payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryEnvelope {
    pub opcode: u32,
    pub payload: Vec<u8>,
}

impl DiscoveryEnvelope {
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, bincode::Error> {
        deserialize_bounded(&self.payload)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupRequest {
    pub target: NodeId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupResponse {
    pub peers: Vec<PeerId>,
}

/// Wrap a discovery payload into a [`MessageBody`] for `service`.
pub fn to_message_body<T: Serialize>(
    service: u32,
    opcode: u32,
    inner: &T,
) -> Result<MessageBody, bincode::Error> {
    let envelope = DiscoveryEnvelope {
        opcode,
        payload: serialize(inner)?,
    };
    Ok(MessageBody::new(service, serialize(&envelope)?))
}

/// Unwrap the discovery envelope carried by a [`MessageBody`].
pub fn parse_message_body(body: &MessageBody) -> Result<DiscoveryEnvelope, bincode::Error> {
    deserialize_bounded(&body.payload)
}
