//! # Discovery Service
//!
//! Runs on top of the dispatcher under a reserved service id and keeps the
//! routing table populated:
//!
//! - **PING → PONG** liveness probes.
//! - **PONG** triggers a bounded iterative FIND_NODE toward the local node
//!   id, pulling the neighborhood into the table.
//! - **LOOKUP_REQUEST(target)** answers with the k closest known peers.
//!
//! ## Anti-flooding gate
//!
//! Before any table update driven by network input, the sender's node id
//! must differ from ours in more than `prefix_diff_min` of the first
//! `prefix_diff_length` bits. Peers failing the gate are still answered,
//! just never added, so an attacker grinding ids adjacent to a victim's
//! cannot flood its buckets.
//!
//! ## Eviction
//!
//! When a bucket is full the least-recently-confirmed entry is probed with
//! a PING. A valid PONG within `ping_timeout` refreshes it and discards the
//! newcomer; anything else evicts it and retries the insert.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use anyhow::Context;
use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::identity::{distance_cmp, prefix_diff, NodeId, PeerId, PublicKey};
use crate::messages::{
    parse_message_body, to_message_body, LookupRequest, LookupResponse, MessageBody, Ping, Pong,
    OPCODE_LOOKUP_REQUEST, OPCODE_LOOKUP_RESPONSE, OPCODE_PING, OPCODE_PONG,
};
use crate::node::{Config, Node};
use crate::protocols::{Service, ServiceMessage};
use crate::routing::{BucketFull, RoutingTable};

/// Reserved service id for discovery. User services must pick another
/// nonzero id.
pub const DISCOVERY_SERVICE_ID: u32 = 1;

/// Cap on iterative lookup rounds; guards against pathological topologies.
const MAX_LOOKUP_ROUNDS: usize = 20;

pub struct DiscoveryService {
    routes: Arc<RoutingTable>,
    config: Config,
    node: OnceLock<Weak<Node>>,
    disable_ping: AtomicBool,
    disable_pong: AtomicBool,
    disable_lookup: AtomicBool,
}

impl DiscoveryService {
    pub fn new(self_peer: PeerId, config: Config) -> Self {
        Self {
            routes: Arc::new(RoutingTable::new(self_peer, config.bucket_size)),
            config,
            node: OnceLock::new(),
            disable_ping: AtomicBool::new(false),
            disable_pong: AtomicBool::new(false),
            disable_lookup: AtomicBool::new(false),
        }
    }

    pub fn routes(&self) -> Arc<RoutingTable> {
        self.routes.clone()
    }

    pub fn set_ping_disabled(&self, disabled: bool) {
        self.disable_ping.store(disabled, Ordering::Relaxed);
    }

    pub fn set_pong_disabled(&self, disabled: bool) {
        self.disable_pong.store(disabled, Ordering::Relaxed);
    }

    pub fn set_lookup_disabled(&self, disabled: bool) {
        self.disable_lookup.store(disabled, Ordering::Relaxed);
    }

    pub(crate) fn bind_node(&self, node: &Arc<Node>) {
        let _ = self.node.set(Arc::downgrade(node));
    }

    fn node(&self) -> Option<Arc<Node>> {
        self.node.get()?.upgrade()
    }

    /// The anti-flooding gate: only ids sufficiently far from ours (in
    /// prefix Hamming distance) may enter the table via network input.
    fn gate_allows(&self, peer: &PeerId) -> bool {
        let self_id = self.routes.self_peer().node_id;
        prefix_diff(
            peer.node_id.as_bytes(),
            self_id.as_bytes(),
            self.config.prefix_diff_length,
        ) > self.config.prefix_diff_min
    }

    /// Insert or refresh `peer`, running the bucket-full eviction probe if
    /// needed.
    pub(crate) async fn update_with_eviction(&self, peer: PeerId) {
        if let Err(BucketFull) = self.routes.update(peer.clone()) {
            if self.evict_least_recent(&peer.node_id).await {
                let _ = self.routes.update(peer);
            }
        }
    }

    /// Probe the least-recently-confirmed entry of the bucket `id` maps
    /// into. Returns true when the entry was evicted (the bucket now has
    /// room).
    async fn evict_least_recent(&self, id: &NodeId) -> bool {
        let Some(node) = self.node() else {
            return false;
        };
        let Some(last_seen) = self.routes.least_recent(id) else {
            return false;
        };
        if last_seen.node_id == self.routes.self_peer().node_id {
            return false;
        }

        let body = match to_message_body(DISCOVERY_SERVICE_ID, OPCODE_PING, &Ping::default()) {
            Ok(body) => body,
            Err(_) => return false,
        };

        let reply = node
            .request(&last_seen.public_key, body, self.config.ping_timeout)
            .await;

        let alive = match reply {
            Ok(reply) => matches!(
                parse_message_body(&reply),
                Ok(envelope) if envelope.opcode == OPCODE_PONG
            ),
            Err(_) => false,
        };

        if alive {
            // Confirmed; the stale entry becomes the freshest and the
            // newcomer is discarded.
            self.routes.move_to_front(&last_seen.node_id);
            false
        } else {
            debug!(
                peer = %last_seen.address,
                "evicting unresponsive peer"
            );
            self.routes.remove(&last_seen.node_id);
            true
        }
    }

    /// Bounded iterative FIND_NODE toward `target`.
    ///
    /// Each round queries up to `alpha` of the closest unqueried candidates
    /// in parallel, merges the responses into the shortlist, and stops when
    /// a round brings nothing closer (or every candidate was queried).
    /// Responses are re-keyed from the public key; a peer cannot claim an
    /// arbitrary node id for a third party.
    pub async fn find_node(&self, target: NodeId, k: usize, alpha: usize) -> Vec<PeerId> {
        let Some(node) = self.node() else {
            return Vec::new();
        };
        let self_id = self.routes.self_peer().node_id;

        let mut shortlist: Vec<PeerId> = self
            .routes
            .find_closest(&target, k)
            .into_iter()
            .filter(|p| p.node_id != self_id)
            .collect();

        let mut seen: HashSet<NodeId> = shortlist.iter().map(|p| p.node_id).collect();
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut best_distance = shortlist
            .first()
            .map(|p| p.node_id.xor_distance(&target))
            .unwrap_or([0xFF; 32]);

        for _round in 0..MAX_LOOKUP_ROUNDS {
            let candidates: Vec<PeerId> = shortlist
                .iter()
                .filter(|p| !queried.contains(&p.node_id))
                .take(alpha)
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }
            for candidate in &candidates {
                queried.insert(candidate.node_id);
            }

            let mut join_set = JoinSet::new();
            for contact in candidates {
                let node = node.clone();
                let deadline = self.config.ping_timeout;
                join_set.spawn(async move {
                    let body = to_message_body(
                        DISCOVERY_SERVICE_ID,
                        OPCODE_LOOKUP_REQUEST,
                        &LookupRequest { target },
                    )?;
                    let reply = node.request(&contact.public_key, body, deadline).await?;
                    let envelope = parse_message_body(&reply)?;
                    anyhow::ensure!(
                        envelope.opcode == OPCODE_LOOKUP_RESPONSE,
                        "unexpected lookup reply opcode {}",
                        envelope.opcode
                    );
                    let response: LookupResponse = envelope.decode_payload()?;
                    Ok::<Vec<PeerId>, anyhow::Error>(response.peers)
                });
            }

            while let Some(joined) = join_set.join_next().await {
                let peers = match joined {
                    Ok(Ok(peers)) => peers,
                    Ok(Err(e)) => {
                        debug!(error = %e, "lookup query failed");
                        continue;
                    }
                    Err(_) => continue,
                };
                for peer in peers {
                    let peer = PeerId::new(peer.address, peer.public_key);
                    if peer.node_id == self_id {
                        continue;
                    }
                    if seen.insert(peer.node_id) {
                        shortlist.push(peer);
                    }
                }
            }

            shortlist.sort_by(|a, b| {
                let da = a.node_id.xor_distance(&target);
                let db = b.node_id.xor_distance(&target);
                distance_cmp(&da, &db).then_with(|| a.node_id.cmp(&b.node_id))
            });
            shortlist.truncate(k);

            let closer = match shortlist.first() {
                Some(first) => {
                    let dist = first.node_id.xor_distance(&target);
                    if distance_cmp(&dist, &best_distance) == std::cmp::Ordering::Less {
                        best_distance = dist;
                        true
                    } else {
                        false
                    }
                }
                None => false,
            };
            if !closer {
                break;
            }
        }

        shortlist
    }
}

#[async_trait]
impl Service for DiscoveryService {
    async fn startup(&self, node: Arc<Node>) {
        self.bind_node(&node);
    }

    async fn receive(&self, message: &ServiceMessage) -> anyhow::Result<Option<MessageBody>> {
        if message.body.service != DISCOVERY_SERVICE_ID {
            return Ok(None);
        }
        if message.body.payload.is_empty() {
            anyhow::bail!("discovery message body is corrupt");
        }

        let envelope =
            parse_message_body(&message.body).context("unable to parse discovery envelope")?;

        let sender = PeerId::new(message.sender_addr.clone(), message.sender);

        // Gate every network-driven table update.
        if self.gate_allows(&sender) {
            self.update_with_eviction(sender.clone()).await;
        }

        match envelope.opcode {
            OPCODE_PING => {
                if self.disable_ping.load(Ordering::Relaxed) {
                    return Ok(None);
                }
                Ok(Some(to_message_body(
                    DISCOVERY_SERVICE_ID,
                    OPCODE_PONG,
                    &Pong::default(),
                )?))
            }
            OPCODE_PONG => {
                if self.disable_pong.load(Ordering::Relaxed) {
                    return Ok(None);
                }
                let target = self.routes.self_peer().node_id;
                let found = self
                    .find_node(target, self.routes.bucket_size(), self.config.alpha)
                    .await;
                for peer in found {
                    if self.gate_allows(&peer) {
                        self.update_with_eviction(peer).await;
                    }
                }
                info!(
                    self_addr = %self.routes.self_peer().address,
                    peers = self.routes.len(),
                    "bootstrapped with peers"
                );
                Ok(None)
            }
            OPCODE_LOOKUP_REQUEST => {
                if self.disable_lookup.load(Ordering::Relaxed) {
                    return Ok(None);
                }
                let request: LookupRequest = envelope
                    .decode_payload()
                    .context("unable to parse lookup request")?;
                let peers = self
                    .routes
                    .find_closest(&request.target, self.routes.bucket_size());
                Ok(Some(to_message_body(
                    DISCOVERY_SERVICE_ID,
                    OPCODE_LOOKUP_RESPONSE,
                    &LookupResponse { peers },
                )?))
            }
            OPCODE_LOOKUP_RESPONSE => {
                // Correlated responses are consumed by `Node::request`; an
                // uncorrelated one has nothing to do here.
                Ok(None)
            }
            other => {
                warn!(opcode = other, "unknown discovery opcode");
                Ok(None)
            }
        }
    }

    async fn peer_disconnect(&self, remote: &PublicKey) {
        let id = crate::identity::NodeId::from_public_key(remote);
        if let Some(peer) = self.routes.get_peer(&id) {
            self.routes.remove(&id);
            debug!(
                peer = %peer.address,
                self_addr = %self.routes.self_peer().address,
                "peer has disconnected"
            );
        }
    }
}
