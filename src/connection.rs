//! # Connection Adapter
//!
//! Glues a TCP listener and a [`Dialer`] to the dispatcher. Outbound, it
//! resolves a public key to an address through the routing table, dials,
//! and performs the active-side adapter setup; inbound, it accepts
//! connections, performs the passive-side setup, records the address the
//! dialer observed for us on the routing table's self entry, and hands the
//! adapter to the dispatcher.
//!
//! Construction wires the discovery service into the node: the adapter
//! owns the discovery instance (and through it the routing table), and
//! registers it as the node's first service.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::discovery::{DiscoveryService, DISCOVERY_SERVICE_ID};
use crate::identity::{PeerId, PublicKey};
use crate::messages::{to_message_body, Ping, OPCODE_PING};
use crate::node::{Node, NodeError};
use crate::protocols::Dialer;
use crate::routing::RoutingTable;
use crate::transport::MessageAdapter;

pub struct ConnectionAdapter {
    listener: StdMutex<Option<TcpListener>>,
    dialer: Arc<dyn Dialer>,
    discovery: Arc<DiscoveryService>,
    local_addr: String,
    max_payload_len: usize,
}

impl ConnectionAdapter {
    /// Create the adapter, its discovery service, and wire both into
    /// `node`. The local address is taken from the bound listener.
    pub fn new(
        listener: TcpListener,
        dialer: Arc<dyn Dialer>,
        node: &Arc<Node>,
    ) -> anyhow::Result<Arc<Self>> {
        let local_addr = listener
            .local_addr()
            .context("listener has no local address")?
            .to_string();

        let self_peer = node.identity().peer_id(local_addr.clone());
        let discovery = Arc::new(DiscoveryService::new(self_peer, node.config()));
        discovery.bind_node(node);

        let adapter = Arc::new(Self {
            listener: StdMutex::new(Some(listener)),
            dialer,
            discovery: discovery.clone(),
            local_addr,
            max_payload_len: node.config().max_payload_len,
        });

        node.set_connection(adapter.clone())?;
        node.add_service(discovery);

        Ok(adapter)
    }

    pub fn discovery(&self) -> &Arc<DiscoveryService> {
        &self.discovery
    }

    pub fn routes(&self) -> Arc<RoutingTable> {
        self.discovery.routes()
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Public keys of all peers currently known to the routing table.
    pub fn get_remote_ids(&self) -> Vec<PublicKey> {
        self.routes()
            .get_peers()
            .into_iter()
            .map(|peer| peer.public_key)
            .collect()
    }

    /// Insert a known peer, applying the discovery layer's eviction policy
    /// when the target bucket is full.
    pub async fn add_remote_id(&self, remote: PublicKey, address: &str) {
        self.discovery
            .update_with_eviction(PeerId::new(address, remote))
            .await;
    }

    /// Seed the routing table and announce ourselves: inserts every seed,
    /// then broadcasts a PING so the seeds learn about us and reply with
    /// the neighborhood.
    pub async fn bootstrap(&self, node: &Arc<Node>, seeds: &[PeerId]) -> anyhow::Result<()> {
        if seeds.is_empty() {
            return Ok(());
        }
        for seed in seeds {
            self.add_remote_id(seed.public_key, &seed.address).await;
        }
        let body = to_message_body(DISCOVERY_SERVICE_ID, OPCODE_PING, &Ping::default())?;
        node.broadcast(body).await?;
        Ok(())
    }

    /// Resolve and dial `remote`, returning the active-mode message
    /// adapter and its frame stream.
    pub(crate) async fn dial(
        &self,
        remote: &PublicKey,
    ) -> Result<
        (
            Arc<MessageAdapter>,
            tokio::sync::mpsc::Receiver<Vec<u8>>,
        ),
        NodeError,
    > {
        let routes = self.routes();
        let local = routes.self_peer();

        if *remote == local.public_key {
            return Err(NodeError::SelfAddressed);
        }

        let peer = routes.get_peer_by_public_key(remote).ok_or_else(|| {
            NodeError::DialFailed(format!(
                "remote {} not found in routing table",
                hex::encode(&remote.as_bytes()[..8])
            ))
        })?;

        if peer.address == local.address {
            return Err(NodeError::DialFailed(format!(
                "skip connecting to self address {}",
                local.address
            )));
        }

        debug!(peer = %peer.address, "dialing peer");

        let stream = self
            .dialer
            .dial(&peer.address)
            .await
            .map_err(|e| NodeError::DialFailed(e.to_string()))?;

        MessageAdapter::active(
            stream,
            local.public_key,
            *remote,
            &local.address,
            &peer.address,
            self.max_payload_len,
        )
        .await
        .map_err(|e| NodeError::DialFailed(e.to_string()))
    }

    /// Accept inbound connections until the listener fails permanently.
    /// One passive setup + key exchange runs per connection, detached.
    pub(crate) async fn accept_loop(self: Arc<Self>, node: Arc<Node>) {
        let listener = self.listener.lock().unwrap().take();
        let Some(listener) = listener else {
            warn!("accept loop already running");
            return;
        };

        info!(addr = %self.local_addr, "listening for connections");

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let adapter = self.clone();
                    let node = node.clone();
                    tokio::spawn(async move {
                        let passive = MessageAdapter::passive(
                            stream,
                            node.public_key(),
                            &adapter.local_addr,
                            adapter.max_payload_len,
                        )
                        .await;
                        match passive {
                            Ok((message_adapter, frames)) => {
                                // The dialer told us how it reached us;
                                // keep that as our advertised address.
                                adapter
                                    .routes()
                                    .set_self_address(message_adapter.local_addr());
                                node.handle_inbound(message_adapter, frames).await;
                            }
                            Err(e) => {
                                debug!(error = %e, "unable to start message adapter");
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "unable to accept connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for ConnectionAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionAdapter")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}
