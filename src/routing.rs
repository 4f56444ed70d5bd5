//! # XOR-Metric Routing Table
//!
//! Prefix-bucketed peer store keyed by node id. Bucket `k` holds peers whose
//! XOR distance to the local node id has exactly `k` leading zero bits; the
//! zero distance (the node itself) is clamped into the last bucket. Each
//! bucket is an ordered list, most-recently-confirmed at the front, capped
//! at `bucket_size` entries.
//!
//! ## Concurrency
//!
//! Every bucket is guarded by its own `std::sync::RwLock`. All operations
//! hold at most one bucket lock at a time; [`RoutingTable::find_closest`]
//! takes shared locks bucket-by-bucket, copies entries out, and sorts after
//! releasing, so it cannot deadlock with writers.
//!
//! ## Eviction
//!
//! [`RoutingTable::update`] never evicts. When a bucket is full it returns
//! [`BucketFull`] and the discovery layer decides: probe the
//! least-recently-confirmed entry with a PING, then either evict it
//! ([`RoutingTable::remove`]) or refresh it ([`RoutingTable::move_to_front`])
//! and drop the newcomer.

use std::collections::{HashSet, VecDeque};
use std::sync::RwLock;

use crate::identity::{distance_cmp, prefix_len, NodeId, PeerId, PublicKey, ID_BITS};

/// Default number of peers per bucket (Kademlia `k`).
pub const DEFAULT_BUCKET_SIZE: usize = 16;

/// Returned by [`RoutingTable::update`] when the target bucket is at
/// capacity. Recovered by the discovery layer via an eviction probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketFull;

impl std::fmt::Display for BucketFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot add peer, bucket is full")
    }
}

impl std::error::Error for BucketFull {}

pub struct RoutingTable {
    self_peer: RwLock<PeerId>,
    bucket_size: usize,
    buckets: Vec<RwLock<VecDeque<PeerId>>>,
}

impl RoutingTable {
    /// Create a routing table for `self_peer` with the given bucket size.
    /// The local peer is inserted into its own (last) bucket.
    pub fn new(self_peer: PeerId, bucket_size: usize) -> Self {
        let mut buckets = Vec::with_capacity(ID_BITS);
        for _ in 0..ID_BITS {
            buckets.push(RwLock::new(VecDeque::new()));
        }
        let table = Self {
            self_peer: RwLock::new(self_peer.clone()),
            bucket_size,
            buckets,
        };
        table
            .update(self_peer)
            .expect("empty bucket cannot be full");
        table
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    /// The local peer id, including the most recently observed address.
    pub fn self_peer(&self) -> PeerId {
        self.self_peer.read().unwrap().clone()
    }

    /// Record the transport-observed local address.
    ///
    /// The node id is key-bound and never changes; only the stored address
    /// is refreshed, both on the self record and on its bucket entry.
    pub fn set_self_address(&self, address: &str) {
        let node_id = {
            let mut self_peer = self.self_peer.write().unwrap();
            if self_peer.address == address {
                return;
            }
            self_peer.address = address.to_string();
            self_peer.node_id
        };
        let idx = self.bucket_index(&node_id);
        let mut bucket = self.buckets[idx].write().unwrap();
        if let Some(entry) = bucket.iter_mut().find(|p| p.node_id == node_id) {
            entry.address = address.to_string();
        }
    }

    /// Bucket index for `id`: `prefix_len(XOR(self, id))`, clamped so the
    /// zero distance maps into the last bucket.
    pub fn bucket_index(&self, id: &NodeId) -> usize {
        let self_id = self.self_peer.read().unwrap().node_id;
        prefix_len(&self_id.xor_distance(id)).min(ID_BITS - 1)
    }

    /// Insert `peer` or confirm it as fresh.
    ///
    /// If the peer is already in its bucket it moves to the front (with its
    /// address refreshed); otherwise it is pushed at the front if the bucket
    /// has room. A full bucket is reported to the caller, never evicted
    /// here.
    pub fn update(&self, peer: PeerId) -> Result<(), BucketFull> {
        let idx = self.bucket_index(&peer.node_id);
        let mut bucket = self.buckets[idx].write().unwrap();

        if let Some(pos) = bucket.iter().position(|p| p.node_id == peer.node_id) {
            bucket.remove(pos);
            bucket.push_front(peer);
            return Ok(());
        }

        if bucket.len() < self.bucket_size {
            bucket.push_front(peer);
            Ok(())
        } else {
            Err(BucketFull)
        }
    }

    pub fn get_peer(&self, id: &NodeId) -> Option<PeerId> {
        let idx = self.bucket_index(id);
        let bucket = self.buckets[idx].read().unwrap();
        bucket.iter().find(|p| p.node_id == *id).cloned()
    }

    pub fn get_peer_by_public_key(&self, public_key: &PublicKey) -> Option<PeerId> {
        self.get_peer(&NodeId::from_public_key(public_key))
    }

    /// Remove the peer with the given node id. Returns whether a peer was
    /// actually removed.
    pub fn remove(&self, id: &NodeId) -> bool {
        let idx = self.bucket_index(id);
        let mut bucket = self.buckets[idx].write().unwrap();
        if let Some(pos) = bucket.iter().position(|p| p.node_id == *id) {
            bucket.remove(pos);
            true
        } else {
            false
        }
    }

    /// Move an existing peer to the front of its bucket (confirmed alive).
    pub fn move_to_front(&self, id: &NodeId) -> bool {
        let idx = self.bucket_index(id);
        let mut bucket = self.buckets[idx].write().unwrap();
        if let Some(pos) = bucket.iter().position(|p| p.node_id == *id) {
            if let Some(peer) = bucket.remove(pos) {
                bucket.push_front(peer);
            }
            true
        } else {
            false
        }
    }

    /// The least-recently-confirmed peer of the bucket `id` maps into.
    /// This is the eviction-probe candidate when that bucket is full.
    pub fn least_recent(&self, id: &NodeId) -> Option<PeerId> {
        let idx = self.bucket_index(id);
        let bucket = self.buckets[idx].read().unwrap();
        bucket.back().cloned()
    }

    /// Snapshot of all peers excluding the local node.
    ///
    /// Order follows bucket iteration; callers must not rely on anything
    /// beyond "excludes self".
    pub fn get_peers(&self) -> Vec<PeerId> {
        let self_id = self.self_peer.read().unwrap().node_id;
        let mut peers = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.read().unwrap();
            for peer in bucket.iter() {
                if peer.node_id != self_id {
                    peers.push(peer.clone());
                }
            }
        }
        peers
    }

    /// Deduplicated list of all known peer addresses, excluding the local
    /// node's.
    pub fn get_peer_addresses(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut addresses = Vec::new();
        for peer in self.get_peers() {
            if seen.insert(peer.address.clone()) {
                addresses.push(peer.address);
            }
        }
        addresses
    }

    /// Number of peers stored, excluding the local node.
    pub fn len(&self) -> usize {
        let self_id = self.self_peer.read().unwrap().node_id;
        self.buckets
            .iter()
            .map(|b| {
                let b = b.read().unwrap();
                b.iter().filter(|p| p.node_id != self_id).count()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to `count` peers with the smallest XOR distance to `target`.
    ///
    /// Starts at the target's bucket, sweeps outward symmetrically until
    /// enough candidates are collected or all buckets are visited, then
    /// sorts the copies by XOR distance (ties broken by ascending node id)
    /// and truncates. May include the local node.
    pub fn find_closest(&self, target: &NodeId, count: usize) -> Vec<PeerId> {
        if count == 0 {
            return Vec::new();
        }

        let home = self.bucket_index(target);
        let mut peers: Vec<PeerId> = Vec::new();

        {
            let bucket = self.buckets[home].read().unwrap();
            peers.extend(bucket.iter().cloned());
        }

        let mut i = 1usize;
        while peers.len() < count && (i <= home || home + i < ID_BITS) {
            if i <= home {
                let bucket = self.buckets[home - i].read().unwrap();
                peers.extend(bucket.iter().cloned());
            }
            if home + i < ID_BITS {
                let bucket = self.buckets[home + i].read().unwrap();
                peers.extend(bucket.iter().cloned());
            }
            i += 1;
        }

        peers.sort_by(|a, b| {
            let da = a.node_id.xor_distance(target);
            let db = b.node_id.xor_distance(target);
            distance_cmp(&da, &db).then_with(|| a.node_id.cmp(&b.node_id))
        });
        peers.truncate(count);
        peers
    }
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("self_peer", &self.self_peer())
            .field("bucket_size", &self.bucket_size)
            .field("peers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{prefix_len, Keypair};

    fn make_peer(seed: u8) -> PeerId {
        let kp = Keypair::generate();
        PeerId::new(format!("127.0.0.1:{}", 9000 + seed as u16), kp.public_key())
    }

    fn make_table() -> (PeerId, RoutingTable) {
        let me = make_peer(0);
        let table = RoutingTable::new(me.clone(), DEFAULT_BUCKET_SIZE);
        (me, table)
    }

    #[test]
    fn self_is_in_its_own_bucket() {
        let (me, table) = make_table();

        assert_eq!(table.get_peer(&me.node_id), Some(me.clone()));
        assert_eq!(table.bucket_index(&me.node_id), ID_BITS - 1);
        assert!(table.get_peers().is_empty(), "get_peers must exclude self");
    }

    #[test]
    fn bucket_index_matches_prefix_len() {
        let (me, table) = make_table();

        for i in 0..64u8 {
            let peer = make_peer(i);
            table.update(peer.clone()).unwrap();
            let expected = prefix_len(&me.node_id.xor_distance(&peer.node_id)).min(ID_BITS - 1);
            assert_eq!(table.bucket_index(&peer.node_id), expected);
        }
    }

    #[test]
    fn peers_appear_in_exactly_one_bucket() {
        let (_, table) = make_table();

        let mut inserted = Vec::new();
        for i in 0..32u8 {
            let peer = make_peer(i);
            table.update(peer.clone()).unwrap();
            inserted.push(peer);
        }

        let snapshot = table.get_peers();
        assert_eq!(snapshot.len(), inserted.len());
        for peer in &inserted {
            assert_eq!(snapshot.iter().filter(|p| *p == peer).count(), 1);
        }
    }

    #[test]
    fn update_moves_existing_peer_to_front() {
        let (_me, table) = make_table();

        // Collect several peers landing in the same bucket so ordering is
        // observable.
        let mut bucket_peers: Vec<PeerId> = Vec::new();
        let mut target_bucket = None;
        while bucket_peers.len() < 3 {
            let peer = make_peer(0);
            let idx = table.bucket_index(&peer.node_id);
            match target_bucket {
                None => {
                    target_bucket = Some(idx);
                    bucket_peers.push(peer);
                }
                Some(b) if b == idx => bucket_peers.push(peer),
                _ => continue,
            }
        }

        for peer in &bucket_peers {
            table.update(peer.clone()).unwrap();
        }

        // Re-updating the first inserted peer must make it most recent.
        table.update(bucket_peers[0].clone()).unwrap();
        let last = table
            .least_recent(&bucket_peers[0].node_id)
            .expect("bucket not empty");
        assert_ne!(last, bucket_peers[0]);
        assert_eq!(last, bucket_peers[1], "second insert is now least recent");
    }

    #[test]
    fn full_bucket_rejects_new_peer() {
        // bucket_size 2 so a handful of random peers fills some bucket.
        let table = RoutingTable::new(make_peer(0), 2);
        let mut rejected = false;
        for i in 0..128u8 {
            if table.update(make_peer(i)).is_err() {
                rejected = true;
                break;
            }
        }
        assert!(rejected, "some bucket should fill with 128 random peers");
    }

    #[test]
    fn remove_peer() {
        let (_, table) = make_table();
        let peer = make_peer(1);

        table.update(peer.clone()).unwrap();
        assert!(table.get_peer(&peer.node_id).is_some());

        assert!(table.remove(&peer.node_id));
        assert!(table.get_peer(&peer.node_id).is_none());
        assert!(!table.remove(&peer.node_id), "second remove is a no-op");
    }

    #[test]
    fn get_peer_by_public_key_derives_node_id() {
        let (_, table) = make_table();
        let peer = make_peer(1);

        table.update(peer.clone()).unwrap();
        assert_eq!(
            table.get_peer_by_public_key(&peer.public_key),
            Some(peer.clone())
        );

        let other = Keypair::generate().public_key();
        assert!(table.get_peer_by_public_key(&other).is_none());
    }

    #[test]
    fn find_closest_returns_nearest_by_xor() {
        let (_, table) = make_table();

        let mut peers = Vec::new();
        for i in 0..48u8 {
            let peer = make_peer(i);
            table.update(peer.clone()).unwrap();
            peers.push(peer);
        }
        peers.push(table.self_peer());

        let target = make_peer(99).node_id;
        let k = 8;
        let closest = table.find_closest(&target, k);
        assert_eq!(closest.len(), k);

        // Compare against a brute-force sort over the full peer set.
        let mut expected = peers.clone();
        expected.sort_by(|a, b| {
            let da = a.node_id.xor_distance(&target);
            let db = b.node_id.xor_distance(&target);
            distance_cmp(&da, &db).then_with(|| a.node_id.cmp(&b.node_id))
        });
        expected.truncate(k);

        assert_eq!(closest, expected);
    }

    #[test]
    fn find_closest_with_zero_count() {
        let (_, table) = make_table();
        table.update(make_peer(1)).unwrap();
        assert!(table.find_closest(&make_peer(2).node_id, 0).is_empty());
    }

    #[test]
    fn find_closest_returns_all_when_fewer_than_count() {
        let (_, table) = make_table();
        for i in 0..3u8 {
            table.update(make_peer(i)).unwrap();
        }
        // 3 peers + self.
        let closest = table.find_closest(&make_peer(9).node_id, 16);
        assert_eq!(closest.len(), 4);
    }

    #[test]
    fn set_self_address_updates_record_and_bucket() {
        let (me, table) = make_table();

        table.set_self_address("10.0.0.1:4444");
        assert_eq!(table.self_peer().address, "10.0.0.1:4444");
        assert_eq!(
            table.get_peer(&me.node_id).unwrap().address,
            "10.0.0.1:4444"
        );
        // node id untouched
        assert_eq!(table.self_peer().node_id, me.node_id);
    }

    #[test]
    fn peer_addresses_are_deduplicated() {
        let (_, table) = make_table();

        let kp1 = Keypair::generate();
        let kp2 = Keypair::generate();
        table
            .update(PeerId::new("127.0.0.1:7000", kp1.public_key()))
            .unwrap();
        table
            .update(PeerId::new("127.0.0.1:7000", kp2.public_key()))
            .unwrap();

        assert_eq!(table.get_peer_addresses(), vec!["127.0.0.1:7000"]);
    }
}
