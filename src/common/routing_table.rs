//! Simplified Kademlia routing table

use std::collections::BTreeMap;
use std::net::SocketAddrV4;
use std::slice::Iter;
use std::time::{Duration, Instant};

use crate::common::{Id, Node};
use crate::rpc::ClosestNodes;

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 20;

#[derive(Debug, Clone)]
/// Simplified Kademlia routing table
///
/// Buckets are indexed by the height of the first differing bit between a
/// node's Id and ours, which is the fully-split form of the classic
/// routing tree: one bucket per distinct prefix length, each capped at K,
/// bounding the table to O(K * 160) entries.
pub struct RoutingTable {
    id: Id,
    buckets: BTreeMap<u8, KBucket>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id.
    pub fn new(id: Id) -> Self {
        RoutingTable {
            id,
            buckets: BTreeMap::new(),
        }
    }

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    // === Public Methods ===

    /// Attempts to add a node to this routing table, and return `true` if it did.
    ///
    /// An existing entry with the same id is refreshed instead, updating its
    /// address and `last_seen`. A full bucket only gives up its least
    /// recently seen entry if that entry has gone stale; a fresh entry is
    /// never displaced by an unverified newcomer.
    pub fn add(&mut self, node: Node) -> bool {
        let height = self.id.bucket_height(&node.id);

        if height == 0 {
            // Do not add self to the routing_table
            return false;
        }

        let bucket = self.buckets.entry(height).or_insert_with(KBucket::new);

        bucket.add(node)
    }

    /// Remove a node from this routing table.
    pub fn remove(&mut self, node_id: &Id) {
        let height = self.id.bucket_height(node_id);

        if let Some(bucket) = self.buckets.get_mut(&height) {
            bucket.remove(node_id)
        }
    }

    /// Return the closest nodes to the target, ordered by ascending XOR
    /// distance, at most K of them.
    pub fn closest(&self, target: &Id) -> Box<[Node]> {
        let mut closest = ClosestNodes::new(*target);

        for bucket in self.buckets.values() {
            for node in &bucket.nodes {
                closest.add(node.clone());
            }
        }

        closest.nodes()[..MAX_BUCKET_SIZE_K.min(closest.len())].into()
    }

    /// One lookup target per bucket untouched longer than `interval`: a
    /// random id inside that bucket's distance range. Running a node lookup
    /// for each keeps rarely-used parts of the table populated.
    pub fn refresh_ids(&self, interval: Duration) -> Vec<Id> {
        self.buckets
            .iter()
            .filter(|(_, bucket)| bucket.last_updated.elapsed() > interval)
            .map(|(height, _)| self.id.random_in_bucket(*height))
            .collect()
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.is_empty())
    }

    /// Return the number of nodes in this routing table.
    pub fn size(&self) -> usize {
        self.buckets
            .values()
            .fold(0, |acc, bucket| acc + bucket.nodes.len())
    }

    /// Returns an iterator over the nodes in this routing table.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.buckets.values().flat_map(|bucket| bucket.nodes.iter())
    }

    /// Turn this routing table into a list of bootstrapping addresses,
    /// suitable for the persisted neighbor-cache.
    pub fn to_bootstrap(&self) -> Vec<SocketAddrV4> {
        self.nodes()
            .filter(|node| !node.is_stale())
            .map(|node| node.address)
            .collect()
    }

    // === Private Methods ===

    #[cfg(test)]
    fn contains(&self, node_id: &Id) -> bool {
        let height = self.id.bucket_height(node_id);

        if let Some(bucket) = self.buckets.get(&height) {
            if bucket.contains(node_id) {
                return true;
            }
        }
        false
    }
}

/// Kbuckets are similar to LRU caches that check and evict unresponsive nodes,
/// without dropping any responsive nodes in the process.
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Nodes in the k-bucket, sorted by the least recently seen.
    nodes: Vec<Node>,
    /// Last time this bucket was touched, for refresh staleness.
    last_updated: Instant,
}

impl KBucket {
    pub fn new() -> Self {
        KBucket {
            nodes: Vec::with_capacity(MAX_BUCKET_SIZE_K),
            last_updated: Instant::now(),
        }
    }

    // === Public Methods ===

    pub fn add(&mut self, incoming: Node) -> bool {
        self.last_updated = Instant::now();

        if let Some(index) = self.iter().position(|n| n.id == incoming.id) {
            // Refresh the node's `last_seen`, move it to the end of the
            // bucket, and accept a changed port instead of waiting for the
            // old one to stop answering pings.
            self.nodes.remove(index);
            self.nodes.push(incoming);

            true
        } else if self.nodes.len() < MAX_BUCKET_SIZE_K {
            self.nodes.push(incoming);
            true
        } else if self.nodes[0].is_stale() {
            // Remove the least recently seen node and add the new one
            self.nodes.remove(0);
            self.nodes.push(incoming);

            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, node_id: &Id) {
        self.nodes.retain(|node| node.id != *node_id);
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, Node> {
        self.nodes.iter()
    }

    #[cfg(test)]
    fn contains(&self, id: &Id) -> bool {
        self.iter().any(|node| node.id == *id)
    }
}

impl Default for KBucket {
    fn default() -> Self {
        Self::new()
    }
}
