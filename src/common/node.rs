//! Struct and implementation of the Node entry in the Kademlia routing table
use std::fmt::{self, Debug, Formatter};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use crate::common::{Id, ID_SIZE};

/// The age at which a node entry is presumed departed unless it answers pings.
pub const STALE_TIME: Duration = Duration::from_secs(15 * 60);
/// The age at which a node entry should be re-verified with a ping.
const PING_TIME: Duration = Duration::from_secs(10 * 60);

/// Bytes per node entry in the compact wire encoding: 20 id + 4 ip + 2 port.
pub const COMPACT_NODE_SIZE: usize = ID_SIZE + 6;

#[derive(Clone)]
/// Node entry in the Kademlia routing table
pub struct Node {
    pub id: Id,
    pub address: SocketAddrV4,
    pub last_seen: Instant,
}

impl Node {
    /// Creates a new Node from an id and socket address.
    pub fn new(id: Id, address: SocketAddrV4) -> Node {
        Node {
            id,
            address,
            last_seen: Instant::now(),
        }
    }

    /// Node has been around long enough without proof of liveness that it
    /// should be dropped from the routing table.
    pub fn is_stale(&self) -> bool {
        self.last_seen.elapsed() > STALE_TIME
    }

    /// Node is aging and should be verified with a ping before it goes stale.
    pub fn should_ping(&self) -> bool {
        self.last_seen.elapsed() > PING_TIME
    }

    /// Append this node's compact encoding to `buffer`.
    pub fn to_compact(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.id.0);
        buffer.extend_from_slice(&self.address.ip().octets());
        buffer.extend_from_slice(&self.address.port().to_be_bytes());
    }

    /// Decode a concatenation of compact node entries, skipping any trailing
    /// partial entry.
    pub fn decode_compact(bytes: &[u8]) -> Vec<Node> {
        bytes
            .chunks_exact(COMPACT_NODE_SIZE)
            .filter_map(|chunk| {
                let id = Id::from_bytes(&chunk[..ID_SIZE]).ok()?;
                let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
                let port = u16::from_be_bytes([chunk[24], chunk[25]]);

                Some(Node::new(id, SocketAddrV4::new(ip, port)))
            })
            .collect()
    }

    /// Encode a list of nodes as concatenated compact entries.
    pub fn encode_compact(nodes: &[Node]) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(nodes.len() * COMPACT_NODE_SIZE);
        for node in nodes {
            node.to_compact(&mut buffer);
        }
        buffer
    }

    #[cfg(test)]
    pub fn random() -> Node {
        Node::new(Id::random(), SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
    }

    #[cfg(test)]
    pub fn unique(i: usize) -> Node {
        Node::new(
            Id::random(),
            SocketAddrV4::new((i as u32).into(), i as u16),
        )
    }

    #[cfg(test)]
    pub fn with_last_seen(mut self, last_seen: Instant) -> Node {
        self.last_seen = last_seen;
        self
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.address == other.address
    }
}

impl Eq for Node {}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("last_seen", &self.last_seen.elapsed().as_secs())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn compact_roundtrip() {
        let nodes = vec![
            Node::new(Id::random(), SocketAddrV4::new([203, 0, 113, 7].into(), 6881)),
            Node::new(Id::random(), SocketAddrV4::new([192, 0, 2, 1].into(), 42069)),
        ];

        let encoded = Node::encode_compact(&nodes);
        assert_eq!(encoded.len(), 2 * COMPACT_NODE_SIZE);

        let decoded = Node::decode_compact(&encoded);
        assert_eq!(decoded, nodes);
    }

    #[test]
    fn decode_skips_trailing_partial_entry() {
        let node = Node::random();

        let mut encoded = Node::encode_compact(&[node.clone()]);
        encoded.extend_from_slice(&[1, 2, 3]);

        assert_eq!(Node::decode_compact(&encoded), vec![node]);
    }

    #[test]
    fn fresh_node_is_not_stale() {
        let node = Node::random();

        assert!(!node.is_stale());
        assert!(!node.should_ping());
    }
}
