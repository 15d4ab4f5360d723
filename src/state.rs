//! Persisted neighbor-cache used for fast rejoin.
//!
//! A snapshot of the node's identity and immediate neighbors, enough to come
//! back after a restart without a full bootstrap from scratch. Written
//! atomically; a missing or corrupt file is recoverable by starting with a
//! fresh identity and an empty table.

use std::convert::TryFrom;
use std::fs;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::common::Id;
use crate::{Error, Result};

/// Bytes per neighbor in the compact encoding: 4 ip + 2 port.
const COMPACT_ADDR_SIZE: usize = 6;

#[derive(Debug, Clone, PartialEq)]
/// Snapshot of a node's identity and immediate neighbors.
pub struct NodeState {
    pub ksize: usize,
    pub alpha: usize,
    pub id: Id,
    pub neighbors: Vec<SocketAddrV4>,
}

#[derive(Serialize, Deserialize)]
struct RawState {
    ksize: i64,
    alpha: i64,
    id: ByteBuf,
    /// Compact 6-byte address entries.
    neighbors: ByteBuf,
}

impl NodeState {
    /// Write the snapshot atomically: a temporary file is renamed over the
    /// target, so a crash mid-write never leaves a corrupt snapshot behind.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut neighbors = Vec::with_capacity(self.neighbors.len() * COMPACT_ADDR_SIZE);
        for address in &self.neighbors {
            neighbors.extend_from_slice(&address.ip().octets());
            neighbors.extend_from_slice(&address.port().to_be_bytes());
        }

        let raw = RawState {
            ksize: self.ksize as i64,
            alpha: self.alpha as i64,
            id: ByteBuf::from(self.id.to_vec()),
            neighbors: ByteBuf::from(neighbors),
        };

        let bytes = serde_bencode::to_bytes(&raw)?;

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, path)?;

        Ok(())
    }

    pub fn load(path: &Path) -> Result<NodeState> {
        let bytes = fs::read(path)?;

        let raw: RawState = serde_bencode::from_bytes(&bytes)
            .map_err(|_| Error::InvalidState("undecodable snapshot"))?;

        let ksize =
            usize::try_from(raw.ksize).map_err(|_| Error::InvalidState("negative ksize"))?;
        let alpha =
            usize::try_from(raw.alpha).map_err(|_| Error::InvalidState("negative alpha"))?;
        let id = Id::from_bytes(&raw.id).map_err(|_| Error::InvalidState("malformed node id"))?;

        if raw.neighbors.len() % COMPACT_ADDR_SIZE != 0 {
            return Err(Error::InvalidState("truncated neighbor list"));
        }

        let neighbors = raw
            .neighbors
            .chunks_exact(COMPACT_ADDR_SIZE)
            .map(|chunk| {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                SocketAddrV4::new(ip, port)
            })
            .collect();

        Ok(NodeState {
            ksize,
            alpha,
            id,
            neighbors,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "kadstore-{}-{}-{}.cache",
            name,
            std::process::id(),
            rand::random::<u32>()
        ))
    }

    #[test]
    fn save_and_load_roundtrip() {
        let path = temp_path("roundtrip");

        let state = NodeState {
            ksize: 20,
            alpha: 3,
            id: Id::random(),
            neighbors: vec![
                SocketAddrV4::new([203, 0, 113, 7].into(), 6881),
                SocketAddrV4::new([192, 0, 2, 1].into(), 4242),
            ],
        };

        state.save(&path).expect("saves");
        let loaded = NodeState::load(&path).expect("loads");

        assert_eq!(loaded, state);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_snapshot_is_an_io_error() {
        let path = temp_path("missing");

        assert!(matches!(NodeState::load(&path), Err(Error::Io(_))));
    }

    #[test]
    fn corrupt_snapshot_is_recoverable() {
        let path = temp_path("corrupt");

        fs::write(&path, b"not a snapshot").expect("writes");

        assert!(matches!(
            NodeState::load(&path),
            Err(Error::InvalidState(_))
        ));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn overwriting_keeps_the_latest_snapshot() {
        let path = temp_path("overwrite");

        let first = NodeState {
            ksize: 20,
            alpha: 3,
            id: Id::random(),
            neighbors: vec![SocketAddrV4::new([203, 0, 113, 7].into(), 6881)],
        };
        let second = NodeState {
            neighbors: vec![SocketAddrV4::new([192, 0, 2, 1].into(), 4242)],
            ..first.clone()
        };

        first.save(&path).expect("saves");
        second.save(&path).expect("saves");

        assert_eq!(NodeState::load(&path).expect("loads"), second);

        let _ = fs::remove_file(&path);
    }
}
