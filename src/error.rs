//! Main Crate Error

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
/// Kadstore crate error enum.
pub enum Error {
    /// There are no known neighbors to seed a lookup with.
    ///
    /// Usually means the node failed to bootstrap, so the routing table is
    /// empty. Check the machine's access to UDP, or use better seeds.
    #[error("No known neighbors to reach the network")]
    UnreachableNetwork,

    /// `set` rejects oversized values before any request is sent.
    #[error("Encoded value is {0} bytes, exceeding the maximum allowed size")]
    ValueTooLarge(usize),

    /// Value bytes did not decode to any known value type.
    #[error("Undecodable value bytes")]
    InvalidValueEncoding,

    /// Indicates that an Id is not the expected 20 bytes.
    #[error("Invalid Id size, expected 20 bytes, got {0}")]
    InvalidIdSize(usize),

    /// Indicates that a hex string does not encode a valid Id.
    #[error("Invalid Id encoding: {0}")]
    InvalidIdEncoding(String),

    #[error("Failed to parse packet bytes: {0}")]
    Bencode(#[from] serde_bencode::Error),

    /// A decodable packet that does not form a valid message.
    #[error("Invalid message: {0}")]
    InvalidMessage(&'static str),

    /// The state snapshot file exists but does not decode. Recoverable by
    /// starting with a fresh identity and an empty routing table.
    #[error("Invalid state snapshot: {0}")]
    InvalidState(&'static str),

    /// The node's coordination thread is gone.
    #[error("Dht node was shutdown")]
    Shutdown,

    #[error(transparent)]
    /// Transparent [std::io::Error]
    Io(#[from] std::io::Error),
}
