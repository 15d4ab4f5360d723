//! Raw serde representation of wire messages.
//!
//! One flat bencoded dictionary per datagram; optional fields are simply
//! absent. The typed conversion lives in the parent module.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub(crate) struct RawMessage {
    /// Transaction (correlation) id.
    pub t: i64,
    /// Sender node id.
    pub id: ByteBuf,
    /// "q" for requests, "r" for responses.
    pub y: String,
    /// Request method: ping, find_node, find_value or store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    /// Lookup target id (find_node).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ByteBuf>,
    /// Key digest (find_value, store).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<ByteBuf>,
    /// Encoded value (store request, find_value response).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ByteBuf>,
    /// Compact node list (find_node/find_value responses).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<ByteBuf>,
    /// Store acknowledgement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<i64>,
}

impl RawMessage {
    pub fn new(t: i64, id: ByteBuf, y: &str) -> RawMessage {
        RawMessage {
            t,
            id,
            y: y.to_string(),
            q: None,
            target: None,
            key: None,
            value: None,
            nodes: None,
            ack: None,
        }
    }
}
