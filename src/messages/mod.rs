//! Typed wire messages and their bencode encoding.
//!
//! Every datagram carries a transaction id, the sender's node id, and one of
//! the four request operations or their responses. The encoding is symmetric:
//! what a store request serializes, the receiving node deserializes to the
//! same key/value pair.

mod internal;

use std::convert::TryFrom;

use serde_bytes::ByteBuf;

use crate::common::{Id, Node, Value};
use crate::{Error, Result};

use internal::RawMessage;

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub transaction_id: u16,
    pub sender_id: Id,
    pub message_type: MessageType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageType {
    Request(RequestSpecific),
    Response(ResponseSpecific),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestSpecific {
    Ping,
    FindNode { target: Id },
    FindValue { key: Id },
    Store { key: Id, value: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseSpecific {
    Pong,
    /// Closest known nodes to the requested target or key.
    Nodes(Vec<Node>),
    /// The requested value, short-circuiting a value lookup.
    Value(Value),
    StoreAck,
}

impl Message {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_bencode::to_bytes(&self.to_raw()).map_err(Error::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Message> {
        let raw: RawMessage = serde_bencode::from_bytes(bytes)?;
        Message::from_raw(raw)
    }

    // === Private Methods ===

    fn to_raw(&self) -> RawMessage {
        let t = self.transaction_id as i64;
        let id = ByteBuf::from(self.sender_id.to_vec());

        match &self.message_type {
            MessageType::Request(request) => {
                let mut raw = RawMessage::new(t, id, "q");
                match request {
                    RequestSpecific::Ping => {
                        raw.q = Some("ping".to_string());
                    }
                    RequestSpecific::FindNode { target } => {
                        raw.q = Some("find_node".to_string());
                        raw.target = Some(ByteBuf::from(target.to_vec()));
                    }
                    RequestSpecific::FindValue { key } => {
                        raw.q = Some("find_value".to_string());
                        raw.key = Some(ByteBuf::from(key.to_vec()));
                    }
                    RequestSpecific::Store { key, value } => {
                        raw.q = Some("store".to_string());
                        raw.key = Some(ByteBuf::from(key.to_vec()));
                        raw.value = Some(ByteBuf::from(value.to_bytes()));
                    }
                }
                raw
            }
            MessageType::Response(response) => {
                let mut raw = RawMessage::new(t, id, "r");
                match response {
                    ResponseSpecific::Pong => {}
                    ResponseSpecific::Nodes(nodes) => {
                        raw.nodes = Some(ByteBuf::from(Node::encode_compact(nodes)));
                    }
                    ResponseSpecific::Value(value) => {
                        raw.value = Some(ByteBuf::from(value.to_bytes()));
                    }
                    ResponseSpecific::StoreAck => {
                        raw.ack = Some(1);
                    }
                }
                raw
            }
        }
    }

    fn from_raw(raw: RawMessage) -> Result<Message> {
        let transaction_id = u16::try_from(raw.t)
            .map_err(|_| Error::InvalidMessage("transaction id out of range"))?;
        let sender_id = Id::from_bytes(&raw.id)?;

        let message_type = match raw.y.as_str() {
            "q" => MessageType::Request(match raw.q.as_deref() {
                Some("ping") => RequestSpecific::Ping,
                Some("find_node") => RequestSpecific::FindNode {
                    target: required_id(&raw.target, "find_node requires a target")?,
                },
                Some("find_value") => RequestSpecific::FindValue {
                    key: required_id(&raw.key, "find_value requires a key")?,
                },
                Some("store") => RequestSpecific::Store {
                    key: required_id(&raw.key, "store requires a key")?,
                    value: Value::from_bytes(
                        raw.value
                            .as_ref()
                            .ok_or(Error::InvalidMessage("store requires a value"))?,
                    )?,
                },
                _ => return Err(Error::InvalidMessage("unknown request method")),
            }),
            "r" => MessageType::Response(if let Some(value) = &raw.value {
                ResponseSpecific::Value(Value::from_bytes(value)?)
            } else if let Some(nodes) = &raw.nodes {
                ResponseSpecific::Nodes(Node::decode_compact(nodes))
            } else if raw.ack.is_some() {
                ResponseSpecific::StoreAck
            } else {
                ResponseSpecific::Pong
            }),
            _ => return Err(Error::InvalidMessage("unknown message type")),
        };

        Ok(Message {
            transaction_id,
            sender_id,
            message_type,
        })
    }
}

fn required_id(field: &Option<ByteBuf>, context: &'static str) -> Result<Id> {
    let bytes = field.as_ref().ok_or(Error::InvalidMessage(context))?;
    Id::from_bytes(bytes)
}

#[cfg(test)]
mod test {
    use std::net::SocketAddrV4;

    use super::*;

    fn roundtrip(message: Message) {
        let bytes = message.to_bytes().expect("encodes");
        assert_eq!(Message::from_bytes(&bytes).expect("decodes"), message);
    }

    #[test]
    fn requests_roundtrip() {
        let sender_id = Id::random();

        for request in vec![
            RequestSpecific::Ping,
            RequestSpecific::FindNode {
                target: Id::random(),
            },
            RequestSpecific::FindValue { key: Id::random() },
            RequestSpecific::Store {
                key: Id::from_key("key"),
                value: Value::from("forty two"),
            },
        ] {
            roundtrip(Message {
                transaction_id: 120,
                sender_id,
                message_type: MessageType::Request(request),
            });
        }
    }

    #[test]
    fn responses_roundtrip() {
        let sender_id = Id::random();
        let nodes = vec![
            Node::new(Id::random(), SocketAddrV4::new([203, 0, 113, 7].into(), 6881)),
            Node::new(Id::random(), SocketAddrV4::new([192, 0, 2, 1].into(), 4242)),
        ];

        for response in vec![
            ResponseSpecific::Pong,
            ResponseSpecific::Nodes(nodes),
            ResponseSpecific::Value(Value::from(3.14)),
            ResponseSpecific::StoreAck,
        ] {
            roundtrip(Message {
                transaction_id: u16::MAX,
                sender_id,
                message_type: MessageType::Response(response),
            });
        }
    }

    #[test]
    fn malformed_messages_are_rejected() {
        assert!(Message::from_bytes(b"garbage").is_err());

        // Unknown message type.
        let mut raw = internal::RawMessage::new(0, ByteBuf::from(Id::random().to_vec()), "e");
        raw.q = Some("ping".to_string());
        let bytes = serde_bencode::to_bytes(&raw).expect("encodes");
        assert!(Message::from_bytes(&bytes).is_err());

        // find_node without a target.
        let mut raw = internal::RawMessage::new(0, ByteBuf::from(Id::random().to_vec()), "q");
        raw.q = Some("find_node".to_string());
        let bytes = serde_bencode::to_bytes(&raw).expect("encodes");
        assert!(Message::from_bytes(&bytes).is_err());

        // Truncated sender id.
        let raw = internal::RawMessage::new(0, ByteBuf::from(vec![1, 2, 3]), "q");
        let bytes = serde_bencode::to_bytes(&raw).expect("encodes");
        assert!(Message::from_bytes(&bytes).is_err());
    }
}
