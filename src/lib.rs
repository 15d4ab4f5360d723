#![doc = include_str!("../README.md")]

mod common;
mod dht;
mod error;
mod messages;
mod rpc;
mod state;
mod storage;

pub use bytes::Bytes;

pub use crate::common::{Id, Node, Value, MAX_BUCKET_SIZE_K, MAX_VALUE_SIZE};
pub use crate::dht::{Dht, Testnet};
pub use crate::error::{Error, Result};
pub use crate::rpc::{Config, Info, StorePolicy};
pub use crate::state::NodeState;
