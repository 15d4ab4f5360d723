//! Common types and data structures.

pub mod id;
pub mod node;
pub mod routing_table;
pub mod value;

pub use id::{Id, ID_SIZE, MAX_DISTANCE};
pub use node::{Node, COMPACT_NODE_SIZE};
pub use routing_table::{KBucket, RoutingTable, MAX_BUCKET_SIZE_K};
pub use value::{Value, MAX_VALUE_SIZE};
