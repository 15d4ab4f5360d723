use tracing::{debug, trace};

use crate::common::{Id, Node, Value, MAX_BUCKET_SIZE_K};
use crate::messages::RequestSpecific;

use super::socket::KrpcSocket;

#[derive(Debug)]
/// Once an [super::IterativeQuery] is done, we can replicate a value to the
/// closest responding nodes using this PutQuery, which keeps track of
/// acknowledging nodes.
pub(crate) struct PutQuery {
    pub key: Id,
    pub value: Value,
    /// Number of nodes that acknowledged the store.
    stored_at: u8,
    inflight_requests: Vec<u16>,
}

impl PutQuery {
    pub fn new(key: Id, value: Value) -> Self {
        Self {
            key,
            value,
            stored_at: 0,
            inflight_requests: Vec::new(),
        }
    }

    /// Send store requests to the closest responding nodes from a finished
    /// lookup.
    pub fn start(&mut self, socket: &mut KrpcSocket, nodes: &[Node]) {
        debug_assert!(!self.started(), "PutQuery::start called twice");

        let key = self.key;
        trace!(?key, "PutQuery start");

        for node in nodes.iter().take(MAX_BUCKET_SIZE_K) {
            let tid = socket.request(
                node.address,
                Some(node.id),
                RequestSpecific::Store {
                    key: self.key,
                    value: self.value.clone(),
                },
            );

            self.inflight_requests.push(tid);
        }
    }

    pub fn started(&self) -> bool {
        !self.inflight_requests.is_empty()
    }

    pub fn inflight(&self, tid: u16) -> bool {
        self.inflight_requests.contains(&tid)
    }

    pub fn success(&mut self) {
        debug!(key = ?self.key, "PutQuery got store acknowledgment");
        self.stored_at += 1
    }

    /// Check if all store requests got acknowledged or timed out.
    ///
    /// Returns the number of acknowledging nodes once done.
    pub fn tick(&self, socket: &KrpcSocket) -> Option<u8> {
        if !self.started() {
            return None;
        }

        let done = !self
            .inflight_requests
            .iter()
            .any(|&tid| socket.inflight(&tid));

        if done {
            debug!(
                key = ?self.key,
                stored_at = ?self.stored_at,
                nodes_count = self.inflight_requests.len(),
                "PutQuery done"
            );

            return Some(self.stored_at);
        }

        None
    }
}
