//! Manage iterative lookups and their corresponding request/response.

use std::collections::HashSet;
use std::net::SocketAddrV4;

use tracing::{debug, trace};

use crate::common::{Id, Node, Value, MAX_BUCKET_SIZE_K};
use crate::messages::RequestSpecific;

use super::closest_nodes::ClosestNodes;
use super::socket::KrpcSocket;

/// Maximum number of concurrent requests per lookup.
pub const ALPHA: usize = 3;

/// An iterative process of concurrently sending a request to the closest known nodes to
/// the target, updating the routing table with closer nodes discovered in the responses, and
/// repeating this process until no closer nodes (that aren't already queried) are found.
///
/// A value lookup additionally terminates as soon as any node answers with the
/// value itself.
#[derive(Debug)]
pub(crate) struct IterativeQuery {
    pub request: RequestSpecific,
    closest: ClosestNodes,
    responders: ClosestNodes,
    /// Responders that answered a value lookup with nodes instead of the
    /// value, candidates for caching the value near the key afterwards.
    responders_without_value: ClosestNodes,
    inflight_requests: Vec<u16>,
    visited: HashSet<SocketAddrV4>,
    value: Option<Value>,
}

impl IterativeQuery {
    pub fn new(target: Id, request: RequestSpecific) -> Self {
        trace!(?target, ?request, "New lookup");

        Self {
            request,

            closest: ClosestNodes::new(target),
            responders: ClosestNodes::new(target),
            responders_without_value: ClosestNodes::new(target),

            inflight_requests: Vec::new(),
            visited: HashSet::new(),

            value: None,
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.responders.target()
    }

    /// Return the closest responding nodes after the lookup is done.
    pub fn responders(&self) -> &ClosestNodes {
        &self.responders
    }

    /// The closest responder that didn't have the value, if any.
    pub fn closest_responder_without_value(&self) -> Option<&Node> {
        self.responders_without_value.nodes().first()
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    // === Public Methods ===

    /// Force start the lookup traversal by visiting the closest candidates.
    pub fn start(&mut self, socket: &mut KrpcSocket) {
        self.visit_closest(socket);
    }

    /// Add a candidate node to visit on the next tick if it is among the closest nodes.
    pub fn add_candidate(&mut self, node: Node) {
        self.closest.add(node);
    }

    /// Visit an explicitly given address, and add it to the visited set.
    /// Only used when calling bootstrapping nodes, which we know nothing
    /// about beyond their address. Re-supplied addresses are not visited
    /// twice.
    pub fn visit_address(&mut self, socket: &mut KrpcSocket, address: SocketAddrV4) {
        if !self.visited.insert(address) {
            return;
        }

        let tid = socket.request(address, None, self.request.clone());
        self.inflight_requests.push(tid);

        let tid = socket.request(address, None, RequestSpecific::Ping);
        self.inflight_requests.push(tid);
    }

    /// Return true if a response (by transaction_id) is expected by this lookup.
    pub fn inflight(&self, tid: u16) -> bool {
        self.inflight_requests.contains(&tid)
    }

    /// Add a node that responded with closer nodes.
    pub fn add_responding_node(&mut self, node: Node) {
        self.responders.add(node.clone());
        self.responders_without_value.add(node);
    }

    /// Add a node that responded with the value itself, ending the lookup.
    pub fn add_value(&mut self, node: Node, value: Value) {
        let target = self.target();
        debug!(?target, from = ?node, "Lookup found value");

        self.responders.add(node);
        self.value.get_or_insert(value);
    }

    /// Visit more candidates and check for termination.
    ///
    /// Returns true if the lookup is done.
    pub fn tick(&mut self, socket: &mut KrpcSocket) -> bool {
        if self.value.is_some() {
            return true;
        }

        self.visit_closest(socket);

        // If none of our requests are still inflight in the socket (not timed
        // out), no closer nodes are left to hear about, and the lookup is done.
        let done = !self
            .inflight_requests
            .iter()
            .any(|&tid| socket.inflight(&tid));

        if done {
            debug!(
                target = ?self.target(),
                candidates = ?self.closest.len(),
                visited = ?self.visited.len(),
                responders = ?self.responders.len(),
                "Done lookup"
            );
        };

        done
    }

    // === Private Methods ===

    /// Visit unvisited candidates among the closest known nodes, keeping at
    /// most [ALPHA] requests outstanding at a time.
    fn visit_closest(&mut self, socket: &mut KrpcSocket) {
        let live = self
            .inflight_requests
            .iter()
            .filter(|tid| socket.inflight(tid))
            .count();

        let to_visit = self
            .closest
            .nodes()
            .iter()
            .take(MAX_BUCKET_SIZE_K)
            .filter(|node| !self.visited.contains(&node.address))
            .map(|node| (node.id, node.address))
            .take(ALPHA.saturating_sub(live))
            .collect::<Vec<_>>();

        for (id, address) in to_visit {
            let tid = socket.request(address, Some(id), self.request.clone());
            self.inflight_requests.push(tid);
            self.visited.insert(address);
        }
    }
}
