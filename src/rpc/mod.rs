//! The single-threaded coordination core: socket, routing table, storage and
//! ongoing lookups, advanced by calling [Rpc::tick] in a loop.

mod closest_nodes;
pub mod config;
mod iterative_query;
mod put_query;
mod socket;

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::common::{Id, Node, RoutingTable, Value, MAX_BUCKET_SIZE_K};
use crate::messages::{Message, MessageType, RequestSpecific, ResponseSpecific};
use crate::state::NodeState;
use crate::storage::Storage;
use crate::{Error, Result};

pub use closest_nodes::ClosestNodes;
pub use config::{Config, StorePolicy};
pub use iterative_query::ALPHA;

use iterative_query::IterativeQuery;
use put_query::PutQuery;
use socket::KrpcSocket;

/// Buckets untouched longer than this get a refresh lookup, and aging stored
/// entries are republished, once per interval.
pub const REFRESH_TABLE_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Stored entries older than this are republished to the currently closest
/// nodes during table refresh.
pub const REPUBLISH_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// How often aging routing table entries are verified with a ping.
const PING_TABLE_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// How often the node's identity and neighbors are snapshotted to disk, when
/// a state path is configured.
pub const SAVE_STATE_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
pub(crate) struct Rpc {
    socket: KrpcSocket,
    routing_table: RoutingTable,
    storage: Storage,

    /// Ongoing lookups, by target and kind. A node lookup and a value lookup
    /// for the same target run side by side; only a lookup of the same kind
    /// is joined.
    queries: HashMap<(Id, LookupKind), IterativeQuery>,
    /// Store fan-outs waiting for their node lookup to finish, by key.
    pending_puts: HashMap<Id, PutQuery>,
    /// Started store fan-outs.
    put_queries: Vec<PutQuery>,

    /// Last time we refreshed stale buckets and republished aging entries.
    last_table_refresh: Instant,
    /// Last time we pinged aging nodes in the routing table.
    last_table_ping: Instant,
    /// Last time we persisted the state snapshot.
    last_state_save: Instant,

    // Options
    id: Id,
    bootstrap: Vec<String>,
    store_policy: StorePolicy,
    welcome_on_response: bool,
    state_path: Option<std::path::PathBuf>,
}

/// What happened during a single [Rpc::tick], for the actor to dispatch to
/// waiting callers.
#[derive(Debug, Default)]
pub(crate) struct RpcTickReport {
    /// Lookups that finished this tick, with the value if one was found.
    pub done_get_queries: Vec<(Id, Option<Value>)>,
    /// Store fan-outs that finished this tick; true iff at least one remote
    /// node acknowledged.
    pub done_put_queries: Vec<(Id, bool)>,
    /// A lookup for our own id finished; true iff the routing table is
    /// populated.
    pub done_bootstrap: Option<bool>,
}

/// What a lookup is after: nodes (bootstrap, put placement) or a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LookupKind {
    Node,
    Value,
}

impl LookupKind {
    fn of(request: &RequestSpecific) -> LookupKind {
        match request {
            RequestSpecific::FindValue { .. } => LookupKind::Value,
            _ => LookupKind::Node,
        }
    }
}

/// A node's identity and address, for callers of the [crate::Dht] handle.
#[derive(Debug, Clone)]
pub struct Info {
    local_addr: SocketAddrV4,
    id: Id,
}

impl Info {
    /// The address the node's socket is listening on.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    /// This node's [Id].
    pub fn id(&self) -> Id {
        self.id
    }
}

impl Rpc {
    pub fn new(config: &Config, id: Option<Id>) -> Result<Self> {
        let id = id.unwrap_or_else(Id::random);

        let socket = KrpcSocket::new(config, id)?;

        let local_addr = socket.local_addr();
        info!(?local_addr, ?id, "Kadstore node listening");

        let mut rpc = Rpc {
            socket,
            routing_table: RoutingTable::new(id),
            storage: Storage::new(config.max_storage_entries),

            queries: HashMap::new(),
            pending_puts: HashMap::new(),
            put_queries: Vec::new(),

            last_table_refresh: Instant::now(),
            last_table_ping: Instant::now(),
            last_state_save: Instant::now(),

            id,
            bootstrap: config.bootstrap.clone(),
            store_policy: config.store_policy,
            welcome_on_response: config.welcome_on_response,
            state_path: config.state_path.clone(),
        };

        if !rpc.bootstrap.is_empty() {
            rpc.populate();
        }

        Ok(rpc)
    }

    // === Getters ===

    pub fn info(&self) -> Info {
        Info {
            local_addr: self.socket.local_addr(),
            id: self.id,
        }
    }

    /// Non-stale neighbor addresses, suitable as bootstrap seeds.
    pub fn to_bootstrap(&self) -> Vec<SocketAddrV4> {
        self.routing_table.to_bootstrap()
    }

    // === Public Methods ===

    /// Advance every ongoing query, evict departed contacts, run periodic
    /// maintenance, and receive one message from the socket.
    pub fn tick(&mut self) -> RpcTickReport {
        let mut report = RpcTickReport::default();

        // === Tick ongoing lookups ===
        let socket = &mut self.socket;
        let done_lookups = self
            .queries
            .iter_mut()
            .filter_map(|(key, query)| {
                if query.tick(socket) {
                    Some(*key)
                } else {
                    None
                }
            })
            .collect::<Vec<_>>();

        for key in done_lookups {
            if let Some(query) = self.queries.remove(&key) {
                self.handle_done_query(query, &mut report);
            }
        }

        // === Tick store fan-outs ===
        let socket = &self.socket;
        let done_put_queries = &mut report.done_put_queries;
        self.put_queries.retain(|query| match query.tick(socket) {
            Some(stored_at) => {
                done_put_queries.push((query.key, stored_at > 0));
                false
            }
            None => true,
        });

        // === Evict contacts that stopped responding ===
        for expired in self.socket.take_expired() {
            if let Some(node_id) = expired.node_id {
                debug!(?node_id, "Request timed out, evicting node");
                self.routing_table.remove(&node_id);
            }
        }

        self.maintain();

        // === Receive and dispatch one message ===
        if let Some((message, from)) = self.socket.recv_from() {
            match &message.message_type {
                MessageType::Request(request) => {
                    // Welcome the requester; it just proved it can reach us.
                    self.routing_table.add(Node::new(message.sender_id, from));

                    self.handle_request(from, message.transaction_id, request);
                }
                MessageType::Response(_) => {
                    if self.welcome_on_response {
                        self.routing_table.add(Node::new(message.sender_id, from));
                    }

                    self.handle_response(from, &message);
                }
            }
        }

        report
    }

    /// Look a key up.
    ///
    /// Returns `Ok(Some(value))` when the value is in local storage. Returns
    /// `Ok(None)` after starting (or joining) a value lookup; the result
    /// arrives in a later tick's report.
    pub fn get(&mut self, key: Id) -> Result<Option<Value>> {
        if let Some(value) = self.storage.get(&key) {
            return Ok(Some(value.clone()));
        }

        if self.routing_table.is_empty() {
            return Err(Error::UnreachableNetwork);
        }

        self.query(key, RequestSpecific::FindValue { key });

        Ok(None)
    }

    /// Store a value under a key, on the closest nodes the network knows.
    ///
    /// Runs a node lookup for the key first; the store fan-out starts when
    /// the lookup finishes, and its outcome arrives in a later tick's report.
    pub fn put(&mut self, key: Id, value: Value) -> Result<()> {
        value.check_size()?;

        if let StorePolicy::Anywhere = self.store_policy {
            self.storage.set(key, value.clone());
        }

        if self.routing_table.is_empty() {
            return Err(Error::UnreachableNetwork);
        }

        self.pending_puts.insert(key, PutQuery::new(key, value));
        self.query(key, RequestSpecific::FindNode { target: key });

        Ok(())
    }

    /// Add seeds and (re)start a lookup for our own id to populate the
    /// routing table. Every newly supplied seed is contacted, even when the
    /// table already has contacts. Tolerates any subset of unreachable seeds.
    pub fn bootstrap(&mut self, seeds: Vec<String>) {
        let mut fresh = Vec::new();

        for seed in seeds {
            if !self.bootstrap.contains(&seed) {
                self.bootstrap.push(seed.clone());
                fresh.push(seed);
            }
        }

        let target = self.id;
        self.query_with_seeds(target, RequestSpecific::FindNode { target }, &fresh);
    }

    /// Snapshot this node's identity and neighbors to `path`.
    pub fn save_state(&self, path: &Path) -> Result<()> {
        NodeState {
            ksize: MAX_BUCKET_SIZE_K,
            alpha: ALPHA,
            id: self.id,
            neighbors: self.routing_table.to_bootstrap(),
        }
        .save(path)
    }

    // === Private Methods ===

    /// Send a request to closer and closer nodes until no closer ones are
    /// found.
    ///
    /// A lookup for a target that is already being looked up (by a lookup of
    /// the same kind) joins the ongoing query instead of starting another one.
    fn query(&mut self, target: Id, request: RequestSpecific) {
        self.query_with_seeds(target, request, &[]);
    }

    /// Same as [Rpc::query], additionally visiting `seeds` unconditionally,
    /// whether or not the routing table has closer candidates.
    fn query_with_seeds(&mut self, target: Id, request: RequestSpecific, seeds: &[String]) {
        let kind = LookupKind::of(&request);

        if let Some(query) = self.queries.get_mut(&(target, kind)) {
            // Steer the ongoing lookup at the new seeds too.
            for address in resolve(seeds) {
                query.visit_address(&mut self.socket, address);
            }

            return;
        }

        let mut query = IterativeQuery::new(target, request);

        let closest = self.routing_table.closest(&target);

        if closest.is_empty() {
            // Nothing in the table yet; open with every known seed.
            for address in resolve(&self.bootstrap) {
                query.visit_address(&mut self.socket, address);
            }
        } else {
            for node in closest.into_vec() {
                query.add_candidate(node)
            }
        }

        for address in resolve(seeds) {
            query.visit_address(&mut self.socket, address);
        }

        query.start(&mut self.socket);

        self.queries.insert((target, kind), query);
    }

    /// Start a lookup for our own id, seeding the routing table.
    fn populate(&mut self) {
        let target = self.id;
        self.query(target, RequestSpecific::FindNode { target });
    }

    fn handle_done_query(&mut self, query: IterativeQuery, report: &mut RpcTickReport) {
        let target = query.target();

        if let RequestSpecific::FindValue { .. } = query.request {
            let value = query.value().cloned();

            // Propagate a found value to the closest responder that lacked
            // it, biasing future lookups toward shorter paths. Fire and
            // forget.
            if let Some(value) = &value {
                if let Some(node) = query.closest_responder_without_value() {
                    self.socket.request(
                        node.address,
                        Some(node.id),
                        RequestSpecific::Store {
                            key: target,
                            value: value.clone(),
                        },
                    );
                }
            }

            report.done_get_queries.push((target, value));

            return;
        }

        if let Some(mut put_query) = self.pending_puts.remove(&target) {
            let closest = query.responders().nodes();
            let closest = &closest[..MAX_BUCKET_SIZE_K.min(closest.len())];

            if let StorePolicy::WhenCloser = self.store_policy {
                // Store locally only when we are closer to the key than the
                // farthest chosen replica.
                if let Some(farthest) = closest.last() {
                    if self.id.xor(&target) < farthest.id.xor(&target) {
                        self.storage.set(target, put_query.value.clone());
                    }
                }
            }

            if closest.is_empty() {
                report.done_put_queries.push((target, false));
            } else {
                put_query.start(&mut self.socket, closest);
                self.put_queries.push(put_query);
            }
        }

        if target == self.id {
            let table_size = self.routing_table.size();

            if table_size == 0 {
                error!("Could not bootstrap the routing table");
            } else {
                debug!(table_size, "Populated the routing table");
            }

            report.done_bootstrap = Some(table_size > 0);
        }
    }

    fn handle_request(
        &mut self,
        from: SocketAddrV4,
        transaction_id: u16,
        request: &RequestSpecific,
    ) {
        match request {
            RequestSpecific::Ping => {
                self.socket
                    .response(from, transaction_id, ResponseSpecific::Pong);
            }
            RequestSpecific::FindNode { target } => {
                self.socket.response(
                    from,
                    transaction_id,
                    ResponseSpecific::Nodes(self.routing_table.closest(target).into_vec()),
                );
            }
            RequestSpecific::FindValue { key } => {
                let response = match self.storage.get(key) {
                    Some(value) => ResponseSpecific::Value(value.clone()),
                    None => ResponseSpecific::Nodes(self.routing_table.closest(key).into_vec()),
                };

                self.socket.response(from, transaction_id, response);
            }
            RequestSpecific::Store { key, value } => {
                if value.check_size().is_err() {
                    debug!(?from, ?key, "Refusing to store oversized value");
                    return;
                }

                self.storage.set(*key, value.clone());
                self.socket
                    .response(from, transaction_id, ResponseSpecific::StoreAck);
            }
        }
    }

    fn handle_response(&mut self, from: SocketAddrV4, message: &Message) {
        let tid = message.transaction_id;

        // A store acknowledgment for one of the fan-outs?
        if let Some(query) = self.put_queries.iter_mut().find(|query| query.inflight(tid)) {
            if let MessageType::Response(ResponseSpecific::StoreAck) = message.message_type {
                query.success();
            }

            return;
        }

        if let Some(query) = self.queries.values_mut().find(|query| query.inflight(tid)) {
            let responder = Node::new(message.sender_id, from);

            match &message.message_type {
                MessageType::Response(ResponseSpecific::Nodes(nodes)) => {
                    for node in nodes {
                        // Other nodes may offer us ourselves as a candidate.
                        if node.id != self.id {
                            query.add_candidate(node.clone());
                        }
                    }

                    query.add_responding_node(responder);
                }
                MessageType::Response(ResponseSpecific::Value(value)) => {
                    query.add_value(responder, value.clone());
                }
                // Pong liveness is already accounted for by the routing table.
                _ => {}
            }
        }
    }

    fn maintain(&mut self) {
        if self.last_table_refresh.elapsed() > REFRESH_TABLE_INTERVAL {
            self.last_table_refresh = Instant::now();

            if self.routing_table.is_empty() {
                // Bootstrapping didn't take; try again.
                self.populate();
            } else {
                for target in self.routing_table.refresh_ids(REFRESH_TABLE_INTERVAL) {
                    self.query(target, RequestSpecific::FindNode { target });
                }
            }

            // Re-set aging entries so they drift toward whichever nodes are
            // currently closest, healing replication after churn.
            let aged = self
                .storage
                .iter_older_than(REPUBLISH_INTERVAL)
                .collect::<Vec<_>>();
            for (key, value) in aged {
                if let Err(e) = self.put(key, value) {
                    debug!(?key, ?e, "Failed to republish entry");
                }
            }
        }

        if self.last_table_ping.elapsed() > PING_TABLE_INTERVAL {
            self.last_table_ping = Instant::now();

            let mut to_remove = Vec::new();
            let mut to_ping = Vec::new();

            for node in self.routing_table.nodes() {
                if node.is_stale() {
                    to_remove.push(node.id);
                } else if node.should_ping() {
                    to_ping.push((node.id, node.address));
                }
            }

            for node_id in to_remove {
                self.routing_table.remove(&node_id);
            }
            for (node_id, address) in to_ping {
                self.socket
                    .request(address, Some(node_id), RequestSpecific::Ping);
            }
        }

        if let Some(path) = self.state_path.clone() {
            if self.last_state_save.elapsed() > SAVE_STATE_INTERVAL {
                self.last_state_save = Instant::now();

                // An empty neighbor list would clobber a useful snapshot.
                if !self.routing_table.is_empty() {
                    if let Err(e) = self.save_state(&path) {
                        debug!(?path, ?e, "Failed to save state snapshot");
                    }
                }
            }
        }
    }
}

/// Resolve `"<host>:<port>"` seed strings to IPv4 addresses, silently
/// skipping unresolvable hosts and IPv6 addresses.
fn resolve(seeds: &[String]) -> Vec<SocketAddrV4> {
    seeds
        .iter()
        .filter_map(|seed| seed.to_socket_addrs().ok())
        .flatten()
        .filter_map(|address| match address {
            SocketAddr::V4(address) => Some(address),
            SocketAddr::V6(_) => None,
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn get_prefers_local_storage() {
        let mut rpc = Rpc::new(&Config::default(), None).expect("binds");
        let key = Id::from_key("key");

        rpc.storage.set(key, Value::from("cached"));

        assert_eq!(rpc.get(key).expect("local"), Some(Value::from("cached")));
    }

    #[test]
    fn get_and_put_require_a_contact() {
        let mut rpc = Rpc::new(&Config::default(), None).expect("binds");
        let key = Id::from_key("key");

        assert!(matches!(rpc.get(key), Err(Error::UnreachableNetwork)));
        assert!(matches!(
            rpc.put(key, Value::from(42)),
            Err(Error::UnreachableNetwork)
        ));
    }

    #[test]
    fn put_anywhere_stores_locally_even_when_unreachable() {
        let mut rpc = Rpc::new(&Config::default(), None).expect("binds");
        let key = Id::from_key("key");

        assert!(rpc.put(key, Value::from(42)).is_err());
        assert_eq!(rpc.get(key).expect("local"), Some(Value::from(42)));
    }

    #[test]
    fn put_when_closer_defers_local_storage() {
        let config = Config {
            store_policy: StorePolicy::WhenCloser,
            ..Config::default()
        };
        let mut rpc = Rpc::new(&config, None).expect("binds");
        let key = Id::from_key("key");

        assert!(rpc.put(key, Value::from(42)).is_err());
        assert!(rpc.storage.is_empty());
        assert!(matches!(rpc.get(key), Err(Error::UnreachableNetwork)));
    }

    #[test]
    fn value_lookup_runs_beside_a_node_lookup_for_the_same_key() {
        let config = Config {
            store_policy: StorePolicy::WhenCloser,
            ..Config::default()
        };
        let mut rpc = Rpc::new(&config, None).expect("binds");
        let key = Id::from_key("key");

        rpc.routing_table
            .add(Node::new(Id::random(), SocketAddrV4::new([127, 0, 0, 1].into(), 1)));

        rpc.put(key, Value::from(42)).expect("starts a node lookup");
        assert_eq!(rpc.get(key).expect("starts a value lookup"), None);

        assert!(rpc.queries.contains_key(&(key, LookupKind::Node)));
        assert!(
            rpc.queries.contains_key(&(key, LookupKind::Value)),
            "a get during a store placement lookup still sends find_value"
        );
    }

    #[test]
    fn oversized_value_is_rejected_before_any_request() {
        let mut rpc = Rpc::new(&Config::default(), None).expect("binds");
        let key = Id::from_key("key");

        let value = Value::from(vec![0_u8; crate::common::MAX_VALUE_SIZE]);

        assert!(matches!(
            rpc.put(key, value),
            Err(Error::ValueTooLarge(_))
        ));
        assert!(rpc.get(key).is_err(), "nothing was stored locally");
    }
}
