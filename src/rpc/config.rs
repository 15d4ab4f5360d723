use std::path::PathBuf;
use std::time::Duration;

use crate::storage::DEFAULT_MAX_ENTRIES;

use super::socket::DEFAULT_REQUEST_TIMEOUT;

/// Where a `set` is allowed to place replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorePolicy {
    /// Store on every node the crawl visited, up to the replication factor.
    Anywhere,
    /// Store on a visited node only if it is closer to the key than the
    /// farthest of the current closest set, keeping replicas tight around
    /// the key.
    WhenCloser,
}

#[derive(Debug, Clone)]
/// Dht node configuration.
pub struct Config {
    /// Bootstrap nodes, as `"<host>:<port>"` strings.
    ///
    /// Defaults to an empty list; a node with no bootstrap nodes starts its
    /// own network.
    pub bootstrap: Vec<String>,
    /// Explicit port to listen on.
    ///
    /// Defaults to None (any available port).
    pub port: Option<u16>,
    /// UDP socket request timeout duration.
    ///
    /// The longer this duration is, the longer queries take until they are deemed "done".
    /// The shorter this duration is, the more responses from busy nodes we miss out on,
    /// which affects the accuracy of queries trying to find closest nodes to a target.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Replica placement policy for `set`.
    ///
    /// Defaults to [StorePolicy::Anywhere].
    pub store_policy: StorePolicy,
    /// Add nodes to the routing table when they respond to our requests,
    /// not only when they send us requests.
    ///
    /// Defaults to true. Disable to only learn about nodes that contact us,
    /// keeping the table limited to nodes that proved they can reach us.
    pub welcome_on_response: bool,
    /// Maximum number of stored values before the least recently set are
    /// evicted.
    ///
    /// Defaults to [DEFAULT_MAX_ENTRIES].
    pub max_storage_entries: usize,
    /// File to periodically snapshot the node's identity and neighbors to,
    /// for fast rejoin after a restart. See [crate::Dht::resume].
    ///
    /// Defaults to None (no persistence).
    pub state_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootstrap: Vec::new(),
            port: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            store_policy: StorePolicy::Anywhere,
            welcome_on_response: true,
            max_storage_entries: DEFAULT_MAX_ENTRIES,
            state_path: None,
        }
    }
}
