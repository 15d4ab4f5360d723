//! Dht node handle and its actor thread.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::thread;

use flume::{Receiver, Sender, TryRecvError};
use tracing::debug;

use crate::common::{Id, Value, MAX_BUCKET_SIZE_K};
use crate::rpc::{Config, Info, Rpc, ALPHA};
use crate::state::NodeState;
use crate::{Error, Result};

/// A clonable handle to a DHT node.
///
/// The node itself lives on a dedicated actor thread that owns the socket,
/// routing table and storage; handles talk to it over channels. The thread
/// stops when [Dht::shutdown] is called or the last handle is dropped.
#[derive(Debug, Clone)]
pub struct Dht {
    sender: Sender<ActorMessage>,
}

impl Dht {
    /// Create a new DHT node, binding its UDP socket and spawning its actor
    /// thread. Bootstrapping starts immediately if the config carries seeds.
    pub fn new(config: Config) -> Result<Dht> {
        Dht::with_id(config, None)
    }

    /// Reconstruct a node from a state snapshot written by [Dht::save_state]:
    /// same identity, persisted neighbors as additional bootstrap seeds.
    ///
    /// A missing or corrupt snapshot is a recoverable error; fall back to
    /// [Dht::new] with a fresh identity.
    pub fn resume(path: &Path, mut config: Config) -> Result<Dht> {
        let state = NodeState::load(path)?;

        if state.ksize != MAX_BUCKET_SIZE_K || state.alpha != ALPHA {
            debug!(
                ksize = state.ksize,
                alpha = state.alpha,
                "Snapshot was taken with different parameters"
            );
        }

        config
            .bootstrap
            .extend(state.neighbors.iter().map(|address| address.to_string()));

        Dht::with_id(config, Some(state.id))
    }

    // === Getters ===

    /// This node's identity and listening address.
    pub fn info(&self) -> Result<Info> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::Info(sender))
            .map_err(|_| Error::Shutdown)?;

        receiver.recv().map_err(|_| Error::Shutdown)
    }

    /// The address the node's socket is listening on.
    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        self.info().map(|info| info.local_addr())
    }

    /// This node's [Id].
    pub fn id(&self) -> Result<Id> {
        self.info().map(|info| info.id())
    }

    /// Non-stale neighbor addresses, suitable as bootstrap seeds for another
    /// node.
    pub fn to_bootstrap(&self) -> Result<Vec<SocketAddrV4>> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::ToBootstrap(sender))
            .map_err(|_| Error::Shutdown)?;

        receiver.recv().map_err(|_| Error::Shutdown)
    }

    // === Public Methods ===

    /// Ping the seeds and run a lookup for our own id to populate the routing
    /// table, blocking until the lookup finishes.
    ///
    /// Fails soft: returns `Ok(true)` if the table ended up populated, no
    /// matter how many seeds were unreachable, and `Ok(false)` if none
    /// responded (the node stays listening; `get`/`set` will return
    /// [Error::UnreachableNetwork] until a contact appears).
    pub fn bootstrap(&self, seeds: &[SocketAddrV4]) -> Result<bool> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::Bootstrap(
                seeds.iter().map(|address| address.to_string()).collect(),
                sender,
            ))
            .map_err(|_| Error::Shutdown)?;

        receiver.recv().map_err(|_| Error::Shutdown)
    }

    /// Look a key up, locally first, then through a value lookup across the
    /// network. Blocks until the value is found or the lookup exhausts the
    /// closest nodes.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.get_key(Id::from_key(key))
    }

    /// Same as [Dht::get] for a key already mapped into the Id space.
    pub fn get_key(&self, key: Id) -> Result<Option<Value>> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::Get(key, sender))
            .map_err(|_| Error::Shutdown)?;

        receiver.recv().map_err(|_| Error::Shutdown)?
    }

    /// Store a value on the nodes closest to the key's digest. Blocks until
    /// the store fan-out finishes; returns `Ok(true)` iff at least one remote
    /// node acknowledged the store.
    pub fn set<V: Into<Value>>(&self, key: &str, value: V) -> Result<bool> {
        self.set_key(Id::from_key(key), value.into())
    }

    /// Same as [Dht::set] for a key already mapped into the Id space.
    pub fn set_key(&self, key: Id, value: Value) -> Result<bool> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::Put(key, value, sender))
            .map_err(|_| Error::Shutdown)?;

        receiver.recv().map_err(|_| Error::Shutdown)?
    }

    /// Snapshot this node's identity and neighbors to `path`, atomically.
    pub fn save_state(&self, path: &Path) -> Result<()> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::SaveState(path.to_path_buf(), sender))
            .map_err(|_| Error::Shutdown)?;

        receiver.recv().map_err(|_| Error::Shutdown)?
    }

    /// Stop the actor thread. Blocks until it acknowledges.
    pub fn shutdown(&self) {
        let (sender, receiver) = flume::bounded(1);

        let _ = self.sender.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv();
    }

    // === Private Methods ===

    fn with_id(config: Config, id: Option<Id>) -> Result<Dht> {
        let (sender, receiver) = flume::unbounded();
        let (ready_sender, ready_receiver) = flume::bounded(1);

        thread::Builder::new()
            .name("kadstore actor".into())
            .spawn(move || match Rpc::new(&config, id) {
                Ok(mut rpc) => {
                    let _ = ready_sender.send(Ok(()));
                    run(&mut rpc, &receiver);
                }
                Err(error) => {
                    let _ = ready_sender.send(Err(error));
                }
            })?;

        ready_receiver.recv().map_err(|_| Error::Shutdown)??;

        Ok(Dht { sender })
    }
}

fn run(rpc: &mut Rpc, receiver: &Receiver<ActorMessage>) {
    let mut get_senders: HashMap<Id, Vec<Sender<Result<Option<Value>>>>> = HashMap::new();
    let mut put_senders: HashMap<Id, Vec<Sender<Result<bool>>>> = HashMap::new();
    let mut bootstrap_senders: Vec<Sender<bool>> = Vec::new();

    loop {
        match receiver.try_recv() {
            Ok(message) => match message {
                ActorMessage::Shutdown(sender) => {
                    let _ = sender.send(());
                    break;
                }
                ActorMessage::Info(sender) => {
                    let _ = sender.send(rpc.info());
                }
                ActorMessage::ToBootstrap(sender) => {
                    let _ = sender.send(rpc.to_bootstrap());
                }
                ActorMessage::SaveState(path, sender) => {
                    let _ = sender.send(rpc.save_state(&path));
                }
                ActorMessage::Bootstrap(seeds, sender) => {
                    rpc.bootstrap(seeds);
                    bootstrap_senders.push(sender);
                }
                ActorMessage::Get(key, sender) => match rpc.get(key) {
                    // Local storage fast path.
                    Ok(Some(value)) => {
                        let _ = sender.send(Ok(Some(value)));
                    }
                    // A lookup was started or joined.
                    Ok(None) => get_senders.entry(key).or_default().push(sender),
                    Err(error) => {
                        let _ = sender.send(Err(error));
                    }
                },
                ActorMessage::Put(key, value, sender) => match rpc.put(key, value) {
                    Ok(()) => put_senders.entry(key).or_default().push(sender),
                    Err(error) => {
                        let _ = sender.send(Err(error));
                    }
                },
            },
            Err(TryRecvError::Disconnected) => {
                debug!("Last Dht handle was dropped, actor thread exiting");
                break;
            }
            Err(TryRecvError::Empty) => {}
        }

        let report = rpc.tick();

        for (key, value) in report.done_get_queries {
            if let Some(senders) = get_senders.remove(&key) {
                for sender in senders {
                    let _ = sender.send(Ok(value.clone()));
                }
            }
        }

        for (key, stored) in report.done_put_queries {
            if let Some(senders) = put_senders.remove(&key) {
                for sender in senders {
                    let _ = sender.send(Ok(stored));
                }
            }
        }

        if let Some(populated) = report.done_bootstrap {
            for sender in bootstrap_senders.drain(..) {
                let _ = sender.send(populated);
            }
        }
    }
}

enum ActorMessage {
    Info(Sender<Info>),
    ToBootstrap(Sender<Vec<SocketAddrV4>>),
    Bootstrap(Vec<String>, Sender<bool>),
    Get(Id, Sender<Result<Option<Value>>>),
    Put(Id, Value, Sender<Result<bool>>),
    SaveState(PathBuf, Sender<Result<()>>),
    Shutdown(Sender<()>),
}

/// A network of interconnected local DHT nodes, for tests.
///
/// Every node after the first bootstraps against the first; construction
/// blocks until each node's bootstrap lookup finishes.
pub struct Testnet {
    pub bootstrap: Vec<SocketAddrV4>,
    pub nodes: Vec<Dht>,
}

impl Testnet {
    pub fn new(count: usize) -> Result<Testnet> {
        let mut nodes = Vec::with_capacity(count);
        let mut bootstrap = Vec::new();

        for i in 0..count {
            let node = Dht::new(Config::default())?;

            if i == 0 {
                bootstrap.push(SocketAddrV4::new(
                    Ipv4Addr::UNSPECIFIED,
                    node.local_addr()?.port(),
                ));
            } else {
                node.bootstrap(&bootstrap)?;
            }

            nodes.push(node);
        }

        Ok(Testnet { bootstrap, nodes })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shutdown() {
        let dht = Dht::new(Config::default()).expect("binds");

        assert!(dht.info().is_ok());

        dht.shutdown();

        assert!(matches!(dht.info(), Err(Error::Shutdown)));
    }

    #[test]
    fn clones_share_one_node() {
        let dht = Dht::new(Config::default()).expect("binds");
        let clone = dht.clone();

        assert_eq!(
            dht.id().expect("id"),
            clone.id().expect("id"),
            "a clone is a handle to the same node"
        );
    }

    #[test]
    fn get_on_lonely_node_is_unreachable() {
        let dht = Dht::new(Config::default()).expect("binds");

        assert!(matches!(
            dht.get("anything"),
            Err(Error::UnreachableNetwork)
        ));
    }
}
