//! In-process group network.
//!
//! Nodes register an [`Endpoint`] with a [`LocalNetwork`]; the network routes
//! election messages and join connections between them. Reachability can be
//! cut per node to exercise partitions: an isolated node can neither reach
//! nor be reached by any other node, for ballots and for new connections.
//! Streams that are already established are unaffected.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::{Arc, RwLock, Weak};

use keel_types::{MasterTerm, NodeIdentity, NodeName};
use tracing::{debug, info};

use crate::channel::{Channel, memory_channel_pair};
use crate::election::{
    AcceptRequest, AcceptResponse, ElectionResult, ElectionTransport, PromiseRequest,
    PromiseResponse,
};
use crate::{RepError, RepResult};

/// Default per-direction frame buffer of a connection.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// A node as seen by the network.
pub trait Endpoint: Send + Sync {
    /// Returns the node's identity.
    fn identity(&self) -> NodeIdentity;

    /// Handles a phase one ballot. `None` if the node does not vote.
    fn on_promise(&self, request: &PromiseRequest) -> Option<PromiseResponse>;

    /// Handles a phase two ballot. `None` if the node does not vote.
    fn on_accept(&self, request: &AcceptRequest) -> Option<AcceptResponse>;

    /// Learns an election result.
    fn on_announce(&self, result: &ElectionResult);

    /// Returns the master this node currently follows or is.
    fn current_master(&self) -> Option<(MasterTerm, NodeName)>;

    /// Accepts an inbound connection. Must not block on the peer.
    fn on_connect(&self, channel: Channel) -> RepResult<()>;
}

/// Routes messages between the nodes of one process.
pub struct LocalNetwork {
    endpoints: RwLock<BTreeMap<NodeName, Weak<dyn Endpoint>>>,
    isolated: RwLock<BTreeSet<NodeName>>,
    channel_capacity: usize,
}

impl std::fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNetwork")
            .field("nodes", &self.nodes())
            .field("isolated", &*self.isolated.read().expect("lock poisoned"))
            .finish()
    }
}

impl LocalNetwork {
    /// Creates an empty network.
    pub fn new() -> Arc<Self> {
        Self::with_channel_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates an empty network with the given per-connection buffer.
    pub fn with_channel_capacity(channel_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            endpoints: RwLock::new(BTreeMap::new()),
            isolated: RwLock::new(BTreeSet::new()),
            channel_capacity,
        })
    }

    /// Attaches a node. A node with the same name is replaced.
    pub fn register(&self, name: NodeName, endpoint: Weak<dyn Endpoint>) {
        debug!(node = %name, "endpoint registered");
        self.endpoints
            .write()
            .expect("lock poisoned")
            .insert(name, endpoint);
    }

    /// Detaches a node.
    pub fn unregister(&self, name: &NodeName) {
        debug!(node = %name, "endpoint unregistered");
        self.endpoints
            .write()
            .expect("lock poisoned")
            .remove(name);
    }

    /// Returns the names of the attached nodes.
    pub fn nodes(&self) -> Vec<NodeName> {
        self.endpoints
            .read()
            .expect("lock poisoned")
            .iter()
            .filter(|(_, endpoint)| endpoint.strong_count() > 0)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Cuts a node off from every other node.
    pub fn isolate(&self, name: &NodeName) {
        info!(node = %name, "node isolated");
        self.isolated
            .write()
            .expect("lock poisoned")
            .insert(name.clone());
    }

    /// Restores a node's reachability.
    pub fn heal(&self, name: &NodeName) {
        info!(node = %name, "node reachable again");
        self.isolated.write().expect("lock poisoned").remove(name);
    }

    /// Returns the endpoint `to` if `from` can reach it.
    fn reach(&self, from: &NodeName, to: &NodeName) -> Option<Arc<dyn Endpoint>> {
        if from != to {
            let isolated = self.isolated.read().expect("lock poisoned");
            if isolated.contains(from) || isolated.contains(to) {
                return None;
            }
        }
        self.endpoints
            .read()
            .expect("lock poisoned")
            .get(to)
            .and_then(Weak::upgrade)
    }

    /// Asks every reachable node for its master and returns the one with the
    /// highest term.
    pub fn find_master(&self, from: &NodeName) -> Option<(MasterTerm, NodeName)> {
        self.nodes()
            .iter()
            .filter(|name| *name != from)
            .filter_map(|name| self.reach(from, name))
            .filter_map(|endpoint| endpoint.current_master())
            .max_by_key(|(term, _)| *term)
    }

    /// Opens a connection from `from` to `to`.
    ///
    /// # Errors
    ///
    /// Returns a connection-refused [`RepError::Io`] when `to` is unreachable.
    pub fn connect(&self, from: &NodeIdentity, to: &NodeName) -> RepResult<Channel> {
        let endpoint = self.reach(&from.name, to).ok_or_else(|| {
            RepError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{to} is unreachable from {}", from.name),
            ))
        })?;
        let (local, remote) =
            memory_channel_pair(self.channel_capacity, from.name.as_str(), to.as_str());
        endpoint.on_connect(remote)?;
        Ok(local)
    }
}

impl ElectionTransport for LocalNetwork {
    fn promise(
        &self,
        from: &NodeName,
        to: &NodeName,
        request: &PromiseRequest,
    ) -> Option<PromiseResponse> {
        self.reach(from, to)?.on_promise(request)
    }

    fn accept(
        &self,
        from: &NodeName,
        to: &NodeName,
        request: &AcceptRequest,
    ) -> Option<AcceptResponse> {
        self.reach(from, to)?.on_accept(request)
    }

    fn announce(&self, from: &NodeName, to: &NodeName, result: &ElectionResult) {
        if let Some(endpoint) = self.reach(from, to) {
            endpoint.on_announce(result);
        }
    }
}
