//! Connection handshake.
//!
//! Before any log data flows, the replica introduces itself and the master
//! runs five hard gates, in order. The first failing gate rejects the
//! connection with a typed [`HandshakeRejection`] and nothing is persisted.
//!
//! ```text
//! Replica                                  Master
//!   │ ── HandshakeRequest ───────────────────► │ 1. group name / uuid
//!   │    group, node, versions, clock          │ 2. protocol version
//!   │                                          │ 3. log format window
//!   │                                          │ 4. clock skew
//!   │                                          │ 5. duplicates, removed members
//!   │ ◄─────────────── Accepted | Rejected ─── │
//!   │ re-checks clock skew, group uuid,        │
//!   │ protocol and log window                  │
//! ```
//!
//! The gates are a pure function ([`evaluate`]) over a snapshot of the
//! group, so no group lock is held while waiting on the network.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keel_types::{GroupUuid, MasterTerm, NodeAddress, NodeId, NodeIdentity, NodeName};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::clock::Clock;
use crate::config::HandshakeConfig;
use crate::group::{AddOutcome, RepGroup};
use crate::protocol::WireMessage;
use crate::{RepError, RepResult};

// ============================================================================
// Versions
// ============================================================================

/// Lowest protocol version this implementation can speak.
pub const MIN_PROTOCOL_VERSION: u32 = 3;

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 7;

/// Current log format version.
pub const LOG_VERSION: u32 = 17;

/// First log version able to re-encode its records for a replica one
/// version behind.
pub const LOG_VERSION_REPLICATE_OLDER: u32 = 9;

#[derive(Debug, Clone, Copy)]
enum LogWindow {
    Accept,
    AcceptFromFeeder(u32),
}

/// Accepted `feeder - replica` log version differences. Anything not listed
/// is rejected.
const LOG_VERSION_TABLE: &[(i64, LogWindow)] = &[
    (0, LogWindow::Accept),
    (1, LogWindow::AcceptFromFeeder(LOG_VERSION_REPLICATE_OLDER)),
    (-1, LogWindow::Accept),
];

/// Returns true if a replica on log version `replica` can be fed by a
/// master on log version `feeder`.
pub fn log_version_compatible(replica: u32, feeder: u32) -> bool {
    let delta = i64::from(feeder) - i64::from(replica);
    LOG_VERSION_TABLE
        .iter()
        .find(|(d, _)| *d == delta)
        .is_some_and(|(_, window)| match window {
            LogWindow::Accept => true,
            LogWindow::AcceptFromFeeder(min) => feeder >= *min,
        })
}

// ============================================================================
// Wire Messages
// ============================================================================

/// The replica's opening message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Group the replica is configured for.
    pub group_name: String,
    /// Group the replica already belongs to, if any.
    pub group_uuid: Option<GroupUuid>,
    /// The replica's identity. The id is unassigned on first join.
    pub node: NodeIdentity,
    /// Highest protocol version the replica speaks.
    pub protocol_version: u32,
    /// The replica's log format version.
    pub log_version: u32,
    /// Replica wall clock, in epoch milliseconds.
    pub clock_ms: u64,
}

/// Contents of an accepted handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAccept {
    /// The group's identity.
    pub group_uuid: GroupUuid,
    /// Negotiated protocol version.
    pub protocol_version: u32,
    /// The master's own log version.
    pub feeder_log_version: u32,
    /// Log version every streamed record will be encoded in.
    pub log_version: u32,
    /// The master's identity.
    pub master: NodeIdentity,
    /// The master's term.
    pub term: MasterTerm,
    /// Master wall clock, in epoch milliseconds.
    pub clock_ms: u64,
    /// The replica's identity as recorded by the group.
    pub node: NodeIdentity,
}

/// The master's verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeResponse {
    /// The connection is trusted.
    Accepted(HandshakeAccept),
    /// The connection is refused.
    Rejected(HandshakeRejection),
}

/// Why a handshake was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum HandshakeRejection {
    /// The peer is configured for another group.
    #[error("group name mismatch: local {local:?}, peer {peer:?}")]
    GroupNameMismatch { local: String, peer: String },

    /// The peer belongs to a different incarnation of the group.
    #[error("group uuid mismatch: local {local}, peer {peer}")]
    GroupUuidMismatch { local: GroupUuid, peer: GroupUuid },

    /// The peer's protocol version is not supported.
    #[error("protocol version {peer} outside supported {local_min}..={local_max}")]
    ProtocolVersion {
        peer: u32,
        local_min: u32,
        local_max: u32,
    },

    /// The two log formats cannot be streamed between.
    #[error("log version incompatible: replica {replica}, feeder {feeder}")]
    LogVersionIncompatible { replica: u32, feeder: u32 },

    /// The two clocks disagree by more than the configured bound.
    #[error("clock skew of {skew_ms}ms exceeds {max_ms}ms")]
    ClockSkew { skew_ms: i64, max_ms: u64 },

    /// A connection for this node name is already live.
    #[error("node {name} is already connected")]
    DuplicateNode { name: NodeName },

    /// A connection from this address is already live.
    #[error("address {address} is already connected as {holder}")]
    DuplicateAddress {
        address: NodeAddress,
        holder: NodeName,
    },

    /// The node was removed from the group.
    #[error("node {name} was removed from the group")]
    RemovedMember { name: NodeName },

    /// The node's identity conflicts with a recorded member.
    #[error("member conflict: {detail}")]
    MemberConflict { detail: String },

    /// The contacted node is not the master.
    #[error("not master (master is {master:?})")]
    NotMaster { master: Option<NodeName> },
}

/// Outcome of a successful handshake, as seen by the replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResult {
    /// Negotiated protocol version.
    pub protocol_version: u32,
    /// Log version of every record the replica will receive.
    pub log_version: u32,
    /// The group's identity.
    pub group_uuid: GroupUuid,
    /// The master.
    pub peer: NodeIdentity,
    /// Id the group assigned to the replica.
    pub node_id: NodeId,
    /// The master's term.
    pub term: MasterTerm,
}

// ============================================================================
// Connection Registry
// ============================================================================

/// Live replica connections on a master, keyed by node name and address.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    live: Mutex<BTreeMap<NodeName, NodeAddress>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks that neither the name nor the address is connected.
    pub fn check(&self, identity: &NodeIdentity) -> Result<(), HandshakeRejection> {
        let live = self.live.lock().expect("lock poisoned");
        check_live(&live, identity)
    }

    /// Records a connection. The returned guard unregisters it when dropped.
    pub fn register(
        self: &Arc<Self>,
        identity: &NodeIdentity,
    ) -> Result<ConnectionGuard, HandshakeRejection> {
        let mut live = self.live.lock().expect("lock poisoned");
        check_live(&live, identity)?;
        live.insert(identity.name.clone(), identity.address.clone());
        debug!(node = %identity.name, address = %identity.address, "connection registered");
        Ok(ConnectionGuard {
            registry: Arc::clone(self),
            name: identity.name.clone(),
        })
    }

    /// Forgets a connection. Returns true if it was registered.
    pub fn unregister(&self, name: &NodeName) -> bool {
        self.live
            .lock()
            .expect("lock poisoned")
            .remove(name)
            .is_some()
    }

    /// Returns true if `name` is connected.
    pub fn is_connected(&self, name: &NodeName) -> bool {
        self.live.lock().expect("lock poisoned").contains_key(name)
    }

    /// Returns the connected node names.
    pub fn connected(&self) -> Vec<NodeName> {
        self.live
            .lock()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

fn check_live(
    live: &BTreeMap<NodeName, NodeAddress>,
    identity: &NodeIdentity,
) -> Result<(), HandshakeRejection> {
    if live.contains_key(&identity.name) {
        return Err(HandshakeRejection::DuplicateNode {
            name: identity.name.clone(),
        });
    }
    if let Some((holder, _)) = live.iter().find(|(_, addr)| **addr == identity.address) {
        return Err(HandshakeRejection::DuplicateAddress {
            address: identity.address.clone(),
            holder: holder.clone(),
        });
    }
    Ok(())
}

/// Keeps a connection registered while alive.
#[derive(Debug)]
pub struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    name: NodeName,
}

impl ConnectionGuard {
    /// Returns the registered node name.
    pub fn name(&self) -> &NodeName {
        &self.name
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.name);
    }
}

// ============================================================================
// Master Side
// ============================================================================

/// What the master knows when judging a handshake.
#[derive(Debug, Clone, Copy)]
pub struct MasterView<'a> {
    /// Configured group name.
    pub group_name: &'a str,
    /// Snapshot of the group table.
    pub group: &'a RepGroup,
    /// The master's identity.
    pub master: &'a NodeIdentity,
    /// The master's term.
    pub term: MasterTerm,
    /// Versions the master advertises.
    pub config: &'a HandshakeConfig,
    /// Tolerated clock skew.
    pub max_clock_delta: Duration,
    /// Master wall clock.
    pub now_ms: u64,
}

/// A request that passed every gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Negotiated protocol version.
    pub protocol_version: u32,
    /// Log version records will be sent in.
    pub log_version: u32,
    /// Whether the node is new to the group.
    pub membership: AddOutcome,
}

impl Admission {
    /// Returns the replica's identity with its group-assigned id.
    pub fn identity(&self) -> &NodeIdentity {
        match &self.membership {
            AddOutcome::Added(identity) | AddOutcome::AlreadyMember(identity) => identity,
        }
    }
}

/// Runs the five gates against a request.
pub fn evaluate(
    request: &HandshakeRequest,
    view: &MasterView<'_>,
    registry: &ConnectionRegistry,
) -> Result<Admission, HandshakeRejection> {
    // 1. Group identity.
    if request.group_name != view.group_name {
        return Err(HandshakeRejection::GroupNameMismatch {
            local: view.group_name.to_string(),
            peer: request.group_name.clone(),
        });
    }
    if let Some(peer) = request.group_uuid {
        if peer != view.group.uuid() {
            return Err(HandshakeRejection::GroupUuidMismatch {
                local: view.group.uuid(),
                peer,
            });
        }
    }

    // 2. Protocol version.
    let protocol_version = negotiate_protocol(view.config, request.protocol_version)?;

    // 3. Log format.
    if !log_version_compatible(request.log_version, view.config.log_version) {
        return Err(HandshakeRejection::LogVersionIncompatible {
            replica: request.log_version,
            feeder: view.config.log_version,
        });
    }
    let log_version = request.log_version.min(view.config.log_version);

    // 4. Clock skew.
    check_skew(view.now_ms, request.clock_ms, view.max_clock_delta)?;

    // 5. Duplicates and revoked identities.
    let node = &request.node;
    if view.group.is_removed(&node.name) {
        return Err(HandshakeRejection::RemovedMember {
            name: node.name.clone(),
        });
    }
    if node.name == view.master.name {
        return Err(HandshakeRejection::DuplicateNode {
            name: node.name.clone(),
        });
    }
    if node.address == view.master.address {
        return Err(HandshakeRejection::DuplicateAddress {
            address: node.address.clone(),
            holder: view.master.name.clone(),
        });
    }
    registry.check(node)?;
    let membership = view
        .group
        .validate_add(node)
        .map_err(|e| HandshakeRejection::MemberConflict {
            detail: e.to_string(),
        })?;

    Ok(Admission {
        protocol_version,
        log_version,
        membership,
    })
}

/// Builds the acceptance sent back to the replica.
pub fn accept(admission: &Admission, view: &MasterView<'_>) -> HandshakeResponse {
    HandshakeResponse::Accepted(HandshakeAccept {
        group_uuid: view.group.uuid(),
        protocol_version: admission.protocol_version,
        feeder_log_version: view.config.log_version,
        log_version: admission.log_version,
        master: view.master.clone(),
        term: view.term,
        clock_ms: view.now_ms,
        node: admission.identity().clone(),
    })
}

/// Waits for a replica's opening message.
pub fn recv_request(channel: &mut Channel, timeout: Duration) -> RepResult<HandshakeRequest> {
    match channel.recv_within(timeout)? {
        WireMessage::HandshakeRequest(request) => Ok(request),
        other => Err(RepError::ProtocolViolation(format!(
            "expected HandshakeRequest, got {}",
            other.name()
        ))),
    }
}

/// Sends a rejection and closes the channel.
pub fn reject(channel: &mut Channel, rejection: HandshakeRejection) {
    warn!(peer = %channel.peer, reason = %rejection, "handshake rejected");
    // The peer may have hung up already.
    let _ = channel.send(&WireMessage::HandshakeResponse(HandshakeResponse::Rejected(
        rejection,
    )));
    channel.close();
}

fn negotiate_protocol(config: &HandshakeConfig, peer: u32) -> Result<u32, HandshakeRejection> {
    let negotiated = config.protocol_version.min(peer);
    if peer < config.min_protocol_version || negotiated < config.min_protocol_version {
        return Err(HandshakeRejection::ProtocolVersion {
            peer,
            local_min: config.min_protocol_version,
            local_max: config.protocol_version,
        });
    }
    Ok(negotiated)
}

fn check_skew(local_ms: u64, peer_ms: u64, max: Duration) -> Result<(), HandshakeRejection> {
    let skew_ms = i64::try_from(i128::from(local_ms) - i128::from(peer_ms)).unwrap_or(i64::MAX);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if skew_ms.unsigned_abs() > max_ms {
        return Err(HandshakeRejection::ClockSkew { skew_ms, max_ms });
    }
    Ok(())
}

// ============================================================================
// Replica Side
// ============================================================================

/// What a joining replica advertises.
#[derive(Debug, Clone, Copy)]
pub struct ReplicaHello<'a> {
    /// Configured group name.
    pub group_name: &'a str,
    /// Group the node is already bound to.
    pub group_uuid: Option<GroupUuid>,
    /// The node's identity.
    pub node: &'a NodeIdentity,
    /// Advertised versions.
    pub config: &'a HandshakeConfig,
    /// Tolerated clock skew.
    pub max_clock_delta: Duration,
    /// The node's clock.
    pub clock: &'a dyn Clock,
}

/// Runs the replica side of the handshake.
///
/// # Errors
///
/// A rejection from the master is mapped onto [`RepError`]; group mismatches
/// are fatal when the node is already bound to a group. The replica runs the
/// clock, group, protocol and log gates again on the master's answer.
pub fn initiate(
    channel: &mut Channel,
    hello: &ReplicaHello<'_>,
    timeout: Duration,
) -> RepResult<HandshakeResult> {
    let bound = hello.group_uuid.is_some();
    channel.send(&WireMessage::HandshakeRequest(HandshakeRequest {
        group_name: hello.group_name.to_string(),
        group_uuid: hello.group_uuid,
        node: hello.node.clone(),
        protocol_version: hello.config.protocol_version,
        log_version: hello.config.log_version,
        clock_ms: hello.clock.now_ms(),
    }))?;

    let accept = match channel.recv_within(timeout)? {
        WireMessage::HandshakeResponse(HandshakeResponse::Accepted(accept)) => accept,
        WireMessage::HandshakeResponse(HandshakeResponse::Rejected(rejection)) => {
            warn!(peer = %channel.peer, reason = %rejection, "handshake refused by master");
            return Err(RepError::from_rejection(rejection, bound));
        }
        other => {
            return Err(RepError::ProtocolViolation(format!(
                "expected HandshakeResponse, got {}",
                other.name()
            )));
        }
    };

    let recheck = || -> Result<(), HandshakeRejection> {
        if let Some(local) = hello.group_uuid {
            if local != accept.group_uuid {
                return Err(HandshakeRejection::GroupUuidMismatch {
                    local,
                    peer: accept.group_uuid,
                });
            }
        }
        if accept.protocol_version < hello.config.min_protocol_version
            || accept.protocol_version > hello.config.protocol_version
        {
            return Err(HandshakeRejection::ProtocolVersion {
                peer: accept.protocol_version,
                local_min: hello.config.min_protocol_version,
                local_max: hello.config.protocol_version,
            });
        }
        if !log_version_compatible(hello.config.log_version, accept.feeder_log_version)
            || accept.log_version > hello.config.log_version
        {
            return Err(HandshakeRejection::LogVersionIncompatible {
                replica: hello.config.log_version,
                feeder: accept.feeder_log_version,
            });
        }
        check_skew(hello.clock.now_ms(), accept.clock_ms, hello.max_clock_delta)
    };
    if let Err(rejection) = recheck() {
        warn!(peer = %channel.peer, reason = %rejection, "master failed replica-side handshake checks");
        channel.close();
        return Err(RepError::from_rejection(rejection, bound));
    }

    debug!(
        master = %accept.master.name,
        protocol = accept.protocol_version,
        log = accept.log_version,
        "handshake complete"
    );
    Ok(HandshakeResult {
        protocol_version: accept.protocol_version,
        log_version: accept.log_version,
        group_uuid: accept.group_uuid,
        peer: accept.master,
        node_id: accept.node.id,
        term: accept.term,
    })
}
