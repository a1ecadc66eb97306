//! # keel-types: Core types for Keel replication
//!
//! This crate contains the value types shared by every layer of a Keel
//! replication group:
//!
//! - [`Vlsn`] / [`VlsnRange`] - Replicated log sequence numbers
//! - [`GroupUuid`] / [`CommitToken`] - Cross-node transaction rendezvous points
//! - [`NodeName`], [`NodeId`], [`NodeType`], [`NodeAddress`], [`NodeIdentity`] - Membership identity
//! - [`NodeState`] - The per-handle replication state
//! - [`MasterTerm`] - The election term that produced a master
//! - [`LogPosition`] - A (file, offset) location in the local log
//! - [`DatabaseName`] - The name of a replicated database
//!
//! Everything here is plain data: `Copy` where the value is small, serde
//! serializable so it can cross the wire inside handshake and stream frames.

use std::cmp::Ordering;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// VLSN - Copy (8-byte value)
// ============================================================================

/// Version/log sequence number of a replicated log record.
///
/// VLSNs are assigned by the master, one per record durably appended to its
/// log, and are dense: a continuous history segment has no gaps. The value
/// zero is reserved as the [`Vlsn::NULL`] sentinel for records that were
/// never replicated (local-only or pre-replication history).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Vlsn(u64);

impl Vlsn {
    /// The unassigned sentinel.
    pub const NULL: Vlsn = Vlsn(0);

    /// The first VLSN ever handed out in a group.
    pub const FIRST: Vlsn = Vlsn(1);

    /// Creates a VLSN from its raw value.
    pub fn new(vlsn: u64) -> Self {
        Self(vlsn)
    }

    /// Returns the VLSN as a `u64`.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns true if this is the unassigned sentinel.
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Returns the next VLSN.
    pub fn next(&self) -> Self {
        Vlsn(self.0.saturating_add(1))
    }

    /// Returns the previous VLSN, saturating at [`Vlsn::NULL`].
    pub fn prev(&self) -> Self {
        Vlsn(self.0.saturating_sub(1))
    }

    /// Returns the number of VLSNs between self and `other`.
    ///
    /// Returns 0 if `other` is not ahead of self.
    pub fn distance_to(&self, other: Vlsn) -> u64 {
        other.0.saturating_sub(self.0)
    }
}

impl Display for Vlsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "vlsn#null")
        } else {
            write!(f, "vlsn#{}", self.0)
        }
    }
}

impl From<u64> for Vlsn {
    fn from(vlsn: u64) -> Self {
        Self(vlsn)
    }
}

impl From<Vlsn> for u64 {
    fn from(vlsn: Vlsn) -> Self {
        vlsn.0
    }
}

// ============================================================================
// VLSN Range
// ============================================================================

/// The `[first, last]` VLSNs known to a node.
///
/// Both bounds are [`Vlsn::NULL`] when the node has no replicated history.
/// `first` may also be NULL while `last` is set, for a node whose files were
/// copied without their VLSN index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct VlsnRange {
    first: Vlsn,
    last: Vlsn,
}

impl VlsnRange {
    /// The range of a node without replicated history.
    pub const EMPTY: VlsnRange = VlsnRange {
        first: Vlsn::NULL,
        last: Vlsn::NULL,
    };

    /// Creates a range.
    ///
    /// # Panics
    ///
    /// Debug builds panic if `first` is set and greater than `last`.
    pub fn new(first: Vlsn, last: Vlsn) -> Self {
        debug_assert!(
            first.is_null() || first <= last,
            "range first {first} beyond last {last}"
        );
        Self { first, last }
    }

    /// Returns the first known VLSN (may be NULL).
    pub fn first(&self) -> Vlsn {
        self.first
    }

    /// Returns the last known VLSN.
    pub fn last(&self) -> Vlsn {
        self.last
    }

    /// Returns true if the range holds no VLSNs.
    pub fn is_empty(&self) -> bool {
        self.last.is_null()
    }

    /// Returns true if `vlsn` lies inside the range.
    pub fn contains(&self, vlsn: Vlsn) -> bool {
        !vlsn.is_null() && !self.is_empty() && vlsn >= self.first && vlsn <= self.last
    }

    /// Returns the range with its upper bound moved to `last`.
    ///
    /// A range that was empty starts at `last`.
    pub fn extend_to(&self, last: Vlsn) -> Self {
        let first = if self.is_empty() { last } else { self.first };
        Self::new(first, last)
    }

    /// Returns the range cut back so that nothing above `last` remains.
    pub fn truncate_to(&self, last: Vlsn) -> Self {
        if last.is_null() || (!self.first.is_null() && last < self.first) {
            return Self::EMPTY;
        }
        Self::new(self.first, last.min(self.last))
    }
}

impl Display for VlsnRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.first, self.last)
    }
}

// ============================================================================
// Group UUID and Commit Token
// ============================================================================

/// Unique identifier of a replication group.
///
/// Generated once when the group is first formed and persisted by every
/// member. Two groups that happen to share a name never share a UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupUuid(Uuid);

impl GroupUuid {
    /// Generates a fresh random group UUID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Display for GroupUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a committed transaction within a specific group.
///
/// Returned by the master when a transaction commits and later handed to a
/// commit-point consistency policy on any node of the same group. Tokens from
/// different groups are not comparable: `partial_cmp` returns `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitToken {
    group_uuid: GroupUuid,
    vlsn: Vlsn,
}

impl CommitToken {
    /// Creates a token for `vlsn` in the group `group_uuid`.
    pub fn new(group_uuid: GroupUuid, vlsn: Vlsn) -> Self {
        debug_assert!(!vlsn.is_null(), "commit token requires an assigned vlsn");
        Self { group_uuid, vlsn }
    }

    /// Returns the group this token belongs to.
    pub fn group_uuid(&self) -> GroupUuid {
        self.group_uuid
    }

    /// Returns the committed VLSN.
    pub fn vlsn(&self) -> Vlsn {
        self.vlsn
    }
}

impl PartialOrd for CommitToken {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.group_uuid != other.group_uuid {
            return None;
        }
        Some(self.vlsn.cmp(&other.vlsn))
    }
}

impl Display for CommitToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.vlsn, self.group_uuid)
    }
}

// ============================================================================
// Node Identity
// ============================================================================

/// Maximum length of a node name in bytes.
pub const MAX_NODE_NAME_LEN: usize = 64;

/// Errors produced when validating names.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    /// The name was empty.
    #[error("name must not be empty")]
    Empty,

    /// The name exceeds the maximum length.
    #[error("name too long: {len} bytes (max {max})")]
    TooLong { len: usize, max: usize },

    /// The name contains a character that is not allowed.
    #[error("invalid character {ch:?} in name")]
    InvalidCharacter { ch: char },
}

/// The unique name of a node within a group.
///
/// Names are the primary key of the membership table. They are non-empty,
/// at most [`MAX_NODE_NAME_LEN`] bytes, and contain no whitespace or control
/// characters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeName(String);

impl NodeName {
    /// Validates and creates a node name.
    pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(NameError::Empty);
        }
        if name.len() > MAX_NODE_NAME_LEN {
            return Err(NameError::TooLong {
                len: name.len(),
                max: MAX_NODE_NAME_LEN,
            });
        }
        if let Some(ch) = name.chars().find(|c| c.is_whitespace() || c.is_control()) {
            return Err(NameError::InvalidCharacter { ch });
        }
        Ok(Self(name))
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for NodeName {
    type Error = NameError;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        Self::new(name)
    }
}

impl TryFrom<&str> for NodeName {
    type Error = NameError;

    fn try_from(name: &str) -> Result<Self, Self::Error> {
        Self::new(name)
    }
}

impl From<NodeName> for String {
    fn from(name: NodeName) -> Self {
        name.0
    }
}

/// Numeric node identifier, assigned by the group when a member is added.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeId(u32);

impl NodeId {
    /// Id used by nodes that have not been assigned one yet.
    pub const UNASSIGNED: NodeId = NodeId(0);

    /// Creates a node id.
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the id as a `u32`.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Returns the next id.
    pub fn next(&self) -> Self {
        NodeId(self.0.saturating_add(1))
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

/// The role a node plays in the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    /// Holds data, votes in elections, and may become master.
    Electable,
    /// Votes are not cast; only tracks the current master for routing.
    Monitor,
    /// Holds data but never votes or becomes master. Not persisted in the group.
    Secondary,
}

impl NodeType {
    /// Returns true if the node participates in elections and durability quorums.
    pub fn is_electable(&self) -> bool {
        matches!(self, NodeType::Electable)
    }

    /// Returns true if the node hosts a replicated environment.
    pub fn is_data_node(&self) -> bool {
        matches!(self, NodeType::Electable | NodeType::Secondary)
    }

    /// Returns true if membership of this node type is committed to the log.
    pub fn is_persistent(&self) -> bool {
        matches!(self, NodeType::Electable | NodeType::Monitor)
    }
}

impl Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::Electable => write!(f, "Electable"),
            NodeType::Monitor => write!(f, "Monitor"),
            NodeType::Secondary => write!(f, "Secondary"),
        }
    }
}

/// The `host:port` a node listens on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    host: String,
    port: u16,
}

impl NodeAddress {
    /// Creates an address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Returns the host part.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The immutable identity of a group member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Unique name within the group.
    pub name: NodeName,
    /// Numeric id assigned by the group.
    pub id: NodeId,
    /// Role of the node.
    pub node_type: NodeType,
    /// Listening address.
    pub address: NodeAddress,
}

impl NodeIdentity {
    /// Creates an identity without an assigned id.
    pub fn new(name: NodeName, node_type: NodeType, address: NodeAddress) -> Self {
        Self {
            name,
            id: NodeId::UNASSIGNED,
            node_type,
            address,
        }
    }

    /// Returns the identity with the given id.
    pub fn with_id(mut self, id: NodeId) -> Self {
        self.id = id;
        self
    }

    /// Returns true if `other` describes the same node, ignoring the id.
    pub fn same_node(&self, other: &NodeIdentity) -> bool {
        self.name == other.name
            && self.node_type == other.node_type
            && self.address == other.address
    }
}

impl Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}, {}, {})",
            self.name, self.id, self.node_type, self.address
        )
    }
}

// ============================================================================
// Node State
// ============================================================================

/// Replication state of a node handle.
///
/// Every handle starts in `Unknown` and ends in `Detached`. `Master` and
/// `Replica` are entered from `Unknown` and fall back to it on failure.
/// `Detached` is only reachable from `Unknown`, so an active handle steps
/// down before it closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum NodeState {
    /// Not currently part of an active group; electing or joining.
    #[default]
    Unknown,
    /// Accepting writes and feeding replicas.
    Master,
    /// Applying the master's log stream.
    Replica,
    /// Closed. Terminal.
    Detached,
}

impl NodeState {
    /// Returns true if this is the master state.
    pub fn is_master(&self) -> bool {
        matches!(self, NodeState::Master)
    }

    /// Returns true if this is the replica state.
    pub fn is_replica(&self) -> bool {
        matches!(self, NodeState::Replica)
    }

    /// Returns true if the node is an active group participant.
    pub fn is_active(&self) -> bool {
        matches!(self, NodeState::Master | NodeState::Replica)
    }

    /// Returns true if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Detached)
    }

    /// Returns true if a handle may move from `self` to `next`.
    pub fn can_transition_to(&self, next: NodeState) -> bool {
        match (self, next) {
            (NodeState::Unknown, NodeState::Master | NodeState::Replica | NodeState::Detached) => {
                true
            }
            (NodeState::Master | NodeState::Replica, NodeState::Unknown) => true,
            _ => false,
        }
    }
}

impl Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Unknown => write!(f, "UNKNOWN"),
            NodeState::Master => write!(f, "MASTER"),
            NodeState::Replica => write!(f, "REPLICA"),
            NodeState::Detached => write!(f, "DETACHED"),
        }
    }
}

// ============================================================================
// Master Term - Copy (8-byte value)
// ============================================================================

/// Election term.
///
/// Each election round runs under a term strictly higher than any the
/// proposer has seen. The term of the elected master is stamped onto every
/// record it writes, which lets a rejoining node tell records of two
/// different masters apart even when their VLSNs coincide.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct MasterTerm(u64);

impl MasterTerm {
    /// The term before any election.
    pub const ZERO: MasterTerm = MasterTerm(0);

    /// Creates a term.
    pub fn new(term: u64) -> Self {
        Self(term)
    }

    /// Returns the term as a `u64`.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the next term.
    pub fn next(&self) -> Self {
        MasterTerm(self.0.saturating_add(1))
    }
}

impl Display for MasterTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

// ============================================================================
// Log Position
// ============================================================================

/// A location in a node's local log: the segment file number and the byte
/// offset of a record within it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct LogPosition {
    /// Segment file number.
    pub file: u32,
    /// Byte offset within the file.
    pub offset: u64,
}

impl LogPosition {
    /// Creates a position.
    pub fn new(file: u32, offset: u64) -> Self {
        Self { file, offset }
    }
}

impl Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}/0x{:x}", self.file, self.offset)
    }
}

// ============================================================================
// Database Name
// ============================================================================

/// Name of a replicated database inside an environment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatabaseName(String);

impl DatabaseName {
    /// Creates a database name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DatabaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DatabaseName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

#[cfg(test)]
mod tests;
