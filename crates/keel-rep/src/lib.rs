//! # keel-rep: Replication group protocol for Keel
//!
//! This crate implements the high-availability layer of the Keel embedded
//! storage engine: a group of nodes holding replicas of the same ordered
//! transaction log, one of which is elected master and accepts writes while
//! the others trail as replicas.
//!
//! ## Architecture
//!
//! ```text
//!          Master                                   Replica
//! ┌──────────────────────┐                 ┌──────────────────────┐
//! │ commit()             │                 │ ensure_consistency() │
//! │   VlsnSequencer      │                 │   ConsistencyTracker │
//! │   ReplicationLog     │                 │          ▲           │
//! │        │             │   handshake     │          │           │
//! │        ▼             │◄───────────────►│     VlsnIndex        │
//! │   Feeder (per peer)  │   syncup        │          ▲           │
//! │   AckTracker         │   log stream    │     Replay thread    │
//! │                      │────────────────►│   (apply in order)   │
//! └──────────┬───────────┘                 └──────────┬───────────┘
//!            │          NodeStateMachine              │
//!            └───────── elections (promise/accept) ───┘
//! ```
//!
//! ## Key Components
//!
//! - [`vlsn`]: VLSN sequencer (master) and VLSN index (every node)
//! - [`handshake`]: Version, identity, clock and duplicate gates run before any data flows
//! - [`group`]: Arena membership table, mutated only through committed log records
//! - [`election`] / [`state`]: Master election and the per-handle state machine
//! - [`feeder`] / [`replay`]: The master-to-replica log stream
//! - [`consistency`]: Replica read consistency policies
//! - [`rollback`]: Hard recovery of a rejoining replica whose log diverged
//! - [`preemption`]: Invalidation of database handles by replicated naming operations
//! - [`node`]: [`RepNode`], the runtime wiring all of the above together
//!
//! ## Example
//!
//! ```ignore
//! use keel_rep::{LocalNetwork, NodeEnv, RepConfig, RepNode};
//!
//! let network = LocalNetwork::new();
//! let config = RepConfig::new("orders", identity).with_designated_primary(true);
//! let node = RepNode::open(config, NodeEnv::in_memory(), network)?;
//! node.await_active(Duration::from_secs(5))?;
//!
//! let token = node.commit(Bytes::from_static(b"txn"))?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use keel_types::{DatabaseName, GroupUuid, LogPosition, NodeName, NodeState, Vlsn};

pub mod channel;
pub mod clock;
pub mod config;
pub mod consistency;
pub mod election;
pub mod feeder;
pub mod framing;
pub mod group;
pub mod handshake;
pub mod log;
pub mod network;
pub mod node;
pub mod preemption;
pub mod protocol;
pub mod replay;
pub mod rollback;
pub mod state;
pub mod vlsn;

// Re-exports for convenient access
pub use channel::{Channel, FrameReceiver, FrameSender, TcpChannel, memory_channel_pair};
pub use clock::{Clock, ManualClock, SkewedClock, SystemClock};
pub use config::{Durability, FeederConfig, HandshakeConfig, RepConfig, TimeoutConfig};
pub use consistency::{
    ConsistencyPolicy, ConsistencyStats, ConsistencyTracker, PolicyKind, PolicyStats,
};
pub use election::{Acceptor, ElectionResult, ElectionTransport, Proposal, quorum_size};
pub use feeder::{AckTracker, FeederStats, StreamCounters, StreamStats};
pub use framing::{FrameDecoder, FrameEncoder, FramingError, HEADER_SIZE};
pub use group::{GroupChange, MemberRecord, RepGroup};
pub use handshake::{
    ConnectionRegistry, HandshakeRejection, HandshakeResult, LOG_VERSION,
    LOG_VERSION_REPLICATE_OLDER, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
    log_version_compatible,
};
pub use log::{
    ApplyError, LogApplier, LogError, LogRecord, MemoryLog, MemoryStore, RecordKind,
    ReplicationLog,
};
pub use network::{Endpoint, LocalNetwork};
pub use node::{NodeEnv, NodeStats, RepNode};
pub use preemption::{DatabaseHandle, NamingOp, PreemptionRegistry};
pub use protocol::{RecordFingerprint, StreamMessage, WireMessage};
pub use replay::ReplayStats;
pub use rollback::{RollbackPlan, plan_rollback};
pub use state::{
    ListenerError, NodeStateMachine, StateChangeEvent, StateChangeListener, Subscription,
};
pub use vlsn::{VlsnIndex, VlsnSequencer};

// ============================================================================
// Error Types
// ============================================================================

/// Errors surfaced by the replication layer.
#[derive(Debug, thiserror::Error)]
pub enum RepError {
    /// The peer's protocol version is outside the supported window.
    #[error(
        "protocol version mismatch: peer advertised {peer}, local supports {local_min}..={local_max}"
    )]
    ProtocolVersionMismatch {
        peer: u32,
        local_min: u32,
        local_max: u32,
    },

    /// The handshake was rejected for a reason other than the protocol version.
    #[error("handshake rejected: {0}")]
    Handshake(handshake::HandshakeRejection),

    /// Group identity mismatch on a node that has never joined a group.
    #[error("unexpected state: {0}")]
    UnexpectedState(String),

    /// Group identity mismatch on a node already bound to a group.
    #[error("unexpected state (fatal): {0}")]
    UnexpectedStateFatal(String),

    /// A consistency policy was not satisfied before its timeout.
    #[error("consistency policy {policy} not satisfied after {elapsed:?}")]
    ConsistencyTimeout {
        policy: consistency::ConsistencyPolicy,
        elapsed: Duration,
    },

    /// Rejoining requires truncating more committed transactions than allowed.
    #[error(
        "rollback prohibited: {transactions} committed transactions past matchpoint {matchpoint} \
         (limit {limit}); truncate the log at {position} to rejoin"
    )]
    RollbackProhibited {
        position: LogPosition,
        matchpoint: Vlsn,
        transactions: u64,
        limit: u64,
    },

    /// A database handle was invalidated by a replicated naming operation.
    #[error("database {database} was preempted by a replicated naming operation")]
    DatabasePreempted { database: DatabaseName },

    /// The environment was invalidated and must be closed.
    #[error("environment invalidated: {cause}")]
    EnvironmentInvalidated {
        #[source]
        cause: Arc<RepError>,
    },

    /// A write or admin operation was attempted on a node that is not master.
    #[error("not master (state {state}, master {master:?})")]
    NotMaster {
        state: NodeState,
        master: Option<NodeName>,
    },

    /// Too few electable replicas are connected to satisfy the durability policy.
    #[error("insufficient replicas: need {needed}, connected {connected}")]
    InsufficientReplicas { needed: usize, connected: usize },

    /// Replica acknowledgments did not arrive in time.
    #[error("insufficient acknowledgments for {vlsn}: need {needed}, got {got}")]
    InsufficientAcks { vlsn: Vlsn, needed: usize, got: usize },

    /// An election could not gather a quorum.
    #[error("quorum not reached: need {needed}, got {got}")]
    QuorumNotReached { needed: usize, got: usize },

    /// The incoming stream skipped VLSNs.
    #[error("vlsn gap: expected {expected}, got {actual}")]
    VlsnGap { expected: Vlsn, actual: Vlsn },

    /// The incoming stream repeated or reordered a VLSN.
    #[error("vlsn out of order: expected {expected}, got {actual}")]
    VlsnOutOfOrder { expected: Vlsn, actual: Vlsn },

    /// A record arrived in a log format newer than negotiated.
    #[error("record {vlsn} has log format {record}, negotiated {negotiated}")]
    LogFormatTooNew {
        vlsn: Vlsn,
        record: u32,
        negotiated: u32,
    },

    /// The named member is not part of the group.
    #[error("member not found: {0}")]
    MemberNotFound(NodeName),

    /// The membership change conflicts with an existing member.
    #[error("member conflict: {0}")]
    MemberConflict(String),

    /// A commit token from another group was supplied.
    #[error("commit token from group {token_group} used in group {group}")]
    InvalidCommitToken {
        token_group: GroupUuid,
        group: GroupUuid,
    },

    /// The state machine refused a transition.
    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition { from: NodeState, to: NodeState },

    /// A state change listener failed.
    #[error("state change listener failed: {0}")]
    Listener(#[from] state::ListenerError),

    /// The node did not become master or replica in time.
    #[error("node did not join the group within {waited:?}")]
    JoinTimeout { waited: Duration },

    /// The peer violated the stream protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The connection was closed.
    #[error("channel closed")]
    ChannelClosed,

    /// The environment was closed.
    #[error("environment closed")]
    Closed,

    /// Frame encoding or decoding failed.
    #[error("framing error: {0}")]
    Framing(#[from] framing::FramingError),

    /// The local log failed.
    #[error("log error: {0}")]
    Log(#[from] log::LogError),

    /// Applying a record to the store failed.
    #[error("apply error: {0}")]
    Apply(#[from] log::ApplyError),

    /// Network I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The operational category of a [`RepError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Group, identity or version mismatches. Never retried automatically.
    Configuration,
    /// Consistency policy timeouts. Retry with a longer timeout or a weaker policy.
    TransientConsistency,
    /// Local environment invalidation or loss of the group.
    NodeFailure,
    /// Divergent history that needs an explicit truncation.
    Divergence,
    /// Stale database handles.
    Preemption,
    /// Stream-level protocol violations and framing errors.
    Protocol,
    /// Transient network or storage errors.
    Io,
}

impl RepError {
    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RepError::ProtocolVersionMismatch { .. }
            | RepError::Handshake(_)
            | RepError::UnexpectedState(_)
            | RepError::UnexpectedStateFatal(_)
            | RepError::MemberNotFound(_)
            | RepError::MemberConflict(_)
            | RepError::InvalidCommitToken { .. } => ErrorKind::Configuration,
            RepError::ConsistencyTimeout { .. } => ErrorKind::TransientConsistency,
            RepError::RollbackProhibited { .. } => ErrorKind::Divergence,
            RepError::DatabasePreempted { .. } => ErrorKind::Preemption,
            RepError::EnvironmentInvalidated { cause } => match cause.kind() {
                ErrorKind::Divergence => ErrorKind::Divergence,
                _ => ErrorKind::NodeFailure,
            },
            RepError::NotMaster { .. }
            | RepError::InsufficientReplicas { .. }
            | RepError::InsufficientAcks { .. }
            | RepError::QuorumNotReached { .. }
            | RepError::InvalidTransition { .. }
            | RepError::Listener(_)
            | RepError::JoinTimeout { .. }
            | RepError::Closed => ErrorKind::NodeFailure,
            RepError::VlsnGap { .. }
            | RepError::VlsnOutOfOrder { .. }
            | RepError::LogFormatTooNew { .. }
            | RepError::ProtocolViolation(_)
            | RepError::Framing(_) => ErrorKind::Protocol,
            RepError::ChannelClosed | RepError::Log(_) | RepError::Apply(_) | RepError::Io(_) => {
                ErrorKind::Io
            }
        }
    }

    /// Returns true if retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransientConsistency | ErrorKind::Io
        )
    }

    /// Returns the innermost error behind any invalidation wrappers.
    pub fn root_cause(&self) -> &RepError {
        match self {
            RepError::EnvironmentInvalidated { cause } => cause.root_cause(),
            other => other,
        }
    }

    /// Maps a wire-level rejection onto the caller-facing taxonomy.
    ///
    /// `bound_to_group` is true when the local node already belongs to a
    /// group, which turns a group identity mismatch into a fatal error.
    pub(crate) fn from_rejection(
        rejection: handshake::HandshakeRejection,
        bound_to_group: bool,
    ) -> Self {
        use handshake::HandshakeRejection as R;
        match rejection {
            R::ProtocolVersion {
                peer,
                local_min,
                local_max,
            } => RepError::ProtocolVersionMismatch {
                peer,
                local_min,
                local_max,
            },
            R::GroupNameMismatch { .. } if bound_to_group => {
                RepError::UnexpectedStateFatal(rejection.to_string())
            }
            R::GroupNameMismatch { .. } => RepError::UnexpectedState(rejection.to_string()),
            R::GroupUuidMismatch { .. } => RepError::UnexpectedStateFatal(rejection.to_string()),
            other => RepError::Handshake(other),
        }
    }
}

/// Result type for replication operations.
pub type RepResult<T> = Result<T, RepError>;

#[cfg(test)]
mod tests;
