//! Replication node configuration.
//!
//! This module defines the configuration for one node of a replication
//! group: its identity and group, election and durability parameters, the
//! default consistency policy, and protocol timeouts.

use std::time::Duration;

use keel_types::NodeIdentity;
use serde::{Deserialize, Serialize};

use crate::consistency::ConsistencyPolicy;
use crate::election::quorum_size;
use crate::handshake::{LOG_VERSION, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};

// ============================================================================
// Node Configuration
// ============================================================================

/// Configuration for a replication node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepConfig {
    /// Name of the group this node belongs to. Must match every peer exactly.
    pub group_name: String,

    /// This node's identity.
    pub node: NodeIdentity,

    /// Whether this node may bootstrap a new group on its own. Elections in
    /// an existing group still need a quorum.
    pub designated_primary: bool,

    /// Election priority. Used to break ties between equally current nodes.
    pub priority: u32,

    /// Acknowledgment policy for commits on the master.
    pub durability: Durability,

    /// Consistency policy applied when neither the transaction nor the
    /// cursor supplies one.
    pub default_consistency: ConsistencyPolicy,

    /// Number of committed transactions a rejoining replica may roll back
    /// without operator intervention.
    pub txn_rollback_limit: u64,

    /// Maximum clock difference tolerated between two nodes at handshake.
    pub max_clock_delta: Duration,

    /// Protocol timeouts.
    pub timeouts: TimeoutConfig,

    /// Versions advertised during the handshake.
    pub handshake: HandshakeConfig,

    /// Feeder tuning.
    pub feeder: FeederConfig,
}

impl RepConfig {
    /// Creates a configuration with production defaults.
    pub fn new(group_name: impl Into<String>, node: NodeIdentity) -> Self {
        Self {
            group_name: group_name.into(),
            node,
            designated_primary: false,
            priority: 1,
            durability: Durability::SimpleMajority,
            default_consistency: ConsistencyPolicy::NoConsistencyRequired,
            txn_rollback_limit: 10,
            max_clock_delta: Duration::from_secs(2),
            timeouts: TimeoutConfig::default(),
            handshake: HandshakeConfig::default(),
            feeder: FeederConfig::default(),
        }
    }

    /// Sets the designated-primary flag.
    pub fn with_designated_primary(mut self, designated_primary: bool) -> Self {
        self.designated_primary = designated_primary;
        self
    }

    /// Sets the election priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the commit durability policy.
    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    /// Sets the environment-wide consistency policy.
    pub fn with_consistency(mut self, policy: ConsistencyPolicy) -> Self {
        self.default_consistency = policy;
        self
    }

    /// Sets the rollback allowance.
    pub fn with_rollback_limit(mut self, limit: u64) -> Self {
        self.txn_rollback_limit = limit;
        self
    }

    /// Sets the maximum tolerated clock skew.
    pub fn with_max_clock_delta(mut self, delta: Duration) -> Self {
        self.max_clock_delta = delta;
        self
    }

    /// Sets the timeout configuration.
    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Sets the handshake configuration.
    pub fn with_handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = handshake;
        self
    }

    /// Sets the feeder configuration.
    pub fn with_feeder(mut self, feeder: FeederConfig) -> Self {
        self.feeder = feeder;
        self
    }
}

// ============================================================================
// Durability
// ============================================================================

/// How many replica acknowledgments a commit waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Durability {
    /// Do not wait for replicas.
    None,
    /// Wait until a quorum of electable nodes (master included) has the record.
    SimpleMajority,
    /// Wait for every electable replica.
    All,
}

impl Durability {
    /// Returns the number of replica acknowledgments required in a group
    /// with `electable` electable members. The master's own copy is not
    /// counted as an acknowledgment.
    pub fn required_acks(&self, electable: usize) -> usize {
        match self {
            Durability::None => 0,
            Durability::SimpleMajority => quorum_size(electable).saturating_sub(1),
            Durability::All => electable.saturating_sub(1),
        }
    }
}

// ============================================================================
// Timeout Configuration
// ============================================================================

/// Timeout configuration for the replication protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Interval between feeder heartbeats on an idle stream.
    pub heartbeat_interval: Duration,

    /// Silence after which a replica declares its master lost, and a feeder
    /// declares its replica lost.
    ///
    /// Should be several heartbeat intervals to ride out scheduling jitter.
    pub heartbeat_timeout: Duration,

    /// Base back-off between election attempts. The actual delay is drawn
    /// uniformly from `[base, 2 * base]`.
    pub election_backoff: Duration,

    /// Maximum time to wait for a handshake or syncup reply.
    pub handshake_timeout: Duration,

    /// Maximum time a commit waits for replica acknowledgments.
    pub replica_ack_timeout: Duration,

    /// How often the node driver re-evaluates its role while idle.
    pub driver_tick: Duration,
}

impl TimeoutConfig {
    /// Creates timeout configuration suitable for production.
    pub fn production() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(5),
            election_backoff: Duration::from_millis(500),
            handshake_timeout: Duration::from_secs(10),
            replica_ack_timeout: Duration::from_secs(5),
            driver_tick: Duration::from_millis(100),
        }
    }

    /// Creates timeout configuration suitable for local development.
    pub fn development() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(250),
            heartbeat_timeout: Duration::from_secs(1),
            election_backoff: Duration::from_millis(100),
            handshake_timeout: Duration::from_secs(2),
            replica_ack_timeout: Duration::from_secs(2),
            driver_tick: Duration::from_millis(20),
        }
    }

    /// Creates timeout configuration for in-process tests.
    pub fn testing() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(20),
            heartbeat_timeout: Duration::from_millis(300),
            election_backoff: Duration::from_millis(15),
            handshake_timeout: Duration::from_secs(2),
            replica_ack_timeout: Duration::from_secs(2),
            driver_tick: Duration::from_millis(5),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self::production()
    }
}

// ============================================================================
// Handshake Configuration
// ============================================================================

/// Versions a node advertises during the handshake.
///
/// Production nodes use the defaults. Tests override individual fields to
/// exercise the compatibility gates without touching any global state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// Highest protocol version this node speaks.
    pub protocol_version: u32,

    /// Lowest protocol version this node accepts from a peer.
    pub min_protocol_version: u32,

    /// Log format version written by this node.
    pub log_version: u32,
}

impl HandshakeConfig {
    /// Overrides the advertised protocol version.
    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    /// Overrides the advertised log version.
    pub fn with_log_version(mut self, version: u32) -> Self {
        self.log_version = version;
        self
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            min_protocol_version: MIN_PROTOCOL_VERSION,
            log_version: LOG_VERSION,
        }
    }
}

// ============================================================================
// Feeder Configuration
// ============================================================================

/// Tuning for the master-side feeder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeederConfig {
    /// Maximum records read from the log per batch.
    pub batch_size: usize,

    /// Capacity of in-process channels, in frames.
    pub channel_capacity: usize,
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            channel_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_acks_exclude_master() {
        assert_eq!(Durability::SimpleMajority.required_acks(1), 0);
        assert_eq!(Durability::SimpleMajority.required_acks(2), 1);
        assert_eq!(Durability::SimpleMajority.required_acks(3), 1);
        assert_eq!(Durability::SimpleMajority.required_acks(5), 2);
    }

    #[test]
    fn all_and_none_acks() {
        assert_eq!(Durability::All.required_acks(3), 2);
        assert_eq!(Durability::All.required_acks(1), 0);
        assert_eq!(Durability::None.required_acks(7), 0);
    }

    #[test]
    fn timeout_presets_keep_heartbeat_below_timeout() {
        for timeouts in [
            TimeoutConfig::production(),
            TimeoutConfig::development(),
            TimeoutConfig::testing(),
        ] {
            assert!(timeouts.heartbeat_interval * 3 <= timeouts.heartbeat_timeout);
        }
    }
}
