//! Messages exchanged on a replication connection.
//!
//! A connection goes through three phases, each with its own messages:
//!
//! ```text
//! Replica                                    Master
//!    │ ── HandshakeRequest ─────────────────► │  gates: group, protocol,
//!    │ ◄───────────────── HandshakeResponse ── │  log version, clock, duplicates
//!    │ ── SyncupRequest (tail fingerprints) ─► │
//!    │ ◄────────────── SyncupResponse ──────── │  matchpoint
//!    │ ◄──── Stream(Entry | Heartbeat) ─────── │  feeder output thread
//!    │ ── Stream(Ack) ──────────────────────► │  feeder input thread
//! ```

use keel_types::{MasterTerm, Vlsn, VlsnRange};
use serde::{Deserialize, Serialize};

use crate::handshake::{HandshakeRequest, HandshakeResponse};
use crate::log::LogRecord;

/// Top-level message carried in every frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Replica's opening message.
    HandshakeRequest(HandshakeRequest),
    /// Master's verdict on the handshake.
    HandshakeResponse(HandshakeResponse),
    /// Replica's log tail, sent after a successful handshake.
    SyncupRequest(SyncupRequest),
    /// Master's answer to the syncup.
    SyncupResponse(SyncupResponse),
    /// Log stream traffic.
    Stream(StreamMessage),
}

impl WireMessage {
    /// Returns the message name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            WireMessage::HandshakeRequest(_) => "HandshakeRequest",
            WireMessage::HandshakeResponse(_) => "HandshakeResponse",
            WireMessage::SyncupRequest(_) => "SyncupRequest",
            WireMessage::SyncupResponse(_) => "SyncupResponse",
            WireMessage::Stream(StreamMessage::Entry(_)) => "Entry",
            WireMessage::Stream(StreamMessage::Heartbeat(_)) => "Heartbeat",
            WireMessage::Stream(StreamMessage::Ack(_)) => "Ack",
            WireMessage::Stream(StreamMessage::Shutdown { .. }) => "Shutdown",
        }
    }
}

// ============================================================================
// Syncup
// ============================================================================

/// Identity of a log record, compared to find the matchpoint.
///
/// Two logs agree on a VLSN when both the term of the writing master and the
/// record checksum are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordFingerprint {
    /// Record VLSN.
    pub vlsn: Vlsn,
    /// Term of the master that wrote the record.
    pub term: MasterTerm,
    /// Record checksum.
    pub checksum: u32,
}

/// The replica's view of its own log, sent to locate the matchpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncupRequest {
    /// The replica's log range.
    pub range: VlsnRange,
    /// Highest VLSN the replica knows to be durable on a quorum.
    pub durable: Vlsn,
    /// Fingerprints of every record after `durable`, ascending.
    pub tail: Vec<RecordFingerprint>,
}

/// The master's answer to a syncup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncupResponse {
    /// Highest VLSN at which both logs hold the same record.
    pub matchpoint: Vlsn,
    /// The master's log range.
    pub master_range: VlsnRange,
}

// ============================================================================
// Stream
// ============================================================================

/// Master liveness and progress, sent when the stream is idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Term of the sending master.
    pub term: MasterTerm,
    /// Last VLSN in the master's log.
    pub master_vlsn: Vlsn,
    /// Highest VLSN durable on a quorum.
    pub durable_vlsn: Vlsn,
    /// Master wall clock.
    pub master_time_ms: u64,
}

/// Replica acknowledgment of everything up to `vlsn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Last VLSN durably applied on the replica.
    pub vlsn: Vlsn,
}

/// Messages of the log stream phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamMessage {
    /// One log record, already encoded in the negotiated format.
    Entry(LogRecord),
    /// Idle-time liveness.
    Heartbeat(Heartbeat),
    /// Replica acknowledgment.
    Ack(Ack),
    /// Orderly end of the stream.
    Shutdown { reason: String },
}
