//! The replicated log and the store it is applied to.
//!
//! The storage engine owns the on-disk log and the data store. The
//! replication layer only sees them through two traits:
//!
//! - [`ReplicationLog`]: a durable, sequentially appendable log of
//!   [`LogRecord`]s that can be read from any VLSN and truncated at a
//!   [`LogPosition`]
//! - [`LogApplier`]: applies a replicated record to the data store
//!
//! [`MemoryLog`] and [`MemoryStore`] are the in-process implementations used
//! by embedded deployments without persistence and by the test suite.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Mutex, RwLock};

use bytes::Bytes;
use keel_types::{LogPosition, MasterTerm, Vlsn, VlsnRange};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::framing::FramingError;
use crate::protocol::RecordFingerprint;
use crate::{RepError, RepResult};

/// Bytes of per-record framing counted in addition to the payload when
/// laying records out in segment files.
pub const RECORD_HEADER_SIZE: u64 = 48;

/// Default size of a [`MemoryLog`] segment file.
pub const DEFAULT_SEGMENT_SIZE: u64 = 1024 * 1024;

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by a [`ReplicationLog`].
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// An appended record does not directly follow the last record.
    #[error("log not contiguous: expected {expected}, got {actual}")]
    NotContiguous { expected: Vlsn, actual: Vlsn },

    /// A stored record failed its checksum.
    #[error("checksum mismatch for {vlsn}")]
    ChecksumMismatch { vlsn: Vlsn },

    /// A record without a VLSN was appended.
    #[error("record has no vlsn")]
    Unassigned,

    /// Underlying storage failure.
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error raised by a [`LogApplier`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ApplyError {
    message: String,
}

impl ApplyError {
    /// Creates an apply error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

// ============================================================================
// Log Record
// ============================================================================

/// What a replicated record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    /// A committed user transaction. The payload is opaque to replication.
    Commit,
    /// An aborted transaction. Nothing is applied.
    Abort,
    /// A committed membership change; the payload is a [`crate::GroupChange`].
    Membership,
    /// A committed database naming operation; the payload is a [`crate::NamingOp`].
    Naming,
}

impl RecordKind {
    /// Returns true if the record commits a transaction.
    pub fn is_commit(&self) -> bool {
        !matches!(self, RecordKind::Abort)
    }
}

/// One record of the replicated log.
///
/// # Invariants
///
/// - `vlsn` is assigned by the master and never NULL
/// - `checksum` covers every field except `format_version` and itself, so a
///   record re-encoded to an older format keeps its fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Position in the replicated history.
    pub vlsn: Vlsn,
    /// Term of the master that wrote the record.
    pub term: MasterTerm,
    /// Record kind.
    pub kind: RecordKind,
    /// Log format version the record is encoded in.
    pub format_version: u32,
    /// Master wall-clock time at commit, in epoch milliseconds.
    pub commit_time_ms: u64,
    /// Record body.
    pub payload: Bytes,
    /// CRC32 of the record.
    pub checksum: u32,
}

impl LogRecord {
    /// Creates a record. The checksum is computed automatically.
    pub fn new(
        vlsn: Vlsn,
        term: MasterTerm,
        kind: RecordKind,
        format_version: u32,
        commit_time_ms: u64,
        payload: Bytes,
    ) -> Self {
        let mut record = Self {
            vlsn,
            term,
            kind,
            format_version,
            commit_time_ms,
            payload,
            checksum: 0,
        };
        record.checksum = record.compute_checksum();
        record
    }

    fn compute_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.vlsn.as_u64().to_le_bytes());
        hasher.update(&self.term.as_u64().to_le_bytes());
        hasher.update(&[match self.kind {
            RecordKind::Commit => 0,
            RecordKind::Abort => 1,
            RecordKind::Membership => 2,
            RecordKind::Naming => 3,
        }]);
        hasher.update(&self.commit_time_ms.to_le_bytes());
        hasher.update(&self.payload);
        hasher.finalize()
    }

    /// Verifies the record's checksum.
    pub fn verify_checksum(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    /// Returns the identity of the record used to find a matchpoint.
    pub fn fingerprint(&self) -> RecordFingerprint {
        RecordFingerprint {
            vlsn: self.vlsn,
            term: self.term,
            checksum: self.checksum,
        }
    }

    /// Returns the record re-encoded in `version` when it was written in a
    /// newer format, unchanged otherwise.
    pub fn downgrade_to(&self, version: u32) -> LogRecord {
        let mut record = self.clone();
        if record.format_version > version {
            record.format_version = version;
        }
        record
    }

    /// Creates a record whose body is a bincode-encoded value, as used by
    /// membership and naming records.
    pub fn structured<T: Serialize>(
        vlsn: Vlsn,
        term: MasterTerm,
        kind: RecordKind,
        format_version: u32,
        commit_time_ms: u64,
        body: &T,
    ) -> RepResult<Self> {
        let payload = bincode::serialize(body)
            .map_err(|e| RepError::Framing(FramingError::Serialize(e.to_string())))?;
        Ok(Self::new(
            vlsn,
            term,
            kind,
            format_version,
            commit_time_ms,
            Bytes::from(payload),
        ))
    }

    /// Decodes a structured record body.
    pub fn decode_body<T: DeserializeOwned>(&self) -> RepResult<T> {
        bincode::deserialize(&self.payload).map_err(|e| {
            RepError::ProtocolViolation(format!(
                "undecodable {:?} record {}: {e}",
                self.kind, self.vlsn
            ))
        })
    }

    /// Returns the number of bytes the record occupies in a segment file.
    pub fn encoded_len(&self) -> u64 {
        RECORD_HEADER_SIZE + u64::try_from(self.payload.len()).unwrap_or(u64::MAX)
    }
}

// ============================================================================
// Log Trait
// ============================================================================

/// A node's durable replicated log.
///
/// Implementations are shared between the commit or replay path (the single
/// writer) and any number of feeders reading concurrently.
pub trait ReplicationLog: Send + Sync + Debug {
    /// Appends a record directly after the last one and returns its position.
    fn append(&self, record: LogRecord) -> Result<LogPosition, LogError>;

    /// Reads up to `max` records starting at `from`.
    fn read_from(&self, from: Vlsn, max: usize) -> Result<Vec<LogRecord>, LogError>;

    /// Returns the record with the given VLSN.
    fn record_at(&self, vlsn: Vlsn) -> Result<Option<LogRecord>, LogError>;

    /// Returns the position of the record with the given VLSN.
    fn position_of(&self, vlsn: Vlsn) -> Result<Option<LogPosition>, LogError>;

    /// Returns the VLSN range held by the log.
    fn range(&self) -> VlsnRange;

    /// Discards the record at `position` and everything after it, returning
    /// the number of records removed.
    fn truncate_from(&self, position: LogPosition) -> Result<u64, LogError>;

    /// Persists the highest VLSN known to be durable on a quorum.
    fn mark_durable(&self, vlsn: Vlsn) -> Result<(), LogError>;

    /// Returns the highest VLSN marked durable.
    fn durable_vlsn(&self) -> Vlsn;

    /// Returns every record after `vlsn`.
    fn tail_after(&self, vlsn: Vlsn) -> Result<Vec<LogRecord>, LogError> {
        self.read_from(vlsn.next(), usize::MAX)
    }
}

/// Applies replicated records to the data store.
pub trait LogApplier: Send + Sync + Debug {
    /// Applies one committed record. Must be atomic: either every effect of
    /// the record is visible afterwards or none is.
    fn apply(&self, record: &LogRecord) -> Result<(), ApplyError>;

    /// Discards the effects of every record after `matchpoint`.
    fn rolled_back(&self, matchpoint: Vlsn) -> Result<(), ApplyError>;
}

// ============================================================================
// Memory Log
// ============================================================================

#[derive(Debug)]
struct StoredRecord {
    position: LogPosition,
    record: LogRecord,
}

#[derive(Debug)]
struct MemoryLogState {
    records: Vec<StoredRecord>,
    next_position: LogPosition,
    durable: Vlsn,
}

/// An in-memory log laid out in numbered segment files.
#[derive(Debug)]
pub struct MemoryLog {
    segment_size: u64,
    state: RwLock<MemoryLogState>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    /// Creates an empty log with the default segment size.
    pub fn new() -> Self {
        Self::with_segment_size(DEFAULT_SEGMENT_SIZE)
    }

    /// Creates an empty log with a custom segment size.
    pub fn with_segment_size(segment_size: u64) -> Self {
        debug_assert!(segment_size > RECORD_HEADER_SIZE, "segment too small");
        Self {
            segment_size,
            state: RwLock::new(MemoryLogState {
                records: Vec::new(),
                next_position: LogPosition::new(0, 0),
                durable: Vlsn::NULL,
            }),
        }
    }

    /// Returns the number of records in the log.
    pub fn len(&self) -> usize {
        self.state.read().expect("lock poisoned").records.len()
    }

    /// Returns true if the log holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn index_of(records: &[StoredRecord], vlsn: Vlsn) -> Option<usize> {
        let first = records.first()?.record.vlsn;
        if vlsn < first {
            return None;
        }
        let index = usize::try_from(vlsn.as_u64() - first.as_u64()).ok()?;
        (index < records.len()).then_some(index)
    }
}

impl ReplicationLog for MemoryLog {
    fn append(&self, record: LogRecord) -> Result<LogPosition, LogError> {
        if record.vlsn.is_null() {
            return Err(LogError::Unassigned);
        }
        let mut state = self.state.write().expect("lock poisoned");
        if let Some(last) = state.records.last() {
            let expected = last.record.vlsn.next();
            if record.vlsn != expected {
                return Err(LogError::NotContiguous {
                    expected,
                    actual: record.vlsn,
                });
            }
        }

        let len = record.encoded_len();
        let mut position = state.next_position;
        if position.offset > 0 && position.offset + len > self.segment_size {
            position = LogPosition::new(position.file + 1, 0);
        }
        state.next_position = LogPosition::new(position.file, position.offset + len);
        state.records.push(StoredRecord { position, record });
        Ok(position)
    }

    fn read_from(&self, from: Vlsn, max: usize) -> Result<Vec<LogRecord>, LogError> {
        let state = self.state.read().expect("lock poisoned");
        let start = match state.records.first() {
            Some(first) if from <= first.record.vlsn => 0,
            Some(_) => match Self::index_of(&state.records, from) {
                Some(index) => index,
                None => return Ok(Vec::new()),
            },
            None => return Ok(Vec::new()),
        };
        state.records[start..]
            .iter()
            .take(max)
            .map(|stored| {
                if stored.record.verify_checksum() {
                    Ok(stored.record.clone())
                } else {
                    Err(LogError::ChecksumMismatch {
                        vlsn: stored.record.vlsn,
                    })
                }
            })
            .collect()
    }

    fn record_at(&self, vlsn: Vlsn) -> Result<Option<LogRecord>, LogError> {
        let state = self.state.read().expect("lock poisoned");
        Ok(Self::index_of(&state.records, vlsn).map(|i| state.records[i].record.clone()))
    }

    fn position_of(&self, vlsn: Vlsn) -> Result<Option<LogPosition>, LogError> {
        let state = self.state.read().expect("lock poisoned");
        Ok(Self::index_of(&state.records, vlsn).map(|i| state.records[i].position))
    }

    fn range(&self) -> VlsnRange {
        let state = self.state.read().expect("lock poisoned");
        match (state.records.first(), state.records.last()) {
            (Some(first), Some(last)) => VlsnRange::new(first.record.vlsn, last.record.vlsn),
            _ => VlsnRange::EMPTY,
        }
    }

    fn truncate_from(&self, position: LogPosition) -> Result<u64, LogError> {
        let mut state = self.state.write().expect("lock poisoned");
        let keep = state
            .records
            .iter()
            .position(|stored| stored.position >= position)
            .unwrap_or(state.records.len());
        let removed = u64::try_from(state.records.len() - keep).unwrap_or(u64::MAX);
        state.records.truncate(keep);
        state.next_position = state
            .records
            .last()
            .map_or(position.min(state.next_position), |stored| {
                LogPosition::new(
                    stored.position.file,
                    stored.position.offset + stored.record.encoded_len(),
                )
            });
        let last = state
            .records
            .last()
            .map_or(Vlsn::NULL, |stored| stored.record.vlsn);
        state.durable = state.durable.min(last);
        Ok(removed)
    }

    fn mark_durable(&self, vlsn: Vlsn) -> Result<(), LogError> {
        let mut state = self.state.write().expect("lock poisoned");
        if vlsn > state.durable {
            state.durable = vlsn;
        }
        Ok(())
    }

    fn durable_vlsn(&self) -> Vlsn {
        self.state.read().expect("lock poisoned").durable
    }
}

// ============================================================================
// Memory Store
// ============================================================================

/// An in-memory data store that keeps every applied record.
#[derive(Debug, Default)]
pub struct MemoryStore {
    applied: Mutex<BTreeMap<Vlsn, LogRecord>>,
    fail_at: Mutex<Option<Vlsn>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of applied records.
    pub fn len(&self) -> usize {
        self.applied.lock().expect("lock poisoned").len()
    }

    /// Returns true if nothing has been applied.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the applied record with the given VLSN.
    pub fn get(&self, vlsn: Vlsn) -> Option<LogRecord> {
        self.applied.lock().expect("lock poisoned").get(&vlsn).cloned()
    }

    /// Returns the payloads of applied user commits in VLSN order.
    pub fn commit_payloads(&self) -> Vec<Bytes> {
        self.applied
            .lock()
            .expect("lock poisoned")
            .values()
            .filter(|record| record.kind == RecordKind::Commit)
            .map(|record| record.payload.clone())
            .collect()
    }

    /// Makes applying `vlsn` fail, simulating an unrecoverable storage error.
    pub fn fail_at(&self, vlsn: Vlsn) {
        *self.fail_at.lock().expect("lock poisoned") = Some(vlsn);
    }
}

impl LogApplier for MemoryStore {
    fn apply(&self, record: &LogRecord) -> Result<(), ApplyError> {
        if *self.fail_at.lock().expect("lock poisoned") == Some(record.vlsn) {
            return Err(ApplyError::new(format!(
                "storage failure applying {}",
                record.vlsn
            )));
        }
        self.applied
            .lock()
            .expect("lock poisoned")
            .insert(record.vlsn, record.clone());
        Ok(())
    }

    fn rolled_back(&self, matchpoint: Vlsn) -> Result<(), ApplyError> {
        let mut applied = self.applied.lock().expect("lock poisoned");
        let discarded = applied.split_off(&matchpoint.next());
        drop(discarded);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(vlsn: u64, term: u64, kind: RecordKind) -> LogRecord {
        LogRecord::new(
            Vlsn::new(vlsn),
            MasterTerm::new(term),
            kind,
            17,
            1_000 + vlsn,
            Bytes::from(vec![vlsn as u8; 16]),
        )
    }

    fn filled(log: &MemoryLog, count: u64) {
        for v in 1..=count {
            log.append(record(v, 1, RecordKind::Commit)).unwrap();
        }
    }

    #[test]
    fn checksum_detects_tampering() {
        let rec = record(1, 1, RecordKind::Commit);
        assert!(rec.verify_checksum());

        let mut tampered = rec.clone();
        tampered.term = MasterTerm::new(2);
        assert!(!tampered.verify_checksum());
    }

    #[test]
    fn downgrade_keeps_fingerprint() {
        let rec = record(3, 1, RecordKind::Commit);
        let old = rec.downgrade_to(16);

        assert_eq!(old.format_version, 16);
        assert_eq!(old.fingerprint(), rec.fingerprint());
        assert!(old.verify_checksum());
        assert_eq!(rec.downgrade_to(18).format_version, 17);
    }

    #[test]
    fn append_must_be_contiguous() {
        let log = MemoryLog::new();
        log.append(record(1, 1, RecordKind::Commit)).unwrap();

        assert!(matches!(
            log.append(record(3, 1, RecordKind::Commit)),
            Err(LogError::NotContiguous { .. })
        ));
        assert!(matches!(
            log.append(record(0, 1, RecordKind::Commit)),
            Err(LogError::Unassigned)
        ));
    }

    #[test]
    fn records_roll_into_new_segments() {
        // Each record is 64 bytes: four fit in a 256-byte segment.
        let log = MemoryLog::with_segment_size(256);
        filled(&log, 6);

        assert_eq!(log.position_of(Vlsn::new(1)).unwrap(), Some(LogPosition::new(0, 0)));
        assert_eq!(log.position_of(Vlsn::new(4)).unwrap(), Some(LogPosition::new(0, 192)));
        assert_eq!(log.position_of(Vlsn::new(5)).unwrap(), Some(LogPosition::new(1, 0)));
        assert_eq!(log.position_of(Vlsn::new(6)).unwrap(), Some(LogPosition::new(1, 64)));
    }

    #[test]
    fn read_from_and_tail() {
        let log = MemoryLog::new();
        filled(&log, 5);

        let batch = log.read_from(Vlsn::new(2), 2).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].vlsn, Vlsn::new(2));
        assert_eq!(batch[1].vlsn, Vlsn::new(3));

        assert_eq!(log.tail_after(Vlsn::new(3)).unwrap().len(), 2);
        assert!(log.read_from(Vlsn::new(9), 10).unwrap().is_empty());
        assert_eq!(log.range(), VlsnRange::new(Vlsn::new(1), Vlsn::new(5)));
    }

    #[test]
    fn truncate_from_position() {
        let log = MemoryLog::with_segment_size(256);
        filled(&log, 6);
        log.mark_durable(Vlsn::new(6)).unwrap();

        let position = log.position_of(Vlsn::new(4)).unwrap().unwrap();
        assert_eq!(log.truncate_from(position).unwrap(), 3);
        assert_eq!(log.range().last(), Vlsn::new(3));
        assert_eq!(log.durable_vlsn(), Vlsn::new(3));

        // The freed space is reused.
        let reused = log.append(record(4, 2, RecordKind::Commit)).unwrap();
        assert_eq!(reused, position);
    }

    #[test]
    fn memory_store_rolls_back_after_matchpoint() {
        let store = MemoryStore::new();
        for v in 1..=5 {
            store.apply(&record(v, 1, RecordKind::Commit)).unwrap();
        }
        store.rolled_back(Vlsn::new(3)).unwrap();

        assert_eq!(store.len(), 3);
        assert!(store.get(Vlsn::new(4)).is_none());
        assert_eq!(store.commit_payloads().len(), 3);
    }

    #[test]
    fn memory_store_injected_failure() {
        let store = MemoryStore::new();
        store.fail_at(Vlsn::new(2));
        store.apply(&record(1, 1, RecordKind::Commit)).unwrap();
        assert!(store.apply(&record(2, 1, RecordKind::Commit)).is_err());
    }
}
