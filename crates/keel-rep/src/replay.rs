//! Applying the replicated log.
//!
//! [`LogWriter`] is the single writer of a node's log, store and VLSN index.
//! The master's commit path and a replica's replay thread both go through it,
//! so a record is appended, applied and only then made visible in the index:
//!
//! ```text
//!   Entry ──► verify ──► ┌─────────── writer lock ───────────┐ ──► Ack
//!                        │ append ─► apply ─► group/naming   │
//!                        │        ─► VlsnIndex::record_applied│
//!                        └───────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use keel_types::{MasterTerm, NodeName, Vlsn};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::channel::{FrameReceiver, FrameSender};
use crate::clock::Clock;
use crate::feeder::{StreamCounters, StreamStats};
use crate::group::{GroupChange, RepGroup};
use crate::log::{LogApplier, LogRecord, RecordKind, ReplicationLog};
use crate::preemption::{NamingOp, PreemptionRegistry};
use crate::protocol::{Ack, StreamMessage, WireMessage};
use crate::vlsn::{VlsnIndex, VlsnSequencer};
use crate::{RepError, RepResult};

/// Records read per batch when rebuilding state from the log.
const RECOVERY_BATCH: usize = 256;

// ============================================================================
// Log Writer
// ============================================================================

/// The single writer of a node's replicated state.
#[derive(Debug)]
pub struct LogWriter {
    log: Arc<dyn ReplicationLog>,
    applier: Arc<dyn LogApplier>,
    index: Arc<VlsnIndex>,
    group: Arc<RwLock<Option<RepGroup>>>,
    preemption: Arc<PreemptionRegistry>,
    clock: Arc<dyn Clock>,
    sequencer: Mutex<VlsnSequencer>,
    log_version: u32,
}

impl LogWriter {
    /// Creates a writer over the node's collaborators.
    ///
    /// The index must already cover the log's range.
    pub fn new(
        log: Arc<dyn ReplicationLog>,
        applier: Arc<dyn LogApplier>,
        index: Arc<VlsnIndex>,
        preemption: Arc<PreemptionRegistry>,
        clock: Arc<dyn Clock>,
        log_version: u32,
    ) -> Self {
        let sequencer = Mutex::new(VlsnSequencer::new(index.last()));
        Self {
            log,
            applier,
            index,
            group: Arc::new(RwLock::new(None)),
            preemption,
            clock,
            sequencer,
            log_version,
        }
    }

    /// Returns the log.
    pub fn log(&self) -> &Arc<dyn ReplicationLog> {
        &self.log
    }

    /// Returns the applier.
    pub fn applier(&self) -> &Arc<dyn LogApplier> {
        &self.applier
    }

    /// Returns the VLSN index.
    pub fn index(&self) -> &Arc<VlsnIndex> {
        &self.index
    }

    /// Returns a copy of the group table, if the node belongs to a group.
    pub fn group(&self) -> Option<RepGroup> {
        self.group.read().expect("lock poisoned").clone()
    }

    /// Runs `f` against the group table.
    pub fn with_group<T>(&self, f: impl FnOnce(Option<&mut RepGroup>) -> T) -> T {
        f(self.group.write().expect("lock poisoned").as_mut())
    }

    /// Rebuilds the group table from the membership records of the log.
    pub fn recover(&self) -> RepResult<()> {
        let _writer = self.sequencer.lock().expect("lock poisoned");
        let mut group = self.group.write().expect("lock poisoned");
        *group = None;
        let mut next = self.log.range().first();
        if next.is_null() {
            return Ok(());
        }
        loop {
            let batch = self.log.read_from(next, RECOVERY_BATCH)?;
            let Some(last) = batch.last().map(|r| r.vlsn) else {
                break;
            };
            for record in batch.iter().filter(|r| r.kind == RecordKind::Membership) {
                let change: GroupChange = record.decode_body()?;
                RepGroup::apply_to(&mut group, &change)?;
            }
            next = last.next();
        }
        if let Some(group) = group.as_ref() {
            info!(
                group = group.name(),
                members = group.live_members().count(),
                "group recovered from log"
            );
        }
        Ok(())
    }

    /// Re-aligns the sequencer with the index, after rollback or on
    /// becoming master.
    pub fn reseed(&self) {
        self.sequencer
            .lock()
            .expect("lock poisoned")
            .reseed(self.index.last());
    }

    /// Commits a new record on the master.
    pub fn append_new(
        &self,
        term: MasterTerm,
        kind: RecordKind,
        payload: Bytes,
    ) -> RepResult<LogRecord> {
        self.append_with(|vlsn, time| {
            Ok(LogRecord::new(vlsn, term, kind, self.log_version, time, payload))
        })
    }

    /// Commits a new record with a structured body on the master.
    pub fn append_structured<T: Serialize>(
        &self,
        term: MasterTerm,
        kind: RecordKind,
        body: &T,
    ) -> RepResult<LogRecord> {
        self.append_with(|vlsn, time| {
            LogRecord::structured(vlsn, term, kind, self.log_version, time, body)
        })
    }

    /// Commits a membership change on the master, decided against the group
    /// table as it stands when the record is written.
    ///
    /// The decision runs under the single-writer guard, so no other change
    /// can land between it and the record taking effect.
    pub fn append_membership<F>(&self, term: MasterTerm, decide: F) -> RepResult<LogRecord>
    where
        F: FnOnce(Option<&RepGroup>) -> RepResult<GroupChange>,
    {
        self.append_with(|vlsn, time| {
            let change = decide(self.group.read().expect("lock poisoned").as_ref())?;
            LogRecord::structured(
                vlsn,
                term,
                RecordKind::Membership,
                self.log_version,
                time,
                &change,
            )
        })
    }

    fn append_with<F>(&self, build: F) -> RepResult<LogRecord>
    where
        F: FnOnce(Vlsn, u64) -> RepResult<LogRecord>,
    {
        let mut sequencer = self.sequencer.lock().expect("lock poisoned");
        let vlsn = sequencer.next_vlsn();
        let result = build(vlsn, self.clock.now_ms()).and_then(|record| {
            self.write(&record)?;
            Ok(record)
        });
        if result.is_err() {
            sequencer.reseed(self.index.last());
        }
        result
    }

    /// Applies a record received from the master.
    pub fn apply_replicated(&self, record: &LogRecord) -> RepResult<()> {
        let mut sequencer = self.sequencer.lock().expect("lock poisoned");
        self.write(record)?;
        sequencer.reseed(record.vlsn);
        Ok(())
    }

    fn write(&self, record: &LogRecord) -> RepResult<()> {
        self.index.check_next(record.vlsn)?;
        let position = self.log.append(record.clone())?;
        if let Err(e) = self.take_effect(record) {
            self.log.truncate_from(position)?;
            return Err(e);
        }
        let commit_time = record.kind.is_commit().then_some(record.commit_time_ms);
        self.index.record_applied(record.vlsn, commit_time)
    }

    fn take_effect(&self, record: &LogRecord) -> RepResult<()> {
        match record.kind {
            RecordKind::Commit => self.applier.apply(record)?,
            RecordKind::Abort => {}
            RecordKind::Membership => {
                let change: GroupChange = record.decode_body()?;
                let mut group = self.group.write().expect("lock poisoned");
                RepGroup::apply_to(&mut group, &change)?;
                info!(vlsn = %record.vlsn, change = %change, "membership change applied");
            }
            RecordKind::Naming => {
                let op: NamingOp = record.decode_body()?;
                self.applier.apply(record)?;
                self.preemption.preempt(&op);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Replay Statistics
// ============================================================================

/// Cumulative replay counters of a node.
#[derive(Debug, Default)]
pub struct ReplayCounters {
    stream: StreamCounters,
    applied: AtomicU64,
    heartbeats: AtomicU64,
}

impl ReplayCounters {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot.
    pub fn snapshot(&self) -> ReplayStats {
        ReplayStats {
            stream: self.stream.snapshot(),
            records_applied: self.applied.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
        }
    }
}

/// Replay statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplayStats {
    /// Traffic on the master connections.
    pub stream: StreamStats,
    /// Records applied from the stream.
    pub records_applied: u64,
    /// Heartbeats received.
    pub heartbeats: u64,
}

// ============================================================================
// Replay Loop
// ============================================================================

/// Why a replay loop ended.
#[derive(Debug)]
pub enum ReplayExit {
    /// The local node asked it to stop.
    Shutdown,
    /// The master went away or fell silent.
    MasterLost(String),
    /// The stream or the local store failed.
    Failed(RepError),
}

/// Applies the master's stream on a replica.
#[derive(Debug)]
pub struct Replayer {
    /// The local node.
    pub node: NodeName,
    /// The master being followed.
    pub master: NodeName,
    /// The node's writer.
    pub writer: Arc<LogWriter>,
    /// Cumulative counters.
    pub counters: Arc<ReplayCounters>,
    /// Log version negotiated at handshake.
    pub log_version: u32,
    /// Silence after which the master is considered lost.
    pub heartbeat_timeout: Duration,
    /// Receive poll period.
    pub poll_interval: Duration,
    /// Set to stop the loop.
    pub shutdown: Arc<AtomicBool>,
}

impl Replayer {
    /// Runs until the stream ends.
    pub fn run(
        &self,
        mut sender: Box<dyn FrameSender>,
        mut receiver: Box<dyn FrameReceiver>,
    ) -> ReplayExit {
        let exit = self.replay(sender.as_mut(), receiver.as_mut());
        if matches!(exit, ReplayExit::Shutdown) {
            let _ = sender.send(&WireMessage::Stream(StreamMessage::Shutdown {
                reason: format!("{} shutting down", self.node),
            }));
        }
        sender.close();
        self.writer.index().forget_master();
        match &exit {
            ReplayExit::Shutdown => debug!(node = %self.node, "replay stopped"),
            ReplayExit::MasterLost(reason) => {
                warn!(node = %self.node, master = %self.master, reason = %reason, "master lost");
            }
            ReplayExit::Failed(e) => warn!(node = %self.node, error = %e, "replay failed"),
        }
        exit
    }

    fn replay(&self, sender: &mut dyn FrameSender, receiver: &mut dyn FrameReceiver) -> ReplayExit {
        let mut last_heard = Instant::now();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return ReplayExit::Shutdown;
            }
            let (message, bytes) = match receiver.recv_timeout(self.poll_interval) {
                Ok(Some(received)) => received,
                Ok(None) => {
                    if last_heard.elapsed() > self.heartbeat_timeout {
                        return ReplayExit::MasterLost("heartbeat timeout".to_string());
                    }
                    continue;
                }
                Err(RepError::ChannelClosed) => {
                    return ReplayExit::MasterLost("channel closed".to_string());
                }
                Err(e) => return ReplayExit::Failed(e),
            };
            self.counters.stream.record_received(bytes);
            last_heard = Instant::now();

            let ack = match message {
                WireMessage::Stream(StreamMessage::Entry(record)) => match self.apply(&record) {
                    Ok(()) => record.vlsn,
                    Err(e) => return ReplayExit::Failed(e),
                },
                WireMessage::Stream(StreamMessage::Heartbeat(heartbeat)) => {
                    self.counters.heartbeats.fetch_add(1, Ordering::Relaxed);
                    let index = self.writer.index();
                    index.note_master_progress(heartbeat.master_vlsn, heartbeat.durable_vlsn);
                    let durable = heartbeat.durable_vlsn.min(index.last());
                    if let Err(e) = self.writer.log().mark_durable(durable) {
                        return ReplayExit::Failed(e.into());
                    }
                    index.last()
                }
                WireMessage::Stream(StreamMessage::Shutdown { reason }) => {
                    return ReplayExit::MasterLost(reason);
                }
                other => {
                    return ReplayExit::Failed(RepError::ProtocolViolation(format!(
                        "unexpected {} on replica stream",
                        other.name()
                    )));
                }
            };

            match sender.send(&WireMessage::Stream(StreamMessage::Ack(Ack { vlsn: ack }))) {
                Ok(bytes) => self.counters.stream.record_sent(bytes),
                Err(RepError::ChannelClosed) => {
                    return ReplayExit::MasterLost("channel closed".to_string());
                }
                Err(e) => return ReplayExit::Failed(e),
            }
        }
    }

    fn apply(&self, record: &LogRecord) -> RepResult<()> {
        if !record.verify_checksum() {
            return Err(RepError::ProtocolViolation(format!(
                "checksum mismatch on record {}",
                record.vlsn
            )));
        }
        if record.format_version > self.log_version {
            return Err(RepError::LogFormatTooNew {
                vlsn: record.vlsn,
                record: record.format_version,
                negotiated: self.log_version,
            });
        }
        trace!(node = %self.node, vlsn = %record.vlsn, kind = ?record.kind, "replaying record");
        self.writer.apply_replicated(record)?;
        self.counters.applied.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
