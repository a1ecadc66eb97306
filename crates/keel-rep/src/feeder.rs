//! Master-side log stream.
//!
//! Each connected replica gets a feeder made of two threads:
//!
//! ```text
//!                     ┌────────────── feeder ──────────────┐
//!   ReplicationLog ──►│ output: read batch, downgrade,     │──► Entry / Heartbeat
//!   VlsnIndex (wait) ─│         send, heartbeat when idle  │
//!                     │ input:  read acks, watch liveness  │◄── Ack
//!                     └──────────────────┬─────────────────┘
//!                                        ▼
//!                                    AckTracker ──► commit durability
//! ```
//!
//! Records are re-encoded to the log version negotiated at handshake before
//! they are sent; a replica never receives a newer format than it accepted.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use keel_types::{MasterTerm, NodeIdentity, NodeName, Vlsn};
use tracing::{debug, info, trace, warn};

use crate::channel::{FrameReceiver, FrameSender};
use crate::clock::Clock;
use crate::handshake::ConnectionGuard;
use crate::log::ReplicationLog;
use crate::protocol::{Heartbeat, StreamMessage, WireMessage};
use crate::vlsn::{VlsnIndex, WaitOutcome};
use crate::{RepError, RepResult};

// ============================================================================
// Stream Counters
// ============================================================================

/// Byte and message counters for one direction pair of a stream.
#[derive(Debug, Default)]
pub struct StreamCounters {
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
}

impl StreamCounters {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one sent message.
    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(u64::try_from(bytes).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    /// Counts one received message.
    pub fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(u64::try_from(bytes).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    /// Returns a snapshot.
    pub fn snapshot(&self) -> StreamStats {
        StreamStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`StreamCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamStats {
    /// Messages sent.
    pub messages_sent: u64,
    /// Bytes sent, frame headers included.
    pub bytes_sent: u64,
    /// Messages received.
    pub messages_received: u64,
    /// Bytes received, frame headers included.
    pub bytes_received: u64,
}

/// Statistics of one feeder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeederStats {
    /// The replica being fed.
    pub replica: NodeName,
    /// Traffic on the connection.
    pub stream: StreamStats,
    /// Last VLSN the replica acknowledged.
    pub acked: Vlsn,
}

// ============================================================================
// Ack Tracker
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct ReplicaAck {
    electable: bool,
    acked: Vlsn,
}

#[derive(Debug, Default)]
struct AckState {
    replicas: BTreeMap<NodeName, ReplicaAck>,
    quorum_acks: usize,
    closed: bool,
}

impl AckState {
    fn acked_at_least(&self, vlsn: Vlsn) -> usize {
        self.replicas
            .values()
            .filter(|r| r.electable && r.acked >= vlsn)
            .count()
    }
}

/// Acknowledgments from connected replicas, on the master.
#[derive(Debug, Default)]
pub struct AckTracker {
    state: Mutex<AckState>,
    changed: Condvar,
}

impl AckTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a replica that has everything up to `acked`.
    pub fn register(&self, replica: NodeName, electable: bool, acked: Vlsn) {
        self.state
            .lock()
            .expect("lock poisoned")
            .replicas
            .insert(replica, ReplicaAck { electable, acked });
        self.changed.notify_all();
    }

    /// Stops tracking a replica.
    pub fn unregister(&self, replica: &NodeName) {
        self.state
            .lock()
            .expect("lock poisoned")
            .replicas
            .remove(replica);
        self.changed.notify_all();
    }

    /// Records that `replica` has everything up to `vlsn`.
    pub fn record_ack(&self, replica: &NodeName, vlsn: Vlsn) {
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(entry) = state.replicas.get_mut(replica) {
            if vlsn > entry.acked {
                entry.acked = vlsn;
            }
        }
        drop(state);
        self.changed.notify_all();
    }

    /// Returns the last VLSN acknowledged by `replica`.
    pub fn acked(&self, replica: &NodeName) -> Option<Vlsn> {
        self.state
            .lock()
            .expect("lock poisoned")
            .replicas
            .get(replica)
            .map(|r| r.acked)
    }

    /// Returns the number of connected electable replicas.
    pub fn connected_electable(&self) -> usize {
        self.state
            .lock()
            .expect("lock poisoned")
            .replicas
            .values()
            .filter(|r| r.electable)
            .count()
    }

    /// Sets how many replica acknowledgments make a record durable.
    pub fn set_quorum_acks(&self, acks: usize) {
        self.state.lock().expect("lock poisoned").quorum_acks = acks;
    }

    /// Returns the highest VLSN held by a quorum, given the master's last.
    pub fn durable_vlsn(&self, master_last: Vlsn) -> Vlsn {
        let state = self.state.lock().expect("lock poisoned");
        if state.quorum_acks == 0 {
            return master_last;
        }
        let mut acks: Vec<Vlsn> = state
            .replicas
            .values()
            .filter(|r| r.electable)
            .map(|r| r.acked.min(master_last))
            .collect();
        acks.sort_unstable_by(|a, b| b.cmp(a));
        acks.get(state.quorum_acks - 1).copied().unwrap_or(Vlsn::NULL)
    }

    /// Blocks until `needed` electable replicas acknowledged `vlsn`.
    ///
    /// # Errors
    ///
    /// Returns [`RepError::InsufficientAcks`] on timeout and
    /// [`RepError::Closed`] if the tracker is closed.
    pub fn await_acks(&self, vlsn: Vlsn, needed: usize, timeout: Duration) -> RepResult<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("lock poisoned");
        loop {
            if state.closed {
                return Err(RepError::Closed);
            }
            let got = state.acked_at_least(vlsn);
            if got >= needed {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RepError::InsufficientAcks { vlsn, needed, got });
            }
            let (guard, _) = self
                .changed
                .wait_timeout(state, deadline - now)
                .expect("lock poisoned");
            state = guard;
        }
    }

    /// Wakes every waiter and fails subsequent waits.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.closed = true;
        state.replicas.clear();
        drop(state);
        self.changed.notify_all();
    }
}

// ============================================================================
// Feeder
// ============================================================================

/// Everything a feeder needs to stream to one replica.
#[derive(Debug)]
pub struct FeederContext {
    /// The replica.
    pub replica: NodeIdentity,
    /// The master's log.
    pub log: Arc<dyn ReplicationLog>,
    /// The master's index, parked on while the log is idle.
    pub index: Arc<VlsnIndex>,
    /// Shared acknowledgment tracker.
    pub acks: Arc<AckTracker>,
    /// The master's clock.
    pub clock: Arc<dyn Clock>,
    /// The master's term.
    pub term: MasterTerm,
    /// Log version records are sent in.
    pub log_version: u32,
    /// First VLSN to send.
    pub start: Vlsn,
    /// Records read per batch.
    pub batch_size: usize,
    /// Idle heartbeat period.
    pub heartbeat_interval: Duration,
    /// Silence after which the replica is considered lost.
    pub heartbeat_timeout: Duration,
}

/// A running feeder.
#[derive(Debug)]
pub struct FeederHandle {
    replica: NodeName,
    shutdown: Arc<AtomicBool>,
    counters: Arc<StreamCounters>,
    acks: Arc<AckTracker>,
    threads: Vec<JoinHandle<()>>,
}

impl FeederHandle {
    /// Returns the replica name.
    pub fn replica(&self) -> &NodeName {
        &self.replica
    }

    /// Returns true once both threads have exited.
    pub fn is_finished(&self) -> bool {
        self.threads.iter().all(JoinHandle::is_finished)
    }

    /// Asks both threads to stop. The replica sees the channel close.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Stops the feeder and waits for its threads.
    pub fn join(mut self) {
        self.stop();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!(replica = %self.replica, "feeder thread panicked");
            }
        }
    }

    /// Returns the feeder's statistics.
    pub fn stats(&self) -> FeederStats {
        FeederStats {
            replica: self.replica.clone(),
            stream: self.counters.snapshot(),
            acked: self.acks.acked(&self.replica).unwrap_or(Vlsn::NULL),
        }
    }
}

/// Starts feeding a replica over an established, synced connection.
///
/// The connection guard is released, and the replica forgotten by the ack
/// tracker, when the feeder exits.
pub fn spawn(
    context: FeederContext,
    sender: Box<dyn FrameSender>,
    receiver: Box<dyn FrameReceiver>,
    guard: ConnectionGuard,
) -> RepResult<FeederHandle> {
    let replica = context.replica.name.clone();
    let shutdown = Arc::new(AtomicBool::new(false));
    let counters = Arc::new(StreamCounters::new());
    let acks = Arc::clone(&context.acks);
    acks.register(
        replica.clone(),
        context.replica.node_type.is_electable(),
        context.start.prev(),
    );

    let context = Arc::new(context);
    let output = {
        let context = Arc::clone(&context);
        let shutdown = Arc::clone(&shutdown);
        let counters = Arc::clone(&counters);
        thread::Builder::new()
            .name(format!("feeder-out-{replica}"))
            .spawn(move || run_output(&context, sender, &shutdown, &counters))?
    };
    let input = {
        let shutdown = Arc::clone(&shutdown);
        let counters = Arc::clone(&counters);
        thread::Builder::new()
            .name(format!("feeder-in-{replica}"))
            .spawn(move || {
                run_input(&context, receiver, &shutdown, &counters);
                context.acks.unregister(&context.replica.name);
                drop(guard);
            })?
    };

    info!(replica = %replica, "feeder started");
    Ok(FeederHandle {
        replica,
        shutdown,
        counters,
        acks,
        threads: vec![output, input],
    })
}

fn run_output(
    context: &FeederContext,
    mut sender: Box<dyn FrameSender>,
    shutdown: &AtomicBool,
    counters: &StreamCounters,
) {
    let replica = &context.replica.name;
    match stream_records(context, sender.as_mut(), shutdown, counters) {
        Ok(()) => debug!(replica = %replica, "feeder output stopped"),
        Err(RepError::ChannelClosed) => debug!(replica = %replica, "replica disconnected"),
        Err(e) => warn!(replica = %replica, error = %e, "feeder output failed"),
    }
    shutdown.store(true, Ordering::Release);
    sender.close();
}

fn stream_records(
    context: &FeederContext,
    sender: &mut dyn FrameSender,
    shutdown: &AtomicBool,
    counters: &StreamCounters,
) -> RepResult<()> {
    let mut next = context.start;
    let mut last_sent = Instant::now();
    let mut send = |sender: &mut dyn FrameSender, message: StreamMessage| -> RepResult<()> {
        let bytes = sender.send(&WireMessage::Stream(message))?;
        counters.record_sent(bytes);
        Ok(())
    };

    // Announce liveness before the first record.
    send(sender, heartbeat(context))?;

    while !shutdown.load(Ordering::Acquire) {
        let batch = context.log.read_from(next, context.batch_size)?;
        if batch.is_empty() {
            if last_sent.elapsed() >= context.heartbeat_interval {
                send(sender, heartbeat(context))?;
                last_sent = Instant::now();
            }
            if context.index.wait_for(next, context.heartbeat_interval) == WaitOutcome::Closed {
                return Ok(());
            }
            continue;
        }

        for record in batch {
            if record.vlsn != next {
                return Err(RepError::VlsnGap {
                    expected: next,
                    actual: record.vlsn,
                });
            }
            trace!(replica = %context.replica.name, vlsn = %record.vlsn, "feeding record");
            send(
                sender,
                StreamMessage::Entry(record.downgrade_to(context.log_version)),
            )?;
            next = next.next();
        }
        last_sent = Instant::now();
    }
    Ok(())
}

fn heartbeat(context: &FeederContext) -> StreamMessage {
    let master_vlsn = context.index.last();
    StreamMessage::Heartbeat(Heartbeat {
        term: context.term,
        master_vlsn,
        durable_vlsn: context.log.durable_vlsn().min(master_vlsn),
        master_time_ms: context.clock.now_ms(),
    })
}

fn run_input(
    context: &FeederContext,
    mut receiver: Box<dyn FrameReceiver>,
    shutdown: &AtomicBool,
    counters: &StreamCounters,
) {
    let replica = &context.replica.name;
    let poll = context.heartbeat_interval.min(context.heartbeat_timeout);
    let mut last_heard = Instant::now();

    while !shutdown.load(Ordering::Acquire) {
        match receiver.recv_timeout(poll) {
            Ok(Some((WireMessage::Stream(StreamMessage::Ack(ack)), bytes))) => {
                counters.record_received(bytes);
                last_heard = Instant::now();
                context.acks.record_ack(replica, ack.vlsn);
                let durable = context.acks.durable_vlsn(context.index.last());
                if let Err(e) = context.log.mark_durable(durable) {
                    warn!(replica = %replica, error = %e, "failed to persist durable vlsn");
                }
            }
            Ok(Some((WireMessage::Stream(StreamMessage::Shutdown { reason }), _))) => {
                info!(replica = %replica, reason = %reason, "replica shut down stream");
                break;
            }
            Ok(Some((other, _))) => {
                warn!(replica = %replica, message = other.name(), "unexpected message from replica");
                break;
            }
            Ok(None) => {
                if last_heard.elapsed() > context.heartbeat_timeout {
                    warn!(replica = %replica, "replica silent, dropping feeder");
                    break;
                }
            }
            Err(e) => {
                debug!(replica = %replica, error = %e, "feeder input closed");
                break;
            }
        }
    }
    shutdown.store(true, Ordering::Release);
}
