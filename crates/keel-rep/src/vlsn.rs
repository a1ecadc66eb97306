//! VLSN sequencer and index.
//!
//! The [`VlsnSequencer`] hands out VLSNs on the master, one per record
//! appended to its log. The [`VlsnIndex`] tracks the range of VLSNs a node
//! has applied, together with what the node last heard from its master, and
//! is the condition every consistency wait and idle feeder parks on.
//!
//! # Single Writer
//!
//! Exactly one thread advances the index: the commit path on a master, the
//! replay thread on a replica. Any number of threads read it or wait on it.
//!
//! ```text
//!   replay / commit ──record_applied──► VlsnIndex ──notify_all──► waiters
//!                                          ▲                     (consistency,
//!   heartbeats ─────note_master_progress───┘                      feeders)
//! ```

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use keel_types::{Vlsn, VlsnRange};
use tracing::{trace, warn};

use crate::{RepError, RepResult};

// ============================================================================
// Sequencer
// ============================================================================

/// Assigns VLSNs on the master.
#[derive(Debug, Clone)]
pub struct VlsnSequencer {
    last: Vlsn,
}

impl VlsnSequencer {
    /// Creates a sequencer whose next VLSN follows `last`.
    pub fn new(last: Vlsn) -> Self {
        Self { last }
    }

    /// Returns the next VLSN. Strictly greater than every VLSN returned before.
    pub fn next_vlsn(&mut self) -> Vlsn {
        self.last = self.last.next();
        self.last
    }

    /// Returns the last VLSN handed out.
    pub fn last(&self) -> Vlsn {
        self.last
    }

    /// Re-seeds the sequencer from the local log when a node becomes master.
    pub fn reseed(&mut self, last: Vlsn) {
        self.last = last;
    }
}

// ============================================================================
// Index
// ============================================================================

/// A consistent view of the index at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSnapshot {
    /// VLSNs applied locally.
    pub range: VlsnRange,
    /// Commit time of the last applied transactional record.
    pub last_commit_time_ms: Option<u64>,
    /// Last VLSN the master reported having.
    pub master_vlsn: Vlsn,
    /// Whether any master progress was ever reported.
    pub master_heard: bool,
    /// Highest VLSN known to be durable on a quorum.
    pub durable: Vlsn,
}

/// Why a wait on the index ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The condition holds.
    Satisfied,
    /// The timeout elapsed first.
    TimedOut,
    /// The index was closed.
    Closed,
}

#[derive(Debug)]
struct IndexState {
    snapshot: IndexSnapshot,
    closed: bool,
}

/// Tracks the applied VLSN range and wakes waiters on every advance.
#[derive(Debug)]
pub struct VlsnIndex {
    state: Mutex<IndexState>,
    advanced: Condvar,
}

impl VlsnIndex {
    /// Creates an index over an already applied range.
    pub fn new(range: VlsnRange) -> Self {
        Self {
            state: Mutex::new(IndexState {
                snapshot: IndexSnapshot {
                    range,
                    last_commit_time_ms: None,
                    master_vlsn: Vlsn::NULL,
                    master_heard: false,
                    durable: Vlsn::NULL,
                },
                closed: false,
            }),
            advanced: Condvar::new(),
        }
    }

    /// Returns the applied range.
    pub fn range(&self) -> VlsnRange {
        self.state.lock().expect("lock poisoned").snapshot.range
    }

    /// Returns the last applied VLSN.
    pub fn last(&self) -> Vlsn {
        self.range().last()
    }

    /// Returns a snapshot of the index.
    pub fn snapshot(&self) -> IndexSnapshot {
        self.state.lock().expect("lock poisoned").snapshot
    }

    /// Checks that `vlsn` is the next VLSN to apply without recording it.
    pub fn check_next(&self, vlsn: Vlsn) -> RepResult<()> {
        let expected = self.last().next();
        check_sequence(expected, vlsn)
    }

    /// Records that `vlsn` was applied.
    ///
    /// `commit_time_ms` is the master commit time of a transactional record.
    ///
    /// # Errors
    ///
    /// Returns [`RepError::VlsnOutOfOrder`] for a duplicate or older VLSN and
    /// [`RepError::VlsnGap`] when VLSNs were skipped. The range is unchanged.
    pub fn record_applied(&self, vlsn: Vlsn, commit_time_ms: Option<u64>) -> RepResult<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        let expected = state.snapshot.range.last().next();
        check_sequence(expected, vlsn)?;

        state.snapshot.range = state.snapshot.range.extend_to(vlsn);
        if commit_time_ms.is_some() {
            state.snapshot.last_commit_time_ms = commit_time_ms;
        }
        if state.snapshot.master_vlsn < vlsn {
            state.snapshot.master_vlsn = vlsn;
        }
        trace!(vlsn = %vlsn, "vlsn applied");
        drop(state);

        self.advanced.notify_all();
        Ok(())
    }

    /// Records master progress reported by a heartbeat.
    pub fn note_master_progress(&self, master_vlsn: Vlsn, durable: Vlsn) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.snapshot.master_heard = true;
        if master_vlsn > state.snapshot.master_vlsn {
            state.snapshot.master_vlsn = master_vlsn;
        }
        if durable > state.snapshot.durable {
            state.snapshot.durable = durable;
        }
        drop(state);

        self.advanced.notify_all();
    }

    /// Forgets the master's reported progress, for example after the stream
    /// to the master was lost.
    pub fn forget_master(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.snapshot.master_heard = false;
        state.snapshot.master_vlsn = state.snapshot.range.last();
    }

    /// Moves the applied range back to `matchpoint`.
    ///
    /// This is the only way the range retreats, and it is always logged.
    pub fn rollback_to(&self, matchpoint: Vlsn) {
        let mut state = self.state.lock().expect("lock poisoned");
        let before = state.snapshot.range;
        state.snapshot.range = before.truncate_to(matchpoint);
        state.snapshot.master_vlsn = state.snapshot.master_vlsn.min(matchpoint);
        warn!(
            before = %before,
            after = %state.snapshot.range,
            "vlsn range rolled back"
        );
        drop(state);

        self.advanced.notify_all();
    }

    /// Blocks until `vlsn` has been applied or the timeout elapses.
    pub fn wait_for(&self, vlsn: Vlsn, timeout: Duration) -> WaitOutcome {
        self.wait_until(timeout, |snapshot| snapshot.range.last() >= vlsn)
    }

    /// Blocks until `condition` holds for the current snapshot, the timeout
    /// elapses, or the index is closed.
    ///
    /// The condition is re-evaluated on every advance and every heartbeat.
    pub fn wait_until<F>(&self, timeout: Duration, mut condition: F) -> WaitOutcome
    where
        F: FnMut(&IndexSnapshot) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("lock poisoned");
        loop {
            if state.closed {
                return WaitOutcome::Closed;
            }
            if condition(&state.snapshot) {
                return WaitOutcome::Satisfied;
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            let (guard, _) = self
                .advanced
                .wait_timeout(state, deadline - now)
                .expect("lock poisoned");
            state = guard;
        }
    }

    /// Wakes every waiter. Subsequent waits return [`WaitOutcome::Closed`].
    pub fn close(&self) {
        self.state.lock().expect("lock poisoned").closed = true;
        self.advanced.notify_all();
    }
}

fn check_sequence(expected: Vlsn, actual: Vlsn) -> RepResult<()> {
    if actual == expected {
        Ok(())
    } else if actual < expected {
        Err(RepError::VlsnOutOfOrder { expected, actual })
    } else {
        Err(RepError::VlsnGap { expected, actual })
    }
}
