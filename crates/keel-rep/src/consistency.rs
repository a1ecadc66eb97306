//! Replica read consistency.
//!
//! A [`ConsistencyPolicy`] bounds how stale a replica may be when a
//! transaction begins or a cursor opens. The [`ConsistencyTracker`] parks the
//! calling thread on the [`VlsnIndex`] condition until the policy holds or
//! its timeout elapses. Other threads are unaffected.
//!
//! Policies can be attached at three levels; the most specific one wins:
//!
//! ```text
//! cursor override  >  transaction override  >  environment default
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use keel_types::{CommitToken, GroupUuid, Vlsn};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::vlsn::{IndexSnapshot, VlsnIndex, WaitOutcome};
use crate::{RepError, RepResult};

// ============================================================================
// Policy
// ============================================================================

/// How stale a replica may be before serving an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConsistencyPolicy {
    /// Serve from whatever the replica has.
    #[default]
    NoConsistencyRequired,
    /// The replica may trail the master by at most `permissible_lag`.
    Time {
        permissible_lag: Duration,
        timeout: Duration,
    },
    /// The replica must have applied the transaction identified by `token`.
    CommitPoint { token: CommitToken, timeout: Duration },
    /// The replica must have applied `vlsn`.
    AbsoluteVlsn { vlsn: Vlsn, timeout: Duration },
}

impl ConsistencyPolicy {
    /// Picks the policy in effect: cursor, then transaction, then environment.
    pub fn resolve(
        env: ConsistencyPolicy,
        txn: Option<ConsistencyPolicy>,
        cursor: Option<ConsistencyPolicy>,
    ) -> ConsistencyPolicy {
        cursor.or(txn).unwrap_or(env)
    }

    /// Returns the policy's kind.
    pub fn kind(&self) -> PolicyKind {
        match self {
            ConsistencyPolicy::NoConsistencyRequired => PolicyKind::NoConsistency,
            ConsistencyPolicy::Time { .. } => PolicyKind::Time,
            ConsistencyPolicy::CommitPoint { .. } => PolicyKind::CommitPoint,
            ConsistencyPolicy::AbsoluteVlsn { .. } => PolicyKind::AbsoluteVlsn,
        }
    }

    /// Returns how long a caller may wait for the policy.
    pub fn timeout(&self) -> Duration {
        match self {
            ConsistencyPolicy::NoConsistencyRequired => Duration::ZERO,
            ConsistencyPolicy::Time { timeout, .. }
            | ConsistencyPolicy::CommitPoint { timeout, .. }
            | ConsistencyPolicy::AbsoluteVlsn { timeout, .. } => *timeout,
        }
    }

    fn target(&self, group: GroupUuid) -> RepResult<Target> {
        match *self {
            ConsistencyPolicy::NoConsistencyRequired => Ok(Target::None),
            ConsistencyPolicy::Time {
                permissible_lag, ..
            } => Ok(Target::Lag(permissible_lag)),
            ConsistencyPolicy::CommitPoint { token, .. } => {
                if token.group_uuid() != group {
                    return Err(RepError::InvalidCommitToken {
                        token_group: token.group_uuid(),
                        group,
                    });
                }
                Ok(Target::Vlsn(token.vlsn()))
            }
            ConsistencyPolicy::AbsoluteVlsn { vlsn, .. } => Ok(Target::Vlsn(vlsn)),
        }
    }
}

impl fmt::Display for ConsistencyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsistencyPolicy::NoConsistencyRequired => write!(f, "NoConsistencyRequired"),
            ConsistencyPolicy::Time {
                permissible_lag,
                timeout,
            } => write!(f, "Time(lag={permissible_lag:?}, timeout={timeout:?})"),
            ConsistencyPolicy::CommitPoint { token, timeout } => {
                write!(f, "CommitPoint({token}, timeout={timeout:?})")
            }
            ConsistencyPolicy::AbsoluteVlsn { vlsn, timeout } => {
                write!(f, "AbsoluteVlsn({vlsn}, timeout={timeout:?})")
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Target {
    None,
    Lag(Duration),
    Vlsn(Vlsn),
}

impl Target {
    fn holds(&self, snapshot: &IndexSnapshot, now_ms: u64) -> bool {
        match *self {
            Target::None => true,
            Target::Vlsn(vlsn) => snapshot.range.last() >= vlsn,
            Target::Lag(lag) => {
                let caught_up =
                    snapshot.master_heard && snapshot.range.last() >= snapshot.master_vlsn;
                let lag_ms = u64::try_from(lag.as_millis()).unwrap_or(u64::MAX);
                let recent = snapshot
                    .last_commit_time_ms
                    .is_some_and(|commit| now_ms.saturating_sub(commit) <= lag_ms);
                caught_up || recent
            }
        }
    }
}

/// The kinds of consistency policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyKind {
    /// [`ConsistencyPolicy::NoConsistencyRequired`]
    NoConsistency,
    /// [`ConsistencyPolicy::Time`]
    Time,
    /// [`ConsistencyPolicy::CommitPoint`]
    CommitPoint,
    /// [`ConsistencyPolicy::AbsoluteVlsn`]
    AbsoluteVlsn,
}

impl PolicyKind {
    const ALL: [PolicyKind; 4] = [
        PolicyKind::NoConsistency,
        PolicyKind::Time,
        PolicyKind::CommitPoint,
        PolicyKind::AbsoluteVlsn,
    ];

    fn index(self) -> usize {
        match self {
            PolicyKind::NoConsistency => 0,
            PolicyKind::Time => 1,
            PolicyKind::CommitPoint => 2,
            PolicyKind::AbsoluteVlsn => 3,
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Wait statistics for one policy kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PolicyStats {
    /// Calls that had to block.
    pub waits: u64,
    /// Total time spent blocked.
    pub wait_time: Duration,
    /// Blocking calls that timed out.
    pub timeouts: u64,
}

/// Wait statistics for every policy kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsistencyStats {
    per_kind: [PolicyStats; 4],
}

impl ConsistencyStats {
    /// Returns the statistics for one kind.
    pub fn get(&self, kind: PolicyKind) -> PolicyStats {
        self.per_kind[kind.index()]
    }

    /// Returns the number of blocking calls across all kinds.
    pub fn total_waits(&self) -> u64 {
        self.per_kind.iter().map(|s| s.waits).sum()
    }
}

#[derive(Debug, Default)]
struct PolicyCounters {
    waits: AtomicU64,
    wait_nanos: AtomicU64,
    timeouts: AtomicU64,
}

// ============================================================================
// Tracker
// ============================================================================

/// Evaluates consistency policies against a node's [`VlsnIndex`].
#[derive(Debug)]
pub struct ConsistencyTracker {
    index: Arc<VlsnIndex>,
    clock: Arc<dyn Clock>,
    counters: [PolicyCounters; 4],
}

impl ConsistencyTracker {
    /// Creates a tracker over `index`.
    pub fn new(index: Arc<VlsnIndex>, clock: Arc<dyn Clock>) -> Self {
        Self {
            index,
            clock,
            counters: Default::default(),
        }
    }

    /// Returns true if `policy` holds right now.
    pub fn is_satisfied(&self, policy: &ConsistencyPolicy, group: GroupUuid) -> RepResult<bool> {
        let target = policy.target(group)?;
        Ok(target.holds(&self.index.snapshot(), self.clock.now_ms()))
    }

    /// Blocks until `policy` holds.
    ///
    /// Returns the time spent waiting: zero when the policy already held,
    /// in which case no wait is recorded.
    ///
    /// # Errors
    ///
    /// - [`RepError::InvalidCommitToken`] for a token from another group
    /// - [`RepError::ConsistencyTimeout`] when the timeout elapses
    /// - [`RepError::Closed`] when the node closes during the wait
    pub fn await_consistency(
        &self,
        policy: &ConsistencyPolicy,
        group: GroupUuid,
    ) -> RepResult<Duration> {
        let target = policy.target(group)?;
        if target.holds(&self.index.snapshot(), self.clock.now_ms()) {
            trace!(policy = %policy, "consistency satisfied without waiting");
            return Ok(Duration::ZERO);
        }

        let counters = &self.counters[policy.kind().index()];
        counters.waits.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let outcome = self.index.wait_until(policy.timeout(), |snapshot| {
            target.holds(snapshot, self.clock.now_ms())
        });
        let elapsed = started.elapsed();
        counters.wait_nanos.fetch_add(
            u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );

        match outcome {
            WaitOutcome::Satisfied => {
                trace!(policy = %policy, elapsed = ?elapsed, "consistency satisfied");
                Ok(elapsed)
            }
            WaitOutcome::TimedOut => {
                counters.timeouts.fetch_add(1, Ordering::Relaxed);
                debug!(policy = %policy, elapsed = ?elapsed, "consistency wait timed out");
                Err(RepError::ConsistencyTimeout {
                    policy: *policy,
                    elapsed,
                })
            }
            WaitOutcome::Closed => Err(RepError::Closed),
        }
    }

    /// Returns a snapshot of the wait statistics.
    pub fn stats(&self) -> ConsistencyStats {
        let mut stats = ConsistencyStats::default();
        for kind in PolicyKind::ALL {
            let counters = &self.counters[kind.index()];
            stats.per_kind[kind.index()] = PolicyStats {
                waits: counters.waits.load(Ordering::Relaxed),
                wait_time: Duration::from_nanos(counters.wait_nanos.load(Ordering::Relaxed)),
                timeouts: counters.timeouts.load(Ordering::Relaxed),
            };
        }
        stats
    }
}
