//! Hard recovery of a rejoining replica.
//!
//! After the handshake the replica sends the fingerprints of every record it
//! holds past its durable VLSN. The master answers with the matchpoint: the
//! highest VLSN at which both logs hold an identical record. Everything the
//! replica has above the matchpoint diverged from the group's history.
//!
//! ```text
//!   replica log:  1 2 3 4 5 6' 7' 8'
//!   master log:   1 2 3 4 5 6  7
//!                           ▲
//!                      matchpoint = 5, divergent suffix = 6'..8'
//! ```
//!
//! A suffix holding at most `txn_rollback_limit` committed transactions is
//! truncated automatically. A larger one, or one that reaches into records
//! known to be durable on a quorum, is refused with
//! [`RepError::RollbackProhibited`] naming the exact log position at which an
//! operator must truncate before the node can rejoin.

use keel_types::{LogPosition, Vlsn};
use tracing::{info, warn};

use crate::log::{LogApplier, ReplicationLog};
use crate::protocol::{SyncupRequest, SyncupResponse};
use crate::vlsn::VlsnIndex;
use crate::{RepError, RepResult};

// ============================================================================
// Syncup
// ============================================================================

/// Builds the replica's syncup request from its local log.
pub fn syncup_request(log: &dyn ReplicationLog) -> RepResult<SyncupRequest> {
    let durable = log.durable_vlsn();
    let tail = log
        .tail_after(durable)?
        .iter()
        .map(crate::log::LogRecord::fingerprint)
        .collect();
    Ok(SyncupRequest {
        range: log.range(),
        durable,
        tail,
    })
}

/// Finds the matchpoint for a replica on the master.
///
/// Records at or below the replica's durable VLSN are on a quorum and so in
/// the master's log; only the tail needs comparing.
pub fn find_matchpoint(
    log: &dyn ReplicationLog,
    request: &SyncupRequest,
) -> RepResult<SyncupResponse> {
    let master_range = log.range();
    for fingerprint in request.tail.iter().rev() {
        if let Some(record) = log.record_at(fingerprint.vlsn)? {
            if record.fingerprint() == *fingerprint {
                return Ok(SyncupResponse {
                    matchpoint: fingerprint.vlsn,
                    master_range,
                });
            }
        }
    }

    let agreed = if request.tail.is_empty() {
        request.range.last()
    } else {
        request.durable
    };
    Ok(SyncupResponse {
        matchpoint: agreed.min(master_range.last()),
        master_range,
    })
}

// ============================================================================
// Plan
// ============================================================================

/// What rejoining at a matchpoint requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackPlan {
    /// Highest VLSN both logs agree on.
    pub matchpoint: Vlsn,
    /// Position of the first divergent record, if any.
    pub truncate_from: Option<LogPosition>,
    /// Committed transactions in the divergent suffix.
    pub transactions: u64,
    /// Records in the divergent suffix.
    pub records: u64,
}

impl RollbackPlan {
    /// Returns true if nothing needs to be rolled back.
    pub fn is_noop(&self) -> bool {
        self.truncate_from.is_none()
    }

    /// Truncates the log, rolls the index back and notifies the applier.
    pub fn execute(
        &self,
        log: &dyn ReplicationLog,
        index: &VlsnIndex,
        applier: &dyn LogApplier,
    ) -> RepResult<()> {
        let Some(position) = self.truncate_from else {
            return Ok(());
        };
        let removed = log.truncate_from(position)?;
        index.rollback_to(self.matchpoint);
        applier.rolled_back(self.matchpoint)?;
        warn!(
            matchpoint = %self.matchpoint,
            position = %position,
            removed,
            transactions = self.transactions,
            "rolled back divergent log suffix"
        );
        Ok(())
    }
}

/// Decides whether the local log can be rolled back to `matchpoint`.
///
/// # Errors
///
/// Returns [`RepError::RollbackProhibited`] when the divergent suffix holds
/// more than `allowance` committed transactions, or when it reaches below
/// the local durable VLSN. Nothing is modified.
pub fn plan_rollback(
    log: &dyn ReplicationLog,
    matchpoint: Vlsn,
    allowance: u64,
) -> RepResult<RollbackPlan> {
    let suffix = log.tail_after(matchpoint)?;
    let Some(first) = suffix.first() else {
        return Ok(RollbackPlan {
            matchpoint,
            truncate_from: None,
            transactions: 0,
            records: 0,
        });
    };

    let position = log.position_of(first.vlsn)?.ok_or_else(|| {
        RepError::UnexpectedState(format!("no log position for {}", first.vlsn))
    })?;
    let transactions =
        u64::try_from(suffix.iter().filter(|r| r.kind.is_commit()).count()).unwrap_or(u64::MAX);
    let records = u64::try_from(suffix.len()).unwrap_or(u64::MAX);
    let durable = log.durable_vlsn();

    if transactions > allowance || durable > matchpoint {
        warn!(
            matchpoint = %matchpoint,
            position = %position,
            transactions,
            allowance,
            durable = %durable,
            "rollback prohibited"
        );
        return Err(RepError::RollbackProhibited {
            position,
            matchpoint,
            transactions,
            limit: allowance,
        });
    }

    info!(matchpoint = %matchpoint, records, transactions, "rollback planned");
    Ok(RollbackPlan {
        matchpoint,
        truncate_from: Some(position),
        transactions,
        records,
    })
}

/// Truncates the log at `position`, the explicit operator step that
/// resolves a prohibited rollback.
pub fn truncate_log(log: &dyn ReplicationLog, position: LogPosition) -> RepResult<u64> {
    let removed = log.truncate_from(position)?;
    warn!(position = %position, removed, "log truncated by operator");
    Ok(removed)
}
