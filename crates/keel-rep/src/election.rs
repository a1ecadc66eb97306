//! Master election.
//!
//! Elections are a two-phase ballot among the electable members:
//!
//! 1. **Promise**: the proposer picks a term above any it has seen and asks
//!    every electable member to promise it. Each member answers with its own
//!    [`Proposal`] and any master it already accepted in an undecided term.
//! 2. **Choose**: with a quorum of promises, an already accepted master is
//!    re-proposed; otherwise the most current proposal wins.
//! 3. **Accept**: members accept unless they promised a higher term. A quorum
//!    of accepts elects the master.
//! 4. **Announce**: every reachable member learns the result.
//!
//! # Safety Properties
//!
//! - At most one master per term: two quorums always intersect
//! - A master accepted by a quorum is re-proposed by any later ballot that
//!   reaches a member of that quorum before the result is announced
//!
//! The winner is the member with the highest VLSN, then the highest
//! priority, then the lowest node id.

use std::cmp::{Ordering, Reverse};
use std::time::Duration;

use keel_types::{MasterTerm, NodeId, NodeName, Vlsn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::{RepError, RepResult};

/// Returns the quorum for `electable` electable members: `floor(n / 2) + 1`.
///
/// Elections always need this many votes. A designated primary only acts
/// alone when it bootstraps a group that does not exist yet.
pub fn quorum_size(electable: usize) -> usize {
    electable / 2 + 1
}

/// Returns a randomized back-off in `[base, 2 * base]`.
pub fn backoff(base: Duration) -> Duration {
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX / 2);
    Duration::from_millis(rand::thread_rng().gen_range(base_ms..=base_ms.saturating_mul(2)))
}

// ============================================================================
// Messages
// ============================================================================

/// A member's candidacy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// Candidate name.
    pub node: NodeName,
    /// Candidate id.
    pub id: NodeId,
    /// Last VLSN in the candidate's log.
    pub vlsn: Vlsn,
    /// Configured priority.
    pub priority: u32,
}

impl Proposal {
    fn rank(&self) -> (Vlsn, u32, Reverse<NodeId>) {
        (self.vlsn, self.priority, Reverse(self.id))
    }

    /// Orders candidates from least to most preferred.
    pub fn compare(&self, other: &Proposal) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// Phase one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromiseRequest {
    /// The ballot's term.
    pub term: MasterTerm,
}

/// Phase one answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromiseResponse {
    /// The member promised to ignore lower terms.
    Promised {
        /// The member's own candidacy.
        proposal: Proposal,
        /// A master accepted in a term that was never announced.
        accepted: Option<(MasterTerm, Proposal)>,
    },
    /// The member already promised a term at least as high.
    Rejected { promised: MasterTerm },
}

/// Phase two request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptRequest {
    /// The ballot's term.
    pub term: MasterTerm,
    /// The chosen master.
    pub master: Proposal,
}

/// Phase two answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcceptResponse {
    /// The member accepted the master.
    Accepted,
    /// The member promised a higher term.
    Rejected { promised: MasterTerm },
}

/// The outcome of a successful election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionResult {
    /// Term of the new master.
    pub term: MasterTerm,
    /// The new master.
    pub master: Proposal,
}

/// Delivers ballot messages between members.
///
/// `None` means the member could not be reached.
pub trait ElectionTransport: Send + Sync {
    /// Sends a promise request.
    fn promise(
        &self,
        from: &NodeName,
        to: &NodeName,
        request: &PromiseRequest,
    ) -> Option<PromiseResponse>;

    /// Sends an accept request.
    fn accept(
        &self,
        from: &NodeName,
        to: &NodeName,
        request: &AcceptRequest,
    ) -> Option<AcceptResponse>;

    /// Announces a result. Delivery is best effort.
    fn announce(&self, from: &NodeName, to: &NodeName, result: &ElectionResult);
}

// ============================================================================
// Acceptor
// ============================================================================

/// The voting side of an election, one per electable member.
#[derive(Debug, Clone, Default)]
pub struct Acceptor {
    promised: MasterTerm,
    accepted: Option<(MasterTerm, Proposal)>,
    decided: MasterTerm,
}

impl Acceptor {
    /// Creates an acceptor that has seen no ballots.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the highest term promised.
    pub fn promised(&self) -> MasterTerm {
        self.promised
    }

    /// Returns the highest term announced.
    pub fn decided(&self) -> MasterTerm {
        self.decided
    }

    /// Handles a promise request. `local` is this member's candidacy.
    pub fn on_promise(&mut self, request: &PromiseRequest, local: Proposal) -> PromiseResponse {
        if request.term <= self.promised {
            return PromiseResponse::Rejected {
                promised: self.promised,
            };
        }
        self.promised = request.term;
        let accepted = self
            .accepted
            .clone()
            .filter(|(term, _)| *term > self.decided);
        PromiseResponse::Promised {
            proposal: local,
            accepted,
        }
    }

    /// Handles an accept request.
    pub fn on_accept(&mut self, request: &AcceptRequest) -> AcceptResponse {
        if request.term < self.promised {
            return AcceptResponse::Rejected {
                promised: self.promised,
            };
        }
        self.promised = request.term;
        self.accepted = Some((request.term, request.master.clone()));
        AcceptResponse::Accepted
    }

    /// Records an announced result.
    pub fn on_decided(&mut self, result: &ElectionResult) {
        self.decided = self.decided.max(result.term);
        self.promised = self.promised.max(result.term);
    }
}

// ============================================================================
// Proposer
// ============================================================================

/// The campaigning side of an election.
#[derive(Debug, Clone)]
pub struct Proposer {
    local: NodeName,
    highest_seen: MasterTerm,
}

impl Proposer {
    /// Creates a proposer for `local`.
    pub fn new(local: NodeName) -> Self {
        Self {
            local,
            highest_seen: MasterTerm::ZERO,
        }
    }

    /// Records a term seen elsewhere so the next ballot runs above it.
    pub fn observe(&mut self, term: MasterTerm) {
        self.highest_seen = self.highest_seen.max(term);
    }

    /// Returns the highest term seen.
    pub fn highest_seen(&self) -> MasterTerm {
        self.highest_seen
    }

    /// Runs one ballot among `electorate`.
    ///
    /// # Errors
    ///
    /// Returns [`RepError::QuorumNotReached`] when fewer than `quorum`
    /// members promise or accept. The caller retries after [`backoff`].
    #[instrument(skip(self, transport, electorate), fields(node = %self.local))]
    pub fn run(
        &mut self,
        transport: &dyn ElectionTransport,
        electorate: &[NodeName],
        quorum: usize,
    ) -> RepResult<ElectionResult> {
        let term = self.highest_seen.next();
        self.highest_seen = term;
        debug!(term = %term, members = electorate.len(), quorum, "election started");

        // Phase 1: promises.
        let request = PromiseRequest { term };
        let mut promisers = Vec::new();
        let mut candidates = Vec::new();
        let mut prior: Option<(MasterTerm, Proposal)> = None;
        for member in electorate {
            match transport.promise(&self.local, member, &request) {
                Some(PromiseResponse::Promised { proposal, accepted }) => {
                    promisers.push(member.clone());
                    candidates.push(proposal);
                    if let Some((t, p)) = accepted {
                        if prior.as_ref().is_none_or(|(best, _)| t > *best) {
                            prior = Some((t, p));
                        }
                    }
                }
                Some(PromiseResponse::Rejected { promised }) => self.observe(promised),
                None => {}
            }
        }
        if promisers.len() < quorum {
            debug!(term = %term, got = promisers.len(), "promise quorum not reached");
            return Err(RepError::QuorumNotReached {
                needed: quorum,
                got: promisers.len(),
            });
        }

        // Phase 2: choose.
        let master = match prior {
            Some((_, accepted)) => accepted,
            None => candidates
                .into_iter()
                .max_by(Proposal::compare)
                .ok_or(RepError::QuorumNotReached {
                    needed: quorum,
                    got: 0,
                })?,
        };

        // Phase 3: accepts.
        let request = AcceptRequest {
            term,
            master: master.clone(),
        };
        let mut accepts = 0;
        for member in &promisers {
            match transport.accept(&self.local, member, &request) {
                Some(AcceptResponse::Accepted) => accepts += 1,
                Some(AcceptResponse::Rejected { promised }) => self.observe(promised),
                None => {}
            }
        }
        if accepts < quorum {
            debug!(term = %term, got = accepts, "accept quorum not reached");
            return Err(RepError::QuorumNotReached {
                needed: quorum,
                got: accepts,
            });
        }

        // Phase 4: announce.
        let result = ElectionResult { term, master };
        info!(term = %term, master = %result.master.node, "election decided");
        for member in electorate {
            transport.announce(&self.local, member, &result);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;

    use proptest::prelude::*;

    use super::*;

    fn name(s: &str) -> NodeName {
        NodeName::new(s).unwrap()
    }

    fn proposal(node: &str, id: u32, vlsn: u64, priority: u32) -> Proposal {
        Proposal {
            node: name(node),
            id: NodeId::new(id),
            vlsn: Vlsn::new(vlsn),
            priority,
        }
    }

    /// In-memory electorate with reachability control.
    struct Members {
        members: Mutex<BTreeMap<NodeName, (Acceptor, Proposal)>>,
        down: Mutex<BTreeSet<NodeName>>,
        announced: Mutex<Vec<(NodeName, ElectionResult)>>,
    }

    impl Members {
        fn new(proposals: Vec<Proposal>) -> Self {
            Self {
                members: Mutex::new(
                    proposals
                        .into_iter()
                        .map(|p| (p.node.clone(), (Acceptor::new(), p)))
                        .collect(),
                ),
                down: Mutex::new(BTreeSet::new()),
                announced: Mutex::new(Vec::new()),
            }
        }

        fn names(&self) -> Vec<NodeName> {
            self.members.lock().unwrap().keys().cloned().collect()
        }

        fn kill(&self, node: &str) {
            self.down.lock().unwrap().insert(name(node));
        }

        fn up(&self, node: &NodeName) -> bool {
            !self.down.lock().unwrap().contains(node)
        }
    }

    impl ElectionTransport for Members {
        fn promise(&self, _: &NodeName, to: &NodeName, r: &PromiseRequest) -> Option<PromiseResponse> {
            if !self.up(to) {
                return None;
            }
            let mut members = self.members.lock().unwrap();
            let (acceptor, local) = members.get_mut(to)?;
            let local = local.clone();
            Some(acceptor.on_promise(r, local))
        }

        fn accept(&self, _: &NodeName, to: &NodeName, r: &AcceptRequest) -> Option<AcceptResponse> {
            if !self.up(to) {
                return None;
            }
            let mut members = self.members.lock().unwrap();
            Some(members.get_mut(to)?.0.on_accept(r))
        }

        fn announce(&self, _: &NodeName, to: &NodeName, result: &ElectionResult) {
            if !self.up(to) {
                return;
            }
            if let Some((acceptor, _)) = self.members.lock().unwrap().get_mut(to) {
                acceptor.on_decided(result);
            }
            self.announced
                .lock()
                .unwrap()
                .push((to.clone(), result.clone()));
        }
    }

    #[test]
    fn quorum_sizes() {
        assert_eq!(quorum_size(1), 1);
        assert_eq!(quorum_size(2), 2);
        assert_eq!(quorum_size(3), 2);
        assert_eq!(quorum_size(4), 3);
        assert_eq!(quorum_size(5), 3);
    }

    #[test]
    fn most_current_member_wins() {
        let members = Members::new(vec![
            proposal("a", 1, 10, 1),
            proposal("b", 2, 12, 1),
            proposal("c", 3, 12, 5),
        ]);
        let result = Proposer::new(name("a"))
            .run(&members, &members.names(), 2)
            .unwrap();
        assert_eq!(result.master.node, name("c"));
        assert_eq!(result.term, MasterTerm::new(1));
        assert_eq!(members.announced.lock().unwrap().len(), 3);
    }

    #[test]
    fn ties_break_on_lowest_id() {
        let a = proposal("a", 4, 7, 1);
        let b = proposal("b", 2, 7, 1);
        assert_eq!(a.compare(&b), Ordering::Less);
    }

    #[test]
    fn needs_quorum_of_reachable_members() {
        let members = Members::new(vec![
            proposal("a", 1, 1, 1),
            proposal("b", 2, 1, 1),
            proposal("c", 3, 1, 1),
        ]);
        members.kill("b");
        assert!(Proposer::new(name("a")).run(&members, &members.names(), 2).is_ok());

        members.kill("c");
        assert!(matches!(
            Proposer::new(name("a")).run(&members, &members.names(), 2),
            Err(RepError::QuorumNotReached { needed: 2, got: 1 })
        ));
    }

    #[test]
    fn acceptor_promises_only_higher_terms() {
        let mut acceptor = Acceptor::new();
        let local = proposal("a", 1, 1, 1);
        let t = |n| PromiseRequest {
            term: MasterTerm::new(n),
        };

        assert!(matches!(
            acceptor.on_promise(&t(2), local.clone()),
            PromiseResponse::Promised { .. }
        ));
        assert_eq!(
            acceptor.on_promise(&t(2), local.clone()),
            PromiseResponse::Rejected {
                promised: MasterTerm::new(2)
            }
        );
        assert_eq!(
            acceptor.on_accept(&AcceptRequest {
                term: MasterTerm::new(1),
                master: local.clone(),
            }),
            AcceptResponse::Rejected {
                promised: MasterTerm::new(2)
            }
        );
    }

    #[test]
    fn accepted_master_is_reproposed() {
        let members = Members::new(vec![
            proposal("a", 1, 1, 1),
            proposal("b", 2, 9, 1),
            proposal("c", 3, 1, 1),
        ]);
        // An earlier ballot got "a" accepted by a and c but never announced.
        {
            let mut guard = members.members.lock().unwrap();
            let request = AcceptRequest {
                term: MasterTerm::new(1),
                master: proposal("a", 1, 1, 1),
            };
            for n in ["a", "c"] {
                guard.get_mut(&name(n)).unwrap().0.on_accept(&request);
            }
        }

        let mut proposer = Proposer::new(name("b"));
        proposer.observe(MasterTerm::new(1));
        let result = proposer.run(&members, &members.names(), 2).unwrap();
        assert_eq!(result.master.node, name("a"));
        assert_eq!(result.term, MasterTerm::new(2));

        // Once announced, the next ballot chooses freely.
        let result = proposer.run(&members, &members.names(), 2).unwrap();
        assert_eq!(result.master.node, name("b"));
    }

    #[test]
    fn rejected_proposer_learns_higher_term() {
        let members = Members::new(vec![proposal("a", 1, 1, 1), proposal("b", 2, 1, 1)]);
        Proposer::new(name("b"))
            .run(&members, &members.names(), 2)
            .unwrap();

        let mut stale = Proposer::new(name("a"));
        assert!(stale.run(&members, &members.names(), 2).is_err());
        assert_eq!(stale.highest_seen(), MasterTerm::new(1));
        assert!(stale.run(&members, &members.names(), 2).is_ok());
    }

    #[test]
    fn backoff_stays_in_window() {
        let base = Duration::from_millis(40);
        for _ in 0..50 {
            let d = backoff(base);
            assert!(d >= base && d <= base * 2);
        }
    }

    proptest! {
        #[test]
        fn two_quorums_intersect(n in 1usize..64) {
            prop_assert!(2 * quorum_size(n) > n);
            prop_assert!(quorum_size(n) <= n);
        }
    }
}
