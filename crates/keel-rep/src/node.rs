//! The replication node runtime.
//!
//! A [`RepNode`] owns one node's replicated environment and a driver thread
//! that keeps re-deriving the node's role:
//!
//! ```text
//!                  ┌────────────── driver tick ──────────────┐
//!                  ▼                                         │
//!   UNKNOWN ── announced / found master ──► join ──► REPLICA ─┤ stream lost
//!      │  ╲                                                  │
//!      │   ╲─ no master, electable ──► election ──► MASTER ──┤ higher term
//!      │                                                     │
//!      └─ designated primary, no group ──► bootstrap ─► MASTER
//! ```
//!
//! Inbound connections are served on their own threads: handshake, syncup,
//! then a feeder per replica. Errors that cannot be cured by retrying
//! (identity or version mismatches, divergence beyond the rollback limit,
//! store failures, failing listeners) invalidate the environment; every later
//! operation fails with [`RepError::EnvironmentInvalidated`] until it is
//! closed.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use keel_types::{
    CommitToken, DatabaseName, GroupUuid, LogPosition, MasterTerm, NodeId, NodeIdentity,
    NodeName, NodeState, NodeType, VlsnRange,
};
use tracing::{debug, error, info, instrument, warn};

use crate::channel::Channel;
use crate::clock::{Clock, SystemClock};
use crate::config::{Durability, RepConfig};
use crate::consistency::{ConsistencyPolicy, ConsistencyStats, ConsistencyTracker};
use crate::election::{
    AcceptRequest, AcceptResponse, Acceptor, ElectionResult, PromiseRequest, PromiseResponse,
    Proposal, Proposer, backoff, quorum_size,
};
use crate::feeder::{self, AckTracker, FeederContext, FeederHandle, FeederStats};
use crate::group::{AddOutcome, GroupChange, RepGroup};
use crate::handshake::{
    self, ConnectionRegistry, HandshakeRejection, MasterView, ReplicaHello,
};
use crate::log::{LogApplier, MemoryLog, MemoryStore, RecordKind, ReplicationLog};
use crate::network::{Endpoint, LocalNetwork};
use crate::preemption::{DatabaseHandle, NamingOp, PreemptionRegistry};
use crate::protocol::WireMessage;
use crate::replay::{LogWriter, ReplayCounters, ReplayExit, ReplayStats, Replayer};
use crate::rollback;
use crate::state::{NodeStateMachine, StateChangeListener, Subscription};
use crate::vlsn::VlsnIndex;
use crate::{ErrorKind, RepError, RepResult};

// ============================================================================
// Environment
// ============================================================================

/// The storage collaborators of a node.
#[derive(Debug, Clone)]
pub struct NodeEnv {
    /// The node's durable log.
    pub log: Arc<dyn ReplicationLog>,
    /// The data store records are applied to.
    pub applier: Arc<dyn LogApplier>,
    /// Wall clock used for commit times, heartbeats and skew checks.
    pub clock: Arc<dyn Clock>,
}

impl NodeEnv {
    /// Creates an environment from its parts.
    pub fn new(
        log: Arc<dyn ReplicationLog>,
        applier: Arc<dyn LogApplier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            log,
            applier,
            clock,
        }
    }

    /// Creates an environment backed by [`MemoryLog`] and [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryLog::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
        )
    }
}

/// Node statistics.
#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    /// Consistency waits on this node.
    pub consistency: ConsistencyStats,
    /// One entry per connected replica while master.
    pub feeders: Vec<FeederStats>,
    /// Stream replay while replica.
    pub replay: ReplayStats,
}

// ============================================================================
// Internal State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// An election result arrived.
    Announced,
    /// The replica stream ended.
    StreamLost,
    /// Re-evaluate now.
    Kick,
    /// Stop the driver.
    Close,
}

#[derive(Debug)]
struct ReplayHandle {
    shutdown: Arc<AtomicBool>,
    thread: JoinHandle<ReplayExit>,
}

#[derive(Debug, Default)]
struct Role {
    term: MasterTerm,
    master: Option<NodeName>,
    leading: bool,
    feeders: Vec<FeederHandle>,
    replay: Option<ReplayHandle>,
}

impl Role {
    /// Clears the role and returns the threads that still need stopping.
    fn relinquish(&mut self) -> (Vec<FeederHandle>, Option<ReplayHandle>) {
        self.master = None;
        self.leading = false;
        (std::mem::take(&mut self.feeders), self.replay.take())
    }
}

struct NodeInner {
    me: Weak<NodeInner>,
    name: NodeName,
    config: RepConfig,
    identity: RwLock<NodeIdentity>,
    network: Arc<LocalNetwork>,
    clock: Arc<dyn Clock>,
    writer: Arc<LogWriter>,
    state: NodeStateMachine,
    consistency: ConsistencyTracker,
    preemption: Arc<PreemptionRegistry>,
    acks: Arc<AckTracker>,
    connections: Arc<ConnectionRegistry>,
    replay_counters: Arc<ReplayCounters>,
    role: Mutex<Role>,
    acceptor: Mutex<Acceptor>,
    proposer: Mutex<Proposer>,
    announced: Mutex<Option<ElectionResult>>,
    // Serializes role changes, log truncation and membership changes.
    join_lock: Mutex<()>,
    commands: Sender<Command>,
    invalidated: RwLock<Option<Arc<RepError>>>,
    closed: AtomicBool,
}

impl fmt::Debug for NodeInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeInner")
            .field("name", &self.name)
            .field("state", &self.state.state())
            .field("range", &self.writer.index().range())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Node
// ============================================================================

/// A node of a replication group.
#[derive(Debug)]
pub struct RepNode {
    inner: Arc<NodeInner>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl RepNode {
    /// Opens a node on `env` and starts joining the group over `network`.
    ///
    /// The group table is rebuilt from the membership records of the log.
    /// The call returns immediately; use [`RepNode::await_active`] to wait
    /// for the node to become master or replica.
    ///
    /// # Errors
    ///
    /// - [`RepError::UnexpectedState`] for a monitor identity, which does not
    ///   host an environment
    /// - [`RepError::UnexpectedStateFatal`] if the log belongs to another group
    pub fn open(config: RepConfig, env: NodeEnv, network: Arc<LocalNetwork>) -> RepResult<Self> {
        if config.node.node_type == NodeType::Monitor {
            return Err(RepError::UnexpectedState(format!(
                "{} is a monitor and does not host a replicated environment",
                config.node.name
            )));
        }

        let index = Arc::new(VlsnIndex::new(env.log.range()));
        let preemption = Arc::new(PreemptionRegistry::new());
        let writer = Arc::new(LogWriter::new(
            env.log,
            env.applier,
            Arc::clone(&index),
            Arc::clone(&preemption),
            Arc::clone(&env.clock),
            config.handshake.log_version,
        ));
        writer.recover()?;

        let mut identity = config.node.clone();
        if let Some(group) = writer.group() {
            if group.name() != config.group_name {
                return Err(RepError::UnexpectedStateFatal(format!(
                    "log belongs to group {}, configured for {}",
                    group.name(),
                    config.group_name
                )));
            }
            if let Some(member) = group.member(&identity.name) {
                identity.id = member.id;
            }
        }

        let name = identity.name.clone();
        let (commands, rx) = mpsc::channel();
        let inner = Arc::new_cyclic(|me| NodeInner {
            me: me.clone(),
            name: name.clone(),
            identity: RwLock::new(identity),
            network: Arc::clone(&network),
            clock: Arc::clone(&env.clock),
            consistency: ConsistencyTracker::new(Arc::clone(&index), Arc::clone(&env.clock)),
            state: NodeStateMachine::new(name.clone()),
            writer,
            preemption,
            acks: Arc::new(AckTracker::new()),
            connections: Arc::new(ConnectionRegistry::new()),
            replay_counters: Arc::new(ReplayCounters::new()),
            role: Mutex::new(Role::default()),
            acceptor: Mutex::new(Acceptor::new()),
            proposer: Mutex::new(Proposer::new(name.clone())),
            announced: Mutex::new(None),
            join_lock: Mutex::new(()),
            commands,
            invalidated: RwLock::new(None),
            closed: AtomicBool::new(false),
            config,
        });

        let endpoint: Weak<dyn Endpoint> = Arc::downgrade(&inner) as Weak<NodeInner>;
        network.register(name.clone(), endpoint);

        let driver = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name(format!("rep-driver-{name}"))
                .spawn(move || inner.drive(&rx))?
        };
        info!(node = %name, range = %inner.writer.index().range(), "node opened");

        Ok(Self {
            inner,
            driver: Mutex::new(Some(driver)),
        })
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    /// Returns the node's name.
    pub fn name(&self) -> &NodeName {
        &self.inner.name
    }

    /// Returns the node's identity, with its group-assigned id once joined.
    pub fn identity(&self) -> NodeIdentity {
        self.inner.identity()
    }

    /// Returns the node's current state.
    pub fn state(&self) -> NodeState {
        self.inner.state.state()
    }

    /// Returns the master this node knows of.
    pub fn master(&self) -> Option<NodeName> {
        self.inner.state.master()
    }

    /// Returns a snapshot of the group table.
    pub fn group(&self) -> Option<RepGroup> {
        self.inner.writer.group()
    }

    /// Returns the VLSN range applied locally.
    pub fn range(&self) -> VlsnRange {
        self.inner.writer.index().range()
    }

    /// Returns the node's statistics.
    pub fn stats(&self) -> NodeStats {
        let feeders = self
            .inner
            .role
            .lock()
            .expect("lock poisoned")
            .feeders
            .iter()
            .map(FeederHandle::stats)
            .collect();
        NodeStats {
            consistency: self.inner.consistency.stats(),
            feeders,
            replay: self.inner.replay_counters.snapshot(),
        }
    }

    /// Installs the state change listener, replacing any previous one. It is
    /// called immediately with the current state.
    ///
    /// A listener that fails on a later transition invalidates the node.
    pub fn set_state_change_listener(&self, listener: Box<dyn StateChangeListener>) -> RepResult<()> {
        self.inner.check_usable()?;
        self.inner.state.set_listener(listener)
    }

    /// Removes the state change listener.
    pub fn clear_state_change_listener(&self) {
        self.inner.state.clear_listener();
    }

    /// Opens a bounded queue of state change events, starting with the
    /// current state. Dropping it cancels the subscription.
    pub fn subscribe(&self, capacity: usize) -> Subscription {
        self.inner.state.subscribe(capacity)
    }

    /// Waits until the node is master or replica.
    ///
    /// # Errors
    ///
    /// - [`RepError::EnvironmentInvalidated`] if joining failed for good
    /// - [`RepError::JoinTimeout`] when `timeout` elapses first
    pub fn await_active(&self, timeout: Duration) -> RepResult<NodeState> {
        let deadline = Instant::now() + timeout;
        let slice = self.inner.config.timeouts.driver_tick.max(Duration::from_millis(1));
        loop {
            self.inner.check_usable()?;
            let now = Instant::now();
            if now >= deadline {
                return Err(RepError::JoinTimeout { waited: timeout });
            }
            let wait = slice.min(deadline - now);
            if let Some(event) = self.inner.state.await_state(wait, |s| s.is_active()) {
                return Ok(event.state);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Writes (master only)
    // ------------------------------------------------------------------------

    /// Commits a transaction with the configured durability.
    pub fn commit(&self, payload: Bytes) -> RepResult<CommitToken> {
        self.commit_with_durability(payload, self.inner.config.durability)
    }

    /// Commits a transaction, waiting for the acknowledgments `durability`
    /// requires.
    ///
    /// # Errors
    ///
    /// - [`RepError::NotMaster`] on a replica or an unjoined node
    /// - [`RepError::InsufficientReplicas`] if too few electable replicas are
    ///   connected; nothing is written
    /// - [`RepError::InsufficientAcks`] if acknowledgments do not arrive in
    ///   time; the transaction is committed locally
    pub fn commit_with_durability(
        &self,
        payload: Bytes,
        durability: Durability,
    ) -> RepResult<CommitToken> {
        self.inner.commit_with(durability, |writer, term| {
            writer.append_new(term, RecordKind::Commit, payload)
        })
    }

    /// Adds an electable or monitor member to the group.
    ///
    /// Returns the identity with its assigned id. Adding an identical live
    /// member again returns the existing identity.
    pub fn add_member(&self, identity: NodeIdentity) -> RepResult<NodeIdentity> {
        if !identity.node_type.is_persistent() {
            return Err(RepError::MemberConflict(format!(
                "{} is a {} node and cannot be added as a persistent member",
                identity.name, identity.node_type
            )));
        }
        let outcome = self
            .inner
            .writer
            .group()
            .ok_or_else(|| self.inner.not_master())?
            .validate_add(&identity)?;
        match outcome {
            AddOutcome::AlreadyMember(existing) => Ok(existing),
            AddOutcome::Added(_) => self.inner.commit_add(&identity),
        }
    }

    /// Adds a monitor, or returns the existing one.
    pub fn ensure_monitor(&self, identity: NodeIdentity) -> RepResult<NodeIdentity> {
        if identity.node_type != NodeType::Monitor {
            return Err(RepError::MemberConflict(format!(
                "{} is not a monitor",
                identity.name
            )));
        }
        self.add_member(identity)
    }

    /// Removes a member. Its name can never be used again in this group.
    pub fn remove_member(&self, name: &NodeName) -> RepResult<()> {
        if *name == self.inner.name {
            return Err(RepError::MemberConflict(format!(
                "{name} is the master and cannot remove itself"
            )));
        }
        self.inner.commit_membership(|group| {
            group.validate_remove(name)?;
            Ok(GroupChange::Remove(name.clone()))
        })?;

        let role = self.inner.role.lock().expect("lock poisoned");
        for feeder in role.feeders.iter().filter(|f| f.replica() == name) {
            feeder.stop();
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Databases
    // ------------------------------------------------------------------------

    /// Opens a handle to a replicated database.
    pub fn open_database(&self, database: impl Into<DatabaseName>) -> RepResult<DatabaseHandle> {
        self.inner.check_usable()?;
        Ok(self.inner.preemption.open(database.into()))
    }

    /// Removes a database on every node.
    pub fn remove_database(&self, database: impl Into<DatabaseName>) -> RepResult<CommitToken> {
        self.inner.commit_naming(&NamingOp::Remove(database.into()))
    }

    /// Renames a database on every node.
    pub fn rename_database(
        &self,
        from: impl Into<DatabaseName>,
        to: impl Into<DatabaseName>,
    ) -> RepResult<CommitToken> {
        self.inner.commit_naming(&NamingOp::Rename {
            from: from.into(),
            to: to.into(),
        })
    }

    /// Truncates a database on every node.
    pub fn truncate_database(&self, database: impl Into<DatabaseName>) -> RepResult<CommitToken> {
        self.inner
            .commit_naming(&NamingOp::Truncate(database.into()))
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Blocks until the node satisfies the consistency policy in effect:
    /// the cursor's, else the transaction's, else the configured default.
    ///
    /// Returns the time spent waiting. Always immediate on the master.
    pub fn ensure_consistency(
        &self,
        txn: Option<ConsistencyPolicy>,
        cursor: Option<ConsistencyPolicy>,
    ) -> RepResult<Duration> {
        self.inner.check_usable()?;
        let policy =
            ConsistencyPolicy::resolve(self.inner.config.default_consistency, txn, cursor);
        if self.inner.state.state().is_master() || policy == ConsistencyPolicy::NoConsistencyRequired
        {
            return Ok(Duration::ZERO);
        }
        let group = self.inner.group_uuid()?;
        self.inner
            .consistency
            .await_consistency(&policy, group)
            .map_err(|e| self.inner.wrap_if_invalidated(e))
    }

    // ------------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------------

    /// Truncates the local log at `position`, the explicit step that lets a
    /// node whose rollback was prohibited rejoin.
    ///
    /// Only allowed while the node is not master or replica. Clears an
    /// invalidation caused by divergence.
    pub fn truncate_log(&self, position: LogPosition) -> RepResult<u64> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(RepError::Closed);
        }
        if let Some(cause) = inner.invalidation() {
            if cause.kind() != ErrorKind::Divergence {
                return Err(RepError::EnvironmentInvalidated { cause });
            }
        }

        let _join = inner.join_lock.lock().expect("lock poisoned");
        let state = inner.state.state();
        if state.is_active() {
            return Err(RepError::UnexpectedState(format!(
                "log truncation requires a node that is not active, {} is {state}",
                inner.name
            )));
        }
        let writer = &inner.writer;
        let removed = rollback::truncate_log(writer.log().as_ref(), position)?;
        let last = writer.log().range().last();
        writer.index().rollback_to(last);
        writer.applier().rolled_back(last)?;
        writer.recover()?;
        writer.reseed();

        *inner.invalidated.write().expect("lock poisoned") = None;
        inner.kick();
        info!(node = %inner.name, position = %position, removed, "log truncated, rejoining");
        Ok(removed)
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Closes the node. An active node steps down to [`NodeState::Unknown`]
    /// first, then moves to [`NodeState::Detached`] and leaves the network.
    pub fn close(&self) -> RepResult<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // The driver may already be gone.
        let _ = inner.commands.send(Command::Close);
        if let Some(driver) = self.driver.lock().expect("lock poisoned").take() {
            if driver.join().is_err() {
                error!(node = %inner.name, "driver thread panicked");
            }
        }

        if inner.state.state().is_active() {
            if let Err(e) = inner.state.transition(NodeState::Unknown, None) {
                warn!(node = %inner.name, error = %e, "step down on close failed");
            }
        }
        inner.relinquish();
        inner.network.unregister(&inner.name);
        inner.writer.index().close();
        inner.acks.close();
        inner.state.transition(NodeState::Detached, None)?;
        info!(node = %inner.name, "node closed");
        Ok(())
    }
}

impl Drop for RepNode {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(node = %self.inner.name, error = %e, "error closing node");
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

impl NodeInner {
    fn drive(&self, rx: &Receiver<Command>) {
        let tick = self.config.timeouts.driver_tick;
        let mut wait = Duration::ZERO;
        loop {
            match rx.recv_timeout(wait) {
                Ok(Command::Close) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(_) | Err(RecvTimeoutError::Timeout) => {}
            }
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            wait = tick;
            if self.invalidation().is_some() {
                continue;
            }

            let _join = self.join_lock.lock().expect("lock poisoned");
            let outcome = match self.state.state() {
                NodeState::Unknown => self.seek_role(),
                NodeState::Master => self.tend_master(),
                NodeState::Replica => self.tend_replica(),
                NodeState::Detached => break,
            };
            match outcome {
                Ok(Some(delay)) => wait = delay,
                Ok(None) => {}
                Err(e) if is_final(&e) => {
                    self.invalidate(e);
                }
                Err(e) => debug!(node = %self.name, error = %e, "role change deferred"),
            }
        }
        debug!(node = %self.name, "driver stopped");
    }

    fn kick(&self) {
        // The driver may already be gone.
        let _ = self.commands.send(Command::Kick);
    }

    /// Finds a role while `Unknown`. Returns a back-off to wait before the
    /// next attempt, if any.
    fn seek_role(&self) -> RepResult<Option<Duration>> {
        let announced = self
            .announced
            .lock()
            .expect("lock poisoned")
            .as_ref()
            .map(|r| (r.term, r.master.node.clone()));
        let found = self.network.find_master(&self.name);
        let target = match (announced, found) {
            (Some(a), Some(f)) => Some(if f.0 > a.0 { f } else { a }),
            (a, f) => a.or(f),
        };

        if let Some((term, master)) = target {
            if master == self.name {
                return self.lead(term).map(|()| None);
            }
            return match self.follow(&master) {
                Ok(()) => Ok(None),
                Err(RepError::Handshake(HandshakeRejection::NotMaster { .. })) => {
                    // The winner has not taken over yet.
                    Ok(None)
                }
                Err(e) => {
                    self.forget_announced(term);
                    Err(e)
                }
            };
        }

        let Some(group) = self.writer.group() else {
            if self.config.designated_primary && self.identity().node_type.is_electable() {
                self.bootstrap()?;
            }
            return Ok(None);
        };
        self.elect(&group)
    }

    fn elect(&self, group: &RepGroup) -> RepResult<Option<Duration>> {
        let electable = group
            .member(&self.name)
            .is_some_and(|m| m.node_type.is_electable());
        if !electable {
            return Ok(None);
        }
        let electorate: Vec<NodeName> = group.electable_members().map(|m| m.name.clone()).collect();
        let quorum = quorum_size(electorate.len());

        let known = {
            let acceptor = self.acceptor.lock().expect("lock poisoned");
            let followed = self.role.lock().expect("lock poisoned").term;
            acceptor.promised().max(acceptor.decided()).max(followed)
        };
        let mut proposer = self.proposer.lock().expect("lock poisoned");
        proposer.observe(known);
        match proposer.run(self.network.as_ref(), &electorate, quorum) {
            Ok(_) => Ok(None),
            Err(RepError::QuorumNotReached { .. }) => {
                Ok(Some(backoff(self.config.timeouts.election_backoff)))
            }
            Err(e) => Err(e),
        }
    }

    fn tend_master(&self) -> RepResult<Option<Duration>> {
        if self.superseded() || self.deposed() {
            self.step_down();
            return Ok(None);
        }

        let finished: Vec<FeederHandle> = {
            let mut role = self.role.lock().expect("lock poisoned");
            let (done, live): (Vec<_>, Vec<_>) = std::mem::take(&mut role.feeders)
                .into_iter()
                .partition(FeederHandle::is_finished);
            role.feeders = live;
            done
        };
        for feeder in finished {
            let replica = feeder.replica().clone();
            feeder.join();
            self.writer.with_group(|group| {
                if let Some(group) = group {
                    if group.remove_secondary(&replica).is_some() {
                        debug!(node = %self.name, secondary = %replica, "secondary disconnected");
                    }
                }
            });
        }
        Ok(None)
    }

    fn tend_replica(&self) -> RepResult<Option<Duration>> {
        if self.superseded() {
            self.step_down();
            return Ok(None);
        }

        let exited = {
            let mut role = self.role.lock().expect("lock poisoned");
            let finished = role
                .replay
                .as_ref()
                .is_some_and(|replay| replay.thread.is_finished());
            if finished { role.replay.take() } else { None }
        };
        let Some(replay) = exited else {
            return Ok(None);
        };
        let exit = replay.thread.join().unwrap_or_else(|_| {
            ReplayExit::Failed(RepError::UnexpectedState("replay thread panicked".into()))
        });
        self.step_down();
        match exit {
            ReplayExit::Failed(e @ (RepError::Apply(_) | RepError::Log(_))) => Err(e),
            ReplayExit::Failed(e) => {
                warn!(node = %self.name, error = %e, "stream failed, resyncing");
                Ok(None)
            }
            ReplayExit::MasterLost(_) | ReplayExit::Shutdown => Ok(None),
        }
    }

    fn forget_announced(&self, term: MasterTerm) {
        let mut announced = self.announced.lock().expect("lock poisoned");
        if announced.as_ref().is_some_and(|r| r.term == term) {
            *announced = None;
        }
    }

    /// Returns true if another reachable node follows a master with a higher
    /// term, which happens when this master missed an election.
    fn deposed(&self) -> bool {
        let term = self.role.lock().expect("lock poisoned").term;
        self.network
            .find_master(&self.name)
            .is_some_and(|(other_term, other)| other_term > term && other != self.name)
    }

    /// Returns true if an election with a higher term chose another master.
    fn superseded(&self) -> bool {
        let announced = self.announced.lock().expect("lock poisoned");
        let Some(result) = announced.as_ref() else {
            return false;
        };
        let mut role = self.role.lock().expect("lock poisoned");
        if result.term <= role.term {
            return false;
        }
        if role.leading && result.master.node == self.name {
            role.term = result.term;
            return false;
        }
        true
    }

    // ------------------------------------------------------------------------
    // Role changes
    // ------------------------------------------------------------------------

    fn step_down(&self) {
        if let Err(e) = self.transition(NodeState::Unknown, None) {
            debug!(node = %self.name, error = %e, "step down transition failed");
        }
        self.relinquish();
    }

    /// Stops every feeder and the replay thread.
    fn relinquish(&self) {
        let (feeders, replay) = self.role.lock().expect("lock poisoned").relinquish();
        for feeder in feeders {
            feeder.join();
        }
        if let Some(replay) = replay {
            replay.shutdown.store(true, Ordering::Release);
            if replay.thread.join().is_err() {
                error!(node = %self.name, "replay thread panicked");
            }
        }
    }

    fn assume_master(&self, term: MasterTerm) {
        let mut role = self.role.lock().expect("lock poisoned");
        role.term = term;
        role.master = Some(self.name.clone());
        role.leading = true;
        drop(role);
        self.writer.reseed();
    }

    #[instrument(skip(self), fields(node = %self.name))]
    fn lead(&self, term: MasterTerm) -> RepResult<()> {
        self.assume_master(term);
        self.refresh_quorum();
        self.transition(NodeState::Master, Some(self.name.clone()))
    }

    /// Forms a new group with this node as its only member.
    #[instrument(skip(self), fields(node = %self.name))]
    fn bootstrap(&self) -> RepResult<()> {
        let term = {
            let mut acceptor = self.acceptor.lock().expect("lock poisoned");
            let term = acceptor.promised().max(acceptor.decided()).next();
            acceptor.on_decided(&ElectionResult {
                term,
                master: self.proposal(),
            });
            term
        };
        self.assume_master(term);

        let uuid = GroupUuid::generate();
        let founder = self.identity().with_id(NodeId::new(1));
        self.writer.append_structured(
            term,
            RecordKind::Membership,
            &GroupChange::Create {
                name: self.config.group_name.clone(),
                uuid,
            },
        )?;
        self.writer.append_structured(
            term,
            RecordKind::Membership,
            &GroupChange::Add(founder.clone()),
        )?;
        self.writer.log().mark_durable(self.writer.index().last())?;
        *self.identity.write().expect("lock poisoned") = founder;
        info!(group = %self.config.group_name, uuid = %uuid, "group bootstrapped");

        self.refresh_quorum();
        self.transition(NodeState::Master, Some(self.name.clone()))
    }

    /// Joins `master` as a replica: handshake, syncup, rollback, stream.
    #[instrument(skip(self), fields(node = %self.name))]
    fn follow(&self, master: &NodeName) -> RepResult<()> {
        let timeouts = self.config.timeouts;
        let identity = self.identity();
        let mut channel = self.network.connect(&identity, master)?;

        let group_uuid = self.writer.group().map(|g| g.uuid());
        let hello = ReplicaHello {
            group_name: &self.config.group_name,
            group_uuid,
            node: &identity,
            config: &self.config.handshake,
            max_clock_delta: self.config.max_clock_delta,
            clock: self.clock.as_ref(),
        };
        let result = handshake::initiate(&mut channel, &hello, timeouts.handshake_timeout)?;
        self.identity.write().expect("lock poisoned").id = result.node_id;

        let log = self.writer.log().as_ref();
        channel.send(&WireMessage::SyncupRequest(rollback::syncup_request(log)?))?;
        let response = match channel.recv_within(timeouts.handshake_timeout)? {
            WireMessage::SyncupResponse(response) => response,
            other => {
                return Err(RepError::ProtocolViolation(format!(
                    "expected SyncupResponse, got {}",
                    other.name()
                )));
            }
        };
        let plan = rollback::plan_rollback(log, response.matchpoint, self.config.txn_rollback_limit)?;
        if !plan.is_noop() {
            plan.execute(log, self.writer.index(), self.writer.applier().as_ref())?;
            self.writer.recover()?;
        }
        self.writer.reseed();
        debug!(master = %master, matchpoint = %response.matchpoint, "synced with master");

        let shutdown = Arc::new(AtomicBool::new(false));
        let replayer = Replayer {
            node: self.name.clone(),
            master: master.clone(),
            writer: Arc::clone(&self.writer),
            counters: Arc::clone(&self.replay_counters),
            log_version: result.log_version,
            heartbeat_timeout: timeouts.heartbeat_timeout,
            poll_interval: timeouts.heartbeat_interval.min(timeouts.heartbeat_timeout),
            shutdown: Arc::clone(&shutdown),
        };
        let (sender, receiver) = channel.split();
        let commands = self.commands.clone();
        let thread = thread::Builder::new()
            .name(format!("rep-replay-{}", self.name))
            .spawn(move || {
                let exit = replayer.run(sender, receiver);
                // The driver may already be gone.
                let _ = commands.send(Command::StreamLost);
                exit
            })?;

        {
            let mut role = self.role.lock().expect("lock poisoned");
            role.term = result.term;
            role.master = Some(master.clone());
            role.leading = false;
            role.replay = Some(ReplayHandle { shutdown, thread });
        }
        self.transition(NodeState::Replica, Some(master.clone()))
    }

    fn transition(&self, to: NodeState, master: Option<NodeName>) -> RepResult<()> {
        match self.state.transition(to, master) {
            Ok(_) => Ok(()),
            Err(e @ RepError::Listener(_)) => Err(self.invalidate(e)),
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------------
    // Master side
    // ------------------------------------------------------------------------

    fn refresh_quorum(&self) {
        let electable = self.writer.group().map_or(1, |g| g.electable_count());
        self.acks
            .set_quorum_acks(quorum_size(electable).saturating_sub(1));
    }

    fn master_term(&self) -> RepResult<MasterTerm> {
        let role = self.role.lock().expect("lock poisoned");
        if role.leading {
            Ok(role.term)
        } else {
            Err(self.not_master())
        }
    }

    fn not_master(&self) -> RepError {
        RepError::NotMaster {
            state: self.state.state(),
            master: self.state.master(),
        }
    }

    fn commit_with<F>(&self, durability: Durability, append: F) -> RepResult<CommitToken>
    where
        F: FnOnce(&LogWriter, MasterTerm) -> RepResult<crate::log::LogRecord>,
    {
        self.check_usable()?;
        let term = self.master_term()?;
        let group = self.writer.group().ok_or_else(|| self.not_master())?;
        let needed = durability.required_acks(group.electable_count());
        let connected = self.acks.connected_electable();
        if connected < needed {
            return Err(RepError::InsufficientReplicas { needed, connected });
        }

        let record = append(&self.writer, term).map_err(|e| match e {
            RepError::Apply(_) | RepError::Log(_) => self.invalidate(e),
            other => other,
        })?;
        let acked = if needed > 0 {
            self.acks
                .await_acks(record.vlsn, needed, self.config.timeouts.replica_ack_timeout)
        } else {
            Ok(())
        };
        self.writer
            .log()
            .mark_durable(self.acks.durable_vlsn(record.vlsn))?;
        acked?;
        Ok(CommitToken::new(group.uuid(), record.vlsn))
    }

    /// Commits a membership change. `decide` sees the group table as it
    /// stands when the record is written, so concurrent changes serialize on
    /// the log writer.
    fn commit_membership<F>(&self, decide: F) -> RepResult<CommitToken>
    where
        F: FnOnce(&RepGroup) -> RepResult<GroupChange>,
    {
        let token = self.commit_with(self.config.durability, |writer, term| {
            writer.append_membership(term, |group| {
                decide(group.ok_or_else(|| {
                    RepError::UnexpectedState(format!("{} has no group to change", self.name))
                })?)
            })
        })?;
        self.refresh_quorum();
        Ok(token)
    }

    /// Commits the addition of `identity` and returns it with its assigned id.
    fn commit_add(&self, identity: &NodeIdentity) -> RepResult<NodeIdentity> {
        let mut added = None;
        self.commit_membership(|group| match group.validate_add(identity)? {
            AddOutcome::Added(assigned) => {
                added = Some(assigned.clone());
                Ok(GroupChange::Add(assigned))
            }
            AddOutcome::AlreadyMember(existing) => Err(RepError::MemberConflict(format!(
                "{} was added concurrently",
                existing.name
            ))),
        })?;
        added.ok_or_else(|| {
            RepError::UnexpectedState(format!("no membership record for {}", identity.name))
        })
    }

    fn commit_naming(&self, op: &NamingOp) -> RepResult<CommitToken> {
        self.commit_with(self.config.durability, |writer, term| {
            writer.append_structured(term, RecordKind::Naming, op)
        })
    }

    /// Serves one inbound connection on its own thread.
    fn serve(&self, channel: Channel) {
        let peer = channel.peer.clone();
        if let Err(e) = self.serve_replica(channel) {
            debug!(node = %self.name, peer = %peer, error = %e, "replica connection failed");
        }
    }

    #[instrument(skip(self, channel), fields(node = %self.name, peer = %channel.peer))]
    fn serve_replica(&self, mut channel: Channel) -> RepResult<()> {
        let timeouts = self.config.timeouts;
        let request = handshake::recv_request(&mut channel, timeouts.handshake_timeout)?;

        let Ok(term) = self.master_term() else {
            handshake::reject(&mut channel, HandshakeRejection::NotMaster {
                master: self.state.master(),
            });
            return Ok(());
        };

        let group = self.writer.group().ok_or_else(|| self.not_master())?;
        let master = self.identity();
        let view = MasterView {
            group_name: &self.config.group_name,
            group: &group,
            master: &master,
            term,
            config: &self.config.handshake,
            max_clock_delta: self.config.max_clock_delta,
            now_ms: self.clock.now_ms(),
        };
        let admitted = handshake::evaluate(&request, &view, &self.connections).and_then(
            |admission| {
                let guard = self.connections.register(admission.identity())?;
                Ok((admission, guard))
            },
        );
        let (mut admission, guard) = match admitted {
            Ok(admitted) => admitted,
            Err(rejection) => {
                handshake::reject(&mut channel, rejection);
                return Ok(());
            }
        };

        // The id offered by `evaluate` came from a snapshot. A new node gets
        // its final id when it is added to the live table.
        let joins_persistently = matches!(
            &admission.membership,
            AddOutcome::Added(identity) if identity.node_type.is_persistent()
        );
        let identity = if joins_persistently {
            self.commit_add(&request.node)?
        } else {
            match &admission.membership {
                AddOutcome::Added(identity) => self
                    .writer
                    .with_group(|g| g.map(|g| g.add_secondary(identity.clone())))
                    .ok_or_else(|| self.not_master())??,
                AddOutcome::AlreadyMember(identity) => identity.clone(),
            }
        };
        if matches!(admission.membership, AddOutcome::Added(_)) {
            admission.membership = AddOutcome::Added(identity.clone());
        }
        let view = MasterView {
            now_ms: self.clock.now_ms(),
            ..view
        };
        channel.send(&WireMessage::HandshakeResponse(handshake::accept(
            &admission, &view,
        )))?;
        info!(replica = %identity.name, id = %identity.id, "replica admitted");

        let syncup = match channel.recv_within(timeouts.handshake_timeout)? {
            WireMessage::SyncupRequest(request) => request,
            other => {
                return Err(RepError::ProtocolViolation(format!(
                    "expected SyncupRequest, got {}",
                    other.name()
                )));
            }
        };
        let response = rollback::find_matchpoint(self.writer.log().as_ref(), &syncup)?;
        channel.send(&WireMessage::SyncupResponse(response))?;

        let (sender, receiver) = channel.split();
        let handle = feeder::spawn(
            FeederContext {
                replica: identity,
                log: Arc::clone(self.writer.log()),
                index: Arc::clone(self.writer.index()),
                acks: Arc::clone(&self.acks),
                clock: Arc::clone(&self.clock),
                term,
                log_version: admission.log_version,
                start: response.matchpoint.next(),
                batch_size: self.config.feeder.batch_size,
                heartbeat_interval: timeouts.heartbeat_interval,
                heartbeat_timeout: timeouts.heartbeat_timeout,
            },
            sender,
            receiver,
            guard,
        )?;

        let mut role = self.role.lock().expect("lock poisoned");
        if role.leading && role.term == term && !self.closed.load(Ordering::Acquire) {
            role.feeders.push(handle);
        } else {
            drop(role);
            handle.join();
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn identity(&self) -> NodeIdentity {
        self.identity.read().expect("lock poisoned").clone()
    }

    fn proposal(&self) -> Proposal {
        let identity = self.identity();
        Proposal {
            node: identity.name,
            id: identity.id,
            vlsn: self.writer.index().last(),
            priority: self.config.priority,
        }
    }

    fn group_uuid(&self) -> RepResult<GroupUuid> {
        self.writer.group().map(|g| g.uuid()).ok_or_else(|| {
            RepError::UnexpectedState(format!("{} has not joined a group", self.name))
        })
    }

    fn invalidation(&self) -> Option<Arc<RepError>> {
        self.invalidated.read().expect("lock poisoned").clone()
    }

    fn check_usable(&self) -> RepResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RepError::Closed);
        }
        match self.invalidation() {
            Some(cause) => Err(RepError::EnvironmentInvalidated { cause }),
            None => Ok(()),
        }
    }

    fn wrap_if_invalidated(&self, error: RepError) -> RepError {
        match self.invalidation() {
            Some(cause) if matches!(error, RepError::Closed) => {
                RepError::EnvironmentInvalidated { cause }
            }
            _ => error,
        }
    }

    /// Invalidates the environment and returns the error callers see.
    fn invalidate(&self, cause: RepError) -> RepError {
        let cause = {
            let mut slot = self.invalidated.write().expect("lock poisoned");
            match slot.as_ref() {
                Some(existing) => Arc::clone(existing),
                None => {
                    error!(node = %self.name, error = %cause, "environment invalidated");
                    let cause = Arc::new(cause);
                    *slot = Some(Arc::clone(&cause));
                    cause
                }
            }
        };
        // The state leaves Master before any stream stops.
        if self.state.state().is_active() {
            // A failing listener has already been removed.
            let _ = self.state.transition(NodeState::Unknown, None);
        }
        self.relinquish();
        RepError::EnvironmentInvalidated { cause }
    }

    fn can_vote(&self) -> bool {
        if self.closed.load(Ordering::Acquire) || self.invalidation().is_some() {
            return false;
        }
        if self.state.state() != NodeState::Unknown {
            return false;
        }
        self.writer
            .group()
            .and_then(|g| g.member(&self.name).map(|m| m.node_type.is_electable()))
            .unwrap_or(false)
    }
}

/// Returns true if retrying a join cannot cure the error.
fn is_final(error: &RepError) -> bool {
    match error {
        RepError::Handshake(
            HandshakeRejection::DuplicateNode { .. }
            | HandshakeRejection::DuplicateAddress { .. }
            | HandshakeRejection::NotMaster { .. },
        ) => false,
        RepError::EnvironmentInvalidated { .. } | RepError::Apply(_) | RepError::Log(_) => true,
        other => matches!(other.kind(), ErrorKind::Configuration | ErrorKind::Divergence),
    }
}

// ============================================================================
// Endpoint
// ============================================================================

impl Endpoint for NodeInner {
    fn identity(&self) -> NodeIdentity {
        NodeInner::identity(self)
    }

    fn on_promise(&self, request: &PromiseRequest) -> Option<PromiseResponse> {
        if !self.can_vote() {
            return None;
        }
        let proposal = self.proposal();
        Some(
            self.acceptor
                .lock()
                .expect("lock poisoned")
                .on_promise(request, proposal),
        )
    }

    fn on_accept(&self, request: &AcceptRequest) -> Option<AcceptResponse> {
        if !self.can_vote() {
            return None;
        }
        Some(self.acceptor.lock().expect("lock poisoned").on_accept(request))
    }

    fn on_announce(&self, result: &ElectionResult) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.acceptor
            .lock()
            .expect("lock poisoned")
            .on_decided(result);
        {
            let mut announced = self.announced.lock().expect("lock poisoned");
            if announced.as_ref().is_none_or(|a| a.term < result.term) {
                *announced = Some(result.clone());
            }
        }
        debug!(node = %self.name, term = %result.term, master = %result.master.node, "election result learned");
        // The driver may already be gone.
        let _ = self.commands.send(Command::Announced);
    }

    fn current_master(&self) -> Option<(MasterTerm, NodeName)> {
        if !self.state.state().is_active() {
            return None;
        }
        let role = self.role.lock().expect("lock poisoned");
        role.master.clone().map(|master| (role.term, master))
    }

    fn on_connect(&self, channel: Channel) -> RepResult<()> {
        let node = self.me.upgrade().ok_or(RepError::Closed)?;
        if node.closed.load(Ordering::Acquire) {
            return Err(RepError::Closed);
        }
        thread::Builder::new()
            .name(format!("rep-serve-{}", channel.peer))
            .spawn(move || node.serve(channel))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use keel_types::NodeAddress;

    use super::*;
    use crate::config::TimeoutConfig;

    fn config(name: &str, port: u16) -> RepConfig {
        RepConfig::new(
            "orders",
            NodeIdentity::new(
                NodeName::new(name).unwrap(),
                NodeType::Electable,
                NodeAddress::new("localhost", port),
            ),
        )
        .with_timeouts(TimeoutConfig::testing())
    }

    #[test]
    fn designated_primary_bootstraps_alone() {
        let network = LocalNetwork::new();
        let node = RepNode::open(
            config("a", 5001).with_designated_primary(true),
            NodeEnv::in_memory(),
            network,
        )
        .unwrap();
        assert_eq!(node.await_active(Duration::from_secs(5)).unwrap(), NodeState::Master);

        let group = node.group().unwrap();
        assert_eq!(group.name(), "orders");
        assert_eq!(group.electable_count(), 1);
        assert_eq!(node.identity().id, NodeId::new(1));

        let token = node.commit(Bytes::from_static(b"txn")).unwrap();
        assert_eq!(token.group_uuid(), group.uuid());
        assert_eq!(token.vlsn(), node.range().last());
        node.close().unwrap();
        assert_eq!(node.state(), NodeState::Detached);
    }

    #[test]
    fn lone_node_without_group_waits() {
        let network = LocalNetwork::new();
        let node = RepNode::open(config("a", 5001), NodeEnv::in_memory(), network).unwrap();
        assert!(matches!(
            node.await_active(Duration::from_millis(100)),
            Err(RepError::JoinTimeout { .. })
        ));
        assert!(matches!(
            node.commit(Bytes::new()),
            Err(RepError::NotMaster {
                state: NodeState::Unknown,
                ..
            })
        ));
    }

    #[test]
    fn monitors_do_not_open_environments() {
        let mut monitor = config("m", 5009);
        monitor.node.node_type = NodeType::Monitor;
        assert!(matches!(
            RepNode::open(monitor, NodeEnv::in_memory(), LocalNetwork::new()),
            Err(RepError::UnexpectedState(_))
        ));
    }

    #[test]
    fn closed_node_rejects_operations() {
        let node = RepNode::open(
            config("a", 5001).with_designated_primary(true),
            NodeEnv::in_memory(),
            LocalNetwork::new(),
        )
        .unwrap();
        node.await_active(Duration::from_secs(5)).unwrap();
        let events = node.subscribe(8);
        node.close().unwrap();
        node.close().unwrap();
        let states: Vec<_> = events.drain().iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            vec![NodeState::Master, NodeState::Unknown, NodeState::Detached]
        );
        assert!(matches!(node.commit(Bytes::new()), Err(RepError::Closed)));
        assert!(matches!(node.open_database("x"), Err(RepError::Closed)));
    }
}
