//! Group-level tests for keel-rep
//!
//! Every test runs a real group of [`RepNode`]s over an in-process
//! [`LocalNetwork`], with the short timeouts of [`TimeoutConfig::testing`].
//! Assertions on asynchronous progress poll with [`eventually`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use keel_types::{
    GroupUuid, MasterTerm, NodeAddress, NodeId, NodeIdentity, NodeName, NodeState, NodeType, Vlsn,
    VlsnRange,
};

use crate::channel::Channel;
use crate::clock::{Clock, SkewedClock, SystemClock};
use crate::config::{Durability, HandshakeConfig, RepConfig, TimeoutConfig};
use crate::consistency::ConsistencyPolicy;
use crate::election::{
    AcceptRequest, AcceptResponse, ElectionResult, PromiseRequest, PromiseResponse,
};
use crate::feeder::{self, AckTracker, FeederContext, FeederHandle};
use crate::group::{AddOutcome, GroupChange};
use crate::handshake::{
    self, ConnectionRegistry, HandshakeRejection, HandshakeRequest, HandshakeResponse, MasterView,
    LOG_VERSION, PROTOCOL_VERSION,
};
use crate::log::{LogApplier, LogRecord, MemoryLog, MemoryStore, RecordKind, ReplicationLog};
use crate::network::{Endpoint, LocalNetwork};
use crate::node::{NodeEnv, RepNode};
use crate::preemption::PreemptionRegistry;
use crate::protocol::{StreamMessage, WireMessage};
use crate::replay::LogWriter;
use crate::rollback;
use crate::state::{ListenerError, StateChangeEvent};
use crate::vlsn::VlsnIndex;
use crate::{RepError, RepResult};

// ============================================================================
// Test Helpers
// ============================================================================

const WAIT: Duration = Duration::from_secs(10);

fn name(name: &str) -> NodeName {
    NodeName::new(name).expect("valid node name")
}

fn identity(node: &str, node_type: NodeType, port: u16) -> NodeIdentity {
    NodeIdentity::new(name(node), node_type, NodeAddress::new("localhost", port))
}

fn config(node: &str, port: u16) -> RepConfig {
    RepConfig::new("orders", identity(node, NodeType::Electable, port))
        .with_timeouts(TimeoutConfig::testing())
}

/// A node together with handles on its storage, so tests can inspect it
/// and reopen the node on the same log.
struct TestNode {
    node: RepNode,
    log: Arc<MemoryLog>,
    store: Arc<MemoryStore>,
}

impl TestNode {
    fn open(config: RepConfig, network: &Arc<LocalNetwork>) -> Self {
        Self::reopen(
            config,
            network,
            Arc::new(MemoryLog::new()),
            Arc::new(MemoryStore::new()),
        )
    }

    fn reopen(
        config: RepConfig,
        network: &Arc<LocalNetwork>,
        log: Arc<MemoryLog>,
        store: Arc<MemoryStore>,
    ) -> Self {
        let env = NodeEnv::new(log.clone(), store.clone(), Arc::new(SystemClock));
        let node = RepNode::open(config, env, Arc::clone(network)).expect("node opens");
        Self { node, log, store }
    }

    fn active(self) -> Self {
        self.node.await_active(WAIT).expect("node becomes active");
        self
    }
}

fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn payload(text: &'static str) -> Bytes {
    Bytes::from_static(text.as_bytes())
}

/// Starts a designated primary `a` and joins `b`.
fn pair(network: &Arc<LocalNetwork>) -> (TestNode, TestNode) {
    let a = TestNode::open(config("a", 5001).with_designated_primary(true), network).active();
    let b = TestNode::open(config("b", 5002), network).active();
    (a, b)
}

/// Starts a three-node group with `a` as master.
fn trio(network: &Arc<LocalNetwork>) -> (TestNode, TestNode, TestNode) {
    let (a, b) = pair(network);
    let c = TestNode::open(config("c", 5003), network).active();
    (a, b, c)
}

fn caught_up(nodes: &[&TestNode], master: &TestNode) -> bool {
    let last = master.node.range().last();
    nodes.iter().all(|n| n.node.range().last() == last)
}

// ============================================================================
// Group Formation
// ============================================================================

#[test]
fn group_forms_and_replicates_commits() {
    let network = LocalNetwork::new();
    let (a, b, c) = trio(&network);

    assert_eq!(a.node.state(), NodeState::Master);
    assert_eq!(b.node.state(), NodeState::Replica);
    assert_eq!(c.node.master(), Some(name("a")));

    let group = a.node.group().expect("master has a group");
    assert_eq!(group.electable_count(), 3);
    let ids: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|n| group.member(&name(n)).expect("member").id.as_u32())
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(c.node.identity().id.as_u32(), 3);

    let token = a.node.commit(payload("first")).expect("commit succeeds");
    for replica in [&b, &c] {
        replica
            .node
            .ensure_consistency(
                None,
                Some(ConsistencyPolicy::CommitPoint {
                    token,
                    timeout: WAIT,
                }),
            )
            .expect("replica reaches the commit point");
        assert_eq!(replica.store.commit_payloads(), vec![payload("first")]);
        assert_eq!(
            replica.node.group().map(|g| g.uuid()),
            Some(token.group_uuid())
        );
    }

    eventually("acks reported in stats", || {
        let stats = a.node.stats();
        stats.feeders.len() == 2 && stats.feeders.iter().all(|f| f.acked >= token.vlsn())
    });
    assert!(b.node.stats().replay.records_applied > 0);
}

#[test]
fn writes_on_a_replica_are_refused() {
    let network = LocalNetwork::new();
    let (_a, b) = pair(&network);
    match b.node.commit(payload("nope")) {
        Err(RepError::NotMaster { state, master }) => {
            assert_eq!(state, NodeState::Replica);
            assert_eq!(master, Some(name("a")));
        }
        other => panic!("expected NotMaster, got {other:?}"),
    }
}

#[test]
fn reopened_replica_resumes_from_its_log() {
    let network = LocalNetwork::new();
    let (a, b) = pair(&network);
    a.node.commit(payload("one")).unwrap();
    eventually("b catches up", || caught_up(&[&b], &a));

    let TestNode { node, log, store } = b;
    node.close().unwrap();
    drop(node);
    a.node
        .commit_with_durability(payload("two"), Durability::None)
        .unwrap();

    let b = TestNode::reopen(config("b", 5002), &network, log, store).active();
    assert_eq!(b.node.identity().id.as_u32(), 2);
    eventually("b catches up again", || caught_up(&[&b], &a));
    assert_eq!(b.store.commit_payloads(), vec![payload("one"), payload("two")]);
}

#[test]
fn secondary_nodes_are_tracked_only_while_connected() {
    let network = LocalNetwork::new();
    let a = TestNode::open(config("a", 5001).with_designated_primary(true), &network).active();
    let s = TestNode::open(
        RepConfig::new("orders", identity("s", NodeType::Secondary, 5009))
            .with_timeouts(TimeoutConfig::testing()),
        &network,
    )
    .active();

    let group = a.node.group().unwrap();
    assert!(group.member(&name("s")).is_some());
    assert_eq!(group.electable_count(), 1);
    assert!(group.record(&name("s")).is_none());

    a.node.commit(payload("x")).unwrap();
    eventually("secondary catches up", || caught_up(&[&s], &a));

    s.node.close().unwrap();
    eventually("secondary forgotten", || {
        a.node.group().is_some_and(|g| g.member(&name("s")).is_none())
    });
}

#[test]
fn monitors_are_added_as_persistent_members() {
    let network = LocalNetwork::new();
    let a = TestNode::open(config("a", 5001).with_designated_primary(true), &network).active();

    let monitor = a
        .node
        .ensure_monitor(identity("m", NodeType::Monitor, 5010))
        .unwrap();
    assert_eq!(monitor.id.as_u32(), 2);
    let again = a
        .node
        .ensure_monitor(identity("m", NodeType::Monitor, 5010))
        .unwrap();
    assert_eq!(again, monitor);

    let group = a.node.group().unwrap();
    assert_eq!(group.electable_count(), 1);
    assert!(group.record(&name("m")).is_some());
    assert!(matches!(
        a.node.ensure_monitor(identity("e", NodeType::Electable, 5011)),
        Err(RepError::MemberConflict(_))
    ));
}

// ============================================================================
// Elections
// ============================================================================

#[test]
fn replicas_elect_a_new_master_when_the_master_dies() {
    let network = LocalNetwork::new();
    let (a, b, c) = trio(&network);
    a.node.commit(payload("before")).unwrap();
    eventually("replicas catch up", || caught_up(&[&b, &c], &a));

    let events = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&events);
    c.node
        .set_state_change_listener(Box::new(move |event: &StateChangeEvent| {
            recorded
                .lock()
                .unwrap()
                .push((event.state, event.master.clone()));
            Ok(())
        }))
        .unwrap();

    a.node.close().unwrap();

    // Equal logs and priorities: the lowest node id wins.
    eventually("b takes over", || b.node.state() == NodeState::Master);
    eventually("c follows b", || c.node.master() == Some(name("b")));
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            (NodeState::Replica, Some(name("a"))),
            (NodeState::Unknown, None),
            (NodeState::Replica, Some(name("b"))),
        ]
    );

    let token = b
        .node
        .commit(payload("after"))
        .expect("new master commits with one replica");
    c.node
        .ensure_consistency(
            Some(ConsistencyPolicy::CommitPoint {
                token,
                timeout: WAIT,
            }),
            None,
        )
        .unwrap();
    assert_eq!(
        c.store.commit_payloads(),
        vec![payload("before"), payload("after")]
    );
}

#[test]
fn invalidated_master_is_replaced_by_exactly_one_master() {
    let network = LocalNetwork::new();
    let (a, b, c) = trio(&network);
    let before = a.node.commit(payload("before")).unwrap();
    eventually("replicas catch up", || caught_up(&[&b, &c], &a));

    let timeline = Arc::new(Mutex::new(Vec::new()));
    for member in [&a, &b, &c] {
        let recorded = Arc::clone(&timeline);
        let node = member.node.name().clone();
        member
            .node
            .set_state_change_listener(Box::new(move |event: &StateChangeEvent| {
                recorded.lock().unwrap().push((node.clone(), event.state));
                Ok(())
            }))
            .unwrap();
    }

    // An unrecoverable store failure on the master, with no close.
    a.store.fail_at(before.vlsn().next());
    let error = a.node.commit(payload("lost")).unwrap_err();
    assert!(matches!(error.root_cause(), RepError::Apply(_)));
    assert_eq!(a.node.state(), NodeState::Unknown);

    eventually("a survivor takes over", || {
        b.node.state() == NodeState::Master || c.node.state() == NodeState::Master
    });
    let (master, replica) = if b.node.state() == NodeState::Master {
        (&b, &c)
    } else {
        (&c, &b)
    };
    eventually("the other survivor follows", || {
        replica.node.master().as_ref() == Some(master.node.name())
    });
    eventually("the new master feeds it", || !master.node.stats().feeders.is_empty());

    let after = master.node.commit(payload("after")).unwrap();
    let term_at = |node: &TestNode, vlsn: Vlsn| node.log.record_at(vlsn).unwrap().unwrap().term;
    assert!(term_at(master, after.vlsn()) > term_at(&a, before.vlsn()));
    assert_eq!(a.node.state(), NodeState::Unknown);

    // Replaying every listener call in order never shows two masters.
    let mut states = BTreeMap::new();
    for (node, state) in timeline.lock().unwrap().iter() {
        states.insert(node.clone(), *state);
        let masters = states.values().filter(|s| **s == NodeState::Master).count();
        assert!(masters <= 1, "two masters at once: {states:?}");
    }
    assert_eq!(states[master.node.name()], NodeState::Master);
    assert_eq!(states[replica.node.name()], NodeState::Replica);
}

#[test]
fn designated_primary_needs_a_quorum_once_the_group_exists() {
    let network = LocalNetwork::new();
    let (a, b) = pair(&network);
    a.node.commit(payload("one")).unwrap();
    eventually("b catches up", || caught_up(&[&b], &a));

    let TestNode { node, log, store } = a;
    node.close().unwrap();
    drop(node);
    eventually("b loses its master", || b.node.state() == NodeState::Unknown);

    // Out of reach of b, the designated primary cannot elect itself.
    network.isolate(&name("a"));
    let a = TestNode::reopen(
        config("a", 5001).with_designated_primary(true),
        &network,
        log,
        store,
    );
    assert!(matches!(
        a.node.await_active(Duration::from_millis(500)),
        Err(RepError::JoinTimeout { .. })
    ));
    assert_eq!(b.node.state(), NodeState::Unknown);

    network.heal(&name("a"));
    a.node.await_active(WAIT).unwrap();
    b.node.await_active(WAIT).unwrap();
    eventually("exactly one master", || {
        let states = [a.node.state(), b.node.state()];
        states.contains(&NodeState::Master) && states.contains(&NodeState::Replica)
    });
}

// ============================================================================
// Handshake
// ============================================================================

fn join_failure(config: RepConfig, env: NodeEnv, network: &Arc<LocalNetwork>) -> RepError {
    let node = RepNode::open(config, env, Arc::clone(network)).unwrap();
    let error = node
        .await_active(WAIT)
        .expect_err("join must fail for good");
    assert!(
        matches!(error, RepError::EnvironmentInvalidated { .. }),
        "expected invalidation, got {error:?}"
    );
    assert!(matches!(node.commit(payload("x")), Err(RepError::EnvironmentInvalidated { .. })));
    error
}

#[test]
fn unsupported_protocol_version_fails_the_join() {
    let network = LocalNetwork::new();
    let _a = TestNode::open(config("a", 5001).with_designated_primary(true), &network).active();

    let old = config("b", 5002).with_handshake(HandshakeConfig::default().with_protocol_version(2));
    let error = join_failure(old, NodeEnv::in_memory(), &network);
    assert!(matches!(
        error.root_cause(),
        RepError::ProtocolVersionMismatch { peer: 2, .. }
    ));
}

#[test]
fn clock_skew_fails_the_join() {
    let network = LocalNetwork::new();
    let _a = TestNode::open(config("a", 5001).with_designated_primary(true), &network).active();

    let env = NodeEnv::new(
        Arc::new(MemoryLog::new()),
        Arc::new(MemoryStore::new()),
        Arc::new(SkewedClock::new(Arc::new(SystemClock), 60_000)),
    );
    let error = join_failure(config("b", 5002), env, &network);
    assert!(matches!(
        error.root_cause(),
        RepError::Handshake(HandshakeRejection::ClockSkew { .. })
    ));
}

#[test]
fn replica_refuses_a_master_with_a_skewed_clock() {
    let network = LocalNetwork::new();
    // The master tolerates two minutes of skew, the replica two seconds.
    let a = TestNode::open(
        config("a", 5001)
            .with_designated_primary(true)
            .with_max_clock_delta(Duration::from_secs(120)),
        &network,
    )
    .active();

    let env = NodeEnv::new(
        Arc::new(MemoryLog::new()),
        Arc::new(MemoryStore::new()),
        Arc::new(SkewedClock::new(Arc::new(SystemClock), 60_000)),
    );
    let error = join_failure(config("b", 5002), env, &network);
    assert!(matches!(
        error.root_cause(),
        RepError::Handshake(HandshakeRejection::ClockSkew { .. })
    ));
    // The master let b in; b's own check refused the master.
    assert!(a.node.group().unwrap().member(&name("b")).is_some());
}

#[test]
fn group_name_mismatch_fails_the_join() {
    let network = LocalNetwork::new();
    let _a = TestNode::open(config("a", 5001).with_designated_primary(true), &network).active();

    let stranger = RepConfig::new("inventory", identity("b", NodeType::Electable, 5002))
        .with_timeouts(TimeoutConfig::testing());
    let error = join_failure(stranger, NodeEnv::in_memory(), &network);
    assert!(matches!(error.root_cause(), RepError::UnexpectedState(_)));
}

#[test]
fn removed_member_cannot_rejoin() {
    let network = LocalNetwork::new();
    let (a, _b, c) = trio(&network);

    a.node.remove_member(&name("c")).unwrap();
    assert!(a.node.group().unwrap().is_removed(&name("c")));
    assert!(matches!(
        a.node.remove_member(&name("a")),
        Err(RepError::MemberConflict(_))
    ));

    eventually("c is invalidated", || {
        matches!(
            c.node.await_active(Duration::from_millis(20)),
            Err(RepError::EnvironmentInvalidated { .. })
        )
    });
    let error = c.node.await_active(Duration::ZERO).unwrap_err();
    assert!(matches!(
        error.root_cause(),
        RepError::Handshake(HandshakeRejection::RemovedMember { .. })
    ));
}

#[test]
fn membership_changes_do_not_wait_for_a_stalled_handshake() {
    // Frames are handed over directly, so the master's reply to x blocks
    // until x reads it.
    let network = LocalNetwork::with_channel_capacity(0);
    let a = TestNode::open(
        config("a", 5001)
            .with_designated_primary(true)
            .with_durability(Durability::None),
        &network,
    )
    .active();

    let x = identity("x", NodeType::Electable, 5005);
    let mut stalled = network.connect(&x, &name("a")).unwrap();
    stalled
        .send(&WireMessage::HandshakeRequest(HandshakeRequest {
            group_name: "orders".to_string(),
            group_uuid: None,
            node: x.clone(),
            protocol_version: PROTOCOL_VERSION,
            log_version: LOG_VERSION,
            clock_ms: SystemClock.now_ms(),
        }))
        .unwrap();
    eventually("x is added", || {
        a.node.group().unwrap().member(&name("x")).is_some()
    });

    let monitor = a
        .node
        .add_member(identity("m", NodeType::Monitor, 5006))
        .unwrap();
    assert_eq!(monitor.id.as_u32(), 3);
    a.node.remove_member(&name("m")).unwrap();

    match stalled.recv_within(WAIT).unwrap() {
        WireMessage::HandshakeResponse(HandshakeResponse::Accepted(accept)) => {
            assert_eq!(accept.node.id.as_u32(), 2);
        }
        other => panic!("expected acceptance, got {}", other.name()),
    }
}

// ============================================================================
// Durability
// ============================================================================

#[test]
fn commit_without_enough_replicas_is_refused() {
    let network = LocalNetwork::new();
    let (a, b) = pair(&network);
    a.node.commit(payload("one")).unwrap();

    b.node.close().unwrap();
    eventually("feeder reaped", || a.node.stats().feeders.is_empty());

    let before = a.node.range();
    match a.node.commit(payload("two")) {
        Err(RepError::InsufficientReplicas { needed, connected }) => {
            assert_eq!(needed, 1);
            assert_eq!(connected, 0);
        }
        other => panic!("expected InsufficientReplicas, got {other:?}"),
    }
    assert_eq!(a.node.range(), before);

    a.node
        .commit_with_durability(payload("two"), Durability::None)
        .expect("no acks needed");
}

// ============================================================================
// Rollback
// ============================================================================

struct Diverged {
    network: Arc<LocalNetwork>,
    a: TestNode,
    b_log: Arc<MemoryLog>,
    b_store: Arc<MemoryStore>,
    first_divergent: Vlsn,
}

/// Builds a pair whose replica wrote two commits of its own while detached,
/// after the master moved on without it.
fn diverged() -> Diverged {
    let network = LocalNetwork::new();
    let (a, b) = pair(&network);
    a.node.commit(payload("one")).unwrap();
    eventually("b catches up", || caught_up(&[&b], &a));

    let TestNode { node, log, store } = b;
    node.close().unwrap();
    drop(node);

    let first_divergent = log.range().last().next();
    let mut vlsn = first_divergent;
    for text in ["rogue-1", "rogue-2"] {
        let record = LogRecord::new(
            vlsn,
            MasterTerm::new(99),
            RecordKind::Commit,
            LOG_VERSION,
            0,
            payload(text),
        );
        log.append(record.clone()).unwrap();
        store.apply(&record).unwrap();
        vlsn = vlsn.next();
    }

    a.node
        .commit_with_durability(payload("two"), Durability::None)
        .unwrap();
    Diverged {
        network,
        a,
        b_log: log,
        b_store: store,
        first_divergent,
    }
}

#[test]
fn small_divergence_is_rolled_back_automatically() {
    let d = diverged();
    let b = TestNode::reopen(
        config("b", 5002).with_rollback_limit(5),
        &d.network,
        d.b_log,
        d.b_store,
    )
    .active();

    eventually("b catches up", || caught_up(&[&b], &d.a));
    assert_eq!(b.store.commit_payloads(), vec![payload("one"), payload("two")]);
}

#[test]
fn large_divergence_needs_explicit_truncation() {
    let d = diverged();
    let position = d
        .b_log
        .position_of(d.first_divergent)
        .unwrap()
        .expect("divergent record is in the log");

    let b = TestNode::reopen(
        config("b", 5002).with_rollback_limit(1),
        &d.network,
        d.b_log,
        d.b_store,
    );
    let error = b.node.await_active(WAIT).unwrap_err();
    match error.root_cause() {
        RepError::RollbackProhibited {
            position: reported,
            transactions,
            limit,
            ..
        } => {
            assert_eq!(*reported, position);
            assert_eq!(*transactions, 2);
            assert_eq!(*limit, 1);
        }
        other => panic!("expected RollbackProhibited, got {other:?}"),
    }
    assert_eq!(b.node.state(), NodeState::Unknown);

    assert_eq!(b.node.truncate_log(position).unwrap(), 2);
    b.node.await_active(WAIT).unwrap();
    eventually("b catches up", || caught_up(&[&b], &d.a));
    assert_eq!(b.store.commit_payloads(), vec![payload("one"), payload("two")]);
}

// ============================================================================
// Preemption
// ============================================================================

#[test]
fn replicated_naming_operations_preempt_handles() {
    let network = LocalNetwork::new();
    let (a, b) = pair(&network);

    let on_master = a.node.open_database("accounts").unwrap();
    let on_replica = b.node.open_database("accounts").unwrap();
    let untouched = b.node.open_database("ledger").unwrap();

    let token = a.node.remove_database("accounts").unwrap();
    b.node
        .ensure_consistency(
            None,
            Some(ConsistencyPolicy::CommitPoint {
                token,
                timeout: WAIT,
            }),
        )
        .unwrap();

    for handle in [&on_master, &on_replica] {
        assert!(matches!(
            handle.run(|_| ()),
            Err(RepError::DatabasePreempted { .. })
        ));
    }
    assert!(untouched.run(|_| ()).is_ok());
    assert!(b.node.open_database("accounts").unwrap().is_valid());

    let renamed = a.node.open_database("ledger").unwrap();
    a.node.rename_database("ledger", "journal").unwrap();
    assert!(!renamed.is_valid());
}

// ============================================================================
// Listeners
// ============================================================================

#[test]
fn failing_listener_at_registration_is_reported() {
    let network = LocalNetwork::new();
    let a = TestNode::open(config("a", 5001).with_designated_primary(true), &network).active();

    let result = a
        .node
        .set_state_change_listener(Box::new(|_: &StateChangeEvent| {
            Err(ListenerError::new("refused"))
        }));
    assert!(matches!(result, Err(RepError::Listener(_))));
    a.node.commit(payload("still usable")).unwrap();
}

#[test]
fn failing_listener_invalidates_the_node() {
    let network = LocalNetwork::new();
    let (a, b) = pair(&network);

    b.node
        .set_state_change_listener(Box::new(|event: &StateChangeEvent| {
            if event.state == NodeState::Unknown {
                return Err(ListenerError::new("cannot handle losing the master"));
            }
            Ok(())
        }))
        .unwrap();

    a.node.close().unwrap();
    eventually("b is invalidated", || {
        matches!(
            b.node.await_active(Duration::from_millis(20)),
            Err(RepError::EnvironmentInvalidated { .. })
        )
    });
    let error = b.node.ensure_consistency(None, None).unwrap_err();
    assert!(matches!(error.root_cause(), RepError::Listener(_)));
}

// ============================================================================
// Consistency
// ============================================================================

#[test]
fn consistency_for_another_group_is_rejected() {
    let network = LocalNetwork::new();
    let (a, b) = pair(&network);
    let token = a.node.commit(payload("one")).unwrap();

    let other = LocalNetwork::new();
    let stranger = TestNode::open(config("z", 6001).with_designated_primary(true), &other).active();
    let foreign = stranger.node.commit(payload("z")).unwrap();
    assert_ne!(foreign.group_uuid(), token.group_uuid());

    assert!(matches!(
        b.node.ensure_consistency(
            None,
            Some(ConsistencyPolicy::CommitPoint {
                token: foreign,
                timeout: Duration::from_millis(50),
            }),
        ),
        Err(RepError::InvalidCommitToken { .. })
    ));
    // The master is always consistent.
    assert_eq!(
        a.node
            .ensure_consistency(
                None,
                Some(ConsistencyPolicy::CommitPoint {
                    token: foreign,
                    timeout: Duration::from_millis(50),
                }),
            )
            .unwrap(),
        Duration::ZERO
    );
}

// ============================================================================
// Stream Gaps
// ============================================================================

/// A master that leaves one record out of its first stream and feeds
/// normally on every later connection.
struct GappyMaster {
    this: Weak<GappyMaster>,
    identity: NodeIdentity,
    term: MasterTerm,
    writer: Arc<LogWriter>,
    acks: Arc<AckTracker>,
    connections: Arc<ConnectionRegistry>,
    skip: Vlsn,
    served: AtomicUsize,
    feeders: Mutex<Vec<FeederHandle>>,
}

impl GappyMaster {
    fn new(commits: &[&'static str], skip: Vlsn) -> RepResult<Arc<Self>> {
        let identity = identity("m", NodeType::Electable, 5000).with_id(NodeId::new(1));
        let term = MasterTerm::new(3);
        let writer = Arc::new(LogWriter::new(
            Arc::new(MemoryLog::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(VlsnIndex::new(VlsnRange::EMPTY)),
            Arc::new(PreemptionRegistry::new()),
            Arc::new(SystemClock),
            LOG_VERSION,
        ));
        writer.append_structured(
            term,
            RecordKind::Membership,
            &GroupChange::Create {
                name: "orders".to_string(),
                uuid: GroupUuid::generate(),
            },
        )?;
        writer.append_structured(
            term,
            RecordKind::Membership,
            &GroupChange::Add(identity.clone()),
        )?;
        for text in commits.iter().copied() {
            writer.append_new(term, RecordKind::Commit, payload(text))?;
        }
        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            identity,
            term,
            writer,
            acks: Arc::new(AckTracker::new()),
            connections: Arc::new(ConnectionRegistry::new()),
            skip,
            served: AtomicUsize::new(0),
            feeders: Mutex::new(Vec::new()),
        }))
    }

    fn serve(&self, mut channel: Channel) -> RepResult<()> {
        let request = handshake::recv_request(&mut channel, WAIT)?;
        let group = self
            .writer
            .group()
            .ok_or_else(|| RepError::UnexpectedState("no group".into()))?;
        let config = HandshakeConfig::default();
        let view = MasterView {
            group_name: "orders",
            group: &group,
            master: &self.identity,
            term: self.term,
            config: &config,
            max_clock_delta: Duration::from_secs(2),
            now_ms: SystemClock.now_ms(),
        };
        let admitted = handshake::evaluate(&request, &view, &self.connections).and_then(
            |admission| {
                let guard = self.connections.register(admission.identity())?;
                Ok((admission, guard))
            },
        );
        let (admission, guard) = match admitted {
            Ok(admitted) => admitted,
            Err(rejection) => {
                handshake::reject(&mut channel, rejection);
                return Ok(());
            }
        };
        if let AddOutcome::Added(identity) = &admission.membership {
            self.writer.append_structured(
                self.term,
                RecordKind::Membership,
                &GroupChange::Add(identity.clone()),
            )?;
        }
        channel.send(&WireMessage::HandshakeResponse(handshake::accept(
            &admission, &view,
        )))?;

        let syncup = match channel.recv_within(WAIT)? {
            WireMessage::SyncupRequest(syncup) => syncup,
            other => panic!("expected SyncupRequest, got {}", other.name()),
        };
        let response = rollback::find_matchpoint(self.writer.log().as_ref(), &syncup)?;
        channel.send(&WireMessage::SyncupResponse(response))?;

        if self.served.fetch_add(1, Ordering::SeqCst) == 0 {
            for record in self.writer.log().tail_after(response.matchpoint)? {
                if record.vlsn != self.skip {
                    channel.send(&WireMessage::Stream(StreamMessage::Entry(record)))?;
                }
            }
            // Held open until the replica hangs up.
            while let Ok(Some(_)) = channel.recv_timeout(WAIT) {}
            return Ok(());
        }

        let (sender, receiver) = channel.split();
        let handle = feeder::spawn(
            FeederContext {
                replica: admission.identity().clone(),
                log: Arc::clone(self.writer.log()),
                index: Arc::clone(self.writer.index()),
                acks: Arc::clone(&self.acks),
                clock: Arc::new(SystemClock),
                term: self.term,
                log_version: admission.log_version,
                start: response.matchpoint.next(),
                batch_size: 16,
                heartbeat_interval: Duration::from_millis(20),
                heartbeat_timeout: WAIT,
            },
            sender,
            receiver,
            guard,
        )?;
        self.feeders.lock().unwrap().push(handle);
        Ok(())
    }

    fn stop(&self) {
        for feeder in self.feeders.lock().unwrap().drain(..) {
            feeder.join();
        }
    }
}

impl Endpoint for GappyMaster {
    fn identity(&self) -> NodeIdentity {
        self.identity.clone()
    }

    fn on_promise(&self, _: &PromiseRequest) -> Option<PromiseResponse> {
        None
    }

    fn on_accept(&self, _: &AcceptRequest) -> Option<AcceptResponse> {
        None
    }

    fn on_announce(&self, _: &ElectionResult) {}

    fn current_master(&self) -> Option<(MasterTerm, NodeName)> {
        Some((self.term, self.identity.name.clone()))
    }

    fn on_connect(&self, channel: Channel) -> RepResult<()> {
        let master = self.this.upgrade().ok_or(RepError::Closed)?;
        thread::spawn(move || {
            if let Err(e) = master.serve(channel) {
                tracing::warn!(error = %e, "scripted master failed to serve");
            }
        });
        Ok(())
    }
}

#[test]
fn gap_on_the_stream_forces_a_resync() {
    let network = LocalNetwork::new();
    // Records 1 and 2 form the group, so 4 is the commit of "two".
    let master = GappyMaster::new(&["one", "two", "three", "four"], Vlsn::new(4)).unwrap();
    let endpoint: Arc<dyn Endpoint> = master.clone();
    network.register(name("m"), Arc::downgrade(&endpoint));

    let b = TestNode::open(config("b", 5002), &network);
    eventually("b replays the whole log", || {
        b.node.range().last() == master.writer.index().last()
    });

    assert_eq!(
        b.store.commit_payloads(),
        vec![payload("one"), payload("two"), payload("three"), payload("four")]
    );
    assert!(master.served.load(Ordering::SeqCst) >= 2);
    assert_eq!(b.node.master().as_ref(), Some(&name("m")));

    b.node.close().unwrap();
    master.stop();
}
