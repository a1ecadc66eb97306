//! Unit tests for keel-types.

use super::*;
use proptest::prelude::*;

// ============================================================================
// VLSN Tests
// ============================================================================

#[test]
fn vlsn_null_sentinel() {
    assert!(Vlsn::NULL.is_null());
    assert!(!Vlsn::FIRST.is_null());
    assert_eq!(Vlsn::NULL.next(), Vlsn::FIRST);
    assert_eq!(Vlsn::NULL.prev(), Vlsn::NULL);
    assert_eq!(format!("{}", Vlsn::NULL), "vlsn#null");
    assert_eq!(format!("{}", Vlsn::new(42)), "vlsn#42");
}

#[test]
fn vlsn_distance() {
    assert_eq!(Vlsn::new(3).distance_to(Vlsn::new(10)), 7);
    assert_eq!(Vlsn::new(10).distance_to(Vlsn::new(3)), 0);
}

#[test]
fn vlsn_range_extends_from_empty() {
    let range = VlsnRange::EMPTY;
    assert!(range.is_empty());
    assert!(!range.contains(Vlsn::FIRST));

    let range = range.extend_to(Vlsn::new(5));
    assert_eq!(range.first(), Vlsn::new(5));
    assert_eq!(range.last(), Vlsn::new(5));

    let range = range.extend_to(Vlsn::new(9));
    assert_eq!(range.first(), Vlsn::new(5));
    assert_eq!(range.last(), Vlsn::new(9));
    assert!(range.contains(Vlsn::new(7)));
    assert!(!range.contains(Vlsn::new(4)));
    assert!(!range.contains(Vlsn::NULL));
}

#[test]
fn vlsn_range_truncate() {
    let range = VlsnRange::new(Vlsn::new(3), Vlsn::new(10));

    assert_eq!(range.truncate_to(Vlsn::new(6)).last(), Vlsn::new(6));
    assert_eq!(range.truncate_to(Vlsn::new(6)).first(), Vlsn::new(3));
    assert!(range.truncate_to(Vlsn::new(2)).is_empty());
    assert!(range.truncate_to(Vlsn::NULL).is_empty());
    assert_eq!(range.truncate_to(Vlsn::new(20)), range);
}

#[test]
fn vlsn_range_with_unknown_first() {
    // Copied files: last known, first not.
    let range = VlsnRange::new(Vlsn::NULL, Vlsn::new(8));
    assert!(!range.is_empty());
    assert_eq!(range.first(), Vlsn::NULL);
    assert!(range.contains(Vlsn::new(1)));
}

// ============================================================================
// Commit Token Tests
// ============================================================================

#[test]
fn commit_tokens_compare_within_group() {
    let group = GroupUuid::generate();
    let a = CommitToken::new(group, Vlsn::new(5));
    let b = CommitToken::new(group, Vlsn::new(9));

    assert!(a < b);
    assert!(b > a);
    assert_eq!(a.partial_cmp(&a), Some(Ordering::Equal));
}

#[test]
fn commit_tokens_incomparable_across_groups() {
    let a = CommitToken::new(GroupUuid::generate(), Vlsn::new(5));
    let b = CommitToken::new(GroupUuid::generate(), Vlsn::new(9));

    assert_eq!(a.partial_cmp(&b), None);
    assert!(!(a < b));
    assert!(!(a > b));
    assert_ne!(a, b);
}

#[test]
fn commit_token_external_representation() {
    let token = CommitToken::new(GroupUuid::generate(), Vlsn::new(1234));

    let json = serde_json::to_string(&token).expect("serialize");
    let parsed: CommitToken = serde_json::from_str(&json).expect("deserialize");

    assert_eq!(parsed, token);
    assert_eq!(parsed.vlsn(), Vlsn::new(1234));
    assert_eq!(parsed.group_uuid(), token.group_uuid());
}

// ============================================================================
// Identity Tests
// ============================================================================

#[test]
fn node_name_validation() {
    assert!(NodeName::new("node-1").is_ok());
    assert_eq!(NodeName::new(""), Err(NameError::Empty));
    assert_eq!(
        NodeName::new("has space"),
        Err(NameError::InvalidCharacter { ch: ' ' })
    );
    assert!(matches!(
        NodeName::new("x".repeat(MAX_NODE_NAME_LEN + 1)),
        Err(NameError::TooLong { .. })
    ));
}

#[test]
fn node_name_rejects_invalid_on_deserialize() {
    let result: Result<NodeName, _> = serde_json::from_str("\"\"");
    assert!(result.is_err());

    let name: NodeName = serde_json::from_str("\"rep1\"").expect("valid name");
    assert_eq!(name.as_str(), "rep1");
}

#[test]
fn node_type_roles() {
    assert!(NodeType::Electable.is_electable());
    assert!(NodeType::Electable.is_data_node());
    assert!(NodeType::Electable.is_persistent());

    assert!(!NodeType::Monitor.is_electable());
    assert!(!NodeType::Monitor.is_data_node());
    assert!(NodeType::Monitor.is_persistent());

    assert!(!NodeType::Secondary.is_electable());
    assert!(NodeType::Secondary.is_data_node());
    assert!(!NodeType::Secondary.is_persistent());
}

#[test]
fn identity_same_node_ignores_id() {
    let name = NodeName::new("a").unwrap();
    let ident = NodeIdentity::new(name, NodeType::Electable, NodeAddress::new("h", 5001));
    let with_id = ident.clone().with_id(NodeId::new(7));

    assert!(ident.same_node(&with_id));
    assert_ne!(ident, with_id);
}

// ============================================================================
// Node State Tests
// ============================================================================

#[test]
fn node_state_transitions() {
    use NodeState::*;

    assert!(Unknown.can_transition_to(Master));
    assert!(Unknown.can_transition_to(Replica));
    assert!(Unknown.can_transition_to(Detached));
    assert!(Master.can_transition_to(Unknown));
    assert!(Replica.can_transition_to(Unknown));

    assert!(!Master.can_transition_to(Replica));
    assert!(!Replica.can_transition_to(Master));
    assert!(!Unknown.can_transition_to(Unknown));
    assert!(!Detached.can_transition_to(Unknown));
    assert!(!Detached.can_transition_to(Detached));
    assert!(!Master.can_transition_to(Detached));
    assert!(!Replica.can_transition_to(Detached));
}

#[test]
fn log_position_orders_by_file_then_offset() {
    assert!(LogPosition::new(1, 900) < LogPosition::new(2, 0));
    assert!(LogPosition::new(2, 10) < LogPosition::new(2, 11));
    assert_eq!(format!("{}", LogPosition::new(3, 255)), "0x3/0xff");
}

// ============================================================================
// Property-Based Tests
// ============================================================================

proptest! {
    #[test]
    fn vlsn_next_strictly_increases(raw in 0u64..u64::MAX) {
        let vlsn = Vlsn::new(raw);
        prop_assert!(vlsn.next() > vlsn);
        prop_assert_eq!(vlsn.next().prev(), vlsn);
    }

    #[test]
    fn extend_never_moves_first(start in 1u64..1_000, steps in 1usize..50) {
        let mut range = VlsnRange::EMPTY.extend_to(Vlsn::new(start));
        let mut vlsn = Vlsn::new(start);
        for _ in 0..steps {
            vlsn = vlsn.next();
            range = range.extend_to(vlsn);
            prop_assert_eq!(range.first(), Vlsn::new(start));
            prop_assert_eq!(range.last(), vlsn);
        }
    }

    #[test]
    fn commit_token_order_matches_vlsn(a in 1u64..u64::MAX, b in 1u64..u64::MAX) {
        let group = GroupUuid::generate();
        let ta = CommitToken::new(group, Vlsn::new(a));
        let tb = CommitToken::new(group, Vlsn::new(b));
        prop_assert_eq!(ta.partial_cmp(&tb), Some(a.cmp(&b)));
    }
}
