//! Group membership registry.
//!
//! [`RepGroup`] is an arena-style table keyed by node name. Members never
//! hold a reference back to the group; everything else in the crate refers
//! to members by [`NodeName`].
//!
//! # Durability
//!
//! Electable and monitor members are persistent: every change to them is a
//! [`GroupChange`] committed as a [`crate::RecordKind::Membership`] record
//! through the normal commit path and applied on replicas during replay.
//! Replaying a node's log therefore rebuilds its group table exactly.
//! Secondary members are transient and live only in the master's memory.
//!
//! # Invariants
//!
//! - Names are unique, and a removed name is never reusable
//! - No two live members share an address
//! - Node ids are assigned in increasing order and never reused

use std::collections::BTreeMap;
use std::fmt;

use keel_types::{GroupUuid, NodeAddress, NodeId, NodeIdentity, NodeName, NodeType};
use serde::{Deserialize, Serialize};

use crate::election::quorum_size;
use crate::{RepError, RepResult};

/// Current version of the group table format.
pub const GROUP_FORMAT_VERSION: u32 = 3;

// ============================================================================
// Changes
// ============================================================================

/// A committed change to the group table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupChange {
    /// The group was formed. Always the first membership record of a log.
    Create {
        /// Group name.
        name: String,
        /// Group identity.
        uuid: GroupUuid,
    },
    /// A persistent member was added. The identity carries its assigned id.
    Add(NodeIdentity),
    /// A member was removed.
    Remove(NodeName),
}

impl fmt::Display for GroupChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupChange::Create { name, uuid } => write!(f, "create group {name} ({uuid})"),
            GroupChange::Add(identity) => write!(f, "add {identity}"),
            GroupChange::Remove(name) => write!(f, "remove {name}"),
        }
    }
}

// ============================================================================
// Members
// ============================================================================

/// One row of the membership table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    /// The member's identity.
    pub identity: NodeIdentity,
    /// True once the member has been removed. Removed rows are kept so their
    /// names can never be claimed again.
    pub removed: bool,
    /// Group change version at which the member was added.
    pub added_at: u64,
}

/// What adding an identity to the group would do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// The identity is new; commit a [`GroupChange::Add`] with this identity.
    Added(NodeIdentity),
    /// The same node is already a live member.
    AlreadyMember(NodeIdentity),
}

// ============================================================================
// Group
// ============================================================================

/// The membership table of a replication group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepGroup {
    name: String,
    uuid: GroupUuid,
    format_version: u32,
    change_version: u64,
    last_node_id: NodeId,
    members: BTreeMap<NodeName, MemberRecord>,
    #[serde(skip)]
    secondaries: BTreeMap<NodeName, NodeIdentity>,
}

impl RepGroup {
    /// Creates an empty group.
    pub fn new(name: impl Into<String>, uuid: GroupUuid) -> Self {
        Self {
            name: name.into(),
            uuid,
            format_version: GROUP_FORMAT_VERSION,
            change_version: 0,
            last_node_id: NodeId::UNASSIGNED,
            members: BTreeMap::new(),
            secondaries: BTreeMap::new(),
        }
    }

    /// Builds a group from the `Create` change that formed it.
    pub fn from_create(change: &GroupChange) -> RepResult<Self> {
        match change {
            GroupChange::Create { name, uuid } => Ok(Self::new(name.clone(), *uuid)),
            other => Err(RepError::UnexpectedState(format!(
                "group history must start with a create record, found: {other}"
            ))),
        }
    }

    /// Returns the group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the group identity.
    pub fn uuid(&self) -> GroupUuid {
        self.uuid
    }

    /// Returns the table format version.
    pub fn format_version(&self) -> u32 {
        self.format_version
    }

    /// Returns the number of changes applied so far.
    pub fn change_version(&self) -> u64 {
        self.change_version
    }

    // ------------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------------

    /// Returns a live member (persistent or secondary) by name.
    pub fn member(&self, name: &NodeName) -> Option<&NodeIdentity> {
        self.members
            .get(name)
            .filter(|record| !record.removed)
            .map(|record| &record.identity)
            .or_else(|| self.secondaries.get(name))
    }

    /// Returns the live member listening on `address`.
    pub fn member_at(&self, address: &NodeAddress) -> Option<&NodeIdentity> {
        self.live_members()
            .find(|identity| identity.address == *address)
    }

    /// Returns true if `name` belonged to a member that was removed.
    pub fn is_removed(&self, name: &NodeName) -> bool {
        self.members.get(name).is_some_and(|record| record.removed)
    }

    /// Returns the full record of a persistent member, removed or not.
    pub fn record(&self, name: &NodeName) -> Option<&MemberRecord> {
        self.members.get(name)
    }

    /// Iterates over live members, persistent first, in name order.
    pub fn live_members(&self) -> impl Iterator<Item = &NodeIdentity> + '_ {
        self.members
            .values()
            .filter(|record| !record.removed)
            .map(|record| &record.identity)
            .chain(self.secondaries.values())
    }

    /// Iterates over live electable members in name order.
    pub fn electable_members(&self) -> impl Iterator<Item = &NodeIdentity> + '_ {
        self.live_members()
            .filter(|identity| identity.node_type.is_electable())
    }

    /// Returns the number of live electable members.
    pub fn electable_count(&self) -> usize {
        self.electable_members().count()
    }

    /// Returns the quorum for elections and durability in this group.
    pub fn quorum_size(&self) -> usize {
        quorum_size(self.electable_count())
    }

    // ------------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------------

    /// Decides whether `identity` can be added.
    ///
    /// Re-adding an identical node is reported as [`AddOutcome::AlreadyMember`]
    /// so admin operations can be idempotent.
    pub fn validate_add(&self, identity: &NodeIdentity) -> RepResult<AddOutcome> {
        if let Some(record) = self.members.get(&identity.name) {
            if record.removed {
                return Err(RepError::MemberConflict(format!(
                    "{} was removed from group {} and cannot rejoin",
                    identity.name, self.name
                )));
            }
            if record.identity.same_node(identity) {
                return Ok(AddOutcome::AlreadyMember(record.identity.clone()));
            }
            return Err(RepError::MemberConflict(format!(
                "{} is already registered as {}",
                identity.name, record.identity
            )));
        }
        if let Some(existing) = self.secondaries.get(&identity.name) {
            if existing.same_node(identity) {
                return Ok(AddOutcome::AlreadyMember(existing.clone()));
            }
            return Err(RepError::MemberConflict(format!(
                "{} is already registered as {existing}",
                identity.name
            )));
        }
        if let Some(holder) = self.member_at(&identity.address) {
            return Err(RepError::MemberConflict(format!(
                "address {} is already used by {}",
                identity.address, holder.name
            )));
        }
        Ok(AddOutcome::Added(
            identity.clone().with_id(self.last_node_id.next()),
        ))
    }

    /// Checks that `name` is a live persistent member that can be removed.
    pub fn validate_remove(&self, name: &NodeName) -> RepResult<&NodeIdentity> {
        match self.members.get(name) {
            Some(record) if !record.removed => Ok(&record.identity),
            _ => Err(RepError::MemberNotFound(name.clone())),
        }
    }

    // ------------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------------

    /// Applies a committed change.
    ///
    /// Replaying the same history always yields the same table.
    pub fn apply(&mut self, change: &GroupChange) -> RepResult<()> {
        match change {
            GroupChange::Create { name, uuid } => {
                if *name != self.name || *uuid != self.uuid {
                    return Err(RepError::UnexpectedStateFatal(format!(
                        "history re-creates group {name} ({uuid}) inside {} ({})",
                        self.name, self.uuid
                    )));
                }
            }
            GroupChange::Add(identity) => {
                if identity.id <= self.last_node_id {
                    return Err(RepError::MemberConflict(format!(
                        "node id {} for {} is not above {}",
                        identity.id, identity.name, self.last_node_id
                    )));
                }
                match self.validate_add(identity)? {
                    AddOutcome::Added(_) => {}
                    AddOutcome::AlreadyMember(existing) => {
                        return Err(RepError::MemberConflict(format!(
                            "{} is already a member",
                            existing.name
                        )));
                    }
                }
                self.secondaries.remove(&identity.name);
                self.last_node_id = identity.id;
                self.members.insert(
                    identity.name.clone(),
                    MemberRecord {
                        identity: identity.clone(),
                        removed: false,
                        added_at: self.change_version + 1,
                    },
                );
            }
            GroupChange::Remove(name) => {
                self.validate_remove(name)?;
                if let Some(record) = self.members.get_mut(name) {
                    record.removed = true;
                }
            }
        }
        self.change_version += 1;
        Ok(())
    }

    /// Applies a committed change to a node's table, forming the table from
    /// the first [`GroupChange::Create`] record.
    pub fn apply_to(slot: &mut Option<RepGroup>, change: &GroupChange) -> RepResult<()> {
        match slot {
            Some(group) => group.apply(change),
            None => {
                *slot = Some(RepGroup::from_create(change)?);
                Ok(())
            }
        }
    }

    /// Tracks a connected secondary node. Not persisted.
    pub fn add_secondary(&mut self, identity: NodeIdentity) -> RepResult<NodeIdentity> {
        debug_assert_eq!(identity.node_type, NodeType::Secondary);
        match self.validate_add(&identity)? {
            AddOutcome::AlreadyMember(existing) => Ok(existing),
            AddOutcome::Added(identity) => {
                self.last_node_id = identity.id;
                self.secondaries
                    .insert(identity.name.clone(), identity.clone());
                Ok(identity)
            }
        }
    }

    /// Forgets a secondary node after it disconnects.
    pub fn remove_secondary(&mut self, name: &NodeName) -> Option<NodeIdentity> {
        self.secondaries.remove(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(name: &str, node_type: NodeType, port: u16) -> NodeIdentity {
        NodeIdentity::new(
            NodeName::new(name).unwrap(),
            node_type,
            NodeAddress::new("localhost", port),
        )
    }

    fn group() -> RepGroup {
        RepGroup::new("orders", GroupUuid::generate())
    }

    fn add(group: &mut RepGroup, identity: &NodeIdentity) -> NodeIdentity {
        match group.validate_add(identity).unwrap() {
            AddOutcome::Added(assigned) => {
                group.apply(&GroupChange::Add(assigned.clone())).unwrap();
                assigned
            }
            AddOutcome::AlreadyMember(existing) => existing,
        }
    }

    #[test]
    fn ids_assigned_in_order() {
        let mut g = group();
        let a = add(&mut g, &ident("a", NodeType::Electable, 5001));
        let b = add(&mut g, &ident("b", NodeType::Electable, 5002));

        assert_eq!(a.id, NodeId::new(1));
        assert_eq!(b.id, NodeId::new(2));
        assert_eq!(g.change_version(), 2);
        assert_eq!(g.electable_count(), 2);
        assert_eq!(g.quorum_size(), 2);
    }

    #[test]
    fn name_and_address_unique() {
        let mut g = group();
        add(&mut g, &ident("a", NodeType::Electable, 5001));

        assert!(matches!(
            g.validate_add(&ident("a", NodeType::Electable, 5009)),
            Err(RepError::MemberConflict(_))
        ));
        assert!(matches!(
            g.validate_add(&ident("z", NodeType::Electable, 5001)),
            Err(RepError::MemberConflict(_))
        ));
    }

    #[test]
    fn removed_names_are_revoked() {
        let mut g = group();
        let a = add(&mut g, &ident("a", NodeType::Electable, 5001));
        g.apply(&GroupChange::Remove(a.name.clone())).unwrap();

        assert!(g.is_removed(&a.name));
        assert!(g.member(&a.name).is_none());
        assert!(matches!(
            g.validate_add(&ident("a", NodeType::Electable, 5001)),
            Err(RepError::MemberConflict(_))
        ));
        assert!(matches!(
            g.validate_remove(&a.name),
            Err(RepError::MemberNotFound(_))
        ));

        // The address is free again for a different node.
        let c = add(&mut g, &ident("c", NodeType::Electable, 5001));
        assert_eq!(c.id, NodeId::new(2));
    }

    #[test]
    fn monitors_do_not_count_toward_quorum() {
        let mut g = group();
        add(&mut g, &ident("a", NodeType::Electable, 5001));
        add(&mut g, &ident("b", NodeType::Electable, 5002));
        add(&mut g, &ident("c", NodeType::Electable, 5003));
        add(&mut g, &ident("mon", NodeType::Monitor, 6000));

        assert_eq!(g.electable_count(), 3);
        assert_eq!(g.quorum_size(), 2);
        assert_eq!(g.live_members().count(), 4);
    }

    #[test]
    fn ensure_is_idempotent() {
        let mut g = group();
        let monitor = ident("mon", NodeType::Monitor, 6000);
        let first = add(&mut g, &monitor);
        let version = g.change_version();

        assert_eq!(
            g.validate_add(&monitor).unwrap(),
            AddOutcome::AlreadyMember(first)
        );
        assert_eq!(g.change_version(), version);
    }

    #[test]
    fn secondaries_are_not_serialized() {
        let mut g = group();
        add(&mut g, &ident("a", NodeType::Electable, 5001));
        let s = g
            .add_secondary(ident("s", NodeType::Secondary, 7000))
            .unwrap();
        assert!(g.member(&s.name).is_some());
        assert_eq!(g.electable_count(), 1);

        let bytes = bincode::serialize(&g).unwrap();
        let restored: RepGroup = bincode::deserialize(&bytes).unwrap();
        assert!(restored.member(&s.name).is_none());
        assert!(restored.member(&NodeName::new("a").unwrap()).is_some());

        assert!(g.remove_secondary(&s.name).is_some());
        assert!(g.member(&s.name).is_none());
    }

    #[test]
    fn replay_rebuilds_identical_table() {
        let uuid = GroupUuid::generate();
        let history = vec![
            GroupChange::Create {
                name: "orders".into(),
                uuid,
            },
            GroupChange::Add(ident("a", NodeType::Electable, 5001).with_id(NodeId::new(1))),
            GroupChange::Add(ident("b", NodeType::Electable, 5002).with_id(NodeId::new(2))),
            GroupChange::Remove(NodeName::new("a").unwrap()),
        ];

        let rebuild = || {
            let mut g = RepGroup::from_create(&history[0]).unwrap();
            for change in &history {
                g.apply(change).unwrap();
            }
            g
        };
        assert_eq!(rebuild(), rebuild());
        assert_eq!(rebuild().electable_count(), 1);
    }

    #[test]
    fn stale_ids_rejected_on_apply() {
        let mut g = group();
        add(&mut g, &ident("a", NodeType::Electable, 5001));
        let stale = ident("b", NodeType::Electable, 5002).with_id(NodeId::new(1));
        assert!(g.apply(&GroupChange::Add(stale)).is_err());
    }
}
