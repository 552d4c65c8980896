use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::CoordinatorError;

/// Lifecycle of a consumer group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    /// Members are (re)joining; no assignment is current.
    PreparingRebalance,
    /// A generation was formed; waiting for the leader's assignment.
    AwaitingSync,
    /// A generation is active and assignments are distributed.
    Stable,
    /// The group has been removed from the coordinator.
    Dead,
}

impl GroupState {
    /// The states this state may be entered *from*.
    fn valid_previous(self) -> &'static [GroupState] {
        match self {
            GroupState::PreparingRebalance => &[GroupState::Stable, GroupState::AwaitingSync],
            GroupState::AwaitingSync => &[GroupState::PreparingRebalance],
            GroupState::Stable => &[GroupState::AwaitingSync],
            GroupState::Dead => &[
                GroupState::Stable,
                GroupState::AwaitingSync,
                GroupState::PreparingRebalance,
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberMetadata {
    pub member_id: String,
    pub session_timeout_ms: i32,
    pub rebalance_timeout_ms: i32,
    /// `(protocol name, protocol metadata)` in the member's preference order.
    pub supported_protocols: Vec<(String, Vec<u8>)>,
    pub assignment: Vec<u8>,
}

impl MemberMetadata {
    pub fn new(
        member_id: impl Into<String>,
        session_timeout_ms: i32,
        rebalance_timeout_ms: i32,
        supported_protocols: Vec<(String, Vec<u8>)>,
    ) -> Self {
        Self {
            member_id: member_id.into(),
            session_timeout_ms,
            rebalance_timeout_ms,
            supported_protocols,
            assignment: Vec::new(),
        }
    }

    pub fn protocol_names(&self) -> BTreeSet<String> {
        self.supported_protocols
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn metadata_for(&self, protocol: &str) -> Option<&[u8]> {
        self.supported_protocols
            .iter()
            .find(|(name, _)| name == protocol)
            .map(|(_, metadata)| metadata.as_slice())
    }

    /// The member's vote: its most-preferred protocol among `candidates`.
    fn vote(&self, candidates: &BTreeSet<String>) -> Option<&str> {
        self.supported_protocols
            .iter()
            .map(|(name, _)| name.as_str())
            .find(|name| candidates.contains(*name))
    }
}

/// Metadata and state machine for one consumer group.
///
/// Only the transitions in `GroupState::valid_previous` are legal; anything
/// else is a coordinator bug surfaced as `IllegalStateTransition`. A new
/// group starts `Stable` with generation 0 and no protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMetadata {
    group_id: String,
    protocol_type: Option<String>,
    state: GroupState,
    generation_id: i32,
    leader_id: Option<String>,
    protocol: Option<String>,
    members: BTreeMap<String, MemberMetadata>,
}

impl GroupMetadata {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            protocol_type: None,
            state: GroupState::Stable,
            generation_id: 0,
            leader_id: None,
            protocol: None,
            members: BTreeMap::new(),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn is(&self, state: GroupState) -> bool {
        self.state == state
    }

    pub fn generation_id(&self) -> i32 {
        self.generation_id
    }

    pub fn leader_id(&self) -> Option<&str> {
        self.leader_id.as_deref()
    }

    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub fn protocol_type(&self) -> Option<&str> {
        self.protocol_type.as_deref()
    }

    pub fn has_members(&self) -> bool {
        !self.members.is_empty()
    }

    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    pub fn member(&self, member_id: &str) -> Option<&MemberMetadata> {
        self.members.get(member_id)
    }

    pub fn members(&self) -> impl Iterator<Item = &MemberMetadata> {
        self.members.values()
    }

    pub fn is_leader(&self, member_id: &str) -> bool {
        self.leader_id.as_deref() == Some(member_id)
    }

    /// Move to `target`, enforcing the transition table.
    pub fn transition_to(&mut self, target: GroupState) -> Result<(), CoordinatorError> {
        if !target.valid_previous().contains(&self.state) {
            return Err(CoordinatorError::IllegalStateTransition {
                group_id: self.group_id.clone(),
                from: self.state,
                to: target,
            });
        }
        debug!(
            group = %self.group_id,
            from = ?self.state,
            to = ?target,
            "group state transition"
        );
        self.state = target;
        Ok(())
    }

    /// Add (or replace) a member. The first member added becomes leader and
    /// pins the group's protocol type.
    pub fn add_member(
        &mut self,
        protocol_type: impl Into<String>,
        member: MemberMetadata,
    ) -> Result<(), CoordinatorError> {
        let protocol_type = protocol_type.into();
        match &self.protocol_type {
            None => self.protocol_type = Some(protocol_type),
            Some(existing) if *existing != protocol_type => {
                return Err(CoordinatorError::InconsistentProtocolType {
                    group_id: self.group_id.clone(),
                    expected: existing.clone(),
                    actual: protocol_type,
                });
            }
            Some(_) => {}
        }
        if member.supported_protocols.is_empty() {
            return Err(CoordinatorError::InconsistentProtocolType {
                group_id: self.group_id.clone(),
                expected: self.protocol_type.clone().unwrap_or_default(),
                actual: "<no protocols>".to_string(),
            });
        }

        if self.leader_id.is_none() {
            self.leader_id = Some(member.member_id.clone());
        }
        self.members.insert(member.member_id.clone(), member);
        Ok(())
    }

    /// Remove a member; a removed leader is succeeded by an arbitrary
    /// remaining member.
    pub fn remove_member(&mut self, member_id: &str) -> Result<(), CoordinatorError> {
        if self.members.remove(member_id).is_none() {
            return Err(CoordinatorError::UnknownMember(member_id.to_string()));
        }
        if self.leader_id.as_deref() == Some(member_id) {
            self.leader_id = self.members.keys().next().cloned();
        }
        Ok(())
    }

    /// Protocols every current member supports.
    pub fn candidate_protocols(&self) -> BTreeSet<String> {
        let mut members = self.members.values();
        let Some(first) = members.next() else {
            return BTreeSet::new();
        };
        members.fold(first.protocol_names(), |candidates, member| {
            candidates
                .intersection(&member.protocol_names())
                .cloned()
                .collect()
        })
    }

    /// Whether a prospective member's protocol list keeps the group viable.
    pub fn supports_protocols(&self, protocols: &BTreeSet<String>) -> bool {
        if self.members.is_empty() {
            return !protocols.is_empty();
        }
        self.candidate_protocols()
            .intersection(protocols)
            .next()
            .is_some()
    }

    /// Pick the group's protocol: each member votes for its most-preferred
    /// candidate; the most-voted protocol wins, ties broken by name.
    pub fn select_protocol(&self) -> Result<String, CoordinatorError> {
        if self.members.is_empty() {
            return Err(CoordinatorError::EmptyGroup {
                group_id: self.group_id.clone(),
            });
        }
        let candidates = self.candidate_protocols();
        if candidates.is_empty() {
            return Err(CoordinatorError::NoCommonProtocol {
                group_id: self.group_id.clone(),
            });
        }

        let mut votes: BTreeMap<&str, usize> = BTreeMap::new();
        for member in self.members.values() {
            let choice = member
                .vote(&candidates)
                .expect("candidates are drawn from member protocol sets");
            *votes.entry(choice).or_default() += 1;
        }

        // BTreeMap iterates name-ascending, and only a strictly greater
        // count displaces the running winner, so ties resolve to the
        // smallest protocol name.
        let mut winner = "";
        let mut winner_votes = 0;
        for (name, count) in votes {
            if count > winner_votes {
                winner = name;
                winner_votes = count;
            }
        }
        Ok(winner.to_string())
    }

    /// Form the next generation: select the protocol, move from
    /// `PreparingRebalance` to `AwaitingSync`, and bump the generation.
    pub fn init_next_generation(&mut self) -> Result<(), CoordinatorError> {
        let protocol = self.select_protocol()?;
        self.transition_to(GroupState::AwaitingSync)?;
        self.generation_id = self.generation_id.saturating_add(1);
        self.protocol = Some(protocol);
        Ok(())
    }

    /// Install the leader's assignments and stabilize the group.
    pub fn complete_rebalance(
        &mut self,
        assignments: BTreeMap<String, Vec<u8>>,
    ) -> Result<(), CoordinatorError> {
        for (member_id, assignment) in assignments {
            let Some(member) = self.members.get_mut(&member_id) else {
                return Err(CoordinatorError::UnknownMember(member_id));
            };
            member.assignment = assignment;
        }
        self.transition_to(GroupState::Stable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str, protocols: &[&str]) -> MemberMetadata {
        MemberMetadata::new(
            id,
            30_000,
            60_000,
            protocols
                .iter()
                .map(|name| (name.to_string(), Vec::new()))
                .collect(),
        )
    }

    fn group_with(members: &[MemberMetadata]) -> GroupMetadata {
        let mut group = GroupMetadata::new("g");
        for m in members {
            group.add_member("consumer", m.clone()).expect("add member");
        }
        group
    }

    #[test]
    fn new_group_starts_stable_with_generation_zero() {
        let group = GroupMetadata::new("g");
        assert_eq!(group.state(), GroupState::Stable);
        assert_eq!(group.generation_id(), 0);
        assert_eq!(group.leader_id(), None);
        assert_eq!(group.protocol(), None);
    }

    #[test]
    fn every_valid_transition_is_accepted() {
        let mut group = GroupMetadata::new("g");
        group.transition_to(GroupState::PreparingRebalance).expect("st -> pr");
        group.transition_to(GroupState::AwaitingSync).expect("pr -> as");
        group.transition_to(GroupState::Stable).expect("as -> st");
        group.transition_to(GroupState::PreparingRebalance).expect("st -> pr again");
        group.transition_to(GroupState::AwaitingSync).expect("pr -> as again");
        group.transition_to(GroupState::PreparingRebalance).expect("as -> pr");
        group.transition_to(GroupState::Dead).expect("pr -> dead");
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let mut group = GroupMetadata::new("g");
        let err = group
            .transition_to(GroupState::AwaitingSync)
            .expect_err("stable cannot go straight to awaiting-sync");
        assert!(matches!(err, CoordinatorError::IllegalStateTransition { .. }));

        let err = group
            .transition_to(GroupState::Stable)
            .expect_err("stable to stable is not a transition");
        assert!(matches!(err, CoordinatorError::IllegalStateTransition { .. }));

        group.transition_to(GroupState::Dead).expect("stable -> dead");
        for target in [
            GroupState::Stable,
            GroupState::AwaitingSync,
            GroupState::PreparingRebalance,
            GroupState::Dead,
        ] {
            assert!(group.transition_to(target).is_err(), "dead is terminal");
        }
    }

    #[test]
    fn first_member_becomes_leader_and_succession_works() {
        let mut group = group_with(&[member("m1", &["range"]), member("m2", &["range"])]);
        assert_eq!(group.leader_id(), Some("m1"));

        group.remove_member("m1").expect("remove leader");
        assert_eq!(group.leader_id(), Some("m2"));

        group.remove_member("m2").expect("remove last");
        assert_eq!(group.leader_id(), None);

        let err = group.remove_member("m2").expect_err("already gone");
        assert!(matches!(err, CoordinatorError::UnknownMember(_)));
    }

    #[test]
    fn protocol_selection_counts_first_preference_votes() {
        // All support both protocols; two prefer roundrobin.
        let group = group_with(&[
            member("m1", &["roundrobin", "range"]),
            member("m2", &["roundrobin", "range"]),
            member("m3", &["range", "roundrobin"]),
        ]);
        assert_eq!(group.select_protocol().expect("select"), "roundrobin");
    }

    #[test]
    fn protocol_selection_ties_break_by_name() {
        let group = group_with(&[
            member("m1", &["alpha", "beta"]),
            member("m2", &["beta", "alpha"]),
        ]);
        assert_eq!(group.select_protocol().expect("select"), "alpha");
    }

    #[test]
    fn protocol_selection_uses_only_common_protocols() {
        let group = group_with(&[
            member("m1", &["sticky", "range"]),
            member("m2", &["range"]),
        ]);
        assert_eq!(group.select_protocol().expect("select"), "range");
    }

    #[test]
    fn empty_group_cannot_select() {
        let group = GroupMetadata::new("g");
        let err = group.select_protocol().expect_err("empty");
        assert!(matches!(err, CoordinatorError::EmptyGroup { .. }));
    }

    #[test]
    fn disjoint_protocols_cannot_select() {
        let group = group_with(&[member("m1", &["range"]), member("m2", &["sticky"])]);
        let err = group.select_protocol().expect_err("no common protocol");
        assert!(matches!(err, CoordinatorError::NoCommonProtocol { .. }));
        assert!(!group.supports_protocols(&BTreeSet::from(["other".to_string()])));
    }

    #[test]
    fn rebalance_cycle_bumps_generation_and_stabilizes() {
        let mut group = group_with(&[member("m1", &["range"]), member("m2", &["range"])]);
        group
            .transition_to(GroupState::PreparingRebalance)
            .expect("prepare");
        group.init_next_generation().expect("next generation");
        assert_eq!(group.state(), GroupState::AwaitingSync);
        assert_eq!(group.generation_id(), 1);
        assert_eq!(group.protocol(), Some("range"));

        let mut assignments = BTreeMap::new();
        assignments.insert("m1".to_string(), b"p0".to_vec());
        assignments.insert("m2".to_string(), b"p1".to_vec());
        group.complete_rebalance(assignments).expect("sync");
        assert_eq!(group.state(), GroupState::Stable);
        assert_eq!(group.member("m1").expect("m1").assignment, b"p0".to_vec());
    }

    #[test]
    fn mismatched_protocol_type_is_rejected() {
        let mut group = GroupMetadata::new("g");
        group
            .add_member("consumer", member("m1", &["range"]))
            .expect("add");
        let err = group
            .add_member("connect", member("m2", &["range"]))
            .expect_err("wrong type");
        assert!(matches!(
            err,
            CoordinatorError::InconsistentProtocolType { .. }
        ));
    }
}
