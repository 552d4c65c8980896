#![forbid(unsafe_code)]

mod group;

pub use group::{GroupMetadata, GroupState, MemberMetadata};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    /// A state-machine move outside the transition table; always a
    /// coordinator bug, never a client-visible condition.
    IllegalStateTransition {
        group_id: String,
        from: GroupState,
        to: GroupState,
    },
    UnknownMember(String),
    EmptyGroup {
        group_id: String,
    },
    NoCommonProtocol {
        group_id: String,
    },
    InconsistentProtocolType {
        group_id: String,
        expected: String,
        actual: String,
    },
}
