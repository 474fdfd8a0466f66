use crate::types::MemberId;
use thiserror::Error;

/// Errors surfaced by members and capabilities.
///
/// RPC-level failures (`Unreachable`, `Interrupted`) carry no information
/// about whether the remote side observed the call; callers treat them as
/// "no information" and retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RaftError {
    /// The contacted member is not the leader. The hint, if any, is the last
    /// leader this member heard from.
    #[error("not the leader (hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<MemberId> },

    /// The operation was cancelled through its interruptor.
    #[error("interrupted")]
    Interrupted,

    /// The destination could not be reached.
    #[error("peer unreachable")]
    Unreachable,

    /// Writing persistent state failed. The member makes no further
    /// progress until a write succeeds.
    #[error("persistent state write failed: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, RaftError>;

/// Outcome of a client proposal on a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposeOutcome {
    /// The proposed entry was committed in the term it was appended.
    Committed,
    /// This member is not the leader; follow the hint if present.
    NotLeader(Option<MemberId>),
    /// The entry was appended but lost (leadership changed before commit),
    /// or the member could not accept the proposal right now.
    Failed,
}

impl ProposeOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }
}
