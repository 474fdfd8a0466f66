use crate::log::RaftLog;
use crate::state_machine::ReplicatedState;
use crate::types::{ComplexConfig, LogIndex, MemberId, Term};
use serde::{Deserialize, Serialize};

/// RequestVote, sent by candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: MemberId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: Term,
    pub vote_granted: bool,
}

/// AppendEntries, sent by leaders. The carried log window is anchored at
/// `prev_log_index`/`prev_log_term`; an empty window is a heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "S: ReplicatedState")]
pub struct AppendEntriesRequest<S: ReplicatedState> {
    pub term: Term,
    pub leader_id: MemberId,
    pub log: RaftLog<S>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub success: bool,
}

/// InstallSnapshot, sent by leaders to peers whose next entry has already
/// been compacted away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "S: ReplicatedState")]
pub struct InstallSnapshotRequest<S: ReplicatedState> {
    pub term: Term,
    pub leader_id: MemberId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub snapshot_state: S,
    pub snapshot_config: ComplexConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub term: Term,
}

/// One of the three requests, for transports that multiplex them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "S: ReplicatedState")]
pub enum RpcRequest<S: ReplicatedState> {
    Vote(RequestVoteRequest),
    Append(AppendEntriesRequest<S>),
    Snapshot(InstallSnapshotRequest<S>),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RpcReply {
    Vote(RequestVoteReply),
    Append(AppendEntriesReply),
    Snapshot(InstallSnapshotReply),
}

impl RpcReply {
    pub fn term(&self) -> Term {
        match self {
            Self::Vote(r) => r.term,
            Self::Append(r) => r.term,
            Self::Snapshot(r) => r.term,
        }
    }
}
