use crate::log::RaftLog;
use crate::state_machine::ReplicatedState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Election epoch. Monotonically non-decreasing on every replica; at most
/// one leader exists per term across the whole cluster.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Term(u64);

impl Term {
    pub const ZERO: Self = Self(0);

    pub const fn new(t: u64) -> Self {
        Self(t)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// 1-based position in the logical log. Index 0 is the position before the
/// first entry. Indices are never reused.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LogIndex(u64);

impl LogIndex {
    pub const ZERO: Self = Self(0);

    pub const fn new(i: u64) -> Self {
        Self(i)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub const fn saturating_prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque unique identifier of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(Uuid);

impl MemberId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The first uuid group is enough to tell members apart in logs.
        let s = self.0.to_string();
        f.write_str(&s[..8])
    }
}

/// One set of voting members plus an optional set of non-voting members.
///
/// Non-voting members receive replicated entries but never vote and never
/// count toward quorums.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftConfig {
    pub voting: BTreeSet<MemberId>,
    pub non_voting: BTreeSet<MemberId>,
}

impl RaftConfig {
    pub fn with_voters(voters: impl IntoIterator<Item = MemberId>) -> Self {
        Self {
            voting: voters.into_iter().collect(),
            non_voting: BTreeSet::new(),
        }
    }

    pub fn is_member(&self, id: &MemberId) -> bool {
        self.voting.contains(id) || self.non_voting.contains(id)
    }

    pub fn is_voter(&self, id: &MemberId) -> bool {
        self.voting.contains(id)
    }

    /// Whether `acks` contains a strict majority of the voting members.
    /// An empty voting set has no quorum.
    pub fn is_quorum(&self, acks: &BTreeSet<MemberId>) -> bool {
        if self.voting.is_empty() {
            return false;
        }
        let count = self.voting.intersection(acks).count();
        count * 2 > self.voting.len()
    }
}

/// Either a simple configuration, or a joint one carrying both the old and
/// new simple configs during a membership change. While joint, quorum
/// checks must pass in both halves.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexConfig {
    pub config: RaftConfig,
    pub new_config: Option<RaftConfig>,
}

impl ComplexConfig {
    pub fn simple(config: RaftConfig) -> Self {
        Self {
            config,
            new_config: None,
        }
    }

    pub fn joint(old: RaftConfig, new: RaftConfig) -> Self {
        Self {
            config: old,
            new_config: Some(new),
        }
    }

    pub fn is_joint(&self) -> bool {
        self.new_config.is_some()
    }

    pub fn is_member(&self, id: &MemberId) -> bool {
        self.config.is_member(id) || self.new_config.as_ref().is_some_and(|c| c.is_member(id))
    }

    pub fn is_voter(&self, id: &MemberId) -> bool {
        self.config.is_voter(id) || self.new_config.as_ref().is_some_and(|c| c.is_voter(id))
    }

    /// All members of both halves, voting and non-voting.
    pub fn members(&self) -> BTreeSet<MemberId> {
        let mut all: BTreeSet<MemberId> = self.config.voting.iter().copied().collect();
        all.extend(self.config.non_voting.iter().copied());
        if let Some(new) = &self.new_config {
            all.extend(new.voting.iter().copied());
            all.extend(new.non_voting.iter().copied());
        }
        all
    }

    pub fn voters(&self) -> BTreeSet<MemberId> {
        let mut all: BTreeSet<MemberId> = self.config.voting.iter().copied().collect();
        if let Some(new) = &self.new_config {
            all.extend(new.voting.iter().copied());
        }
        all
    }

    pub fn is_quorum(&self, acks: &BTreeSet<MemberId>) -> bool {
        self.config.is_quorum(acks)
            && self.new_config.as_ref().map_or(true, |c| c.is_quorum(acks))
    }
}

/// Payload of one log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "S: ReplicatedState")]
pub enum EntryPayload<S: ReplicatedState> {
    /// Committed at the start of a new leader's term to pin down the
    /// commit index.
    Noop,
    /// An application-defined change.
    Change(S::Change),
    /// A configuration, adopted as soon as it appears in the log.
    Config(ComplexConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "S: ReplicatedState")]
pub struct LogEntry<S: ReplicatedState> {
    pub term: Term,
    pub payload: EntryPayload<S>,
}

impl<S: ReplicatedState> LogEntry<S> {
    pub fn noop(term: Term) -> Self {
        Self {
            term,
            payload: EntryPayload::Noop,
        }
    }

    pub fn change(term: Term, change: S::Change) -> Self {
        Self {
            term,
            payload: EntryPayload::Change(change),
        }
    }

    pub fn config(term: Term, config: ComplexConfig) -> Self {
        Self {
            term,
            payload: EntryPayload::Config(config),
        }
    }
}

/// Everything a member must retain across a crash. Written atomically and
/// in full through the capability before the member acknowledges anything
/// that depends on it.
///
/// The log's `prev_index`/`prev_term` anchor is the latest snapshot's last
/// index and term; `snapshot_state` and `snapshot_config` describe the
/// state machine and configuration as of that index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "S: ReplicatedState")]
pub struct PersistentState<S: ReplicatedState> {
    pub current_term: Term,
    pub voted_for: Option<MemberId>,
    pub snapshot_state: S,
    pub snapshot_config: ComplexConfig,
    pub log: RaftLog<S>,
}

impl<S: ReplicatedState> PersistentState<S> {
    /// State for a founding member of a new cluster.
    pub fn make_initial(state: S, config: RaftConfig) -> Self {
        Self {
            current_term: Term::ZERO,
            voted_for: None,
            snapshot_state: state,
            snapshot_config: ComplexConfig::simple(config),
            log: RaftLog::new(LogIndex::ZERO, Term::ZERO),
        }
    }

    /// State for a blank member joining an existing cluster. It holds no
    /// configuration and catches up via an install-snapshot from the
    /// leader once a config change adds it.
    pub fn make_join() -> Self
    where
        S: Default,
    {
        Self {
            current_term: Term::ZERO,
            voted_for: None,
            snapshot_state: S::default(),
            snapshot_config: ComplexConfig::default(),
            log: RaftLog::new(LogIndex::ZERO, Term::ZERO),
        }
    }

    pub fn snapshot_last_index(&self) -> LogIndex {
        self.log.prev_index()
    }

    pub fn snapshot_last_term(&self) -> Term {
        self.log.prev_term()
    }

    /// The effective configuration: the latest one appearing in the log,
    /// committed or not, falling back to the snapshot's.
    pub fn latest_config(&self) -> ComplexConfig {
        self.config_at(self.log.last_index())
    }

    /// Index of the latest config entry still retained in the log, if any.
    pub fn latest_config_index(&self) -> Option<LogIndex> {
        let mut i = self.log.last_index();
        while i > self.log.prev_index() {
            if let Some(LogEntry {
                payload: EntryPayload::Config(_),
                ..
            }) = self.log.entry(i)
            {
                return Some(i);
            }
            i = i.saturating_prev();
        }
        None
    }

    /// The configuration active at `index`: the latest one at or before it.
    pub fn config_at(&self, index: LogIndex) -> ComplexConfig {
        let mut i = index.min(self.log.last_index());
        while i > self.log.prev_index() {
            if let Some(LogEntry {
                payload: EntryPayload::Config(config),
                ..
            }) = self.log.entry(i)
            {
                return config.clone();
            }
            i = i.saturating_prev();
        }
        self.snapshot_config.clone()
    }
}
