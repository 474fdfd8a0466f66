use crate::state_machine::ReplicatedState;
use crate::types::{LogEntry, LogIndex, Term};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A window of the logical log anchored at the position just before its
/// first entry.
///
/// The same shape serves two purposes: a member's in-memory log, whose
/// anchor is the latest snapshot's last index and term, and the payload of
/// an AppendEntries RPC, whose anchor is `prev_log_index`/`prev_log_term`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "S: ReplicatedState")]
pub struct RaftLog<S: ReplicatedState> {
    prev_index: LogIndex,
    prev_term: Term,
    entries: VecDeque<LogEntry<S>>,
}

impl<S: ReplicatedState> RaftLog<S> {
    pub fn new(prev_index: LogIndex, prev_term: Term) -> Self {
        Self {
            prev_index,
            prev_term,
            entries: VecDeque::new(),
        }
    }

    pub fn prev_index(&self) -> LogIndex {
        self.prev_index
    }

    pub fn prev_term(&self) -> Term {
        self.prev_term
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the first retained entry.
    pub fn first_index(&self) -> LogIndex {
        self.prev_index.next()
    }

    /// Index of the last entry, or the anchor if the window is empty.
    pub fn last_index(&self) -> LogIndex {
        LogIndex::new(self.prev_index.get() + self.entries.len() as u64)
    }

    pub fn last_term(&self) -> Term {
        self.entries.back().map_or(self.prev_term, |e| e.term)
    }

    /// The retained entry at `index`, or `None` outside the window.
    pub fn entry(&self, index: LogIndex) -> Option<&LogEntry<S>> {
        if index < self.first_index() || index > self.last_index() {
            return None;
        }
        self.entries.get((index.get() - self.first_index().get()) as usize)
    }

    /// The term of the entry at `index`. Defined at the anchor position as
    /// well; `None` before the anchor or past the end.
    pub fn term_of(&self, index: LogIndex) -> Option<Term> {
        if index == self.prev_index {
            Some(self.prev_term)
        } else {
            self.entry(index).map(|e| e.term)
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (LogIndex, &LogEntry<S>)> {
        let first = self.first_index().get();
        self.entries
            .iter()
            .enumerate()
            .map(move |(i, e)| (LogIndex::new(first + i as u64), e))
    }

    /// Appends one entry at the end, returning its index.
    pub fn append(&mut self, entry: LogEntry<S>) -> LogIndex {
        self.entries.push_back(entry);
        self.last_index()
    }

    /// Deletes the suffix starting at `index` (inclusive). No-op past the
    /// end; `index` must lie after the anchor.
    pub fn truncate_from(&mut self, index: LogIndex) {
        assert!(
            index > self.prev_index,
            "cannot truncate into the snapshotted prefix"
        );
        let keep = (index.get() - self.first_index().get()) as usize;
        if keep < self.entries.len() {
            self.entries.truncate(keep);
        }
    }

    /// A copy of the window from `from` (inclusive) to the end, anchored at
    /// `from - 1`. `from` must lie within `[first_index, last_index + 1]`.
    pub fn suffix(&self, from: LogIndex) -> Self {
        let anchor = from.saturating_prev();
        let prev_term = self
            .term_of(anchor)
            .expect("suffix anchor outside retained window");
        let skip = (from.get() - self.first_index().get()) as usize;
        Self {
            prev_index: anchor,
            prev_term,
            entries: self.entries.iter().skip(skip).cloned().collect(),
        }
    }

    /// Drops retained entries through `index`, moving the anchor there.
    /// Used after taking a snapshot covering the prefix.
    pub fn discard_through(&mut self, index: LogIndex, term: Term) {
        assert!(
            index >= self.prev_index && index <= self.last_index(),
            "snapshot point outside retained window"
        );
        let drop = (index.get() - self.prev_index.get()) as usize;
        self.entries.drain(..drop);
        self.prev_index = index;
        self.prev_term = term;
    }

    /// Replaces the whole window with an empty one anchored at the given
    /// snapshot position. Used when an installed snapshot supersedes the
    /// retained log.
    pub fn reset_to_snapshot(&mut self, index: LogIndex, term: Term) {
        self.entries.clear();
        self.prev_index = index;
        self.prev_term = term;
    }
}
