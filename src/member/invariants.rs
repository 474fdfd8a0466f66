use super::RaftMember;
use crate::state_machine::ReplicatedState;
use crate::types::{LogIndex, MemberId, Term};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Cross-replica safety check, intended for test harnesses. Panics with
/// context on the first violation found.
///
/// Checks, over all given members:
/// - election safety: no term has two recorded leaders;
/// - log matching: whenever two logs agree on the term at an index, they
///   hold identical entries there and at every shared earlier index;
/// - committed-prefix agreement: entries at or below both members' commit
///   indices are identical (with deterministic state machines this is
///   state-machine safety for the applied prefix).
pub async fn check_invariants<S: ReplicatedState + PartialEq>(members: &[Arc<RaftMember<S>>]) {
    let mut cores = Vec::with_capacity(members.len());
    for member in members {
        cores.push((member.id(), member.shared.core.lock().await));
    }

    let mut leaders: BTreeMap<Term, MemberId> = BTreeMap::new();
    for (_, core) in &cores {
        for (term, leader) in &core.leadership_history {
            if let Some(existing) = leaders.insert(*term, *leader) {
                assert_eq!(
                    existing, *leader,
                    "election safety violated: term {term} has leaders {existing} and {leader}"
                );
            }
        }
    }

    for i in 0..cores.len() {
        for j in (i + 1)..cores.len() {
            let (a_id, a) = &cores[i];
            let (b_id, b) = &cores[j];
            let a_log = &a.persistent.log;
            let b_log = &b.persistent.log;

            let lo = a_log.first_index().max(b_log.first_index());
            let hi = a_log.last_index().min(b_log.last_index());
            if lo > hi {
                continue;
            }

            // Highest shared index where the terms agree; everything below
            // it that both retain must be identical.
            let mut anchor = None;
            let mut idx = hi;
            while idx >= lo {
                if a_log.term_of(idx) == b_log.term_of(idx) {
                    anchor = Some(idx);
                    break;
                }
                idx = idx.saturating_prev();
            }
            if let Some(anchor) = anchor {
                let mut k = lo;
                while k <= anchor {
                    assert_eq!(
                        a_log.entry(k),
                        b_log.entry(k),
                        "log matching violated at index {k} between {a_id} and {b_id}"
                    );
                    k = k.next();
                }
            }

            let committed: LogIndex = a.commit_index.min(b.commit_index).min(hi);
            let mut k = lo;
            while k <= committed {
                assert_eq!(
                    a_log.entry(k),
                    b_log.entry(k),
                    "committed entries diverge at index {k} between {a_id} and {b_id}"
                );
                k = k.next();
            }
        }
    }
}
