use async_trait::async_trait;
use replicore::{
    AppendEntriesReply, AppendEntriesRequest, ComplexConfig, InstallSnapshotReply,
    InstallSnapshotRequest, Interruptor, LogEntry, LogIndex, MemberId, PersistentState,
    ProposeOutcome, RaftCapability, RaftConfig, RaftError, RaftLog, RaftMember, RaftOptions,
    RecordedChanges, RequestVoteReply, RequestVoteRequest, Role, Term,
};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

type Result<T> = std::result::Result<T, RaftError>;

/// A capability whose network is always down. Persistent-state writes are
/// recorded so tests can assert what the member made durable, and when.
struct StubCapability {
    written: Mutex<Option<PersistentState<RecordedChanges>>>,
    alive: watch::Sender<BTreeSet<MemberId>>,
}

impl StubCapability {
    fn new() -> Arc<Self> {
        Self::with_connected([])
    }

    fn with_connected(peers: impl IntoIterator<Item = MemberId>) -> Arc<Self> {
        let (alive, _) = watch::channel(peers.into_iter().collect());
        Arc::new(Self {
            written: Mutex::new(None),
            alive,
        })
    }

    fn written(&self) -> Option<PersistentState<RecordedChanges>> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl RaftCapability<RecordedChanges> for StubCapability {
    async fn send_request_vote(
        &self,
        _dest: MemberId,
        _request: RequestVoteRequest,
        _interruptor: &Interruptor,
    ) -> Result<RequestVoteReply> {
        Err(RaftError::Unreachable)
    }

    async fn send_append_entries(
        &self,
        _dest: MemberId,
        _request: AppendEntriesRequest<RecordedChanges>,
        _interruptor: &Interruptor,
    ) -> Result<AppendEntriesReply> {
        Err(RaftError::Unreachable)
    }

    async fn send_install_snapshot(
        &self,
        _dest: MemberId,
        _request: InstallSnapshotRequest<RecordedChanges>,
        _interruptor: &Interruptor,
    ) -> Result<InstallSnapshotReply> {
        Err(RaftError::Unreachable)
    }

    async fn write_persistent_state(
        &self,
        state: &PersistentState<RecordedChanges>,
        _interruptor: &Interruptor,
    ) -> Result<()> {
        *self.written.lock().unwrap() = Some(state.clone());
        Ok(())
    }

    fn connected_members(&self) -> watch::Receiver<BTreeSet<MemberId>> {
        self.alive.subscribe()
    }
}

fn follower_member() -> (RaftMember<RecordedChanges>, Arc<StubCapability>, MemberId) {
    let id = MemberId::random();
    let peers = [MemberId::random(), MemberId::random()];
    let config = RaftConfig::with_voters([id, peers[0], peers[1]]);
    let stub = StubCapability::new();
    let member = RaftMember::new(
        id,
        stub.clone(),
        PersistentState::make_initial(RecordedChanges::default(), config),
        RaftOptions::default(),
    );
    (member, stub, id)
}

/// Anchored entry window for feeding a member's AppendEntries receiver.
fn window(
    prev_index: u64,
    prev_term: u64,
    entries: &[(u64, Uuid)],
) -> RaftLog<RecordedChanges> {
    let mut log = RaftLog::new(LogIndex::new(prev_index), Term::new(prev_term));
    for (term, change) in entries {
        log.append(LogEntry::change(Term::new(*term), *change));
    }
    log
}

fn append_request(
    term: u64,
    leader: MemberId,
    log: RaftLog<RecordedChanges>,
    leader_commit: u64,
) -> AppendEntriesRequest<RecordedChanges> {
    AppendEntriesRequest {
        term: Term::new(term),
        leader_id: leader,
        log,
        leader_commit: LogIndex::new(leader_commit),
    }
}

#[tokio::test]
async fn follower_grants_one_vote_per_term() {
    let (member, stub, _) = follower_member();
    let candidate_a = MemberId::random();
    let candidate_b = MemberId::random();
    let never = Interruptor::never();

    let request = RequestVoteRequest {
        term: Term::new(1),
        candidate_id: candidate_a,
        last_log_index: LogIndex::ZERO,
        last_log_term: Term::ZERO,
    };
    let reply = member.on_request_vote(request.clone(), &never).await.unwrap();
    assert!(reply.vote_granted);
    assert_eq!(reply.term, Term::new(1));

    // The vote is durable before the reply goes out.
    let written = stub.written().expect("vote was persisted");
    assert_eq!(written.current_term, Term::new(1));
    assert_eq!(written.voted_for, Some(candidate_a));

    // A competing candidate in the same term is refused.
    let competing = RequestVoteRequest {
        candidate_id: candidate_b,
        ..request.clone()
    };
    let reply = member.on_request_vote(competing, &never).await.unwrap();
    assert!(!reply.vote_granted);

    // The original candidate retrying is granted again.
    let reply = member.on_request_vote(request, &never).await.unwrap();
    assert!(reply.vote_granted);
}

#[tokio::test]
async fn vote_denied_when_candidate_log_is_behind() {
    let (member, _, _) = follower_member();
    let leader = MemberId::random();
    let never = Interruptor::never();

    // Give the member two term-1 entries.
    let entries = [(1, Uuid::new_v4()), (1, Uuid::new_v4())];
    let reply = member
        .on_append_entries(append_request(1, leader, window(0, 0, &entries), 0), &never)
        .await
        .unwrap();
    assert!(reply.success);

    // A candidate with an empty log loses the up-to-date comparison even
    // with a newer term; the term still advances.
    let reply = member
        .on_request_vote(
            RequestVoteRequest {
                term: Term::new(2),
                candidate_id: MemberId::random(),
                last_log_index: LogIndex::ZERO,
                last_log_term: Term::ZERO,
            },
            &never,
        )
        .await
        .unwrap();
    assert!(!reply.vote_granted);
    assert_eq!(reply.term, Term::new(2));

    // A candidate with the same last entry is at least as up-to-date.
    let reply = member
        .on_request_vote(
            RequestVoteRequest {
                term: Term::new(2),
                candidate_id: MemberId::random(),
                last_log_index: LogIndex::new(2),
                last_log_term: Term::new(1),
            },
            &never,
        )
        .await
        .unwrap();
    assert!(reply.vote_granted);
}

#[tokio::test]
async fn append_entries_applies_committed_prefix() {
    let (member, stub, _) = follower_member();
    let leader = MemberId::random();
    let never = Interruptor::never();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    let reply = member
        .on_append_entries(
            append_request(1, leader, window(0, 0, &[(1, a), (1, b)]), 1),
            &never,
        )
        .await
        .unwrap();
    assert!(reply.success);

    let status = member.status().await;
    assert_eq!(status.role, Role::Follower);
    assert_eq!(status.last_log_index, LogIndex::new(2));
    assert_eq!(status.commit_index, LogIndex::new(1));
    assert_eq!(status.leader_hint, Some(leader));
    assert_eq!(member.state_machine().current().changes, vec![a]);

    // The entries were durable before the reply.
    assert_eq!(stub.written().unwrap().log.last_index(), LogIndex::new(2));

    // A heartbeat raising leader_commit applies the rest.
    let reply = member
        .on_append_entries(append_request(1, leader, window(2, 1, &[]), 2), &never)
        .await
        .unwrap();
    assert!(reply.success);
    assert_eq!(member.state_machine().current().changes, vec![a, b]);
}

#[tokio::test]
async fn append_entries_rejects_mismatched_anchor() {
    let (member, _, _) = follower_member();
    let leader = MemberId::random();
    let never = Interruptor::never();

    // Anchor at index 5 of an empty log.
    let reply = member
        .on_append_entries(
            append_request(1, leader, window(5, 1, &[(1, Uuid::new_v4())]), 0),
            &never,
        )
        .await
        .unwrap();
    assert!(!reply.success);
    assert_eq!(member.status().await.last_log_index, LogIndex::ZERO);

    // Stale-term requests are refused outright.
    member
        .on_append_entries(append_request(3, leader, window(0, 0, &[]), 0), &never)
        .await
        .unwrap();
    let reply = member
        .on_append_entries(append_request(2, leader, window(0, 0, &[]), 0), &never)
        .await
        .unwrap();
    assert!(!reply.success);
    assert_eq!(reply.term, Term::new(3));
}

#[tokio::test]
async fn append_entries_deletes_conflicting_suffix() {
    let (member, _, _) = follower_member();
    let old_leader = MemberId::random();
    let new_leader = MemberId::random();
    let never = Interruptor::never();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let c = Uuid::new_v4();

    member
        .on_append_entries(
            append_request(1, old_leader, window(0, 0, &[(1, a), (1, b)]), 1),
            &never,
        )
        .await
        .unwrap();

    // A new leader overwrites the uncommitted entry at index 2.
    let reply = member
        .on_append_entries(append_request(2, new_leader, window(1, 1, &[(2, c)]), 2), &never)
        .await
        .unwrap();
    assert!(reply.success);

    let status = member.status().await;
    assert_eq!(status.last_log_index, LogIndex::new(2));
    assert_eq!(status.commit_index, LogIndex::new(2));
    assert_eq!(member.state_machine().current().changes, vec![a, c]);

    // Replaying the same request is a no-op.
    let reply = member
        .on_append_entries(append_request(2, new_leader, window(1, 1, &[(2, c)]), 2), &never)
        .await
        .unwrap();
    assert!(reply.success);
    assert_eq!(member.status().await.last_log_index, LogIndex::new(2));
    assert_eq!(member.state_machine().current().changes, vec![a, c]);
}

#[tokio::test(start_paused = true)]
async fn single_member_elects_itself_and_commits() {
    let id = MemberId::random();
    let stub = StubCapability::new();
    let member = RaftMember::new(
        id,
        stub.clone(),
        PersistentState::make_initial(
            RecordedChanges::default(),
            RaftConfig::with_voters([id]),
        ),
        RaftOptions::default(),
    );

    let deadline = Instant::now() + Duration::from_secs(5);
    while !member.status().await.role.is_leader() {
        assert!(Instant::now() < deadline, "single member never became leader");
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(member.get_leader().await, Some(id));

    let change = Uuid::new_v4();
    let outcome = member
        .propose_change_if_leader(change, &Interruptor::never())
        .await
        .unwrap();
    assert_eq!(outcome, ProposeOutcome::Committed);
    assert_eq!(member.state_machine().current().changes, vec![change]);

    // Noop at index 1, the change at index 2, all committed and durable.
    let status = member.status().await;
    assert_eq!(status.commit_index, LogIndex::new(2));
    assert_eq!(stub.written().unwrap().log.last_index(), LogIndex::new(2));
}

#[tokio::test(start_paused = true)]
async fn leader_steps_down_on_higher_term_vote_request() {
    let id = MemberId::random();
    let stub = StubCapability::new();
    let member = RaftMember::new(
        id,
        stub.clone(),
        PersistentState::make_initial(
            RecordedChanges::default(),
            RaftConfig::with_voters([id]),
        ),
        RaftOptions::default(),
    );
    let deadline = Instant::now() + Duration::from_secs(5);
    while !member.status().await.role.is_leader() {
        assert!(Instant::now() < deadline);
        sleep(Duration::from_millis(10)).await;
    }
    let term = member.status().await.term;

    let reply = member
        .on_request_vote(
            RequestVoteRequest {
                term: Term::new(term.get() + 5),
                candidate_id: MemberId::random(),
                last_log_index: LogIndex::new(100),
                last_log_term: Term::new(term.get() + 5),
            },
            &Interruptor::never(),
        )
        .await
        .unwrap();
    assert!(reply.vote_granted);

    let status = member.status().await;
    assert_eq!(status.role, Role::Follower);
    assert_eq!(status.term, Term::new(term.get() + 5));
}

#[tokio::test]
async fn propose_on_follower_reports_leader_hint() {
    let (member, _, _) = follower_member();
    let leader = MemberId::random();
    let never = Interruptor::never();

    let outcome = member
        .propose_change_if_leader(Uuid::new_v4(), &never)
        .await
        .unwrap();
    assert_eq!(outcome, ProposeOutcome::NotLeader(None));

    member
        .on_append_entries(append_request(1, leader, window(0, 0, &[]), 0), &never)
        .await
        .unwrap();
    let outcome = member
        .propose_change_if_leader(Uuid::new_v4(), &never)
        .await
        .unwrap();
    assert_eq!(outcome, ProposeOutcome::NotLeader(Some(leader)));
}

#[tokio::test]
async fn install_snapshot_fast_forwards_blank_member() {
    let id = MemberId::random();
    let leader = MemberId::random();
    let voters = RaftConfig::with_voters([leader, id]);
    let stub = StubCapability::new();
    let member: RaftMember<RecordedChanges> = RaftMember::new(
        id,
        stub.clone(),
        PersistentState::make_join(),
        RaftOptions::default(),
    );
    let never = Interruptor::never();

    let snapshot_changes = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
    let reply = member
        .on_install_snapshot(
            InstallSnapshotRequest {
                term: Term::new(2),
                leader_id: leader,
                last_included_index: LogIndex::new(3),
                last_included_term: Term::new(1),
                snapshot_state: RecordedChanges {
                    changes: snapshot_changes.clone(),
                },
                snapshot_config: ComplexConfig::simple(voters.clone()),
            },
            &never,
        )
        .await
        .unwrap();
    assert_eq!(reply.term, Term::new(2));

    let status = member.status().await;
    assert_eq!(status.commit_index, LogIndex::new(3));
    assert_eq!(status.last_applied, LogIndex::new(3));
    assert_eq!(status.snapshot_index, LogIndex::new(3));
    assert_eq!(member.state_machine().current().changes, snapshot_changes);

    let written = stub.written().unwrap();
    assert_eq!(written.snapshot_last_index(), LogIndex::new(3));
    assert_eq!(written.latest_config(), ComplexConfig::simple(voters));

    // Replication resumes from the snapshot point.
    let next = Uuid::new_v4();
    let reply = member
        .on_append_entries(append_request(2, leader, window(3, 1, &[(2, next)]), 4), &never)
        .await
        .unwrap();
    assert!(reply.success);
    let mut expected = snapshot_changes;
    expected.push(next);
    assert_eq!(member.state_machine().current().changes, expected);

    // An older snapshot offer is ignored.
    let reply = member
        .on_install_snapshot(
            InstallSnapshotRequest {
                term: Term::new(2),
                leader_id: leader,
                last_included_index: LogIndex::new(2),
                last_included_term: Term::new(1),
                snapshot_state: RecordedChanges::default(),
                snapshot_config: ComplexConfig::default(),
            },
            &never,
        )
        .await
        .unwrap();
    assert_eq!(reply.term, Term::new(2));
    assert_eq!(member.status().await.snapshot_index, LogIndex::new(3));
}

#[tokio::test]
async fn follower_compacts_log_past_threshold() {
    let id = MemberId::random();
    let leader = MemberId::random();
    let config = RaftConfig::with_voters([leader, id]);
    let stub = StubCapability::new();
    let options = RaftOptions {
        snapshot_threshold: 4,
        ..RaftOptions::default()
    };
    let member = RaftMember::new(
        id,
        stub.clone(),
        PersistentState::make_initial(RecordedChanges::default(), config),
        options,
    );
    let never = Interruptor::never();

    let changes: Vec<Uuid> = (0..10).map(|_| Uuid::new_v4()).collect();
    let entries: Vec<(u64, Uuid)> = changes.iter().map(|c| (1, *c)).collect();
    let reply = member
        .on_append_entries(append_request(1, leader, window(0, 0, &entries), 10), &never)
        .await
        .unwrap();
    assert!(reply.success);

    let status = member.status().await;
    assert_eq!(status.last_applied, LogIndex::new(10));
    assert_eq!(status.snapshot_index, LogIndex::new(10));
    assert_eq!(member.state_machine().current().changes, changes);

    // The durable state carries the snapshot instead of the entries.
    let written = stub.written().unwrap();
    assert_eq!(written.snapshot_last_index(), LogIndex::new(10));
    assert_eq!(written.snapshot_state.changes, changes);
    assert!(written.log.is_empty());
}

#[tokio::test(start_paused = true)]
async fn blank_joiner_stays_quiet() {
    let stub = StubCapability::new();
    let member: RaftMember<RecordedChanges> = RaftMember::new(
        MemberId::random(),
        stub,
        PersistentState::make_join(),
        RaftOptions::default(),
    );

    sleep(Duration::from_secs(5)).await;
    let status = member.status().await;
    assert_eq!(status.role, Role::Follower);
    assert_eq!(status.term, Term::ZERO);
}

#[tokio::test(start_paused = true)]
async fn member_without_visible_quorum_does_not_campaign() {
    // Three-voter config, but the capability reports nobody reachable.
    let (member, _, _) = follower_member();
    sleep(Duration::from_secs(5)).await;
    let status = member.status().await;
    assert_eq!(status.role, Role::Follower);
    assert_eq!(status.term, Term::ZERO);
}
