mod invariants;

pub use invariants::check_invariants;

use crate::capability::RaftCapability;
use crate::config::RaftOptions;
use crate::error::{ProposeOutcome, RaftError, Result};
use crate::interrupt::{DrainLatch, Interruptor};
use crate::message::{
    AppendEntriesReply, AppendEntriesRequest, InstallSnapshotReply, InstallSnapshotRequest,
    RequestVoteReply, RequestVoteRequest, RpcReply,
};
use crate::state_machine::{ReplicatedState, StateAdapter, StateWatcher};
use crate::types::{
    ComplexConfig, EntryPayload, LogEntry, LogIndex, MemberId, PersistentState, RaftConfig, Term,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

/// Role of a member: follower, candidate, or leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Role {
    pub const fn is_leader(self) -> bool {
        matches!(self, Self::Leader)
    }
}

/// A point-in-time view of a member, for observability and tests.
#[derive(Debug, Clone)]
pub struct MemberStatus {
    pub id: MemberId,
    pub role: Role,
    pub term: Term,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub snapshot_index: LogIndex,
    pub leader_hint: Option<MemberId>,
}

/// One replica of the consensus group.
///
/// A member is created from its persistent state and runs until destroyed;
/// recreating a member from the state it last wrote through the capability
/// resumes it correctly. All I/O goes through the supplied
/// [`RaftCapability`].
pub struct RaftMember<S: ReplicatedState> {
    shared: Arc<Shared<S>>,
    latch: DrainLatch,
    watcher: StateWatcher<S>,
    commit_rx: watch::Receiver<u64>,
    role_rx: watch::Receiver<(Term, Role)>,
    driver: JoinHandle<()>,
}

struct Shared<S: ReplicatedState> {
    id: MemberId,
    options: RaftOptions,
    capability: Arc<dyn RaftCapability<S>>,
    core: Mutex<MemberCore<S>>,
    kick: Notify,
    interruptor: Interruptor,
}

struct MemberCore<S: ReplicatedState> {
    persistent: PersistentState<S>,
    /// Latest configuration appearing in the log, committed or not.
    effective_config: ComplexConfig,
    role: Role,
    commit_index: LogIndex,
    last_applied: LogIndex,
    leader_hint: Option<MemberId>,
    election_deadline: Instant,
    next_index: BTreeMap<MemberId, LogIndex>,
    match_index: BTreeMap<MemberId, LogIndex>,
    votes: BTreeSet<MemberId>,
    /// Terms in which this member itself won the election. Only ever grows;
    /// feeds the cross-replica election-safety check.
    leadership_history: BTreeMap<Term, MemberId>,
    adapter: StateAdapter<S>,
    commit_tx: watch::Sender<u64>,
    role_tx: watch::Sender<(Term, Role)>,
}

impl<S: ReplicatedState> RaftMember<S> {
    pub fn new(
        id: MemberId,
        capability: Arc<dyn RaftCapability<S>>,
        persistent: PersistentState<S>,
        options: RaftOptions,
    ) -> Self {
        let adapter = StateAdapter::new(persistent.snapshot_state.clone());
        let watcher = adapter.watcher();
        let snapshot_index = persistent.snapshot_last_index();
        let (commit_tx, commit_rx) = watch::channel(snapshot_index.get());
        let (role_tx, role_rx) = watch::channel((persistent.current_term, Role::Follower));
        let effective_config = persistent.latest_config();

        let core = MemberCore {
            persistent,
            effective_config,
            role: Role::Follower,
            commit_index: snapshot_index,
            last_applied: snapshot_index,
            leader_hint: None,
            election_deadline: Instant::now() + options.election_timeout(),
            next_index: BTreeMap::new(),
            match_index: BTreeMap::new(),
            votes: BTreeSet::new(),
            leadership_history: BTreeMap::new(),
            adapter,
            commit_tx,
            role_tx,
        };

        let latch = DrainLatch::new();
        let shared = Arc::new(Shared {
            id,
            options,
            capability,
            core: Mutex::new(core),
            kick: Notify::new(),
            interruptor: latch.interruptor(),
        });
        let driver = tokio::spawn(drive(shared.clone()));

        Self {
            shared,
            latch,
            watcher,
            commit_rx,
            role_rx,
            driver,
        }
    }

    pub fn id(&self) -> MemberId {
        self.shared.id
    }

    /// The member this replica believes is leader: itself when leading,
    /// otherwise the last leader it heard from.
    pub async fn get_leader(&self) -> Option<MemberId> {
        let core = self.shared.core.lock().await;
        if core.role.is_leader() {
            Some(self.shared.id)
        } else {
            core.leader_hint
        }
    }

    pub async fn status(&self) -> MemberStatus {
        let core = self.shared.core.lock().await;
        MemberStatus {
            id: self.shared.id,
            role: core.role,
            term: core.persistent.current_term,
            commit_index: core.commit_index,
            last_applied: core.last_applied,
            last_log_index: core.persistent.log.last_index(),
            snapshot_index: core.persistent.log.prev_index(),
            leader_hint: core.leader_hint,
        }
    }

    /// Handle onto the applied state, supporting `run_until_satisfied`.
    pub fn state_machine(&self) -> StateWatcher<S> {
        self.watcher.clone()
    }

    /// Proposes a change if this member is currently leader, waiting until
    /// the entry commits or leadership is lost. `Failed` means the change
    /// is not known to have committed, not that it certainly did not.
    pub async fn propose_change_if_leader(
        &self,
        change: S::Change,
        interruptor: &Interruptor,
    ) -> Result<ProposeOutcome> {
        let (index, term) = {
            let mut core = lock_interruptible(&self.shared.core, interruptor).await?;
            if !core.role.is_leader() {
                return Ok(ProposeOutcome::NotLeader(core.leader_hint));
            }
            let term = core.persistent.current_term;
            let index = core.persistent.log.append(LogEntry::change(term, change));
            self.shared.persist(&core, interruptor).await?;
            core.leader_advance_commit(self.shared.id);
            self.shared.kick.notify_one();
            (index, term)
        };
        self.wait_for_entry(index, term, interruptor).await
    }

    /// Proposes a membership change via joint consensus: the joint config
    /// is appended and committed first, then the new simple config. Fails
    /// if a reconfiguration is already in progress.
    pub async fn propose_config_change_if_leader(
        &self,
        new_config: RaftConfig,
        interruptor: &Interruptor,
    ) -> Result<ProposeOutcome> {
        let (joint_index, term) = {
            let mut core = lock_interruptible(&self.shared.core, interruptor).await?;
            if !core.role.is_leader() {
                return Ok(ProposeOutcome::NotLeader(core.leader_hint));
            }
            if core.effective_config.is_joint() {
                return Ok(ProposeOutcome::Failed);
            }
            let term = core.persistent.current_term;
            let joint =
                ComplexConfig::joint(core.effective_config.config.clone(), new_config.clone());
            let index = core.persistent.log.append(LogEntry::config(term, joint));
            core.refresh_config();
            core.sync_peer_indices(self.shared.id);
            self.shared.persist(&core, interruptor).await?;
            core.leader_advance_commit(self.shared.id);
            self.shared.kick.notify_one();
            info!(member = %self.shared.id, term = %term, "proposed joint configuration");
            (index, term)
        };
        match self.wait_for_entry(joint_index, term, interruptor).await? {
            ProposeOutcome::Committed => {}
            other => return Ok(other),
        }

        let simple_index = {
            let mut core = lock_interruptible(&self.shared.core, interruptor).await?;
            if !core.role.is_leader() || core.persistent.current_term != term {
                return Ok(ProposeOutcome::Failed);
            }
            if core.effective_config.is_joint() {
                let index = core
                    .persistent
                    .log
                    .append(LogEntry::config(term, ComplexConfig::simple(new_config)));
                core.refresh_config();
                core.sync_peer_indices(self.shared.id);
                self.shared.persist(&core, interruptor).await?;
                core.leader_advance_commit(self.shared.id);
                self.shared.kick.notify_one();
                info!(member = %self.shared.id, term = %term, "proposed final configuration");
                index
            } else {
                // The replication loop already appended the final config
                // after seeing the joint entry commit; wait on that one.
                core.persistent.latest_config_index().unwrap_or(joint_index)
            }
        };
        self.wait_for_entry(simple_index, term, interruptor).await
    }

    /// RequestVote receiver.
    pub async fn on_request_vote(
        &self,
        request: RequestVoteRequest,
        interruptor: &Interruptor,
    ) -> Result<RequestVoteReply> {
        let mut core = lock_interruptible(&self.shared.core, interruptor).await?;
        let mut dirty = false;
        if request.term > core.persistent.current_term {
            core.step_down(request.term);
            dirty = true;
        }

        let up_to_date = (request.last_log_term, request.last_log_index)
            >= (
                core.persistent.log.last_term(),
                core.persistent.log.last_index(),
            );
        let can_vote = core
            .persistent
            .voted_for
            .map_or(true, |v| v == request.candidate_id);
        let grant =
            request.term == core.persistent.current_term && can_vote && up_to_date;

        if grant {
            if core.persistent.voted_for.is_none() {
                core.persistent.voted_for = Some(request.candidate_id);
                dirty = true;
            }
            core.reset_election_timer(&self.shared.options);
            self.shared.kick.notify_one();
            debug!(member = %self.shared.id, candidate = %request.candidate_id,
                   term = %request.term, "granted vote");
        }
        if dirty {
            self.shared.persist(&core, interruptor).await?;
        }
        Ok(RequestVoteReply {
            term: core.persistent.current_term,
            vote_granted: grant,
        })
    }

    /// AppendEntries receiver. Idempotent under duplication: entries the
    /// log already holds are skipped, conflicting suffixes are deleted.
    pub async fn on_append_entries(
        &self,
        request: AppendEntriesRequest<S>,
        interruptor: &Interruptor,
    ) -> Result<AppendEntriesReply> {
        let mut core = lock_interruptible(&self.shared.core, interruptor).await?;
        if request.term < core.persistent.current_term {
            return Ok(AppendEntriesReply {
                term: core.persistent.current_term,
                success: false,
            });
        }
        let mut dirty = request.term > core.persistent.current_term;
        core.step_down(request.term);
        core.leader_hint = Some(request.leader_id);
        core.reset_election_timer(&self.shared.options);
        self.shared.kick.notify_one();

        // Consistency check at the anchor. An anchor inside our snapshot is
        // committed history and cannot conflict.
        let anchor = request.log.prev_index();
        let consistent = anchor < core.persistent.log.prev_index()
            || core.persistent.log.term_of(anchor) == Some(request.log.prev_term());
        if !consistent {
            if dirty {
                self.shared.persist(&core, interruptor).await?;
            }
            return Ok(AppendEntriesReply {
                term: core.persistent.current_term,
                success: false,
            });
        }

        let mut config_touched = false;
        for (index, entry) in request.log.entries() {
            if index <= core.persistent.log.prev_index() {
                continue;
            }
            match core.persistent.log.term_of(index) {
                Some(t) if t == entry.term => continue,
                Some(_) => {
                    // Conflicting suffix; it cannot contain committed entries.
                    debug_assert!(index > core.commit_index);
                    core.persistent.log.truncate_from(index);
                    core.persistent.log.append(entry.clone());
                    dirty = true;
                    config_touched = true;
                }
                None => {
                    core.persistent.log.append(entry.clone());
                    dirty = true;
                    if matches!(entry.payload, EntryPayload::Config(_)) {
                        config_touched = true;
                    }
                }
            }
        }
        if config_touched {
            core.refresh_config();
        }
        if dirty {
            self.shared.persist(&core, interruptor).await?;
        }
        core.advance_commit_to(request.leader_commit.min(request.log.last_index()));
        self.shared.maybe_compact(&mut core).await;
        Ok(AppendEntriesReply {
            term: core.persistent.current_term,
            success: true,
        })
    }

    /// InstallSnapshot receiver. Replaces the snapshotted prefix when the
    /// offered snapshot is newer than ours; a matching retained suffix is
    /// kept, anything conflicting is dropped.
    pub async fn on_install_snapshot(
        &self,
        request: InstallSnapshotRequest<S>,
        interruptor: &Interruptor,
    ) -> Result<InstallSnapshotReply> {
        let mut core = lock_interruptible(&self.shared.core, interruptor).await?;
        if request.term < core.persistent.current_term {
            return Ok(InstallSnapshotReply {
                term: core.persistent.current_term,
            });
        }
        core.step_down(request.term);
        core.leader_hint = Some(request.leader_id);
        core.reset_election_timer(&self.shared.options);
        self.shared.kick.notify_one();

        if request.last_included_index > core.persistent.log.prev_index() {
            let keep_suffix = core.persistent.log.term_of(request.last_included_index)
                == Some(request.last_included_term);
            if keep_suffix {
                core.persistent
                    .log
                    .discard_through(request.last_included_index, request.last_included_term);
            } else {
                core.persistent
                    .log
                    .reset_to_snapshot(request.last_included_index, request.last_included_term);
            }
            core.persistent.snapshot_state = request.snapshot_state;
            core.persistent.snapshot_config = request.snapshot_config;
            core.refresh_config();

            if core.last_applied < request.last_included_index {
                core.adapter
                    .install(core.persistent.snapshot_state.clone());
                core.last_applied = request.last_included_index;
            }
            if core.commit_index < request.last_included_index {
                core.commit_index = request.last_included_index;
                let _ = core.commit_tx.send_replace(core.commit_index.get());
            }
            self.shared.persist(&core, interruptor).await?;
            info!(member = %self.shared.id, from = %request.leader_id,
                  through = %request.last_included_index, "installed snapshot");
        }
        Ok(InstallSnapshotReply {
            term: core.persistent.current_term,
        })
    }

    /// Fires the member's interruptor and stops its driver. In-flight
    /// operations observe the interruption promptly.
    pub async fn shutdown(&self) {
        self.latch.fire();
        self.driver.abort();
    }

    async fn wait_for_entry(
        &self,
        index: LogIndex,
        term: Term,
        interruptor: &Interruptor,
    ) -> Result<ProposeOutcome> {
        let mut commit_rx = self.commit_rx.clone();
        let mut role_rx = self.role_rx.clone();
        loop {
            {
                let core = lock_interruptible(&self.shared.core, interruptor).await?;
                if core.persistent.current_term != term || !core.role.is_leader() {
                    return Ok(ProposeOutcome::Failed);
                }
                if core.commit_index >= index {
                    return Ok(ProposeOutcome::Committed);
                }
            }
            tokio::select! {
                changed = commit_rx.changed() => {
                    if changed.is_err() {
                        return Err(RaftError::Interrupted);
                    }
                }
                changed = role_rx.wait_for(|(t, role)| *t != term || !role.is_leader()) => {
                    if changed.is_err() {
                        return Err(RaftError::Interrupted);
                    }
                }
                _ = interruptor.fired() => return Err(RaftError::Interrupted),
            }
        }
    }
}

impl<S: ReplicatedState> Drop for RaftMember<S> {
    fn drop(&mut self) {
        self.latch.fire();
        self.driver.abort();
    }
}

impl<S: ReplicatedState> Shared<S> {
    async fn persist(&self, core: &MemberCore<S>, interruptor: &Interruptor) -> Result<()> {
        self.capability
            .write_persistent_state(&core.persistent, interruptor)
            .await
    }

    /// Compacts the log prefix into a snapshot once enough applied entries
    /// have accumulated. Failure to persist leaves the previous state on
    /// disk, which is still a complete valid state.
    async fn maybe_compact(&self, core: &mut MemberCore<S>) {
        if core.persistent.log.len() <= self.options.snapshot_threshold {
            return;
        }
        let through = core.last_applied;
        if through <= core.persistent.log.prev_index() {
            return;
        }
        let term = core
            .persistent
            .log
            .term_of(through)
            .expect("applied entry missing from log");
        core.persistent.snapshot_config = core.persistent.config_at(through);
        core.persistent.snapshot_state = core.adapter.current();
        core.persistent.log.discard_through(through, term);
        match self.persist(core, &self.interruptor).await {
            Ok(()) => {
                debug!(member = %self.id, through = %through, "compacted log into snapshot")
            }
            Err(err) => warn!(member = %self.id, %err, "snapshot persist failed"),
        }
    }
}

impl<S: ReplicatedState> MemberCore<S> {
    fn reset_election_timer(&mut self, options: &RaftOptions) {
        self.election_deadline = Instant::now() + options.election_timeout();
    }

    fn refresh_config(&mut self) {
        self.effective_config = self.persistent.latest_config();
    }

    fn publish_role(&self) {
        let _ = self
            .role_tx
            .send_replace((self.persistent.current_term, self.role));
    }

    /// Reverts to follower. A higher term wipes the vote; an equal term
    /// only demotes the role.
    fn step_down(&mut self, term: Term) {
        debug_assert!(term >= self.persistent.current_term);
        if term > self.persistent.current_term {
            self.persistent.current_term = term;
            self.persistent.voted_for = None;
            self.leader_hint = None;
        }
        self.role = Role::Follower;
        self.votes.clear();
        self.next_index.clear();
        self.match_index.clear();
        self.publish_role();
    }

    fn become_leader(&mut self, self_id: MemberId) {
        info!(member = %self_id, term = %self.persistent.current_term, "won election");
        self.role = Role::Leader;
        self.leader_hint = Some(self_id);
        self.leadership_history
            .insert(self.persistent.current_term, self_id);
        self.persistent
            .log
            .append(LogEntry::noop(self.persistent.current_term));
        self.next_index.clear();
        self.match_index.clear();
        self.sync_peer_indices(self_id);
        self.publish_role();
    }

    /// Reconciles per-peer bookkeeping with the effective configuration.
    fn sync_peer_indices(&mut self, self_id: MemberId) {
        let members = self.effective_config.members();
        let next_default = self.persistent.log.last_index().next();
        self.next_index.retain(|peer, _| members.contains(peer));
        self.match_index.retain(|peer, _| members.contains(peer));
        for peer in members {
            if peer == self_id {
                continue;
            }
            self.next_index.entry(peer).or_insert(next_default);
            self.match_index.entry(peer).or_insert(LogIndex::ZERO);
        }
    }

    /// Raises the commit index and applies newly committed entries, in log
    /// order, to the state machine. The commit index never moves backward.
    fn advance_commit_to(&mut self, index: LogIndex) {
        if index <= self.commit_index {
            return;
        }
        debug_assert!(index <= self.persistent.log.last_index());
        self.commit_index = index;
        while self.last_applied < self.commit_index {
            let i = self.last_applied.next();
            let entry = self
                .persistent
                .log
                .entry(i)
                .expect("committed entry missing from log");
            if let EntryPayload::Change(change) = &entry.payload {
                self.adapter.apply(change);
            }
            self.last_applied = i;
        }
        let _ = self.commit_tx.send_replace(self.commit_index.get());
    }

    /// Leader commit rule: the highest index replicated on a quorum of the
    /// effective configuration whose entry carries the current term.
    /// Earlier entries commit transitively.
    fn leader_advance_commit(&mut self, self_id: MemberId) {
        let mut n = self.persistent.log.last_index();
        while n > self.commit_index {
            if self.persistent.log.term_of(n) == Some(self.persistent.current_term) {
                let mut acks: BTreeSet<MemberId> = [self_id].into_iter().collect();
                for (peer, matched) in &self.match_index {
                    if *matched >= n {
                        acks.insert(*peer);
                    }
                }
                if self.effective_config.is_quorum(&acks) {
                    self.advance_commit_to(n);
                    return;
                }
            }
            n = n.saturating_prev();
        }
    }
}

async fn lock_interruptible<'a, S: ReplicatedState>(
    core: &'a Mutex<MemberCore<S>>,
    interruptor: &Interruptor,
) -> Result<MutexGuard<'a, MemberCore<S>>> {
    tokio::select! {
        guard = core.lock() => Ok(guard),
        _ = interruptor.fired() => Err(RaftError::Interrupted),
    }
}

enum Step {
    AwaitElection(Instant),
    Replicate,
}

/// The per-member background loop: election timer while follower or
/// candidate, heartbeat/replication rounds while leader. Kicked early
/// through `Shared::kick` whenever there is new work.
async fn drive<S: ReplicatedState>(shared: Arc<Shared<S>>) {
    let interruptor = shared.interruptor.clone();
    loop {
        if interruptor.is_fired() {
            return;
        }
        let step = {
            let core = shared.core.lock().await;
            match core.role {
                Role::Leader => Step::Replicate,
                _ => Step::AwaitElection(core.election_deadline),
            }
        };
        match step {
            Step::AwaitElection(deadline) => {
                if Instant::now() >= deadline {
                    run_election(&shared, &interruptor).await;
                } else {
                    tokio::select! {
                        _ = sleep_until(deadline) => {}
                        _ = shared.kick.notified() => {}
                        _ = interruptor.fired() => return,
                    }
                }
            }
            Step::Replicate => {
                replication_round(&shared, &interruptor).await;
                tokio::select! {
                    _ = sleep(shared.options.heartbeat_interval()) => {}
                    _ = shared.kick.notified() => {}
                    _ = interruptor.fired() => return,
                }
            }
        }
    }
}

async fn run_election<S: ReplicatedState>(shared: &Arc<Shared<S>>, interruptor: &Interruptor) {
    let (request, peers) = {
        let mut core = shared.core.lock().await;
        if core.role.is_leader() || Instant::now() < core.election_deadline {
            return;
        }
        let config = core.effective_config.clone();
        if !config.is_voter(&shared.id) {
            // A non-voter (blank joiner, or member removed by a config
            // change) never campaigns.
            core.reset_election_timer(&shared.options);
            return;
        }
        let mut connected: BTreeSet<MemberId> =
            shared.capability.connected_members().borrow().clone();
        connected.insert(shared.id);
        if !config.is_quorum(&connected) {
            // Cannot see a quorum; campaigning would only burn terms.
            core.reset_election_timer(&shared.options);
            return;
        }

        let term = core.persistent.current_term.next();
        core.persistent.current_term = term;
        core.persistent.voted_for = Some(shared.id);
        core.role = Role::Candidate;
        core.votes = [shared.id].into_iter().collect();
        core.leader_hint = None;
        core.publish_role();
        core.reset_election_timer(&shared.options);
        if let Err(err) = shared.persist(&core, interruptor).await {
            warn!(member = %shared.id, %err, "could not persist candidacy");
            return;
        }
        debug!(member = %shared.id, term = %term, "election started");

        if core.effective_config.is_quorum(&core.votes) {
            // Single-voter configuration: won on the spot.
            core.become_leader(shared.id);
            if let Err(err) = shared.persist(&core, interruptor).await {
                warn!(member = %shared.id, %err, "could not persist leadership no-op");
            }
            shared.kick.notify_one();
            return;
        }

        let request = RequestVoteRequest {
            term,
            candidate_id: shared.id,
            last_log_index: core.persistent.log.last_index(),
            last_log_term: core.persistent.log.last_term(),
        };
        let peers: Vec<MemberId> = config
            .voters()
            .into_iter()
            .filter(|p| *p != shared.id)
            .collect();
        (request, peers)
    };

    let mut rpcs = JoinSet::new();
    for peer in peers {
        let capability = shared.capability.clone();
        let request = request.clone();
        let interruptor = interruptor.clone();
        rpcs.spawn(async move {
            let reply = capability
                .send_request_vote(peer, request, &interruptor)
                .await;
            (peer, reply)
        });
    }

    while let Some(joined) = rpcs.join_next().await {
        let Ok((peer, outcome)) = joined else { continue };
        if interruptor.is_fired() {
            return;
        }
        // A failed RPC carries no information; the next timeout retries.
        let Ok(reply) = outcome else { continue };

        let mut core = shared.core.lock().await;
        if reply.term > core.persistent.current_term {
            core.step_down(reply.term);
            if let Err(err) = shared.persist(&core, interruptor).await {
                warn!(member = %shared.id, %err, "could not persist term update");
            }
            return;
        }
        if core.role != Role::Candidate || reply.term != core.persistent.current_term {
            return;
        }
        if reply.vote_granted {
            core.votes.insert(peer);
            if core.effective_config.is_quorum(&core.votes) {
                core.become_leader(shared.id);
                if let Err(err) = shared.persist(&core, interruptor).await {
                    warn!(member = %shared.id, %err, "could not persist leadership no-op");
                }
                shared.kick.notify_one();
                return;
            }
        }
    }
}

/// One fan-out of AppendEntries (or InstallSnapshot, for peers whose next
/// entry has been compacted away) to every peer in the effective
/// configuration, integrating replies as they arrive.
async fn replication_round<S: ReplicatedState>(shared: &Arc<Shared<S>>, interruptor: &Interruptor) {
    enum Plan<S: ReplicatedState> {
        Append(AppendEntriesRequest<S>),
        Snapshot(InstallSnapshotRequest<S>),
    }

    let (term, plans) = {
        let mut core = shared.core.lock().await;
        if !core.role.is_leader() {
            return;
        }
        core.sync_peer_indices(shared.id);
        core.leader_advance_commit(shared.id);
        shared.maybe_compact(&mut core).await;

        // Leader-driven completion of a committed joint configuration: once
        // the joint entry commits, append the final simple config. This runs
        // on whichever leader observes the committed joint entry, so a
        // reconfiguration survives leader changes mid-transition.
        // A config no longer in the retained log lives in the snapshot,
        // which only ever holds committed entries.
        let config_committed = core
            .persistent
            .latest_config_index()
            .map_or(true, |index| core.commit_index >= index);
        if core.effective_config.is_joint() && config_committed {
            let new_config = core
                .effective_config
                .new_config
                .clone()
                .expect("joint config has a new half");
            let term = core.persistent.current_term;
            core.persistent
                .log
                .append(LogEntry::config(term, ComplexConfig::simple(new_config)));
            core.refresh_config();
            core.sync_peer_indices(shared.id);
            if let Err(err) = shared.persist(&core, interruptor).await {
                warn!(member = %shared.id, %err, "could not persist final configuration");
            } else {
                info!(member = %shared.id, term = %term, "completed joint configuration");
            }
        }

        // A leader voted out by a committed configuration steps down.
        let config_committed = core
            .persistent
            .latest_config_index()
            .map_or(true, |index| core.commit_index >= index);
        if !core.effective_config.is_voter(&shared.id) && config_committed {
            info!(member = %shared.id, "removed from configuration, stepping down");
            let current_term = core.persistent.current_term;
            core.step_down(current_term);
            return;
        }

        let term = core.persistent.current_term;
        let mut plans = Vec::new();
        for peer in core.effective_config.members() {
            if peer == shared.id {
                continue;
            }
            let next = core
                .next_index
                .get(&peer)
                .copied()
                .unwrap_or_else(|| core.persistent.log.last_index().next());
            let plan = if next <= core.persistent.log.prev_index() {
                // acked = snapshot point
                let acked = core.persistent.log.prev_index();
                (
                    peer,
                    acked,
                    Plan::Snapshot(InstallSnapshotRequest {
                        term,
                        leader_id: shared.id,
                        last_included_index: core.persistent.log.prev_index(),
                        last_included_term: core.persistent.log.prev_term(),
                        snapshot_state: core.persistent.snapshot_state.clone(),
                        snapshot_config: core.persistent.snapshot_config.clone(),
                    }),
                )
            } else {
                let window = core.persistent.log.suffix(next);
                let acked = window.last_index();
                (
                    peer,
                    acked,
                    Plan::Append(AppendEntriesRequest {
                        term,
                        leader_id: shared.id,
                        log: window,
                        leader_commit: core.commit_index,
                    }),
                )
            };
            plans.push(plan);
        }
        (term, plans)
    };

    let mut rpcs = JoinSet::new();
    for (peer, acked, plan) in plans {
        let capability = shared.capability.clone();
        let interruptor = interruptor.clone();
        rpcs.spawn(async move {
            let outcome = match plan {
                Plan::Append(request) => capability
                    .send_append_entries(peer, request, &interruptor)
                    .await
                    .map(RpcReply::Append),
                Plan::Snapshot(request) => capability
                    .send_install_snapshot(peer, request, &interruptor)
                    .await
                    .map(RpcReply::Snapshot),
            };
            (peer, acked, outcome)
        });
    }

    while let Some(joined) = rpcs.join_next().await {
        let Ok((peer, acked, outcome)) = joined else {
            continue;
        };
        if interruptor.is_fired() {
            return;
        }
        let Ok(reply) = outcome else { continue };

        let mut core = shared.core.lock().await;
        if !core.role.is_leader() || core.persistent.current_term != term {
            return;
        }
        if reply.term() > core.persistent.current_term {
            core.step_down(reply.term());
            if let Err(err) = shared.persist(&core, interruptor).await {
                warn!(member = %shared.id, %err, "could not persist term update");
            }
            return;
        }
        match reply {
            RpcReply::Append(AppendEntriesReply { success: true, .. })
            | RpcReply::Snapshot(InstallSnapshotReply { .. }) => {
                let matched = core.match_index.entry(peer).or_insert(LogIndex::ZERO);
                if acked > *matched {
                    *matched = acked;
                }
                core.next_index.insert(peer, acked.next());
                core.leader_advance_commit(shared.id);
            }
            RpcReply::Append(AppendEntriesReply { success: false, .. }) => {
                // Log mismatch: walk next_index back and retry next round.
                if let Some(next) = core.next_index.get_mut(&peer) {
                    if *next > LogIndex::new(1) {
                        *next = next.saturating_prev();
                    }
                }
            }
            RpcReply::Vote(_) => unreachable!("vote reply in replication round"),
        }
    }
}
