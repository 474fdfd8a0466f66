//! In-process simulation harness.
//!
//! Hosts a set of members behind a single in-memory capability that routes
//! RPCs between them, randomly yielding and sleeping around every delivery
//! to exercise unusual interleavings. Each member is alive (participating),
//! isolated (running but unreachable), or dead (only its persistent state
//! remains), and a background task cross-checks the safety invariants of
//! every live member every 100ms.

mod traffic;

pub use traffic::TrafficGenerator;

use crate::capability::RaftCapability;
use crate::config::RaftOptions;
use crate::error::{ProposeOutcome, RaftError, Result};
use crate::interrupt::{DrainLatch, Interruptor};
use crate::member::{check_invariants, MemberStatus, RaftMember};
use crate::message::{
    AppendEntriesReply, AppendEntriesRequest, InstallSnapshotReply, InstallSnapshotRequest,
    RequestVoteReply, RequestVoteRequest, RpcReply, RpcRequest,
};
use crate::state_machine::{ReplicatedState, StateWatcher};
use crate::storage::{InMemoryStore, PersistentStore};
use crate::types::{MemberId, PersistentState, RaftConfig, Term};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock as StdRwLock, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// The harness's state machine: an append-only record of change ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordedChanges {
    pub changes: Vec<Uuid>,
}

impl ReplicatedState for RecordedChanges {
    type Change = Uuid;

    fn apply_change(&mut self, change: &Uuid) {
        self.changes.push(*change);
    }
}

/// Liveness of a member slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Running and reachable; participates in the connectivity watchable.
    Alive,
    /// Running and ticking timers, but every RPC to or from it fails.
    Isolated,
    /// Not running; only the stored persistent state remains.
    Dead,
}

/// A cluster of in-process members with controllable liveness.
pub struct RaftCluster<S: ReplicatedState> {
    shared: Arc<ClusterShared<S>>,
    checker: JoinHandle<()>,
}

pub(crate) struct ClusterShared<S: ReplicatedState> {
    options: RaftOptions,
    // Slots are only ever inserted; the per-slot rwlock governs the member
    // within.
    slots: StdRwLock<BTreeMap<MemberId, Arc<MemberSlot<S>>>>,
    alive: watch::Sender<BTreeSet<MemberId>>,
}

struct MemberSlot<S: ReplicatedState> {
    // Read to dispatch into the member, write to create or destroy it.
    lock: RwLock<SlotState<S>>,
    // The slot's "disk"; written through the capability, read to
    // reconstruct the member after death.
    disk: Mutex<InMemoryStore<S>>,
}

struct SlotState<S: ReplicatedState> {
    member: Option<Arc<RaftMember<S>>>,
    // Present while alive; incoming RPCs take a keepalive on it, and
    // leaving the alive state drains them.
    latch: Option<Arc<DrainLatch>>,
}

impl<S: ReplicatedState> RaftCluster<S> {
    /// Starts `num` alive members agreeing on `initial_state`, returning
    /// their ids.
    pub async fn new(
        num: usize,
        initial_state: S,
        options: RaftOptions,
    ) -> (Self, Vec<MemberId>)
    where
        S: PartialEq,
    {
        let (alive, _) = watch::channel(BTreeSet::new());
        let shared = Arc::new(ClusterShared {
            options,
            slots: StdRwLock::new(BTreeMap::new()),
            alive,
        });

        let ids: Vec<MemberId> = (0..num).map(|_| MemberId::random()).collect();
        let config = RaftConfig::with_voters(ids.iter().copied());
        for id in &ids {
            shared
                .add_member(
                    *id,
                    PersistentState::make_initial(initial_state.clone(), config.clone()),
                )
                .await;
        }

        let checker = tokio::spawn(invariant_check_loop(shared.clone()));
        (Self { shared, checker }, ids)
    }

    /// Adds a blank member awaiting an install-snapshot. The caller is
    /// responsible for committing a config change that includes it.
    pub async fn join(&self) -> MemberId
    where
        S: Default,
    {
        let id = MemberId::random();
        self.shared.add_member(id, PersistentState::make_join()).await;
        id
    }

    pub async fn set_live(&self, id: MemberId, liveness: Liveness) {
        self.shared.set_live(id, liveness).await;
    }

    pub fn member_ids(&self) -> Vec<MemberId> {
        self.shared.slots.read().unwrap().keys().copied().collect()
    }

    pub fn alive_ids(&self) -> Vec<MemberId> {
        self.shared.alive.borrow().iter().copied().collect()
    }

    pub async fn status_of(&self, id: MemberId) -> Option<MemberStatus> {
        let slot = self.shared.slot(&id)?;
        let member = slot.lock.read().await.member.clone()?;
        Some(member.status().await)
    }

    /// Watcher onto a live member's applied state.
    pub async fn state_watcher(&self, id: MemberId) -> Option<StateWatcher<S>> {
        let slot = self.shared.slot(&id)?;
        let member = slot.lock.read().await.member.clone()?;
        Some(member.state_machine())
    }

    /// The member currently acting as leader, preferring the highest term
    /// when a deposed leader has not yet noticed its demotion.
    pub async fn find_leader(&self) -> Option<MemberId> {
        let mut best: Option<(Term, MemberId)> = None;
        for id in self.alive_ids() {
            if let Some(status) = self.status_of(id).await {
                if status.role.is_leader() && best.map_or(true, |(term, _)| status.term > term) {
                    best = Some((status.term, id));
                }
            }
        }
        best.map(|(_, id)| id)
    }

    /// Mimics a client: picks any alive member, follows leader hints for
    /// at most two redirects, and proposes the change on whoever claims to
    /// be leader. Fire-and-forget; the result is discarded.
    pub async fn try_change(&self, change: S::Change) {
        self.shared.try_change(change).await;
    }

    /// Proposes a membership change through the current leader, returning
    /// whether it is known to have committed both phases.
    pub async fn try_config_change(&self, new_config: RaftConfig) -> bool {
        let Some((member, interruptor, _guard)) = self.shared.find_proposer().await else {
            return false;
        };
        matches!(
            member
                .propose_config_change_if_leader(new_config, &interruptor)
                .await,
            Ok(ProposeOutcome::Committed)
        )
    }

    /// Runs the cross-replica invariant check once, immediately.
    pub async fn check_invariants(&self)
    where
        S: PartialEq,
    {
        check_cluster_invariants(&self.shared).await;
    }

    /// Transitions every member to dead, draining in-flight work.
    pub async fn shutdown(&self) {
        self.checker.abort();
        for id in self.member_ids() {
            self.set_live(id, Liveness::Dead).await;
        }
    }
}

impl RaftCluster<RecordedChanges> {
    /// Blocks until some alive member has applied `change`. Call only
    /// while a majority stays alive for the duration.
    pub async fn wait_for_commit(&self, change: Uuid) {
        let alive = self.alive_ids();
        let chosen = *alive
            .choose(&mut rand::thread_rng())
            .expect("wait_for_commit needs a living member");
        let slot = self.shared.slot(&chosen).expect("slot vanished");
        let member = slot
            .lock
            .read()
            .await
            .member
            .clone()
            .expect("alive member has no instance");
        let mut watcher = member.state_machine();
        watcher
            .run_until_satisfied(
                |state| state.changes.contains(&change),
                &Interruptor::never(),
            )
            .await
            .expect("wait_for_commit interrupted");
    }
}

impl<S: ReplicatedState> Drop for RaftCluster<S> {
    fn drop(&mut self) {
        self.checker.abort();
    }
}

impl<S: ReplicatedState> ClusterShared<S> {
    fn slot(&self, id: &MemberId) -> Option<Arc<MemberSlot<S>>> {
        self.slots.read().unwrap().get(id).cloned()
    }

    async fn add_member(self: &Arc<Self>, id: MemberId, stored: PersistentState<S>) {
        let slot = Arc::new(MemberSlot {
            lock: RwLock::new(SlotState {
                member: None,
                latch: None,
            }),
            disk: Mutex::new(InMemoryStore::new(stored)),
        });
        self.slots.write().unwrap().insert(id, slot);
        self.set_live(id, Liveness::Alive).await;
    }

    async fn set_live(self: &Arc<Self>, id: MemberId, liveness: Liveness) {
        let slot = self.slot(&id).expect("unknown member id");

        // Leaving the alive state: unpublish, then drain in-flight calls.
        let latch = {
            let mut state = slot.lock.write().await;
            if liveness != Liveness::Alive {
                state.latch.take()
            } else {
                None
            }
        };
        if let Some(latch) = latch {
            self.alive.send_modify(|set| {
                set.remove(&id);
            });
            latch.drain().await;
        }

        let mut state = slot.lock.write().await;
        match liveness {
            Liveness::Dead => {
                if let Some(member) = state.member.take() {
                    member.shutdown().await;
                }
            }
            Liveness::Alive | Liveness::Isolated => {
                if state.member.is_none() {
                    let stored = slot
                        .disk
                        .lock()
                        .await
                        .load()
                        .expect("in-memory store cannot fail")
                        .expect("slot has no stored state");
                    let capability: Arc<dyn RaftCapability<S>> = Arc::new(SimCapability {
                        shared: Arc::downgrade(self),
                        origin: id,
                        alive_rx: self.alive.subscribe(),
                    });
                    state.member = Some(Arc::new(RaftMember::new(
                        id,
                        capability,
                        stored,
                        self.options.clone(),
                    )));
                }
            }
        }
        if liveness == Liveness::Alive && state.latch.is_none() {
            state.latch = Some(Arc::new(DrainLatch::new()));
            self.alive.send_modify(|set| {
                set.insert(id);
            });
        }
    }

    /// Walks leader hints from a random alive member to whoever claims
    /// leadership, returning it with a keepalive and its drain signal.
    async fn find_proposer(
        self: &Arc<Self>,
    ) -> Option<(Arc<RaftMember<S>>, Interruptor, crate::interrupt::DrainGuard)> {
        let alive: Vec<MemberId> = self.alive.borrow().iter().copied().collect();
        let mut target = *alive.choose(&mut rand::thread_rng())?;

        let mut redirects = 0;
        loop {
            let hint = {
                let slot = self.slot(&target)?;
                let state = slot.lock.read().await;
                let member = state.member.clone()?;
                drop(state);
                member.get_leader().await
            };
            match hint {
                None => return None,
                Some(hint) if hint == target => break,
                Some(hint) => {
                    if redirects == 2 {
                        return None;
                    }
                    redirects += 1;
                    target = hint;
                }
            }
        }

        let slot = self.slot(&target)?;
        let state = slot.lock.read().await;
        let member = state.member.clone()?;
        let latch = state.latch.clone()?;
        let guard = latch.acquire()?;
        Some((member, latch.interruptor(), guard))
    }

    pub(crate) async fn try_change(self: &Arc<Self>, change: S::Change) {
        let Some((member, interruptor, _guard)) = self.find_proposer().await else {
            return;
        };
        let _ = member.propose_change_if_leader(change, &interruptor).await;
    }

    /// Random yield and occasional random sleep around every simulated
    /// suspension point, to shake out ordering assumptions.
    async fn block(&self, interruptor: &Interruptor) -> Result<()> {
        let (yield_now, sleep_ms) = {
            let mut rng = rand::thread_rng();
            let yield_now = rng.gen_range(0..10) != 0;
            let sleep_ms = if rng.gen_range(0..10) == 0 {
                Some(rng.gen_range(0..30u64))
            } else {
                None
            };
            (yield_now, sleep_ms)
        };
        if yield_now {
            tokio::task::yield_now().await;
        }
        if let Some(ms) = sleep_ms {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                _ = interruptor.fired() => return Err(RaftError::Interrupted),
            }
        }
        interruptor.check()
    }

    async fn do_rpc(
        self: &Arc<Self>,
        origin: MemberId,
        dest: MemberId,
        request: RpcRequest<S>,
        interruptor: &Interruptor,
    ) -> Result<RpcReply> {
        // An isolated sender sees every destination as disconnected.
        if !self.alive.borrow().contains(&origin) {
            return Err(RaftError::Unreachable);
        }
        self.block(interruptor).await?;

        let slot = match self.slot(&dest) {
            Some(slot) => slot,
            None => return Err(RaftError::Unreachable),
        };
        let acquired = {
            let state = slot.lock.read().await;
            match (&state.member, &state.latch) {
                (Some(member), Some(latch)) => latch
                    .acquire()
                    .map(|guard| (member.clone(), latch.interruptor(), guard)),
                _ => None,
            }
        };
        let Some((member, dest_interruptor, _guard)) = acquired else {
            self.block(interruptor).await?;
            return Err(RaftError::Unreachable);
        };

        let reply = tokio::select! {
            reply = dispatch(&member, request, &dest_interruptor) => reply,
            _ = dest_interruptor.fired() => Err(RaftError::Interrupted),
        };
        self.block(&dest_interruptor).await?;
        reply
    }
}

async fn dispatch<S: ReplicatedState>(
    member: &RaftMember<S>,
    request: RpcRequest<S>,
    interruptor: &Interruptor,
) -> Result<RpcReply> {
    match request {
        RpcRequest::Vote(request) => member
            .on_request_vote(request, interruptor)
            .await
            .map(RpcReply::Vote),
        RpcRequest::Append(request) => member
            .on_append_entries(request, interruptor)
            .await
            .map(RpcReply::Append),
        RpcRequest::Snapshot(request) => member
            .on_install_snapshot(request, interruptor)
            .await
            .map(RpcReply::Snapshot),
    }
}

/// Per-member capability backed by the cluster. Holds only the member's id
/// and a weak backreference; a dead destination simply fails to resolve.
struct SimCapability<S: ReplicatedState> {
    shared: Weak<ClusterShared<S>>,
    origin: MemberId,
    alive_rx: watch::Receiver<BTreeSet<MemberId>>,
}

#[async_trait]
impl<S: ReplicatedState> RaftCapability<S> for SimCapability<S> {
    async fn send_request_vote(
        &self,
        dest: MemberId,
        request: RequestVoteRequest,
        interruptor: &Interruptor,
    ) -> Result<RequestVoteReply> {
        let shared = self.shared.upgrade().ok_or(RaftError::Unreachable)?;
        match shared
            .do_rpc(self.origin, dest, RpcRequest::Vote(request), interruptor)
            .await?
        {
            RpcReply::Vote(reply) => Ok(reply),
            _ => unreachable!("mismatched rpc reply"),
        }
    }

    async fn send_append_entries(
        &self,
        dest: MemberId,
        request: AppendEntriesRequest<S>,
        interruptor: &Interruptor,
    ) -> Result<AppendEntriesReply> {
        let shared = self.shared.upgrade().ok_or(RaftError::Unreachable)?;
        match shared
            .do_rpc(self.origin, dest, RpcRequest::Append(request), interruptor)
            .await?
        {
            RpcReply::Append(reply) => Ok(reply),
            _ => unreachable!("mismatched rpc reply"),
        }
    }

    async fn send_install_snapshot(
        &self,
        dest: MemberId,
        request: InstallSnapshotRequest<S>,
        interruptor: &Interruptor,
    ) -> Result<InstallSnapshotReply> {
        let shared = self.shared.upgrade().ok_or(RaftError::Unreachable)?;
        match shared
            .do_rpc(self.origin, dest, RpcRequest::Snapshot(request), interruptor)
            .await?
        {
            RpcReply::Snapshot(reply) => Ok(reply),
            _ => unreachable!("mismatched rpc reply"),
        }
    }

    async fn write_persistent_state(
        &self,
        state: &PersistentState<S>,
        interruptor: &Interruptor,
    ) -> Result<()> {
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| RaftError::Storage("cluster is gone".into()))?;
        shared.block(interruptor).await?;
        let slot = shared
            .slot(&self.origin)
            .ok_or_else(|| RaftError::Storage("slot is gone".into()))?;
        slot.disk
            .lock()
            .await
            .save(state)
            .map_err(|e| RaftError::Storage(e.to_string()))?;
        shared.block(interruptor).await?;
        Ok(())
    }

    fn connected_members(&self) -> watch::Receiver<BTreeSet<MemberId>> {
        self.alive_rx.clone()
    }
}

async fn invariant_check_loop<S: ReplicatedState + PartialEq>(shared: Arc<ClusterShared<S>>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        check_cluster_invariants(&shared).await;
    }
}

/// Read-locks every slot simultaneously and checks the cross-replica
/// invariants over all live members.
pub(crate) async fn check_cluster_invariants<S: ReplicatedState + PartialEq>(shared: &ClusterShared<S>) {
    let slots: Vec<Arc<MemberSlot<S>>> = shared.slots.read().unwrap().values().cloned().collect();
    let mut guards = Vec::with_capacity(slots.len());
    for slot in &slots {
        guards.push(slot.lock.read().await);
    }
    let members: Vec<Arc<RaftMember<S>>> = guards
        .iter()
        .filter_map(|state| state.member.clone())
        .collect();
    check_invariants(&members).await;
}
