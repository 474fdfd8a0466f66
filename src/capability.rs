use crate::error::Result;
use crate::interrupt::Interruptor;
use crate::message::{
    AppendEntriesReply, AppendEntriesRequest, InstallSnapshotReply, InstallSnapshotRequest,
    RequestVoteReply, RequestVoteRequest,
};
use crate::state_machine::ReplicatedState;
use crate::types::{MemberId, PersistentState};
use async_trait::async_trait;
use std::collections::BTreeSet;
use tokio::sync::watch;

/// Everything a member needs from its environment: three RPC senders, a
/// persistent-state writer, and a connectivity watchable.
///
/// Any RPC send is free to fail; the member treats a failure as "no
/// information" and retries later. Receivers must be idempotent, since a
/// sender that saw a failure may retry a call that was in fact delivered.
///
/// `write_persistent_state` may suspend. If interrupted, the state may or
/// may not have been written, but it is never partially written.
#[async_trait]
pub trait RaftCapability<S: ReplicatedState>: Send + Sync {
    async fn send_request_vote(
        &self,
        dest: MemberId,
        request: RequestVoteRequest,
        interruptor: &Interruptor,
    ) -> Result<RequestVoteReply>;

    async fn send_append_entries(
        &self,
        dest: MemberId,
        request: AppendEntriesRequest<S>,
        interruptor: &Interruptor,
    ) -> Result<AppendEntriesReply>;

    async fn send_install_snapshot(
        &self,
        dest: MemberId,
        request: InstallSnapshotRequest<S>,
        interruptor: &Interruptor,
    ) -> Result<InstallSnapshotReply>;

    async fn write_persistent_state(
        &self,
        state: &PersistentState<S>,
        interruptor: &Interruptor,
    ) -> Result<()>;

    /// The set of peers currently believed reachable. Updates are
    /// edge-triggered through the watch channel.
    fn connected_members(&self) -> watch::Receiver<BTreeSet<MemberId>>;
}
