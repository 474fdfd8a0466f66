use crate::error::{RaftError, Result};
use crate::interrupt::Interruptor;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use tokio::sync::watch;

/// The application state replicated by the cluster.
///
/// `apply_change` must be deterministic: applying the same sequence of
/// changes to equal states yields equal states on every replica.
pub trait ReplicatedState:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    type Change: Clone
        + fmt::Debug
        + PartialEq
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;

    fn apply_change(&mut self, change: &Self::Change);
}

/// Owner side of a replicated state machine.
///
/// The member applies committed entries through this adapter in strict log
/// order; every transition is published to subscribed [`StateWatcher`]s.
#[derive(Debug)]
pub struct StateAdapter<S: ReplicatedState> {
    tx: watch::Sender<S>,
}

impl<S: ReplicatedState> StateAdapter<S> {
    pub fn new(initial: S) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn apply(&self, change: &S::Change) {
        self.tx.send_modify(|state| state.apply_change(change));
    }

    /// Replaces the whole state, e.g. when installing a snapshot.
    pub fn install(&self, state: S) {
        self.tx.send_replace(state);
    }

    pub fn current(&self) -> S {
        self.tx.borrow().clone()
    }

    pub fn watcher(&self) -> StateWatcher<S> {
        StateWatcher {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read handle onto a member's applied state.
#[derive(Debug, Clone)]
pub struct StateWatcher<S: ReplicatedState> {
    rx: watch::Receiver<S>,
}

impl<S: ReplicatedState> StateWatcher<S> {
    pub fn current(&self) -> S {
        self.rx.borrow().clone()
    }

    /// Returns once the applied state satisfies `predicate`, or fails with
    /// `Interrupted`. Reads are linearised against applications: the
    /// predicate only ever observes states the member actually reached.
    pub async fn run_until_satisfied(
        &mut self,
        mut predicate: impl FnMut(&S) -> bool,
        interruptor: &Interruptor,
    ) -> Result<()> {
        tokio::select! {
            result = self.rx.wait_for(|state| predicate(state)) => {
                result.map(|_| ()).map_err(|_| RaftError::Interrupted)
            }
            _ = interruptor.fired() => Err(RaftError::Interrupted),
        }
    }
}
