//! A Raft-based replicated state machine core.
//!
//! A set of cooperating [`member::RaftMember`]s agrees on a totally-ordered
//! log of application-defined changes and applies them deterministically to
//! an application-defined [`state_machine::ReplicatedState`], tolerating
//! message loss, reordering, process death, and partitions. Members reach
//! their environment only through the [`capability::RaftCapability`] trait;
//! the [`sim`] module supplies the in-memory implementation used to
//! validate the core under randomized schedules.

pub mod capability;
pub mod config;
pub mod error;
pub mod interrupt;
pub mod log;
pub mod member;
pub mod message;
pub mod sim;
pub mod state_machine;
pub mod storage;
pub mod types;

pub use capability::RaftCapability;
pub use config::RaftOptions;
pub use error::{ProposeOutcome, RaftError};
pub use interrupt::{DrainGuard, DrainLatch, Interruptor, Trigger};
pub use log::RaftLog;
pub use member::{check_invariants, MemberStatus, RaftMember, Role};
pub use message::*;
pub use sim::{Liveness, RaftCluster, RecordedChanges, TrafficGenerator};
pub use state_machine::{ReplicatedState, StateAdapter, StateWatcher};
pub use storage::{FileStore, InMemoryStore, PersistentStore};
pub use types::*;
