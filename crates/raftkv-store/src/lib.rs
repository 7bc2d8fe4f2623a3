//! In-memory key/value store, the deterministic state machine that applies
//! replicated transactions to it, and the storage layer openraft drives.
//!
//! Replicas that apply the same committed entries in the same order end up
//! with identical contents; expiry is the only time-dependent behavior and
//! is evaluated against each replica's local clock.

mod command;
mod fsm;
mod log_store;
mod state_machine;
mod store;

pub use command::{Command, LogEntry, Op, Transaction};
pub use fsm::{ApplyOutcome, Fsm, FsmError, FsmSnapshot, MemorySink, SinkState, SnapshotSink};
pub use log_store::LogStore;
pub use state_machine::{ArcStateMachineStore, StateMachineStore, StoredSnapshot};
pub use store::{Store, StoreConfig, StoreWriter, DEFAULT_SWEEP_INTERVAL};

use std::io::Cursor;

pub type NodeId = u64;

openraft::declare_raft_types!(
    /// Raft type configuration for the replicated store: entries carry an
    /// encoded [`Transaction`] and applying one yields an [`ApplyOutcome`].
    pub TypeConfig:
        D = LogEntry,
        R = ApplyOutcome,
);
