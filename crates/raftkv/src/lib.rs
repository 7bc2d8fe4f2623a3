//! A node of a raft-replicated key/value store.
//!
//! Writes are encoded as [`Transaction`]s, replicated through openraft and
//! applied to every replica's in-memory [`Store`](raftkv_store::Store) in
//! log order. Reads are served from the local replica.

mod config;
mod error;
mod membership;
mod node;

#[cfg(feature = "testing")]
pub mod testing;

pub use config::KvConfig;
pub use error::{ForwardToLeader, KvError, KvResult, WriteError};
pub use node::KvNode;

pub use raftkv_store::{
    ApplyOutcome, Command, LogEntry, NodeId, Op, StoreConfig, Transaction, TypeConfig,
};
