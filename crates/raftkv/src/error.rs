use std::time::Duration;

use openraft::error::{ClientWriteError, Fatal, InitializeError, RaftError};
use openraft::{BasicNode, ConfigError};
use raftkv_store::NodeId;

pub type ForwardToLeader = openraft::error::ForwardToLeader<NodeId, BasicNode>;
pub type WriteError = RaftError<NodeId, ClientWriteError<NodeId, BasicNode>>;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// Attempted to write through a non-leader.
    /// The write should succeed against the node named in the hint.
    #[error("{0}")]
    NotLeader(ForwardToLeader),

    #[error("failed to encode transaction: {0}")]
    Encode(#[from] serde_json::Error),

    /// The write was not applied in time. It may still be applied later.
    #[error("write was not applied within {0:?}")]
    Timeout(Duration),

    #[error("write rejected: {0}")]
    Write(WriteError),

    /// A membership change failed; the error from raft is passed through
    /// as is.
    #[error("membership change failed: {0}")]
    Membership(WriteError),

    #[error("failed to initialize cluster: {0}")]
    Initialize(#[from] RaftError<NodeId, InitializeError<NodeId, BasicNode>>),

    #[error("invalid raft config: {0}")]
    Config(#[from] ConfigError),

    /// Something unrecoverable happened inside raft.
    /// Retrying is not likely to succeed.
    #[error(transparent)]
    Fatal(#[from] Fatal<NodeId>),
}

impl From<WriteError> for KvError {
    fn from(e: WriteError) -> Self {
        match e {
            RaftError::APIError(ClientWriteError::ForwardToLeader(fwd)) => Self::NotLeader(fwd),
            e => Self::Write(e),
        }
    }
}

impl KvError {
    /// The leader to retry against, if this is a [`KvError::NotLeader`] and
    /// the leader is known.
    pub fn leader_hint(&self) -> Option<NodeId> {
        match self {
            Self::NotLeader(fwd) => fwd.leader_id,
            _ => None,
        }
    }
}

pub type KvResult<T> = Result<T, KvError>;
