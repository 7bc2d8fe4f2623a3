use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use openraft::storage::{RaftStateMachine, Snapshot};
use openraft::{
    BasicNode, Entry, EntryPayload, LogId, OptionalSend, RaftSnapshotBuilder, SnapshotMeta,
    StorageError, StorageIOError, StoredMembership,
};
use parking_lot::Mutex;

use crate::fsm::{ApplyOutcome, Fsm, MemorySink};
use crate::store::{Store, StoreConfig};
use crate::{NodeId, TypeConfig};

#[derive(Debug)]
pub struct StoredSnapshot {
    pub meta: SnapshotMeta<NodeId, BasicNode>,

    /// Serialized store contents at the time of this snapshot.
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct AppliedState {
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
}

/// Cheaply clonable handle; openraft takes the state machine and its
/// snapshot builder by value.
#[derive(Clone, Debug, derive_more::Deref, derive_more::From)]
pub struct ArcStateMachineStore(Arc<StateMachineStore>);

/// Raft-facing wrapper around the [`Fsm`]: tracks the last applied log id
/// and membership, and keeps the most recent snapshot around for followers
/// that need it.
#[derive(Debug)]
pub struct StateMachineStore {
    fsm: Fsm,

    /// Held for the whole of every apply batch, restore and snapshot
    /// capture, so the recorded log id always matches the store contents.
    applied: Mutex<AppliedState>,

    snapshot_idx: AtomicU64,

    /// The last built or received snapshot.
    current_snapshot: Mutex<Option<StoredSnapshot>>,
}

impl StateMachineStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            fsm: Fsm::new(Store::new(config)),
            applied: Mutex::new(AppliedState::default()),
            snapshot_idx: AtomicU64::new(0),
            current_snapshot: Mutex::new(None),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.fsm.get(key)
    }

    pub fn last_applied(&self) -> Option<LogId<NodeId>> {
        self.applied.lock().last_applied
    }
}

impl ArcStateMachineStore {
    pub fn new(config: StoreConfig) -> Self {
        Self(Arc::new(StateMachineStore::new(config)))
    }
}

impl RaftSnapshotBuilder<TypeConfig> for ArcStateMachineStore {
    #[tracing::instrument(level = "trace", skip(self))]
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let (snapshot, last_applied_log, last_membership) = {
            let applied = self.applied.lock();
            let snapshot = self
                .fsm
                .snapshot()
                .map_err(|e| StorageIOError::read_state_machine(&e))?;
            (
                snapshot,
                applied.last_applied,
                applied.last_membership.clone(),
            )
        };

        let snapshot_idx = self.snapshot_idx.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot_id = if let Some(last) = last_applied_log {
            format!("{}-{}-{}", last.leader_id, last.index, snapshot_idx)
        } else {
            format!("--{}", snapshot_idx)
        };

        let meta = SnapshotMeta {
            last_log_id: last_applied_log,
            last_membership,
            snapshot_id,
        };

        let mut sink = MemorySink::new(meta.snapshot_id.clone());
        snapshot
            .persist(&mut sink)
            .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), &e))?;
        snapshot.release();
        let data = sink
            .into_bytes()
            .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), &e))?;

        tracing::debug!(snapshot_id = %meta.snapshot_id, size = data.len(), "built snapshot");

        *self.current_snapshot.lock() = Some(StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        });

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for ArcStateMachineStore {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>>
    {
        let applied = self.applied.lock();
        Ok((applied.last_applied, applied.last_membership.clone()))
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn apply<I>(&mut self, entries: I) -> Result<Vec<ApplyOutcome>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut res = Vec::new(); //No `with_capacity`; do not know `len` of iterator

        let mut applied = self.applied.lock();

        for entry in entries {
            tracing::debug!(%entry.log_id, "replicate to sm");

            applied.last_applied = Some(entry.log_id);

            let outcome = match entry.payload {
                EntryPayload::Blank => ApplyOutcome::Internal,
                EntryPayload::Normal(data) => self.fsm.apply(&data),
                EntryPayload::Membership(membership) => {
                    applied.last_membership =
                        StoredMembership::new(Some(entry.log_id), membership);
                    ApplyOutcome::Internal
                }
            };
            res.push(outcome);
        }
        Ok(res)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    #[tracing::instrument(level = "trace", skip(self, snapshot))]
    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        tracing::info!(
            snapshot_id = %meta.snapshot_id,
            size = snapshot.get_ref().len(),
            "install snapshot"
        );

        let new_snapshot = StoredSnapshot {
            meta: meta.clone(),
            data: snapshot.into_inner(),
        };

        {
            let mut applied = self.applied.lock();
            self.fsm
                .restore(new_snapshot.data.as_slice())
                .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &e))?;
            applied.last_applied = meta.last_log_id;
            applied.last_membership = meta.last_membership.clone();
        }

        *self.current_snapshot.lock() = Some(new_snapshot);
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        match &*self.current_snapshot.lock() {
            Some(snapshot) => Ok(Some(Snapshot {
                meta: snapshot.meta.clone(),
                snapshot: Box::new(Cursor::new(snapshot.data.clone())),
            })),
            None => Ok(None),
        }
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }
}
