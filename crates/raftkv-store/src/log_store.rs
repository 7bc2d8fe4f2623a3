use std::collections::BTreeMap;
use std::fmt::Debug;
use std::ops::RangeBounds;
use std::sync::Arc;

use openraft::storage::{LogFlushed, RaftLogStorage};
use openraft::{Entry, LogId, LogState, RaftLogReader, StorageError, Vote};
use parking_lot::Mutex;

use crate::{NodeId, TypeConfig};

/// In-memory raft log, vote and commit index.
///
/// Nothing here survives a restart; a restarted node catches up from its
/// peers through log replication or a snapshot.
#[derive(Clone, Debug, Default)]
pub struct LogStore {
    inner: Arc<Mutex<LogStoreInner>>,
}

#[derive(Debug, Default)]
struct LogStoreInner {
    last_purged_log_id: Option<LogId<NodeId>>,
    log: BTreeMap<u64, Entry<TypeConfig>>,
    committed: Option<LogId<NodeId>>,
    vote: Option<Vote<NodeId>>,
}

impl LogStoreInner {
    fn log_state(&self) -> LogState<TypeConfig> {
        let last_log_id = self
            .log
            .values()
            .next_back()
            .map(|e| e.log_id)
            .or(self.last_purged_log_id);

        LogState {
            last_purged_log_id: self.last_purged_log_id,
            last_log_id,
        }
    }

    fn append(&mut self, entries: impl IntoIterator<Item = Entry<TypeConfig>>) {
        for entry in entries {
            self.log.insert(entry.log_id.index, entry);
        }
    }

    /// Remove `log_id` and everything after it.
    fn truncate(&mut self, log_id: LogId<NodeId>) {
        self.log.split_off(&log_id.index);
    }

    /// Remove `log_id` and everything before it.
    fn purge(&mut self, log_id: LogId<NodeId>) {
        debug_assert!(self.last_purged_log_id <= Some(log_id));
        self.last_purged_log_id = Some(log_id);
        self.log = self.log.split_off(&(log_id.index + 1));
    }
}

impl LogStore {
    /// Every entry still held in the log, in index order.
    pub fn entries(&self) -> Vec<Entry<TypeConfig>> {
        self.inner.lock().log.values().cloned().collect()
    }
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        let inner = self.inner.lock();
        Ok(inner.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        Ok(self.inner.lock().log_state())
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        self.inner.lock().committed = committed;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        Ok(self.inner.lock().committed)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.inner.lock().vote = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(self.inner.lock().vote)
    }

    #[tracing::instrument(level = "trace", skip(self, entries, callback))]
    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>>,
    {
        self.inner.lock().append(entries);
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn truncate(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.inner.lock().truncate(log_id);
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn purge(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.inner.lock().purge(log_id);
        Ok(())
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }
}
