use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{InitializeError, RaftError};
use openraft::{BasicNode, LogId, Raft, RaftNetworkFactory};
use raftkv_store::{
    ApplyOutcome, ArcStateMachineStore, LogEntry, LogStore, NodeId, Transaction, TypeConfig,
};

use crate::config::KvConfig;
use crate::error::{KvError, KvResult};

/// One replica of the store: a raft instance plus the in-memory log and
/// state machine it drives.
///
/// Derefs to the underlying [`Raft`] for anything not wrapped here.
#[derive(Clone, derive_more::Deref)]
pub struct KvNode {
    #[deref]
    pub raft: Raft<TypeConfig>,

    pub id: NodeId,
    pub config: Arc<KvConfig>,
    pub state_machine: ArcStateMachineStore,
    pub log_store: LogStore,
}

impl KvNode {
    pub async fn new_mem<N>(
        id: NodeId,
        config: impl Into<Arc<KvConfig>>,
        network: N,
    ) -> KvResult<Self>
    where
        N: RaftNetworkFactory<TypeConfig>,
    {
        let config = config.into();
        let raft_config = Arc::new(config.raft_config.clone().validate()?);

        let log_store = LogStore::default();
        let state_machine = ArcStateMachineStore::new(config.store_config.clone());

        let raft = Raft::new(
            id,
            raft_config,
            network,
            log_store.clone(),
            state_machine.clone(),
        )
        .await?;

        Ok(Self {
            raft,
            id,
            config,
            state_machine,
            log_store,
        })
    }

    /// Bootstrap a cluster with the given voters. Calling this on a node that
    /// already has state (for instance because another member initialized
    /// first and reached it) is not an error.
    pub async fn initialize(
        &self,
        members: impl IntoIterator<Item = (NodeId, BasicNode)>,
    ) -> KvResult<()> {
        let members = members.into_iter().collect::<BTreeMap<_, _>>();
        match self.raft.initialize(members).await {
            Ok(_) => Ok(()),
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn is_leader(&self) -> bool {
        self.current_leader().await == Some(self.id)
    }

    /// Voters of the membership config this node currently uses.
    pub fn voter_ids(&self) -> BTreeSet<NodeId> {
        self.raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .voter_ids()
            .collect()
    }

    pub fn is_voter(&self, id: NodeId) -> bool {
        self.voter_ids().contains(&id)
    }

    /// Replicate `tx` and wait until the leader has applied it.
    pub async fn submit(&self, tx: &Transaction) -> KvResult<ApplyOutcome> {
        self.write_entry(tx.encode()?).await
    }

    /// Replicate an already encoded entry. The state machine decides what to
    /// make of it; undecodable payloads come back as
    /// [`ApplyOutcome::Malformed`].
    pub async fn write_entry(&self, entry: impl Into<LogEntry>) -> KvResult<ApplyOutcome> {
        let timeout = self.config.apply_timeout;
        let res = tokio::time::timeout(timeout, self.raft.client_write(entry.into()))
            .await
            .map_err(|_| KvError::Timeout(timeout))??;
        Ok(res.data)
    }

    pub async fn set(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
        ttl: Duration,
    ) -> KvResult<ApplyOutcome> {
        self.submit(&Transaction::new().set(key, value, ttl)).await
    }

    pub async fn delete(&self, key: impl Into<String>) -> KvResult<ApplyOutcome> {
        self.submit(&Transaction::new().delete(key)).await
    }

    /// Read from this replica's store. Followers may lag the leader.
    pub fn get(&self, key: &str) -> Option<String> {
        self.state_machine.get(key)
    }

    pub fn last_applied(&self) -> Option<LogId<NodeId>> {
        self.state_machine.last_applied()
    }

    /// Ask raft to build a snapshot now rather than waiting for the log
    /// threshold.
    pub async fn trigger_snapshot(&self) -> KvResult<()> {
        self.raft.trigger().snapshot().await?;
        Ok(())
    }
}
