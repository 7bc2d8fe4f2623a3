use maplit::btreeset;
use openraft::{BasicNode, ChangeMembers};
use raftkv_store::NodeId;

use crate::error::{KvError, KvResult};
use crate::KvNode;

impl KvNode {
    /// Add `id` as a voter. The node first joins as a learner and this call
    /// blocks until it has caught up with the leader's log; it is then
    /// promoted. Adding a node that already votes succeeds without changes.
    ///
    /// Must be called on the leader.
    pub async fn add_voter(&self, id: NodeId, addr: impl ToString) -> KvResult<()> {
        if self.is_voter(id) {
            tracing::debug!(node = id, "already a voter");
            return Ok(());
        }

        self.raft
            .add_learner(id, BasicNode::new(addr), true)
            .await
            .map_err(KvError::Membership)?;

        self.raft
            .change_membership(ChangeMembers::AddVoterIds(btreeset![id]), false)
            .await
            .map_err(KvError::Membership)?;

        tracing::info!(node = id, "added voter");
        Ok(())
    }

    /// Remove `id` from the voters. It is not kept on as a learner.
    ///
    /// Must be called on the leader.
    pub async fn remove_voter(&self, id: NodeId) -> KvResult<()> {
        self.raft
            .change_membership(ChangeMembers::RemoveVoters(btreeset![id]), false)
            .await
            .map_err(KvError::Membership)?;

        tracing::info!(node = id, "removed voter");
        Ok(())
    }
}
