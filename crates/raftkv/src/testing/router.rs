use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use openraft::error::Unreachable;
use openraft::BasicNode;
use raftkv_store::NodeId;
use tokio::sync::Mutex;

use crate::config::KvConfig;
use crate::error::KvResult;
use crate::KvNode;

/// One node's handle on the simulated network.
#[derive(Clone)]
pub struct RouterNode {
    pub source: NodeId,
    pub router: Router,
}

/// Simulate a network router connecting in-process nodes.
#[derive(Clone, derive_more::Deref)]
pub struct Router {
    #[deref]
    connections: Arc<Mutex<RouterConnections>>,
    pub config: Arc<KvConfig>,
}

impl Router {
    pub fn new(config: impl Into<Arc<KvConfig>>) -> Self {
        Self {
            connections: Default::default(),
            config: config.into(),
        }
    }

    pub fn node(&self, id: NodeId) -> RouterNode {
        RouterNode {
            source: id,
            router: self.clone(),
        }
    }

    /// Create a node with in-memory storage and make it reachable through
    /// this router. It starts uninitialized, as a blank learner.
    pub async fn new_node(&self, id: NodeId) -> KvResult<KvNode> {
        let node = KvNode::new_mem(id, self.config.clone(), self.node(id)).await?;
        self.lock().await.targets.insert(id, node.clone());
        Ok(node)
    }

    pub async fn add_nodes(&self, ids: impl IntoIterator<Item = NodeId>) -> KvResult<Vec<KvNode>> {
        let mut nodes = Vec::new();
        for id in ids {
            nodes.push(self.new_node(id).await?);
        }
        Ok(nodes)
    }

    /// Move nodes into fresh partitions, one per inner list. Nodes in
    /// different partitions cannot reach each other. Nodes not listed stay
    /// where they are.
    pub async fn create_partitions(
        &self,
        partitions: impl IntoIterator<Item = impl IntoIterator<Item = NodeId>>,
    ) {
        self.lock().await.create_partitions(partitions);
    }

    pub async fn show_partitions(&self) -> BTreeSet<BTreeSet<NodeId>> {
        self.lock().await.show_partitions()
    }
}

/// Address a node is registered under in the router.
pub fn node_addr(id: NodeId) -> BasicNode {
    BasicNode::new(format!("router:{id}"))
}

#[derive(Default)]
pub struct RouterConnections {
    pub targets: BTreeMap<NodeId, KvNode>,
    pub partitions: BTreeMap<NodeId, PartitionId>,
}

pub type PartitionId = u64;

static PARTITION_ID: AtomicU64 = AtomicU64::new(1);

impl RouterConnections {
    pub fn create_partitions(
        &mut self,
        partitions: impl IntoIterator<Item = impl IntoIterator<Item = NodeId>>,
    ) {
        for group in partitions {
            let id = PARTITION_ID.fetch_add(1, Ordering::Relaxed);
            self.partitions.extend(group.into_iter().map(|n| (n, id)));
        }
        tracing::info!(partitions = ?self.show_partitions(), "network partitioned");
    }

    /// Current groups of mutually reachable nodes. Feeding the result back
    /// into `create_partitions` reproduces the same split.
    pub fn show_partitions(&self) -> BTreeSet<BTreeSet<NodeId>> {
        let mut groups: BTreeMap<PartitionId, BTreeSet<NodeId>> = BTreeMap::new();
        let mut unassigned = self.targets.keys().copied().collect::<BTreeSet<_>>();
        for (node, id) in self.partitions.iter() {
            unassigned.remove(node);
            groups.entry(*id).or_default().insert(*node);
        }
        let mut groups = groups.into_values().collect::<BTreeSet<_>>();
        if !unassigned.is_empty() {
            groups.insert(unassigned);
        }
        groups
    }
}

impl RouterNode {
    /// Look up `to`, failing the way a real network would if it is in
    /// another partition or does not exist.
    pub async fn reach(&self, to: NodeId) -> Result<KvNode, Unreachable> {
        let r = self.router.lock().await;

        if r.partitions.get(&self.source) != r.partitions.get(&to) {
            // can't communicate across partitions
            return Err(Unreachable::new(&std::io::Error::other(
                "simulated network partition",
            )));
        }

        r.targets.get(&to).cloned().ok_or_else(|| {
            Unreachable::new(&std::io::Error::other(format!("no such node: {to}")))
        })
    }
}
