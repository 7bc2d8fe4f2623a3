use std::collections::BTreeSet;
use std::time::Duration;

use itertools::Itertools;
use openraft::ServerState;
use raftkv_store::NodeId;
use tracing_subscriber::EnvFilter;

use crate::config::KvConfig;
use crate::KvNode;

use super::*;

/// Install a fmt subscriber for test output. `RUST_LOG` wins over `filter`
/// when set; calling this more than once is harmless.
pub fn setup_tracing(filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Create `num_peers` nodes numbered from 0 and initialize them all as voters
/// of one cluster.
pub async fn initialized_router(num_peers: u64, config: KvConfig) -> (Router, Vec<KvNode>) {
    let all_ids = (0..num_peers).collect::<BTreeSet<_>>();
    let router = Router::new(config);
    let nodes = router.add_nodes(all_ids.clone()).await.unwrap();

    tracing::info!("router created.");

    for node in nodes.iter() {
        node.initialize(all_ids.iter().map(|id| (*id, node_addr(*id))))
            .await
            .unwrap();
        tracing::info!("initialized {}.", node.id);
    }

    (router, nodes)
}

pub async fn await_any_leader_t(nodes: &[KvNode], timeout: Option<Duration>) -> anyhow::Result<u64> {
    let start = std::time::Instant::now();
    let ids = nodes.iter().map(|r| r.id).collect_vec();
    tracing::info!("awaiting any leader for {ids:?}");
    let futs = nodes.iter().map(|r| {
        Box::pin(async move {
            r.raft
                .wait(timeout)
                .state(ServerState::Leader, "await_state")
                .await
        })
    });

    let (res, _idx, _) = futures::future::select_all(futs).await;
    let leader = res?.id;
    tracing::info!("found new leader {leader} in {:?}", start.elapsed());
    Ok(leader)
}

/// Wait for a leader to be elected and for every node in `nodes` to know
/// about it.
pub async fn await_any_leader(nodes: &[KvNode]) -> u64 {
    let start = std::time::Instant::now();
    let leader = await_any_leader_t(nodes, None).await.unwrap();
    let election_time = start.elapsed();

    futures::future::join_all(nodes.iter().map(|r| async move {
        if r.id != leader {
            r.wait(None)
                .current_leader(leader, "await consensus")
                .await
                .unwrap();
        }
    }))
    .await;
    let consensus_time = start.elapsed();

    tracing::info!(
        "elected new leader {leader} in {:?}, full consensus in {:?}",
        election_time,
        consensus_time
    );
    leader
}

/// Wait until every node in `nodes` has applied the leader's latest entry.
pub async fn await_applied(leader: &KvNode, nodes: &[KvNode]) {
    let index = leader.last_applied().map(|l| l.index);
    futures::future::join_all(nodes.iter().map(|r| async move {
        r.wait(Some(Duration::from_secs(10)))
            .applied_index_at_least(index, "await applied")
            .await
            .unwrap();
    }))
    .await;
}

/// Wait until `node` reports exactly `voters` as its voter set.
pub async fn await_voters(node: &KvNode, voters: impl IntoIterator<Item = NodeId>) {
    let voters = voters.into_iter().collect::<BTreeSet<_>>();
    node.wait(Some(Duration::from_secs(10)))
        .metrics(
            move |m| {
                m.membership_config
                    .membership()
                    .voter_ids()
                    .collect::<BTreeSet<_>>()
                    == voters
            },
            "await voters",
        )
        .await
        .unwrap();
}

pub async fn sleep(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
