//! Run a five node cluster in-process, cut the leader off, keep writing
//! through the majority side and then heal the network.
//!
//!     cargo run -p raftkv --example partition

use std::time::Duration;

use raftkv::testing::*;
use raftkv::KvConfig;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    setup_tracing("raftkv=info,partition=info,openraft=error");

    const N: u64 = 5;
    let (router, nodes) = initialized_router(N, KvConfig::testing(100)).await;

    let leader = await_any_leader(&nodes).await;
    let node = &nodes[leader as usize];
    node.set("greeting", "hello", Duration::ZERO).await?;
    node.set("ephemeral", "soon gone", Duration::from_secs(2))
        .await?;
    await_applied(node, &nodes).await;
    print_values(&nodes, "before partition");

    let majority = nodes
        .iter()
        .filter(|n| n.id != leader)
        .cloned()
        .collect::<Vec<_>>();
    router
        .create_partitions([vec![leader], majority.iter().map(|n| n.id).collect()])
        .await;

    let new_leader = await_any_leader_t(&majority, Some(Duration::from_secs(10))).await?;
    tracing::info!("leader moved from {leader} to {new_leader}");

    let node = &nodes[new_leader as usize];
    node.set("greeting", "hello again", Duration::ZERO).await?;
    await_applied(node, &majority).await;
    print_values(&nodes, "during partition");

    router.create_partitions([0..N]).await;
    node.delete("unused").await?;
    await_applied(node, &nodes).await;
    sleep(2_000).await;
    print_values(&nodes, "after heal");

    Ok(())
}

fn print_values(nodes: &[raftkv::KvNode], label: &str) {
    for node in nodes {
        tracing::info!(
            node = node.id,
            greeting = ?node.get("greeting"),
            ephemeral = ?node.get("ephemeral"),
            "{label}"
        );
    }
}
