//! Growing a cluster from one node to three, and confirming a write on the leader
//! replicates to every member's applied index.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use kvstore::Command;
use maplit::btreeset;
use openreplica::client_api::ClientHandle;
use openreplica::session::SessionType;
use openreplica::Config;
use openreplica::Role;

#[macro_use]
mod fixtures;

use fixtures::RaftRouter;

#[tokio::test]
async fn write_on_leader_replicates_to_every_member() -> Result<()> {
    let config = Arc::new(
        Config::build("test")
            .election_timeout_min(300)
            .election_timeout_max(600)
            .heartbeat_interval(50)
            .validate()
            .expect("valid config"),
    );
    let router = Arc::new(RaftRouter::new(config));
    let timeout = Some(Duration::from_millis(2000));

    router.new_raft_node(0).await;
    router.initialize(0).await?;
    router.wait_for_state(&btreeset![0], Role::Leader, timeout).await?;

    router.new_raft_node(1).await;
    router.new_raft_node(2).await;
    router.add_member(0, 1).await?;
    router.add_member(0, 2).await?;

    let all = btreeset![0, 1, 2];
    // Bootstrap appended Blank (1) + Configuration (2); each add_member appended its own
    // Configuration entry (3, 4).
    router.wait_for_log(&all, 4, timeout).await?;

    let server = router.server(0).await?;
    let client = ClientHandle::open(server, "writer", SessionType::Client, 5000, 1).await?;
    let payload = serde_json::to_vec(&Command::Set { key: "k".into(), value: "v".into() })?;
    client.command(2, payload).await?;

    for id in all.iter() {
        router.wait(*id, timeout).await?.applied_index(6).await?;
    }

    assert_eq!(router.leader().await, Some(0));

    Ok(())
}
