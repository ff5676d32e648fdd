//! A single node must bootstrap itself as leader on `initialize`, and must actually commit
//! writes that a client then observes on read.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use kvstore::Command;
use kvstore::Query;
use maplit::btreeset;
use openreplica::client_api::ClientHandle;
use openreplica::session::SessionType;
use openreplica::Config;
use openreplica::ConsistencyLevel;
use openreplica::Role;

#[macro_use]
mod fixtures;

use fixtures::RaftRouter;

#[tokio::test]
async fn single_node_bootstraps_and_serves_writes_and_reads() -> Result<()> {
    let config = Arc::new(Config::build("test").validate().expect("valid config"));
    let router = Arc::new(RaftRouter::new(config));
    let timeout = Some(Duration::from_millis(1000));

    router.new_raft_node(0).await;
    router.wait_for_state(&btreeset![0], Role::Inactive, timeout).await?;

    router.initialize(0).await?;
    router.wait_for_state(&btreeset![0], Role::Leader, timeout).await?;

    let server = router.server(0).await?;
    // Bootstrap already appended a Blank entry (index 1) and a Configuration entry (index
    // 2); opening the session appends index 3, the command lands at index 4.
    let client = ClientHandle::open(server, "test-client", SessionType::Client, 5000, 1).await?;

    let set = serde_json::to_vec(&Command::Set { key: "a".into(), value: "1".into() })?;
    client.command(2, set).await?;

    router.wait(0, timeout).await?.applied_index(4).await?;

    let get = serde_json::to_vec(&Query::Get { key: "a".into() })?;
    let raw = client.query(0, ConsistencyLevel::Linearizable, get).await?;
    let value: String = serde_json::from_slice(&raw)?;
    assert_eq!(value, "1");

    Ok(())
}
