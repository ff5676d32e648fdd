//! Fixtures for testing the Raft node end to end.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use kvstore::KvStore;
use openreplica::cluster::MemberType;
use openreplica::config::Config;
use openreplica::metrics::ServerMetrics;
use openreplica::metrics::Wait;
use openreplica::network::AppendEntriesRequest;
use openreplica::network::AppendEntriesResponse;
use openreplica::network::InstallSnapshotRequest;
use openreplica::network::InstallSnapshotResponse;
use openreplica::network::VoteRequest;
use openreplica::network::VoteResponse;
use openreplica::Role;
use openreplica::{log::Log, meta::PersistentMeta, server::Server, snapshot::SnapshotStore, NodeId, RaftNetwork};
use tempfile::TempDir;
use tokio::sync::RwLock;

/// A concrete server type used during testing.
pub type TestServer = Server<RaftRouter, KvStore>;

/// A type which emulates a network transport and implements [`RaftNetwork`].
///
/// Every registered node gets its own on-disk log/snapshot directory (backed by a
/// [`TempDir`] this router owns for the node's whole lifetime) so the behavior under test
/// is the real, file-backed [`openreplica::log::Log`] and [`SnapshotStore`], not a mock.
pub struct RaftRouter {
    config: Arc<Config>,
    routing_table: RwLock<BTreeMap<NodeId, (TestServer, Arc<TempDir>)>>,
    isolated_nodes: RwLock<HashSet<NodeId>>,
}

impl RaftRouter {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            routing_table: Default::default(),
            isolated_nodes: Default::default(),
        }
    }

    /// Create and register a new node bearing the given ID.
    pub async fn new_raft_node(self: &Arc<Self>, id: NodeId) {
        let dir = Arc::new(tempfile::tempdir().expect("failed to create temp dir for node"));
        let log = Log::open(dir.path(), "log", &self.config).expect("failed to open log");
        let snapshots = SnapshotStore::open(dir.path(), "snapshot").expect("failed to open snapshot store");
        let meta = PersistentMeta::open(dir.path(), "node").expect("failed to open meta");
        let server = Server::new(id, self.config.clone(), self.clone(), log, snapshots, meta, KvStore::new());
        let mut rt = self.routing_table.write().await;
        rt.insert(id, (server, dir));
    }

    /// Initialize a single-node cluster rooted at `node`.
    pub async fn initialize(&self, node: NodeId) -> Result<()> {
        let rt = self.routing_table.read().await;
        rt.get(&node).ok_or_else(|| anyhow!("node {} not found in routing table", node))?.0.initialize().await?;
        Ok(())
    }

    /// Add `target` to the cluster as an active voting member, via `leader`.
    pub async fn add_member(&self, leader: NodeId, target: NodeId) -> Result<()> {
        let rt = self.routing_table.read().await;
        let node = rt.get(&leader).with_context(|| format!("node {} not found", leader))?;
        node.0
            .change_membership(vec![(target, MemberType::Active, format!("node-{}", target), format!("node-{}", target))])
            .await?;
        Ok(())
    }

    #[allow(dead_code)]
    pub async fn isolate_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.insert(id);
    }

    #[allow(dead_code)]
    pub async fn restore_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.remove(&id);
    }

    pub async fn latest_metrics(&self) -> Vec<ServerMetrics> {
        let rt = self.routing_table.read().await;
        let mut metrics = vec![];
        for (node, _) in rt.values() {
            metrics.push(node.metrics().borrow().clone());
        }
        metrics
    }

    pub async fn server(&self, id: NodeId) -> Result<TestServer> {
        let rt = self.routing_table.read().await;
        Ok(rt.get(&id).with_context(|| format!("node {} not found", id))?.0.clone())
    }

    pub async fn wait(&self, node_id: NodeId, timeout: Option<Duration>) -> Result<Wait> {
        let rt = self.routing_table.read().await;
        let node = rt.get(&node_id).with_context(|| format!("node {} not found", node_id))?;
        Ok(node.0.wait(timeout))
    }

    pub async fn wait_for_state(&self, node_ids: &BTreeSet<NodeId>, want: Role, timeout: Option<Duration>) -> Result<()> {
        for id in node_ids {
            self.wait(*id, timeout).await?.role(want).await?;
        }
        Ok(())
    }

    pub async fn wait_for_log(&self, node_ids: &BTreeSet<NodeId>, want_log: u64, timeout: Option<Duration>) -> Result<()> {
        for id in node_ids {
            self.wait(*id, timeout).await?.log_index(want_log).await?;
        }
        Ok(())
    }

    /// Find the node every non-isolated member agrees is leader, if one exists.
    pub async fn leader(&self) -> Option<NodeId> {
        let isolated = self.isolated_nodes.read().await;
        self.latest_metrics().await.into_iter().find_map(|m| {
            if m.current_leader == Some(m.id) && !isolated.contains(&m.id) {
                Some(m.id)
            } else {
                None
            }
        })
    }
}

#[async_trait]
impl RaftNetwork for RaftRouter {
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        if isolated.contains(&target) || isolated.contains(&rpc.leader) {
            return Err(anyhow!("node is isolated"));
        }
        let (node, _) = rt.get(&target).ok_or_else(|| anyhow!("target node not found in routing table"))?;
        Ok(node.append_entries(rpc).await?)
    }

    async fn send_install_snapshot(&self, target: NodeId, rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse> {
        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        if isolated.contains(&target) || isolated.contains(&rpc.leader) {
            return Err(anyhow!("node is isolated"));
        }
        let (node, _) = rt.get(&target).ok_or_else(|| anyhow!("target node not found in routing table"))?;
        Ok(node.install_snapshot(rpc).await?)
    }

    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        if isolated.contains(&target) || isolated.contains(&rpc.candidate) {
            return Err(anyhow!("node is isolated"));
        }
        let (node, _) = rt.get(&target).ok_or_else(|| anyhow!("target node not found in routing table"))?;
        Ok(node.vote(rpc).await?)
    }

    async fn send_poll(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        if isolated.contains(&target) || isolated.contains(&rpc.candidate) {
            return Err(anyhow!("node is isolated"));
        }
        let (node, _) = rt.get(&target).ok_or_else(|| anyhow!("target node not found in routing table"))?;
        Ok(node.poll(rpc).await?)
    }
}
