//! The pluggable transport seam (§6: wire encoding is explicitly out of scope — only the
//! shape the core calls through is specified).
//!
//! The core never picks a transport itself, it only calls through this trait, letting the
//! embedding application choose TCP, in-memory channels (as the test fixtures do), or
//! anything else.

use async_trait::async_trait;

use crate::cluster::ClusterConfiguration;
use crate::raft_types::LogId;
use crate::raft_types::SnapshotSegmentId;
use crate::NodeId;

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader: NodeId,
    pub log_index: u64,
    pub log_term: u64,
    pub entries: Vec<crate::log::segment::LogEntry>,
    pub commit_index: u64,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub succeeded: bool,
    pub log_index: u64,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate: NodeId,
    pub log_index: u64,
    pub log_term: u64,
}

#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub granted: bool,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader: NodeId,
    pub id: SnapshotSegmentId,
    pub log_id: LogId,
    pub offset: u64,
    pub data: Vec<u8>,
    pub complete: bool,
}

#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
}

/// Sent by a server to update the known leader's cached view of a remote's configuration
/// (used for Configure/Join/Leave/Reconfigure forwarding).
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ConfigureResponse {
    pub index: u64,
    pub term: u64,
    pub time: u64,
    pub members: ClusterConfiguration,
}

/// The transport-agnostic seam the core dispatches RPCs through. An embedder supplies a
/// concrete implementation (TCP, QUIC, or the in-memory router used by the test fixtures).
#[async_trait]
pub trait RaftNetwork: Send + Sync + 'static {
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest) -> anyhow::Result<AppendEntriesResponse>;
    async fn send_install_snapshot(&self, target: NodeId, rpc: InstallSnapshotRequest) -> anyhow::Result<InstallSnapshotResponse>;
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> anyhow::Result<VoteResponse>;
    async fn send_poll(&self, target: NodeId, rpc: VoteRequest) -> anyhow::Result<VoteResponse>;
}
