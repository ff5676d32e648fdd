//! Metrics reporting over a `watch`-channel stream.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::cluster::ClusterConfiguration;
use crate::core::Role;
use crate::replication::ReplicationMetrics;
use crate::NodeId;

/// A snapshot of a server's state, published on every state transition so that the parent
/// application and tests can observe progress without polling the server task directly.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerMetrics {
    pub id: NodeId,
    pub role: Role,
    pub current_term: u64,
    pub last_log_index: u64,
    pub last_applied: u64,
    pub current_leader: Option<NodeId>,
    pub configuration: ClusterConfiguration,
    pub snapshot_index: u64,
    pub leader_metrics: Option<LeaderMetrics>,
}

impl ServerMetrics {
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            role: Role::Inactive,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            current_leader: None,
            configuration: ClusterConfiguration::new_initial(id),
            snapshot_index: 0,
            leader_metrics: None,
        }
    }
}

/// Metrics which only make sense while this server is the cluster leader.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaderMetrics {
    pub replication: BTreeMap<NodeId, ReplicationMetrics>,
}

/// A handle for waiting until the metrics stream satisfies some condition.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<ServerMetrics>,
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timed out after {0:?} waiting on condition")]
    Timeout(Duration),
    #[error("the metrics channel has closed")]
    Closed,
}

impl Wait {
    /// Wait for the predicate to return `true` against some future metrics payload.
    pub async fn metrics<T>(&self, mut func: T, msg: impl Into<String>) -> Result<ServerMetrics, WaitError>
    where T: FnMut(&ServerMetrics) -> bool {
        let mut rx = self.rx.clone();
        let msg = msg.into();
        let fut = async move {
            loop {
                {
                    let latest = rx.borrow();
                    if func(&latest) {
                        return Ok(latest.clone());
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(WaitError::Closed);
                }
            }
        };
        match timeout(self.timeout, fut).await {
            Ok(res) => res,
            Err(_) => {
                tracing::error!("timeout waiting for: {}", msg);
                Err(WaitError::Timeout(self.timeout))
            }
        }
    }

    pub async fn log_index(&self, want: u64) -> Result<ServerMetrics, WaitError> {
        self.metrics(|m| m.last_log_index >= want, format!("log_index>={}", want)).await
    }

    pub async fn applied_index(&self, want: u64) -> Result<ServerMetrics, WaitError> {
        self.metrics(|m| m.last_applied >= want, format!("applied_index>={}", want)).await
    }

    pub async fn current_leader(&self, want: NodeId) -> Result<ServerMetrics, WaitError> {
        self.metrics(|m| m.current_leader == Some(want), format!("current_leader=={}", want)).await
    }

    pub async fn role(&self, want: Role) -> Result<ServerMetrics, WaitError> {
        self.metrics(move |m| m.role == want, format!("role=={:?}", want)).await
    }
}
