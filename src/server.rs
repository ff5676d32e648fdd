//! The public server handle: spawns a [`RaftCore`] task and exposes the RPC and
//! client-facing request plane to the embedding application (§6).
//!
//! A cheap, cloneable handle around a channel into the single-threaded core task. Inbound
//! RPCs (the other side of [`crate::network::RaftNetwork`], which this node uses to call
//! *out* to peers) are delivered here by whatever transport the application wires up; this
//! type never picks a transport itself.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::cluster::MemberType;
use crate::config::Config;
use crate::core::client::ClientReadRequestEntry;
use crate::core::client::ClientWriteOk;
use crate::core::client::ClientWriteRequestEntry;
use crate::core::client::CloseSessionRequestEntry;
use crate::core::client::ConsistencyLevel;
use crate::core::client::KeepAliveRequestEntry;
use crate::core::client::MetadataRequestEntry;
use crate::core::client::RegisterRequestEntry;
use crate::core::RaftCore;
use crate::core::RaftMsg;
use crate::error::ChangeConfigError;
use crate::error::InitializeError;
use crate::error::OperationError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::log::Log;
use crate::meta::PersistentMeta;
use crate::metrics::ServerMetrics;
use crate::metrics::Wait;
use crate::network::AppendEntriesRequest;
use crate::network::AppendEntriesResponse;
use crate::network::InstallSnapshotRequest;
use crate::network::InstallSnapshotResponse;
use crate::network::RaftNetwork;
use crate::network::VoteRequest;
use crate::network::VoteResponse;
use crate::session::SessionId;
use crate::session::SessionSummary;
use crate::session::SessionType;
use crate::snapshot::SnapshotStore;
use crate::state_machine::KeepAliveUpdate;
use crate::state_machine::StateMachine;
use crate::NodeId;

struct Inner<N: RaftNetwork, S: StateMachine> {
    tx_api: mpsc::UnboundedSender<RaftMsg>,
    rx_metrics: watch::Receiver<ServerMetrics>,
    handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_n: std::marker::PhantomData<N>,
    marker_s: std::marker::PhantomData<S>,
}

/// A running server node.
///
/// Cloning is cheap (an `Arc` bump) and the recommended way to share a handle across the
/// tasks that feed it inbound RPCs and client requests.
pub struct Server<N: RaftNetwork, S: StateMachine> {
    inner: Arc<Inner<N, S>>,
}

impl<N: RaftNetwork, S: StateMachine> Clone for Server<N, S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<N: RaftNetwork, S: StateMachine> Server<N, S> {
    /// Spawn the core task and return a handle to it.
    #[allow(clippy::too_many_arguments)]
    pub fn new(id: NodeId, config: Arc<Config>, network: Arc<N>, log: Log, snapshots: SnapshotStore, meta: PersistentMeta, state_machine: S) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(ServerMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let handle = RaftCore::spawn(id, config, network, log, snapshots, meta, state_machine, rx_api, tx_metrics, rx_shutdown);
        Self {
            inner: Arc::new(Inner {
                tx_api,
                rx_metrics,
                handle: Mutex::new(Some(handle)),
                tx_shutdown: Mutex::new(Some(tx_shutdown)),
                marker_n: std::marker::PhantomData,
                marker_s: std::marker::PhantomData,
            }),
        }
    }

    fn send<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> RaftMsg) -> impl std::future::Future<Output = Result<T, RaftError>> {
        let (tx, rx) = oneshot::channel();
        let sent = self.inner.tx_api.send(make(tx));
        async move {
            sent.map_err(|_| RaftError::ShuttingDown)?;
            rx.await.map_err(|_| RaftError::ShuttingDown)
        }
    }

    /// Deliver an inbound `AppendEntries` RPC (§4.6 "Append handling").
    pub async fn append_entries(&self, rpc: AppendEntriesRequest) -> RaftResult<AppendEntriesResponse> {
        self.send(|tx| RaftMsg::AppendEntries { rpc, tx }).await?
    }

    /// Deliver an inbound `Vote` RPC.
    pub async fn vote(&self, rpc: VoteRequest) -> RaftResult<VoteResponse> {
        self.send(|tx| RaftMsg::Vote { rpc, tx }).await?
    }

    /// Deliver an inbound `Poll` RPC (advisory pre-vote, §4.6).
    pub async fn poll(&self, rpc: VoteRequest) -> RaftResult<VoteResponse> {
        self.send(|tx| RaftMsg::Poll { rpc, tx }).await?
    }

    /// Deliver an inbound `InstallSnapshot` chunk.
    pub async fn install_snapshot(&self, rpc: InstallSnapshotRequest) -> RaftResult<InstallSnapshotResponse> {
        self.send(|tx| RaftMsg::InstallSnapshot { rpc, tx }).await?
    }

    /// Open a new client session (§4.4 `OpenSession`).
    pub async fn register(&self, name: String, session_type: SessionType, timeout: u64, timestamp: u64) -> Result<SessionId, OperationError> {
        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .tx_api
            .send(RaftMsg::Register(RegisterRequestEntry {
                name,
                session_type,
                timeout,
                timestamp,
                tx,
            }))
            .is_err()
        {
            return Err(OperationError::InternalError("server is shutting down".into()));
        }
        rx.await.unwrap_or(Err(OperationError::InternalError("server is shutting down".into())))
    }

    /// Refresh a session's liveness, and optionally fold in replayed acks (§4.4 `KeepAlive`).
    pub async fn keep_alive(&self, updates: Vec<KeepAliveUpdate>, timestamp: u64) -> Result<(), OperationError> {
        let (tx, rx) = oneshot::channel();
        if self.inner.tx_api.send(RaftMsg::KeepAlive(KeepAliveRequestEntry { updates, timestamp, tx })).is_err() {
            return Err(OperationError::InternalError("server is shutting down".into()));
        }
        rx.await.unwrap_or(Err(OperationError::InternalError("server is shutting down".into())))
    }

    /// Close a session early (§4.4 `CloseSession`).
    pub async fn close_session(&self, session: SessionId, timestamp: u64) -> Result<(), OperationError> {
        let (tx, rx) = oneshot::channel();
        if self.inner.tx_api.send(RaftMsg::CloseSession(CloseSessionRequestEntry { session, timestamp, tx })).is_err() {
            return Err(OperationError::InternalError("server is shutting down".into()));
        }
        rx.await.unwrap_or(Err(OperationError::InternalError("server is shutting down".into())))
    }

    /// Submit a mutating `Command` to the state machine (§4.4). The response is delivered
    /// once the entry both commits and applies.
    #[allow(clippy::too_many_arguments)]
    pub async fn client_write(&self, session: SessionId, sequence: u64, request_sequence: u64, timestamp: u64, payload: Vec<u8>) -> Result<ClientWriteOk, OperationError> {
        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .tx_api
            .send(RaftMsg::ClientWrite(ClientWriteRequestEntry {
                session,
                sequence,
                request_sequence,
                timestamp,
                payload,
                tx,
            }))
            .is_err()
        {
            return Err(OperationError::InternalError("server is shutting down".into()));
        }
        rx.await.unwrap_or(Err(OperationError::InternalError("server is shutting down".into())))
    }

    /// Submit a `Query` (§4.5). `consistency` controls whether a heartbeat re-verification
    /// is performed before the query is answered.
    pub async fn client_read(&self, session: SessionId, sequence: u64, index: u64, consistency: ConsistencyLevel, payload: Vec<u8>) -> Result<Vec<u8>, OperationError> {
        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .tx_api
            .send(RaftMsg::ClientRead(ClientReadRequestEntry {
                session,
                sequence,
                index,
                consistency,
                payload,
                tx,
            }))
            .is_err()
        {
            return Err(OperationError::InternalError("server is shutting down".into()));
        }
        rx.await.unwrap_or(Err(OperationError::InternalError("server is shutting down".into())))
    }

    /// List every session this server currently knows about (§3, §6 `Metadata`). Logged and
    /// answered at a committed index, but has no side effect on any session.
    pub async fn metadata(&self, session: SessionId, timestamp: u64) -> Result<Vec<SessionSummary>, OperationError> {
        let (tx, rx) = oneshot::channel();
        if self.inner.tx_api.send(RaftMsg::Metadata(MetadataRequestEntry { session, timestamp, tx })).is_err() {
            return Err(OperationError::InternalError("server is shutting down".into()));
        }
        rx.await.unwrap_or(Err(OperationError::InternalError("server is shutting down".into())))
    }

    /// Bootstrap a brand-new cluster from this node alone (§8 S1).
    pub async fn initialize(&self) -> Result<(), InitializeError> {
        self.send(|tx| RaftMsg::Initialize { tx }).await?
    }

    /// Propose a membership change (Join/Leave/Reconfigure, §4.3, §6).
    pub async fn change_membership(&self, members: Vec<(NodeId, MemberType, String, String)>) -> Result<(), ChangeConfigError> {
        self.send(|tx| RaftMsg::ChangeMembership { members, tx }).await?
    }

    /// A handle to the live metrics stream.
    pub fn metrics(&self) -> watch::Receiver<ServerMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// A handle for awaiting a condition against the metrics stream, e.g.
    /// `server.wait(None).role(Role::Leader).await`.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or_else(|| Duration::from_millis(5000)),
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shut the node down and await its task's completion.
    pub async fn shutdown(&self) -> RaftResult<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.handle.lock().await.take() {
            return handle.await.map_err(|_| RaftError::ShuttingDown)?;
        }
        Ok(())
    }
}
