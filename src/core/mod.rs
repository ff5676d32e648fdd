//! The core Raft node: role state machine, election/heartbeat timing, and the primary
//! single-threaded dispatch context (§4.6, §5).

mod admin;
mod append_entries;
pub(crate) mod client;
mod install_snapshot;
mod vote;

use std::io;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::time::Duration;
use tokio::time::Instant;

use crate::cluster::ClusterState;
use crate::cluster::MemberType;
use crate::config::Config;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::log::Log;
use crate::metrics::ServerMetrics;
use crate::network::RaftNetwork;
use crate::raft_types::LogId;
use crate::replication::LeaderAppender;
use crate::session::SessionId;
use crate::session::SessionSummary;
use crate::snapshot::SnapshotStore;
use crate::state_machine::Executor;
use crate::state_machine::StateMachine;
use crate::NodeId;

/// The states named in §4.6, in the order a member may legitimately pass through them.
/// `Inactive` is both the initial and terminal state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Role {
    Inactive,
    Reserve,
    Passive,
    Follower,
    Candidate,
    Leader,
}

impl Role {
    pub fn is_active_voter(&self) -> bool {
        matches!(self, Role::Follower | Role::Candidate | Role::Leader)
    }
}

/// A request arriving on the core's single dispatch channel. Wire decoding happens upstream
/// of this boundary (§1 Non-goals); what crosses here is already a typed RPC.
pub enum RaftMsg {
    AppendEntries {
        rpc: crate::network::AppendEntriesRequest,
        tx: oneshot::Sender<RaftResult<crate::network::AppendEntriesResponse>>,
    },
    Vote {
        rpc: crate::network::VoteRequest,
        tx: oneshot::Sender<RaftResult<crate::network::VoteResponse>>,
    },
    Poll {
        rpc: crate::network::VoteRequest,
        tx: oneshot::Sender<RaftResult<crate::network::VoteResponse>>,
    },
    InstallSnapshot {
        rpc: crate::network::InstallSnapshotRequest,
        tx: oneshot::Sender<RaftResult<crate::network::InstallSnapshotResponse>>,
    },
    ClientWrite(client::ClientWriteRequestEntry),
    ClientRead(client::ClientReadRequestEntry),
    Register(client::RegisterRequestEntry),
    KeepAlive(client::KeepAliveRequestEntry),
    CloseSession(client::CloseSessionRequestEntry),
    Metadata(client::MetadataRequestEntry),
    Initialize {
        tx: oneshot::Sender<Result<(), crate::error::InitializeError>>,
    },
    ChangeMembership {
        members: Vec<(NodeId, MemberType, String, String)>,
        tx: oneshot::Sender<Result<(), crate::error::ChangeConfigError>>,
    },
}

/// The core type implementing the role state machine. Owns everything the primary context
/// is the exclusive writer of: term, `votedFor`, the log suffix, cluster state, and role
/// (§5).
pub struct RaftCore<N: RaftNetwork, S: StateMachine> {
    pub(crate) id: NodeId,
    pub(crate) config: Arc<Config>,
    pub(crate) network: Arc<N>,

    pub(crate) role: Role,
    pub(crate) current_term: u64,
    pub(crate) voted_for: Option<NodeId>,
    pub(crate) current_leader: Option<NodeId>,

    pub(crate) log: Log,
    pub(crate) cluster: ClusterState,
    pub(crate) meta: crate::meta::PersistentMeta,
    pub(crate) snapshots: SnapshotStore,
    pub(crate) executor: Executor<S>,
    pub(crate) appender: Option<LeaderAppender>,

    pub(crate) last_heartbeat: Option<Instant>,
    pub(crate) next_election_timeout: Option<Instant>,

    /// Client requests parked awaiting their log index to apply, keyed by that index
    /// (§5: "client-visible request futures ... complete on apply, error, or step-down").
    pub(crate) pending_client_responses: std::collections::BTreeMap<u64, client::PendingResponder>,

    pub(crate) rx_api: mpsc::UnboundedReceiver<RaftMsg>,
    pub(crate) tx_metrics: watch::Sender<ServerMetrics>,
    pub(crate) rx_shutdown: oneshot::Receiver<()>,
}

impl<N: RaftNetwork, S: StateMachine> RaftCore<N, S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        network: Arc<N>,
        log: Log,
        snapshots: SnapshotStore,
        meta: crate::meta::PersistentMeta,
        state_machine: S,
        rx_api: mpsc::UnboundedReceiver<RaftMsg>,
        tx_metrics: watch::Sender<ServerMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> tokio::task::JoinHandle<RaftResult<()>> {
        let executor = Executor::new(state_machine, &config);
        let cluster = match meta.configuration() {
            Some(cfg) => ClusterState::with_configuration(cfg.clone()),
            None => ClusterState::new(id),
        };
        let this = Self {
            id,
            cluster,
            config,
            network,
            role: Role::Inactive,
            current_term: meta.current_term(),
            voted_for: meta.voted_for(),
            current_leader: None,
            log,
            snapshots,
            meta,
            executor,
            appender: None,
            last_heartbeat: None,
            next_election_timeout: None,
            pending_client_responses: std::collections::BTreeMap::new(),
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main())
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = self.id, cluster = %self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::debug!("server is initializing");
        // A brand-new node (never bootstrapped, never received a replicated entry) waits
        // inert for an explicit `initialize()` or an incoming AppendEntries from a real
        // leader — it must not assume cluster membership from the placeholder
        // single-member configuration `ClusterState::new` seeds it with (§4.6, §8 S1).
        //
        // A node resuming with prior state always re-enters as Follower and lets the
        // normal election-timeout path re-establish leadership, even in a single-node
        // cluster — re-running `become_leader`'s entry-appending directly on every restart
        // would duplicate the bootstrap Blank/Configuration entries.
        let never_started = self.current_term == 0 && self.log.last_index() == 0;
        self.role = if never_started { Role::Inactive } else { Role::Follower };
        if self.role == Role::Follower {
            self.reset_election_timeout();
        }
        self.report_metrics();

        loop {
            if (self.rx_shutdown).try_recv().is_ok() {
                self.role = Role::Inactive;
                self.report_metrics();
                return Ok(());
            }
            tokio::select! {
                _ = &mut self.rx_shutdown => {
                    self.role = Role::Inactive;
                    self.report_metrics();
                    return Ok(());
                }
                msg = self.rx_api.recv() => {
                    match msg {
                        Some(msg) => self.handle_msg(msg).await?,
                        None => return Ok(()),
                    }
                }
                _ = self.tick_delay() => {
                    self.handle_tick().await?;
                }
            }
        }
    }

    async fn tick_delay(&self) {
        match self.role {
            Role::Leader => tokio::time::sleep(Duration::from_millis(self.config.heartbeat_interval)).await,
            Role::Follower | Role::Candidate => {
                let until = self.next_election_timeout.unwrap_or_else(|| Instant::now() + Duration::from_millis(self.config.election_timeout_min));
                tokio::time::sleep_until(until).await
            }
            Role::Reserve | Role::Passive | Role::Inactive => std::future::pending().await,
        }
    }

    async fn handle_tick(&mut self) -> RaftResult<()> {
        match self.role {
            Role::Leader => self.leader_append_cycle().await?,
            Role::Follower | Role::Candidate => self.handle_election_timeout().await?,
            _ => {}
        }
        Ok(())
    }

    async fn handle_msg(&mut self, msg: RaftMsg) -> RaftResult<()> {
        match msg {
            RaftMsg::AppendEntries { rpc, tx } => {
                let res = self.handle_append_entries_request(rpc).await;
                let _ = tx.send(res);
            }
            RaftMsg::Vote { rpc, tx } => {
                let res = self.handle_vote_request(rpc);
                let _ = tx.send(res);
            }
            RaftMsg::Poll { rpc, tx } => {
                let res = self.handle_poll_request(rpc);
                let _ = tx.send(res);
            }
            RaftMsg::InstallSnapshot { rpc, tx } => {
                let res = self.handle_install_snapshot_request(rpc).await;
                let _ = tx.send(res);
            }
            RaftMsg::ClientWrite(entry) => self.handle_client_write(entry).await?,
            RaftMsg::ClientRead(entry) => self.handle_client_read(entry).await?,
            RaftMsg::Register(entry) => self.handle_register(entry).await?,
            RaftMsg::KeepAlive(entry) => self.handle_keep_alive(entry).await?,
            RaftMsg::CloseSession(entry) => self.handle_close_session(entry).await?,
            RaftMsg::Metadata(entry) => self.handle_metadata(entry).await?,
            RaftMsg::Initialize { tx } => {
                let res = self.handle_initialize().await;
                let _ = tx.send(res);
            }
            RaftMsg::ChangeMembership { members, tx } => {
                let res = self.handle_change_membership(members).await;
                let _ = tx.send(res);
            }
        }
        self.report_metrics();
        Ok(())
    }

    pub(crate) fn update_current_term(&mut self, term: u64, voted_for: Option<NodeId>) -> io::Result<()> {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = voted_for;
            self.current_leader = None;
            self.persist_meta()?;
        }
        Ok(())
    }

    /// Durably record the current `currentTerm`/`votedFor`/configuration triple (§5). Called
    /// any time one of the three changes so a restart recovers exactly where this node left
    /// off, rather than as a blank node.
    pub(crate) fn persist_meta(&mut self) -> io::Result<()> {
        let configuration = self.cluster.configuration().clone();
        self.meta.save(self.current_term, self.voted_for, &configuration)
    }

    pub(crate) fn update_current_leader(&mut self, leader: Option<NodeId>) {
        self.current_leader = leader;
    }

    pub(crate) fn set_role(&mut self, role: Role) {
        tracing::debug!(from = ?self.role, to = ?role, "role transition");
        if self.role == Role::Leader && role != Role::Leader {
            self.appender = None;
        }
        self.role = role;
    }

    pub(crate) fn reset_election_timeout(&mut self) {
        self.last_heartbeat = Some(Instant::now());
        self.next_election_timeout = Some(Instant::now() + Duration::from_millis(self.config.new_rand_election_timeout()));
    }

    pub(crate) fn last_log_id(&self) -> LogId {
        let index = self.log.last_index();
        let term = self.log.get(index).map(|e| e.log_id.term).unwrap_or(0);
        LogId::new(term, index)
    }

    fn report_metrics(&self) {
        let metrics = ServerMetrics {
            id: self.id,
            role: self.role,
            current_term: self.current_term,
            last_log_index: self.log.last_index(),
            last_applied: self.executor.last_applied,
            current_leader: self.current_leader,
            configuration: self.cluster.configuration().clone(),
            snapshot_index: self.snapshots.complete().map(|m| m.log_id.index).unwrap_or(0),
            leader_metrics: self.appender.as_ref().map(|a| a.metrics()),
        };
        let _ = self.tx_metrics.send(metrics);
    }

    /// Apply every committed-but-not-yet-applied entry in order (§5: "applies occur in
    /// strict index order, one at a time").
    pub(crate) fn apply_committed(&mut self) {
        let mut index = self.executor.last_applied + 1;
        while index <= self.log.commit_index() {
            // Install any newer completed snapshot before continuing (§4.5 step 7).
            if let Some(meta) = self.snapshots.complete().cloned() {
                if meta.log_id.index >= index && meta.log_id.index > self.executor.last_applied {
                    if let Ok(Some(mut reader)) = self.snapshots.get_snapshot_by_id(meta.log_id) {
                        if let Ok(bytes) = reader.read_all() {
                            self.executor.restore_snapshot(&meta, &bytes);
                            index = meta.log_id.index + 1;
                            continue;
                        }
                    }
                }
            }
            let entry = match self.log.get(index) {
                Some(e) => e.clone(),
                None => break,
            };
            let outcome = self.executor.apply(&entry);
            for (resolved_index, result) in outcome.results {
                self.resolve_pending_response(resolved_index, result);
            }
            if outcome.snapshot_due && self.role == Role::Leader {
                self.take_snapshot();
            }
            index += 1;
        }
        self.cluster.mark_committed(self.log.commit_index());
    }

    fn resolve_pending_response(&mut self, index: u64, result: Result<Vec<u8>, crate::error::OperationError>) {
        let Some(responder) = self.pending_client_responses.remove(&index) else {
            return;
        };
        let event_index = self.executor.sessions().iter().map(|(_, s)| s.event_index).max().unwrap_or(0);
        match responder {
            client::PendingResponder::Write(tx) => {
                let mapped = result.map(|bytes| client::ClientWriteOk { index, event_index, result: bytes });
                let _ = tx.send(mapped);
            }
            client::PendingResponder::Register(tx) => {
                let mapped = result.and_then(|bytes| serde_json::from_slice::<SessionId>(&bytes).map_err(|e| crate::error::OperationError::InternalError(e.to_string())));
                let _ = tx.send(mapped);
            }
            client::PendingResponder::Unit(tx) => {
                let _ = tx.send(result.map(|_| ()));
            }
            client::PendingResponder::Metadata(tx) => {
                let mapped = result.and_then(|bytes| serde_json::from_slice::<Vec<SessionSummary>>(&bytes).map_err(|e| crate::error::OperationError::InternalError(e.to_string())));
                let _ = tx.send(mapped);
            }
        }
    }

    fn take_snapshot(&mut self) {
        let index = self.executor.last_applied;
        let log_id = LogId::new(self.log.get(index).map(|e| e.log_id.term).unwrap_or(self.current_term), index);
        let bytes = self.executor.take_snapshot(index);
        if let Ok(mut writer) = self.snapshots.create_temporary(log_id, self.cluster.configuration().index) {
            if writer.write_chunk(0, &bytes).is_ok() && writer.finalize().is_ok() {
                self.snapshots.note_persisted(crate::snapshot::SnapshotMeta {
                    log_id,
                    membership_index: self.cluster.configuration().index,
                });
            }
        }
        if self.executor.snapshot_eligible(log_id.index) {
            self.snapshots.mark_complete(log_id);
            let _ = self.log.compact(log_id.index);
        }
    }

    fn map_fatal_storage_error(&self, err: std::io::Error) -> RaftError {
        RaftError::from(err)
    }
}
