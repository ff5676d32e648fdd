//! Client-facing request plane: Command, Query, Register, KeepAlive, CloseSession (§4.4, §6).
//!
//! A mutating request becomes a log entry; the caller's response channel is parked until
//! the entry both commits and is applied, at which point [`RaftCore::apply_committed`]
//! resolves it with the executor's result. A request this server cannot service itself
//! (wrong role, no leader known) is answered immediately with the appropriate error.

use tokio::sync::oneshot;

use crate::core::RaftCore;
use crate::core::Role;
use crate::error::OperationError;
use crate::log::segment::EntryPayload;
use crate::network::RaftNetwork;
use crate::session::SessionId;
use crate::session::SessionSummary;
use crate::session::SessionType;
use crate::state_machine::NormalOp;
use crate::state_machine::StateMachine;

pub struct ClientWriteRequestEntry {
    pub session: SessionId,
    pub sequence: u64,
    pub request_sequence: u64,
    pub timestamp: u64,
    pub payload: Vec<u8>,
    pub tx: oneshot::Sender<Result<ClientWriteOk, OperationError>>,
}

pub struct ClientWriteOk {
    pub index: u64,
    pub event_index: u64,
    pub result: Vec<u8>,
}

pub struct ClientReadRequestEntry {
    pub session: SessionId,
    pub sequence: u64,
    pub index: u64,
    pub consistency: ConsistencyLevel,
    pub payload: Vec<u8>,
    pub tx: oneshot::Sender<Result<Vec<u8>, OperationError>>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ConsistencyLevel {
    Sequential,
    LinearizableLease,
    Linearizable,
}

pub struct RegisterRequestEntry {
    pub name: String,
    pub session_type: SessionType,
    pub timeout: u64,
    pub timestamp: u64,
    pub tx: oneshot::Sender<Result<SessionId, OperationError>>,
}

pub struct KeepAliveRequestEntry {
    pub updates: Vec<crate::state_machine::KeepAliveUpdate>,
    pub timestamp: u64,
    pub tx: oneshot::Sender<Result<(), OperationError>>,
}

pub struct CloseSessionRequestEntry {
    pub session: SessionId,
    pub timestamp: u64,
    pub tx: oneshot::Sender<Result<(), OperationError>>,
}

/// `Metadata {session} -> {sessions[]}` (§3, §6): logged only so its answer is pinned to a
/// committed index, with no side effect on any session or the user state machine.
pub struct MetadataRequestEntry {
    pub session: SessionId,
    pub timestamp: u64,
    pub tx: oneshot::Sender<Result<Vec<SessionSummary>, OperationError>>,
}

/// What a parked client request is waiting to be told once its log index applies.
pub(crate) enum PendingResponder {
    Write(oneshot::Sender<Result<ClientWriteOk, OperationError>>),
    Register(oneshot::Sender<Result<SessionId, OperationError>>),
    Unit(oneshot::Sender<Result<(), OperationError>>),
    Metadata(oneshot::Sender<Result<Vec<SessionSummary>, OperationError>>),
}

impl<N: RaftNetwork, S: StateMachine> RaftCore<N, S> {
    fn append_normal(&mut self, op: NormalOp) -> Result<u64, OperationError> {
        let bytes = serde_json::to_vec(&op).map_err(|e| OperationError::InternalError(e.to_string()))?;
        let indexed = self.log.append(self.current_term, EntryPayload::Normal(bytes.into())).map_err(|e| OperationError::InternalError(e.to_string()))?;
        Ok(indexed.log_id.index)
    }

    pub(crate) async fn handle_client_write(&mut self, req: ClientWriteRequestEntry) -> crate::error::RaftResult<()> {
        if self.role != Role::Leader {
            let _ = req.tx.send(Err(leader_routing_error(self.current_leader)));
            return Ok(());
        }
        let Some(session) = self.executor.sessions().get(req.session) else {
            let _ = req.tx.send(Err(OperationError::UnknownSession));
            return Ok(());
        };
        if let Some(cached) = session.cached_result(req.sequence) {
            let result = cached.result.clone();
            let _ = req.tx.send(result.map(|bytes| ClientWriteOk { index: 0, event_index: session.event_index, result: bytes }).map_err(OperationError::ApplicationError));
            return Ok(());
        }
        if req.request_sequence <= session.request_sequence && session.request_sequence != 0 {
            let _ = req.tx.send(Err(OperationError::CommandError { last_sequence: session.command_sequence }));
            return Ok(());
        }

        let op = NormalOp::Command {
            session: req.session,
            sequence: req.sequence,
            request_sequence: req.request_sequence,
            timestamp: req.timestamp,
            payload: req.payload,
        };
        match self.append_normal(op) {
            Ok(index) => {
                self.pending_client_responses.insert(index, PendingResponder::Write(req.tx));
                self.apply_committed_if_self_quorum(index);
            }
            Err(err) => {
                let _ = req.tx.send(Err(err));
            }
        }
        Ok(())
    }

    pub(crate) async fn handle_client_read(&mut self, req: ClientReadRequestEntry) -> crate::error::RaftResult<()> {
        if self.role != Role::Leader {
            let _ = req.tx.send(Err(OperationError::NoLeader));
            return Ok(());
        }
        let ready = self
            .executor
            .sessions()
            .get(req.session)
            .map(|s| s.command_sequence + 1 >= req.sequence && self.executor.last_applied >= req.index)
            .unwrap_or(false);
        if !ready {
            let _ = req.tx.send(Err(OperationError::QueryError));
            return Ok(());
        }
        if req.consistency == ConsistencyLevel::Linearizable || req.consistency == ConsistencyLevel::LinearizableLease {
            // Re-verify leadership with a heartbeat round before answering (§4.5).
            if !self.confirm_leadership_via_heartbeat().await {
                let _ = req.tx.send(Err(OperationError::NoLeader));
                return Ok(());
            }
        }
        let result = self.executor.apply_query(req.session, &req.payload);
        let _ = req.tx.send(result);
        Ok(())
    }

    pub(crate) async fn handle_register(&mut self, req: RegisterRequestEntry) -> crate::error::RaftResult<()> {
        if self.role != Role::Leader {
            let _ = req.tx.send(Err(leader_routing_error(self.current_leader)));
            return Ok(());
        }
        let op = NormalOp::OpenSession {
            name: req.name,
            session_type: req.session_type,
            timeout: req.timeout,
            timestamp: req.timestamp,
        };
        match self.append_normal(op) {
            Ok(index) => {
                self.pending_client_responses.insert(index, PendingResponder::Register(req.tx));
                self.apply_committed_if_self_quorum(index);
            }
            Err(err) => {
                let _ = req.tx.send(Err(err));
            }
        }
        Ok(())
    }

    pub(crate) async fn handle_keep_alive(&mut self, req: KeepAliveRequestEntry) -> crate::error::RaftResult<()> {
        if self.role != Role::Leader {
            let _ = req.tx.send(Err(leader_routing_error(self.current_leader)));
            return Ok(());
        }
        let op = NormalOp::KeepAlive {
            updates: req.updates,
            timestamp: req.timestamp,
        };
        match self.append_normal(op) {
            Ok(index) => {
                self.pending_client_responses.insert(index, PendingResponder::Unit(req.tx));
                self.apply_committed_if_self_quorum(index);
            }
            Err(err) => {
                let _ = req.tx.send(Err(err));
            }
        }
        Ok(())
    }

    pub(crate) async fn handle_close_session(&mut self, req: CloseSessionRequestEntry) -> crate::error::RaftResult<()> {
        if self.role != Role::Leader {
            let _ = req.tx.send(Err(leader_routing_error(self.current_leader)));
            return Ok(());
        }
        let op = NormalOp::CloseSession {
            session: req.session,
            timestamp: req.timestamp,
        };
        match self.append_normal(op) {
            Ok(index) => {
                self.pending_client_responses.insert(index, PendingResponder::Unit(req.tx));
                self.apply_committed_if_self_quorum(index);
            }
            Err(err) => {
                let _ = req.tx.send(Err(err));
            }
        }
        Ok(())
    }

    pub(crate) async fn handle_metadata(&mut self, req: MetadataRequestEntry) -> crate::error::RaftResult<()> {
        if self.role != Role::Leader {
            let _ = req.tx.send(Err(leader_routing_error(self.current_leader)));
            return Ok(());
        }
        if self.executor.sessions().get(req.session).is_none() {
            let _ = req.tx.send(Err(OperationError::UnknownSession));
            return Ok(());
        }
        let op = NormalOp::Metadata {
            session: req.session,
            timestamp: req.timestamp,
        };
        match self.append_normal(op) {
            Ok(index) => {
                self.pending_client_responses.insert(index, PendingResponder::Metadata(req.tx));
                self.apply_committed_if_self_quorum(index);
            }
            Err(err) => {
                let _ = req.tx.send(Err(err));
            }
        }
        Ok(())
    }

    /// For a single-node cluster the entry just appended is already committed; give apply a
    /// chance to run immediately rather than waiting for the next heartbeat/append cycle.
    fn apply_committed_if_self_quorum(&mut self, index: u64) {
        if self.cluster.configuration().active_ids().len() <= 1 {
            self.log.commit(index);
        }
        self.apply_committed();
    }

    async fn confirm_leadership_via_heartbeat(&mut self) -> bool {
        self.leader_append_cycle().await.is_ok() && self.role == Role::Leader
    }
}

/// Requests that arrive at a non-leader are reported `NoLeader`; the caller (`ClientHandle`
/// in `crate::client_api`) is responsible for redirecting to `current_leader` when known,
/// mirroring the `ForwardToLeader` variants in `crate::error`.
fn leader_routing_error(_current_leader: Option<crate::NodeId>) -> OperationError {
    OperationError::NoLeader
}
