//! The error taxonomy surfaced by this crate (§7).

use crate::NodeId;

/// Errors coming out of the core Raft task.
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("the Raft node is shutting down")]
    ShuttingDown,
    #[error("fatal storage error: {0}")]
    RaftStorage(#[from] anyhow::Error),
    #[error(transparent)]
    RaftNetwork(anyhow::Error),
    #[error("mismatched snapshot segment, expected {expect:?} got {got:?}")]
    SnapshotMismatch {
        expect: crate::raft_types::SnapshotSegmentId,
        got: crate::raft_types::SnapshotSegmentId,
    },
}

impl From<std::io::Error> for RaftError {
    fn from(err: std::io::Error) -> Self {
        RaftError::RaftStorage(err.into())
    }
}

pub type RaftResult<T> = Result<T, RaftError>;

/// Error returned from `Raft::initialize`.
#[derive(Debug, thiserror::Error)]
pub enum InitializeError {
    #[error("the cluster is already operating, this call is not allowed")]
    NotAllowed,
    #[error(transparent)]
    RaftError(#[from] RaftError),
}

/// Error returned from a membership change call (`add_non_voter`, `change_membership`, or
/// the Configure/Join/Leave/Reconfigure request plane in §6).
#[derive(Debug, thiserror::Error)]
pub enum ChangeConfigError {
    #[error("this node is not the cluster leader, known leader: {0:?}")]
    NodeNotLeader(Option<NodeId>),
    #[error("a configuration change is already in progress")]
    ConfigChangeInProgress,
    #[error("proposed membership would leave the cluster with no members")]
    InoperableConfig,
    #[error("requested change is already satisfied, nothing to do")]
    Noop,
    #[error(transparent)]
    RaftError(#[from] RaftError),
}

/// Error returned from the internal admin response channel.
#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    #[error(transparent)]
    ChangeConfig(#[from] ChangeConfigError),
    #[error(transparent)]
    RaftError(#[from] RaftError),
}

/// Error returned from `Raft::client_read` / a `Query` request (§6, §7).
#[derive(Debug, thiserror::Error)]
pub enum ClientReadError {
    #[error(transparent)]
    RaftError(#[from] RaftError),
    #[error("this node is not the leader, forward to: {0:?}")]
    ForwardToLeader(Option<NodeId>),
    #[error("the consistency level requested could not be honored: {0}")]
    QueryError(#[from] QueryError),
}

/// Error returned from `Raft::client_write` / a `Command` request (§6, §7).
#[derive(Debug, thiserror::Error)]
pub enum ClientWriteError<D> {
    #[error(transparent)]
    RaftError(#[from] RaftError),
    #[error("this node is not the leader, forward to: {1:?}")]
    ForwardToLeader(D, Option<NodeId>),
    #[error("command sequence rejected: {0}")]
    CommandError(#[from] CommandError),
}

/// §4.4 dedup rejection: the request's sequence has already been superseded.
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("stale command sequence, last accepted sequence was {last_sequence}")]
pub struct CommandError {
    pub last_sequence: u64,
}

/// §4.5 query ordering rejection (e.g. a linearizable lease has expired).
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("query could not be linearized at the requested consistency level")]
pub struct QueryError;

/// The taxonomy named explicitly in spec §7, used by the client-facing request plane
/// (`crate::server`) to report well-known conditions that are not necessarily fatal to the
/// server task itself.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum OperationError {
    #[error("no leader is currently known")]
    NoLeader,
    #[error("this server's role cannot service the request")]
    IllegalMemberState,
    #[error("unknown or expired session")]
    UnknownSession,
    #[error("unknown state machine")]
    UnknownStateMachine,
    #[error("command sequence error, last accepted sequence was {last_sequence}")]
    CommandError { last_sequence: u64 },
    #[error("query could not be linearized")]
    QueryError,
    #[error("configuration change rejected: {0}")]
    ConfigurationError(String),
    #[error("the application state machine returned an error: {0}")]
    ApplicationError(String),
    #[error("internal error: {0}")]
    InternalError(String),
}
