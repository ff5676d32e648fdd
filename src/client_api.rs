//! Ergonomic client-side session handle (§4.4, §6).
//!
//! Wraps a [`Server`] with session bookkeeping — a monotonic command counter doubling as
//! both the dedup key (`commandSequence`) and the ordering gate (`requestSequence`), and
//! the session's acknowledged event index. An application would typically keep one
//! `ClientHandle` per logical client connection rather than calling [`Server`] directly.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::core::client::ConsistencyLevel;
use crate::error::OperationError;
use crate::network::RaftNetwork;
use crate::server::Server;
use crate::session::SessionId;
use crate::session::SessionType;
use crate::state_machine::StateMachine;

/// A session-bound handle to a running server node.
///
/// Deliberately not `Clone`: a session's sequence counter must stay single-owner, or two
/// concurrent issuers could race on the same `requestSequence` (§4.4).
pub struct ClientHandle<N: RaftNetwork, S: StateMachine> {
    server: Server<N, S>,
    session: SessionId,
    sequence: AtomicU64,
    acked_event: AtomicU64,
}

impl<N: RaftNetwork, S: StateMachine> ClientHandle<N, S> {
    /// Open a new session against `server` and wrap it.
    pub async fn open(server: Server<N, S>, name: impl Into<String>, session_type: SessionType, timeout: u64, timestamp: u64) -> Result<Self, OperationError> {
        let session = server.register(name.into(), session_type, timeout, timestamp).await?;
        Ok(Self {
            server,
            session,
            sequence: AtomicU64::new(0),
            acked_event: AtomicU64::new(0),
        })
    }

    /// Wrap an already-open session, e.g. one restored from a reconnecting client's last
    /// known sequence numbers.
    pub fn resume(server: Server<N, S>, session: SessionId, last_sequence: u64, last_acked_event: u64) -> Self {
        Self {
            server,
            session,
            sequence: AtomicU64::new(last_sequence),
            acked_event: AtomicU64::new(last_acked_event),
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Submit a command, assigning the next sequence number automatically. A network-level
    /// retry of the exact same call must reuse the same sequence to dedup correctly — this
    /// handle only ever issues a fresh one, so retries are the caller's responsibility at a
    /// layer that knows whether a prior attempt's outcome is actually unknown.
    pub async fn command(&self, timestamp: u64, payload: Vec<u8>) -> Result<Vec<u8>, OperationError> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let ok = self.server.client_write(self.session, sequence, sequence, timestamp, payload).await?;
        Ok(ok.result)
    }

    /// Submit a query at the given consistency level (§4.5), waiting on the session's own
    /// last-issued command before reading so the caller observes its own writes.
    pub async fn query(&self, index: u64, consistency: ConsistencyLevel, payload: Vec<u8>) -> Result<Vec<u8>, OperationError> {
        let sequence = self.sequence.load(Ordering::SeqCst);
        self.server.client_read(self.session, sequence, index, consistency, payload).await
    }

    /// List every session the server currently knows about (§3, §6 `Metadata`).
    pub async fn metadata(&self, timestamp: u64) -> Result<Vec<crate::session::SessionSummary>, OperationError> {
        self.server.metadata(self.session, timestamp).await
    }

    /// Keep this session alive without submitting a command.
    pub async fn keep_alive(&self, timestamp: u64) -> Result<(), OperationError> {
        self.server.keep_alive(Vec::new(), timestamp).await
    }

    /// Record that the caller has durably delivered every event up through `through`, so
    /// a future `KeepAlive` need not redeliver them (§4.4).
    pub fn ack_events(&self, through: u64) {
        self.acked_event.fetch_max(through, Ordering::SeqCst);
    }

    /// Close this session early, freeing its server-side state immediately instead of
    /// waiting for the idle timeout (§4.4).
    pub async fn close(&self, timestamp: u64) -> Result<(), OperationError> {
        self.server.close_session(self.session, timestamp).await
    }
}
