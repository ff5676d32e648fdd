//! Client sessions: linearizable command sequencing, response deduplication, and ordered
//! event delivery (§4.4).
//!
//! A session is opened with `Register`, kept alive with periodic `KeepAlive` requests (or
//! implicitly by any command/query), and expires at *apply time* — driven by the
//! deterministic state-machine clock, never wall-clock — once `session_timeout` has elapsed
//! since its last activity (§4.5). Commands are deduplicated by `commandSequence`: a
//! command whose sequence has already been applied replays the cached
//! [`OperationResult`] instead of re-executing it, so at-least-once client retries still
//! produce exactly-once apply semantics.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use serde::Deserialize;
use serde::Serialize;

use crate::NodeId;

pub type SessionId = u64;

/// What kind of client this session belongs to — a plain external client, or a server
/// acting as a session-bound proxy for a nested state machine (§3).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SessionType {
    Client,
    Server,
}

/// Whether a session is still servicing requests.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SessionState {
    Open,
    Expired,
    Closed,
}

/// The cached result of a previously-applied command, keyed by `commandSequence` so a
/// duplicate submission can be answered without re-running application logic.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationResult {
    pub sequence: u64,
    pub result: Result<Vec<u8>, String>,
}

/// An event queued for delivery to a session's bound connection, ordered by `eventIndex` so
/// a reconnecting client can resume exactly where it left off (§4.4).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingEvent {
    pub event_index: u64,
    pub state_machine: String,
    pub payload: Vec<u8>,
}

/// How many of a session's most recent command results are retained for dedup replay
/// before the oldest is evicted (§4.4: "bounded response caching").
pub const MAX_PENDING_RESULTS: usize = 64;

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub session_type: SessionType,
    /// Idle timeout in ms, measured against the deterministic executor clock.
    pub timeout: u64,
    /// Last time (executor clock, ms) this session was observed active.
    pub timestamp: u64,
    /// Highest `commandSequence` applied so far.
    pub command_sequence: u64,
    /// Highest `requestSequence` observed so far, used to drop out-of-order command
    /// re-deliveries that have not yet had their predecessor applied.
    pub request_sequence: u64,
    /// Monotonic counter for events published to this session.
    pub event_index: u64,
    pub last_applied: u64,
    /// The highest snapshot index this session is known to have acknowledged via
    /// keep-alive, gating when that snapshot may be marked complete (§4.2, §4.4).
    pub last_completed: u64,
    pub state: SessionState,
    pending_results: VecDeque<OperationResult>,
    pending_events: VecDeque<PendingEvent>,
    /// The connection (if any) currently bound to stream events to this session.
    pub bound_connection: Option<NodeId>,
}

impl Session {
    fn new(id: SessionId, name: impl Into<String>, session_type: SessionType, timeout: u64, now: u64) -> Self {
        Self {
            id,
            name: name.into(),
            session_type,
            timeout,
            timestamp: now,
            command_sequence: 0,
            request_sequence: 0,
            event_index: 0,
            last_applied: 0,
            last_completed: 0,
            state: SessionState::Open,
            pending_results: VecDeque::new(),
            pending_events: VecDeque::new(),
            bound_connection: None,
        }
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        self.state == SessionState::Open && now.saturating_sub(self.timestamp) > self.timeout
    }

    pub fn touch(&mut self, now: u64) {
        self.timestamp = now;
    }

    /// Look up a previously-applied command's result by sequence, for dedup replay.
    pub fn cached_result(&self, sequence: u64) -> Option<&OperationResult> {
        self.pending_results.iter().find(|r| r.sequence == sequence)
    }

    /// Record a freshly-applied command's result, evicting the oldest if the cache is full.
    pub fn record_result(&mut self, sequence: u64, result: Result<Vec<u8>, String>) {
        if self.pending_results.len() >= MAX_PENDING_RESULTS {
            self.pending_results.pop_front();
        }
        self.pending_results.push_back(OperationResult { sequence, result });
        self.command_sequence = self.command_sequence.max(sequence);
    }

    pub fn enqueue_event(&mut self, state_machine: impl Into<String>, payload: Vec<u8>) -> u64 {
        self.event_index += 1;
        self.pending_events.push_back(PendingEvent {
            event_index: self.event_index,
            state_machine: state_machine.into(),
            payload,
        });
        self.event_index
    }

    /// Drain events the client has acknowledged up to and including `through`.
    pub fn ack_events(&mut self, through: u64) {
        while matches!(self.pending_events.front(), Some(e) if e.event_index <= through) {
            self.pending_events.pop_front();
        }
    }

    pub fn pending_events(&self) -> impl Iterator<Item = &PendingEvent> {
        self.pending_events.iter()
    }
}

/// A read-only view of one session's bookkeeping, returned by the `Metadata` operation
/// (§3). Carries everything in the spec's Session shape except the bulky internal caches
/// (`pendingResults`, `pendingEvents`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub name: String,
    pub session_type: SessionType,
    pub timeout: u64,
    pub timestamp: u64,
    pub command_sequence: u64,
    pub request_sequence: u64,
    pub event_index: u64,
    pub last_applied: u64,
    pub last_completed: u64,
    pub state: SessionState,
    pub bound_connection: Option<NodeId>,
}

impl From<&Session> for SessionSummary {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id,
            name: s.name.clone(),
            session_type: s.session_type,
            timeout: s.timeout,
            timestamp: s.timestamp,
            command_sequence: s.command_sequence,
            request_sequence: s.request_sequence,
            event_index: s.event_index,
            last_applied: s.last_applied,
            last_completed: s.last_completed,
            state: s.state,
            bound_connection: s.bound_connection,
        }
    }
}

/// Owns every open session for one server and its per-`requestSequence` replay queue.
#[derive(Default)]
pub struct SessionManager {
    sessions: BTreeMap<SessionId, Session>,
    /// Commands that arrived with a `requestSequence` ahead of what has been observed,
    /// queued until the missing predecessor arrives (§4.4 "command replay queue").
    replay_queue: BTreeMap<SessionId, BTreeMap<u64, QueuedCommand>>,
}

#[derive(Clone, Debug)]
pub struct QueuedCommand {
    pub index: u64,
    pub command_sequence: u64,
    pub payload: Vec<u8>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session whose id is the log index of its `OpenSession` entry (§3: "the session
    /// id equals the log index of its OpenSession entry"), not an independently assigned
    /// counter — every replica applying the same entry must derive the same id.
    pub fn register_at(&mut self, id: SessionId, name: impl Into<String>, session_type: SessionType, timeout: u64, now: u64) -> SessionId {
        self.sessions.insert(id, Session::new(id, name, session_type, timeout, now));
        id
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn close(&mut self, id: SessionId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.state = SessionState::Closed;
        }
        self.replay_queue.remove(&id);
    }

    /// Expire every session idle past its timeout, called once per apply at the
    /// deterministic clock's current value (§4.5 step: "session expiration at apply time").
    pub fn expire_idle(&mut self, now: u64) -> Vec<SessionId> {
        let mut expired = Vec::new();
        for (id, session) in self.sessions.iter_mut() {
            if session.is_expired_at(now) {
                session.state = SessionState::Expired;
                expired.push(*id);
            }
        }
        for id in &expired {
            self.replay_queue.remove(id);
        }
        expired
    }

    /// Accept a command for in-order application, buffering it in the replay queue if its
    /// `request_sequence` arrived ahead of the session's next-expected sequence. Returns the
    /// commands (in order, each tagged with the log index it was logged at) that are now
    /// ready to apply, which may include this one and any subsequently-unblocked queued
    /// commands. Callers are expected to have already filtered out `request_sequence` values
    /// below the next-expected one (those are answered directly from `cached_result`, not
    /// routed through the queue).
    pub fn accept_command(
        &mut self,
        id: SessionId,
        index: u64,
        request_sequence: u64,
        command_sequence: u64,
        payload: Vec<u8>,
    ) -> Vec<(u64, u64, Vec<u8>)> {
        let next_expected = match self.sessions.get(&id) {
            Some(s) => s.request_sequence + 1,
            None => return Vec::new(),
        };
        if request_sequence < next_expected {
            return Vec::new();
        }
        let queue = self.replay_queue.entry(id).or_default();
        queue.insert(request_sequence, QueuedCommand { index, command_sequence, payload });

        let mut ready = Vec::new();
        let mut expect = next_expected;
        while let Some(cmd) = queue.remove(&expect) {
            ready.push((cmd.index, cmd.command_sequence, cmd.payload));
            expect += 1;
        }
        if let Some(session) = self.sessions.get_mut(&id) {
            if expect > next_expected {
                session.request_sequence = expect - 1;
            }
        }
        ready
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SessionId, &Session)> {
        self.sessions.iter()
    }

    /// The introspection view served by `Metadata` (§3, §6: `Metadata {session} -> {sessions[]}`).
    pub fn summaries(&self) -> Vec<SessionSummary> {
        self.sessions.values().map(SessionSummary::from).collect()
    }

    /// The minimum `lastCompleted` across every open session, used to decide whether a
    /// pending snapshot may transition from Persisted to Complete (§4.2, §4.4).
    pub fn min_last_completed(&self) -> u64 {
        self.sessions.values().filter(|s| s.state == SessionState::Open).map(|s| s.last_completed).min().unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_expire_after_timeout() {
        let mut mgr = SessionManager::new();
        let id = mgr.register_at(1, "c1", SessionType::Client, 100, 0);
        assert!(mgr.expire_idle(50).is_empty());
        let expired = mgr.expire_idle(200);
        assert_eq!(expired, vec![id]);
        assert_eq!(mgr.get(id).unwrap().state, SessionState::Expired);
    }

    #[test]
    fn dedup_replays_cached_result_instead_of_reapplying() {
        let mut mgr = SessionManager::new();
        let id = mgr.register_at(1, "c1", SessionType::Client, 1000, 0);
        let session = mgr.get_mut(id).unwrap();
        session.record_result(1, Ok(b"ok".to_vec()));
        assert!(session.cached_result(1).is_some());
        assert!(session.cached_result(2).is_none());
    }

    #[test]
    fn out_of_order_commands_queue_until_predecessor_arrives() {
        let mut mgr = SessionManager::new();
        let id = mgr.register_at(1, "c1", SessionType::Client, 1000, 0);
        let ready = mgr.accept_command(id, 11, 2, 2, b"second".to_vec());
        assert!(ready.is_empty(), "sequence 2 arrived before 1, must queue");
        let ready = mgr.accept_command(id, 10, 1, 1, b"first".to_vec());
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].2, b"first".to_vec());
        assert_eq!(ready[1].2, b"second".to_vec());
        assert_eq!(ready[0].0, 10);
        assert_eq!(ready[1].0, 11);
    }

    #[test]
    fn event_ack_drains_only_through_requested_index() {
        let mut mgr = SessionManager::new();
        let id = mgr.register_at(1, "c1", SessionType::Client, 1000, 0);
        let session = mgr.get_mut(id).unwrap();
        session.enqueue_event("kv", b"a".to_vec());
        session.enqueue_event("kv", b"b".to_vec());
        session.ack_events(1);
        assert_eq!(session.pending_events().count(), 1);
    }
}
