//! The single-threaded state-machine executor (§4.5).
//!
//! Applies committed log entries in strict index order against a user-supplied
//! [`StateMachine`], advancing a deterministic clock derived only from entry timestamps
//! (never wall-clock), firing scheduled callbacks, expiring idle sessions, and publishing
//! ordered per-session events. None of this is observable to differ between replicas that
//! have applied the same entry prefix (§8 property 5).

use std::collections::VecDeque;

use crate::config::Config;
use crate::error::OperationError;
use crate::log::segment::EntryPayload;
use crate::log::segment::LogEntry;
use crate::session::SessionId;
use crate::session::SessionManager;
use crate::session::SessionType;
use crate::snapshot::SnapshotMeta;

/// A task scheduled by the user state machine to fire once the executor clock reaches
/// `at`, optionally repeating every `period_ms` thereafter.
pub struct ScheduledTask {
    pub at: u64,
    pub period_ms: Option<u64>,
    pub state_machine: String,
    pub payload: Vec<u8>,
}

/// An event produced while applying a command, destined for one session's pending-event
/// queue with `eventIndex = entry.index` (§4.5 step 5).
pub struct PublishedEvent {
    pub session: SessionId,
    pub state_machine: String,
    pub payload: Vec<u8>,
}

/// The operations an applied entry can ask the user state machine to perform, and the
/// side-effects it may emit back (results, scheduled tasks, published events).
pub trait StateMachine: Send {
    /// Apply a mutating command and return its serialized result (or an application-level
    /// error string, wrapped by the executor as `APPLICATION_ERROR`).
    fn apply_command(&mut self, session: SessionId, sequence: u64, payload: &[u8], ctx: &mut ApplyContext) -> Result<Vec<u8>, String>;

    /// Execute a read-only query against committed state. Never mutates, never schedules,
    /// never publishes.
    fn apply_query(&self, session: SessionId, payload: &[u8]) -> Result<Vec<u8>, String>;

    /// Serialize the entire user-visible state for a snapshot.
    fn snapshot(&self) -> Vec<u8>;

    /// Restore state from a previously-produced snapshot (§8 property 8).
    fn restore(&mut self, bytes: &[u8]);

    /// Fired when a scheduled task's time has come; default no-op for state machines that
    /// never schedule anything.
    fn on_scheduled(&mut self, _state_machine: &str, _payload: &[u8], _ctx: &mut ApplyContext) {}
}

/// Threaded through `apply_command`/`on_scheduled` so user code can publish events and
/// schedule follow-up callbacks without reaching back into executor internals.
#[derive(Default)]
pub struct ApplyContext {
    pub published: Vec<PublishedEvent>,
    pub scheduled: Vec<ScheduledTask>,
}

impl ApplyContext {
    pub fn publish(&mut self, session: SessionId, state_machine: impl Into<String>, payload: Vec<u8>) {
        self.published.push(PublishedEvent {
            session,
            state_machine: state_machine.into(),
            payload,
        });
    }

    pub fn schedule(&mut self, at: u64, period_ms: Option<u64>, state_machine: impl Into<String>, payload: Vec<u8>) {
        self.scheduled.push(ScheduledTask {
            at,
            period_ms,
            state_machine: state_machine.into(),
            payload,
        });
    }
}

/// A snapshot of the executor's bookkeeping (time + cadence) that the owning server context
/// persists so a restart can pick the clock back up from where it left off.
pub struct Executor<S: StateMachine> {
    state_machine: S,
    sessions: SessionManager,
    /// Maximum entry timestamp observed so far; never decreases (§4.5).
    time: u64,
    /// Scheduled tasks sorted ascending by `at`, inserted via binary search (§4.5).
    scheduled: VecDeque<ScheduledTask>,
    snapshot_interval_ms: u64,
    last_snapshot_time: u64,
    last_snapshot_index: u64,
    pub last_applied: u64,
}

impl<S: StateMachine> Executor<S> {
    pub fn new(state_machine: S, config: &Config) -> Self {
        let snapshot_interval_ms = match &config.snapshot_policy {
            crate::config::SnapshotPolicy::TimeSinceLast(ms) => *ms,
            crate::config::SnapshotPolicy::LogsSinceLast(_) => crate::config::SNAPSHOT_INTERVAL_MS,
        };
        Self {
            state_machine,
            sessions: SessionManager::new(),
            time: 0,
            scheduled: VecDeque::new(),
            snapshot_interval_ms,
            last_snapshot_time: 0,
            last_snapshot_index: 0,
            last_applied: 0,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn sessions_mut(&mut self) -> &mut SessionManager {
        &mut self.sessions
    }

    pub fn now(&self) -> u64 {
        self.time
    }

    fn insert_scheduled(&mut self, task: ScheduledTask) {
        let pos = self.scheduled.iter().position(|t| t.at > task.at).unwrap_or(self.scheduled.len());
        self.scheduled.insert(pos, task);
    }

    /// Apply one committed entry, running the seven-step sequence from §4.5. Returns
    /// whatever events were published during this apply, for the caller to route to bound
    /// connections, plus an optional due-for-persistence snapshot signal.
    #[tracing::instrument(level = "debug", skip(self, entry))]
    pub fn apply(&mut self, entry: &LogEntry) -> ApplyOutcome {
        let timestamp = entry_timestamp(&entry.payload);
        // Step 1: advance the deterministic clock.
        self.time = self.time.max(timestamp);

        // Step 2: fire due scheduled tasks, reinserting repeating ones.
        let mut ctx = ApplyContext::default();
        while matches!(self.scheduled.front(), Some(t) if t.at <= self.time) {
            let task = self.scheduled.pop_front().expect("checked by matches! above");
            self.state_machine.on_scheduled(&task.state_machine, &task.payload, &mut ctx);
            if let Some(period) = task.period_ms {
                self.insert_scheduled(ScheduledTask {
                    at: self.time + period,
                    period_ms: Some(period),
                    state_machine: task.state_machine,
                    payload: task.payload,
                });
            }
        }

        // Step 3: expire idle sessions.
        let expired = self.sessions.expire_idle(self.time);

        // Step 4/5: dispatch on entry variant, publishing events keyed by this entry's index.
        let dispatch = self.dispatch(entry, &mut ctx);

        for task in ctx.scheduled {
            self.insert_scheduled(task);
        }
        for event in &ctx.published {
            if let Some(session) = self.sessions.get_mut(event.session) {
                session.enqueue_event(event.state_machine.clone(), event.payload.clone());
            }
        }

        self.last_applied = entry.log_id.index;

        ApplyOutcome {
            results: dispatch,
            expired_sessions: expired,
            snapshot_due: self.time.saturating_sub(self.last_snapshot_time) >= self.snapshot_interval_ms,
        }
    }

    /// Dispatch on entry variant. Returns one `(log index, result)` pair per request this
    /// apply resolves — normally just this entry's own index, but a `Command` whose
    /// `requestSequence` unblocks previously-queued predecessors (or successors) resolves
    /// each of their original indices too (§4.5 command ordering rule).
    fn dispatch(&mut self, entry: &LogEntry, ctx: &mut ApplyContext) -> Vec<(u64, Result<Vec<u8>, OperationError>)> {
        match &entry.payload {
            EntryPayload::Blank => Vec::new(),
            EntryPayload::Configuration(_) => Vec::new(),
            EntryPayload::Normal(bytes) => self.dispatch_normal(entry.log_id.index, bytes, ctx),
        }
    }

    fn dispatch_normal(&mut self, index: u64, bytes: &[u8], ctx: &mut ApplyContext) -> Vec<(u64, Result<Vec<u8>, OperationError>)> {
        let op: NormalOp = match serde_json::from_slice(bytes) {
            Ok(op) => op,
            Err(e) => return vec![(index, Err(OperationError::InternalError(e.to_string())))],
        };
        match op {
            NormalOp::OpenSession { name, session_type, timeout, .. } => {
                let id = self.sessions.register_at(index, name, session_type, timeout, self.time);
                vec![(index, Ok(serde_json::to_vec(&id).expect("u64 serialization cannot fail")))]
            }
            NormalOp::CloseSession { session, .. } => {
                self.sessions.close(session);
                vec![(index, Ok(Vec::new()))]
            }
            NormalOp::KeepAlive { updates, .. } => {
                for update in updates {
                    if let Some(session) = self.sessions.get_mut(update.session) {
                        session.touch(self.time);
                        session.record_result(update.command_sequence, Ok(Vec::new()));
                        session.ack_events(update.event_index);
                        session.bound_connection = update.connection;
                    }
                }
                vec![(index, Ok(Vec::new()))]
            }
            NormalOp::Command { session, sequence, request_sequence, payload, .. } => {
                self.dispatch_command(index, session, request_sequence, sequence, payload, ctx)
            }
            NormalOp::Metadata { .. } => {
                let result = serde_json::to_vec(&self.sessions.summaries()).expect("session summaries always serialize");
                vec![(index, Ok(result))]
            }
        }
    }

    /// Command ordering rule (§4.5): a request whose `requestSequence` has already been
    /// observed is answered immediately (cache hit or null); one that is next in line
    /// applies now; one that arrives ahead of its predecessor is parked in the replay
    /// queue until that predecessor's entry is applied, at which point it (and any further
    /// unblocked successors) apply here, resolved against their own original log indices.
    fn dispatch_command(
        &mut self,
        index: u64,
        session: SessionId,
        request_sequence: u64,
        sequence: u64,
        payload: Vec<u8>,
        ctx: &mut ApplyContext,
    ) -> Vec<(u64, Result<Vec<u8>, OperationError>)> {
        let next_expected = match self.sessions.get(session) {
            Some(s) => s.request_sequence + 1,
            None => return vec![(index, Err(OperationError::UnknownSession))],
        };
        if request_sequence < next_expected {
            return vec![(index, self.apply_command(session, sequence, &payload, ctx))];
        }
        self.sessions
            .accept_command(session, index, request_sequence, sequence, payload)
            .into_iter()
            .map(|(idx, seq, data)| {
                let result = self.apply_command(session, seq, &data, ctx);
                (idx, result)
            })
            .collect()
    }

    fn apply_command(&mut self, session: SessionId, sequence: u64, payload: &[u8], ctx: &mut ApplyContext) -> Result<Vec<u8>, OperationError> {
        let cached = match self.sessions.get(session) {
            Some(s) => s.cached_result(sequence).cloned(),
            None => return Err(OperationError::UnknownSession),
        };
        if let Some(cached) = cached {
            return cached.result.map_err(OperationError::ApplicationError);
        }
        let outcome = self.state_machine.apply_command(session, sequence, payload, ctx);
        if let Some(s) = self.sessions.get_mut(session) {
            s.record_result(sequence, outcome.clone());
            s.last_applied = self.last_applied;
        }
        outcome.map_err(OperationError::ApplicationError)
    }

    /// Answer a read-only query directly from committed state, without logging (§4.5 query
    /// ordering rule). The caller is responsible for enforcing the `(index, sequence)` wait
    /// condition before invoking this.
    pub fn apply_query(&self, session: SessionId, payload: &[u8]) -> Result<Vec<u8>, OperationError> {
        if self.sessions.get(session).is_none() {
            return Err(OperationError::UnknownSession);
        }
        self.state_machine.apply_query(session, payload).map_err(OperationError::ApplicationError)
    }

    /// True once every open session has acknowledged events through `index` — the gate for
    /// promoting a Persisted snapshot to Complete (§3, §4.2, §4.4).
    pub fn snapshot_eligible(&self, index: u64) -> bool {
        self.sessions.min_last_completed() >= index
    }

    pub fn take_snapshot(&mut self, index: u64) -> Vec<u8> {
        self.last_snapshot_time = self.time;
        self.last_snapshot_index = index;
        self.state_machine.snapshot()
    }

    pub fn restore_snapshot(&mut self, meta: &SnapshotMeta, bytes: &[u8]) {
        self.state_machine.restore(bytes);
        self.last_applied = meta.log_id.index;
        self.last_snapshot_index = meta.log_id.index;
    }
}

pub struct ApplyOutcome {
    /// `(log index, result)` for every request this apply resolved — usually this entry's
    /// own index alone, but possibly zero (a command parked in the replay queue) or several
    /// (a command that unblocked predecessors queued at earlier indices).
    pub results: Vec<(u64, Result<Vec<u8>, OperationError>)>,
    pub expired_sessions: Vec<SessionId>,
    pub snapshot_due: bool,
}

fn entry_timestamp(payload: &EntryPayload) -> u64 {
    match payload {
        EntryPayload::Blank => 0,
        EntryPayload::Configuration(cfg) => cfg.timestamp,
        EntryPayload::Normal(bytes) => serde_json::from_slice::<NormalOp>(bytes).ok().map(|op| op.timestamp_hint()).unwrap_or(0),
    }
}

/// The user-opaque `Normal` payload's internal shape. `Command`'s actual operation bytes
/// are themselves opaque to the executor and handed to the user `StateMachine` untouched.
/// Every variant carries the `timestamp` the leader stamped it with at append time (§3) —
/// this is what drives the executor's deterministic clock, never wall-clock (§4.5).
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub enum NormalOp {
    OpenSession { name: String, session_type: SessionType, timeout: u64, timestamp: u64 },
    CloseSession { session: SessionId, timestamp: u64 },
    KeepAlive { updates: Vec<KeepAliveUpdate>, timestamp: u64 },
    Command { session: SessionId, sequence: u64, request_sequence: u64, timestamp: u64, payload: Vec<u8> },
    /// Introspection, logged only to pin its answer to a committed index — it has no
    /// side effect on the user state machine or any session (§3 "non-replicating side
    /// effects").
    Metadata { session: SessionId, timestamp: u64 },
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct KeepAliveUpdate {
    pub session: SessionId,
    pub command_sequence: u64,
    pub event_index: u64,
    pub connection: Option<crate::NodeId>,
}

impl NormalOp {
    fn timestamp_hint(&self) -> u64 {
        match self {
            NormalOp::OpenSession { timestamp, .. } => *timestamp,
            NormalOp::CloseSession { timestamp, .. } => *timestamp,
            NormalOp::KeepAlive { timestamp, .. } => *timestamp,
            NormalOp::Command { timestamp, .. } => *timestamp,
            NormalOp::Metadata { timestamp, .. } => *timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft_types::LogId;

    struct Echo {
        applied: u32,
    }

    impl StateMachine for Echo {
        fn apply_command(&mut self, _session: SessionId, _sequence: u64, payload: &[u8], _ctx: &mut ApplyContext) -> Result<Vec<u8>, String> {
            self.applied += 1;
            Ok(payload.to_vec())
        }
        fn apply_query(&self, _session: SessionId, payload: &[u8]) -> Result<Vec<u8>, String> {
            Ok(payload.to_vec())
        }
        fn snapshot(&self) -> Vec<u8> {
            self.applied.to_be_bytes().to_vec()
        }
        fn restore(&mut self, bytes: &[u8]) {
            self.applied = u32::from_be_bytes(bytes.try_into().unwrap());
        }
    }

    fn command_entry(index: u64, session: SessionId, sequence: u64, timestamp: u64, payload: &[u8]) -> LogEntry {
        command_entry_seq(index, session, sequence, index.saturating_sub(1), timestamp, payload)
    }

    fn command_entry_seq(index: u64, session: SessionId, sequence: u64, request_sequence: u64, timestamp: u64, payload: &[u8]) -> LogEntry {
        let op = NormalOp::Command {
            session,
            sequence,
            request_sequence,
            timestamp,
            payload: payload.to_vec(),
        };
        LogEntry {
            log_id: LogId::new(1, index),
            payload: EntryPayload::Normal(serde_json::to_vec(&op).unwrap().into()),
        }
    }

    fn open_session_entry(index: u64, timeout: u64, timestamp: u64) -> LogEntry {
        let op = NormalOp::OpenSession {
            name: "c1".into(),
            session_type: SessionType::Client,
            timeout,
            timestamp,
        };
        LogEntry {
            log_id: LogId::new(1, index),
            payload: EntryPayload::Normal(serde_json::to_vec(&op).unwrap().into()),
        }
    }

    #[test]
    fn dedup_replays_cached_result_without_reapplying() {
        let config = Config::build("t").validate().unwrap();
        let mut exec = Executor::new(Echo { applied: 0 }, &config);
        exec.apply(&open_session_entry(1, 10_000, 0));
        exec.apply(&command_entry(2, 1, 1, 100, b"x"));
        exec.apply(&command_entry(3, 1, 1, 200, b"x"));
        assert_eq!(exec.state_machine.applied, 1, "duplicate sequence must not re-invoke the state machine");
    }

    #[test]
    fn clock_advances_to_max_observed_timestamp_and_never_goes_back() {
        let config = Config::build("t").validate().unwrap();
        let mut exec = Executor::new(Echo { applied: 0 }, &config);
        exec.apply(&open_session_entry(1, 10_000, 500));
        assert_eq!(exec.now(), 500);
        exec.apply(&command_entry(2, 1, 1, 300, b"x"));
        assert_eq!(exec.now(), 500, "clock must never move backwards");
    }

    #[test]
    fn session_expires_deterministically_once_idle_past_timeout() {
        let config = Config::build("t").validate().unwrap();
        let mut exec = Executor::new(Echo { applied: 0 }, &config);
        exec.apply(&open_session_entry(1, 1000, 0));
        let outcome = exec.apply(&command_entry(2, 2, 1, 2000, b"irrelevant-other-session"));
        assert!(outcome.expired_sessions.contains(&1));
    }
}
