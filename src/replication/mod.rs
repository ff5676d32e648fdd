//! The leader-side replication engine: per-follower append cycles, quorum commit via the
//! median `matchIndex`, and liveness tracking (§4.7).

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;
use tokio::time::Instant;

use crate::cluster::MemberStatus;
use crate::core::RaftCore;
use crate::core::Role;
use crate::error::RaftResult;
use crate::network::AppendEntriesRequest;
use crate::network::RaftNetwork;
use crate::quorum::median_index;
use crate::state_machine::StateMachine;
use crate::NodeId;

/// Per-follower replication progress (§4.7: `nextIndex`, `matchIndex`, `lastAttemptTime`,
/// `failureCount`).
#[derive(Clone, Debug)]
struct FollowerReplication {
    next_index: u64,
    match_index: u64,
    last_attempt: Option<Instant>,
    failure_count: u32,
}

impl FollowerReplication {
    fn new(last_index: u64) -> Self {
        Self {
            next_index: last_index + 1,
            match_index: 0,
            last_attempt: None,
            failure_count: 0,
        }
    }
}

/// A point-in-time view of one follower's replication progress, reported through
/// `ServerMetrics::leader_metrics` (§5).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicationMetrics {
    pub match_index: u64,
    pub next_index: u64,
}

/// Owned by a leader only. Dropped the moment the role changes away from `Leader`
/// (`RaftCore::set_role`), so a demoted node carries no stale follower state into its next
/// term as leader.
pub struct LeaderAppender {
    followers: BTreeMap<NodeId, FollowerReplication>,
}

impl LeaderAppender {
    /// `self_id` is excluded from the tracked set: a leader is not its own follower, and
    /// routing an AppendEntries to itself through the network layer would block the same
    /// single-threaded task the reply is awaited on.
    pub fn new(self_id: NodeId, active_ids: &BTreeSet<NodeId>, last_index: u64) -> Self {
        let followers = active_ids.iter().filter(|id| **id != self_id).map(|id| (*id, FollowerReplication::new(last_index))).collect();
        Self { followers }
    }

    /// Reconcile tracked followers against a freshly observed configuration (§4.3): newly
    /// active members start at the leader's current last index, members no longer active
    /// are dropped.
    pub fn sync_members(&mut self, self_id: NodeId, active_ids: &BTreeSet<NodeId>, last_index: u64) {
        self.followers.retain(|id, _| active_ids.contains(id) && *id != self_id);
        for id in active_ids.iter().filter(|id| **id != self_id) {
            self.followers.entry(*id).or_insert_with(|| FollowerReplication::new(last_index));
        }
    }

    pub fn metrics(&self) -> crate::metrics::LeaderMetrics {
        crate::metrics::LeaderMetrics {
            replication: self
                .followers
                .iter()
                .map(|(id, f)| {
                    (
                        *id,
                        ReplicationMetrics {
                            match_index: f.match_index,
                            next_index: f.next_index,
                        },
                    )
                })
                .collect(),
        }
    }
}

impl<N: RaftNetwork, S: StateMachine> RaftCore<N, S> {
    /// One round of the leader's append cycle: send every follower due for an append (or
    /// bare heartbeat) its batch, fold successes into `nextIndex`/`matchIndex`, and
    /// recompute the quorum commit index from the resulting `matchIndex` set (§4.7).
    pub(crate) async fn leader_append_cycle(&mut self) -> RaftResult<()> {
        let targets: Vec<NodeId> = match self.appender.as_ref() {
            Some(a) => a.followers.keys().copied().collect(),
            None => return Ok(()),
        };
        let term = self.current_term;
        let leader = self.id;
        let commit_index = self.log.commit_index();
        let last_index = self.log.last_index();
        let max_entries = self.config.max_payload_entries.max(1);
        let heartbeat_interval = self.config.heartbeat_interval;
        let max_failures = self.config.max_append_failures;

        for target in targets {
            if target == self.id {
                continue;
            }
            let Some((next_index, due)) = self.appender.as_ref().and_then(|a| a.followers.get(&target)).map(|f| {
                let due = f.last_attempt.map(|at| at.elapsed().as_millis() as u64 >= heartbeat_interval).unwrap_or(true);
                (f.next_index, due)
            }) else {
                continue;
            };
            if !due {
                continue;
            }

            let prev_index = next_index.saturating_sub(1);
            let prev_term = if prev_index == 0 { 0 } else { self.log.get(prev_index).map(|e| e.log_id.term).unwrap_or(0) };
            let last_batch_index = last_index.min(next_index + max_entries - 1);
            let entries: Vec<_> = (next_index..=last_batch_index).filter(|&i| i >= next_index).filter_map(|i| self.log.get(i).cloned()).collect();
            let entries_len = entries.len() as u64;

            let req = AppendEntriesRequest {
                term,
                leader,
                log_index: prev_index,
                log_term: prev_term,
                entries,
                commit_index,
            };

            if let Some(f) = self.appender.as_mut().and_then(|a| a.followers.get_mut(&target)) {
                f.last_attempt = Some(Instant::now());
            }

            match self.network.send_append_entries(target, req).await {
                Ok(resp) => {
                    if resp.term > term {
                        self.update_current_term(resp.term, None)?;
                        self.set_role(Role::Follower);
                        return Ok(());
                    }
                    if resp.succeeded {
                        let advanced_to = prev_index + entries_len;
                        self.cluster.set_member_status(target, MemberStatus::Available);
                        if let Some(f) = self.appender.as_mut().and_then(|a| a.followers.get_mut(&target)) {
                            f.match_index = f.match_index.max(advanced_to);
                            f.next_index = advanced_to + 1;
                            f.failure_count = 0;
                        }
                    } else {
                        self.note_append_failure(target, max_failures);
                        if let Some(f) = self.appender.as_mut().and_then(|a| a.followers.get_mut(&target)) {
                            f.next_index = resp.log_index.saturating_add(1).max(1);
                        }
                    }
                }
                Err(_) => {
                    self.note_append_failure(target, max_failures);
                }
            }
        }

        self.recompute_commit_index();
        self.apply_committed();
        Ok(())
    }

    fn note_append_failure(&mut self, target: NodeId, max_failures: u32) {
        let crossed = self.appender.as_mut().and_then(|a| a.followers.get_mut(&target)).map(|f| {
            f.failure_count += 1;
            f.failure_count >= max_failures
        });
        if crossed == Some(true) {
            self.cluster.set_member_status(target, MemberStatus::Unavailable);
        }
    }

    /// Quorum commit: the highest index acknowledged by a majority of active members,
    /// restricted to entries from the current term so a leader never commits a prior
    /// term's entry by count alone (§4.7, the classic Raft figure-8 safeguard).
    fn recompute_commit_index(&mut self) {
        let Some(appender) = self.appender.as_ref() else { return };
        let active = self.cluster.configuration().active_ids();
        if active.is_empty() {
            return;
        }
        let indices: Vec<u64> = active
            .iter()
            .map(|id| if *id == self.id { self.log.last_index() } else { appender.followers.get(id).map(|f| f.match_index).unwrap_or(0) })
            .collect();
        let candidate = median_index(indices);
        if candidate <= self.log.commit_index() {
            return;
        }
        if self.log.get(candidate).map(|e| e.log_id.term) != Some(self.current_term) {
            return;
        }
        self.log.commit(candidate);
    }
}
