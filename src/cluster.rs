//! Cluster membership (§3 `ClusterConfiguration`, §4.3).

use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::NodeId;

/// The three member roles named in §2/§6: active members vote, passive members replicate
/// asynchronously without a vote, reserve members are stateless standbys.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum MemberType {
    Active,
    Passive,
    Reserve,
}

/// Whether the leader currently considers a member reachable.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum MemberStatus {
    Available,
    Unavailable,
}

/// A single cluster member and the addresses used to reach it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    pub member_type: MemberType,
    pub status: MemberStatus,
    pub server_address: String,
    pub client_address: String,
}

impl Member {
    pub fn new_active(id: NodeId, server_address: impl Into<String>, client_address: impl Into<String>) -> Self {
        Self {
            id,
            member_type: MemberType::Active,
            status: MemberStatus::Available,
            server_address: server_address.into(),
            client_address: client_address.into(),
        }
    }
}

impl Ord for Member {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}
impl PartialOrd for Member {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The configuration in effect at a particular log index (§3).
///
/// Exactly one configuration is active at a time; it takes effect the moment its
/// `Configuration` log entry is *observed* (appended), not when it commits (§3, §4.3).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterConfiguration {
    pub index: u64,
    pub term: u64,
    pub timestamp: u64,
    pub members: BTreeSet<MemberRef>,
}

/// Members are stored sorted by id inside a `BTreeSet` via this thin wrapper so equality
/// and iteration order are both deterministic across replicas.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct MemberRef(pub Member);

impl ClusterConfiguration {
    pub fn new_initial(id: NodeId) -> Self {
        let mut members = BTreeSet::new();
        members.insert(MemberRef(Member::new_active(id, "", "")));
        Self {
            index: 0,
            term: 0,
            timestamp: 0,
            members,
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.iter().any(|m| m.0.id == id)
    }

    pub fn get(&self, id: NodeId) -> Option<&Member> {
        self.members.iter().find(|m| m.0.id == id).map(|m| &m.0)
    }

    pub fn active_ids(&self) -> BTreeSet<NodeId> {
        self.members.iter().filter(|m| m.0.member_type == MemberType::Active).map(|m| m.0.id).collect()
    }

    pub fn passive_ids(&self) -> BTreeSet<NodeId> {
        self.members.iter().filter(|m| m.0.member_type == MemberType::Passive).map(|m| m.0.id).collect()
    }

    pub fn member_type(&self, id: NodeId) -> Option<MemberType> {
        self.get(id).map(|m| m.member_type)
    }
}

/// Tracks the active configuration and enforces the "only one pending configuration at a
/// time" invariant (§4.3).
#[derive(Debug)]
pub struct ClusterState {
    configuration: ClusterConfiguration,
    /// Set while a Configuration entry has been observed (appended) but not yet committed.
    pending_index: Option<u64>,
}

impl ClusterState {
    pub fn new(id: NodeId) -> Self {
        Self {
            configuration: ClusterConfiguration::new_initial(id),
            pending_index: None,
        }
    }

    /// Resume from a configuration recovered from persistent meta (§5), rather than the
    /// placeholder single-member configuration `new` seeds a brand-new node with.
    pub fn with_configuration(configuration: ClusterConfiguration) -> Self {
        Self {
            configuration,
            pending_index: None,
        }
    }

    pub fn configuration(&self) -> &ClusterConfiguration {
        &self.configuration
    }

    /// Apply a newly-observed `Configuration` entry immediately (§3: "takes effect on
    /// observation"). `commit_index` is used to decide whether the prior configuration, if
    /// still pending, should be treated as superseded (e.g. after a leader-change rollback
    /// truncated it away — the caller is expected to have already truncated the log before
    /// calling this again with the replacement).
    pub fn observe(&mut self, cfg: ClusterConfiguration) {
        self.pending_index = Some(cfg.index);
        self.configuration = cfg;
    }

    /// Mark the currently pending configuration committed, once `commit_index` reaches it.
    pub fn mark_committed(&mut self, commit_index: u64) {
        if let Some(idx) = self.pending_index {
            if commit_index >= idx {
                self.pending_index = None;
            }
        }
    }

    /// True while a configuration change has been logged but not yet committed — Join,
    /// Leave, and Reconfigure requests are rejected in this state (§4.3, §4.6).
    pub fn is_configuring(&self) -> bool {
        self.pending_index.is_some()
    }

    pub fn pending_index(&self) -> Option<u64> {
        self.pending_index
    }

    /// Roll the cluster state back to a prior configuration, e.g. when the log suffix
    /// containing the pending Configuration entry is truncated away after a leader change.
    pub fn rollback_to(&mut self, cfg: ClusterConfiguration) {
        self.configuration = cfg;
        self.pending_index = None;
    }

    /// Update a member's liveness status in place. This is leader-observed replication
    /// health (§4.7), not a membership change, so it does not touch `index`/`term` or go
    /// through the log.
    pub fn set_member_status(&mut self, id: NodeId, status: MemberStatus) {
        if let Some(member) = self.configuration.members.iter().find(|m| m.0.id == id).cloned() {
            if member.0.status != status {
                let mut updated = member.0.clone();
                updated.status = status;
                self.configuration.members.remove(&member);
                self.configuration.members.insert(MemberRef(updated));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_configuration_contains_self() {
        let cfg = ClusterConfiguration::new_initial(1);
        assert!(cfg.contains(1));
        assert_eq!(cfg.member_type(1), Some(MemberType::Active));
    }

    #[test]
    fn observing_configuration_marks_pending_until_committed() {
        let mut state = ClusterState::new(1);
        assert!(!state.is_configuring());

        let mut cfg = ClusterConfiguration::new_initial(1);
        cfg.index = 5;
        cfg.members.insert(MemberRef(Member::new_active(2, "a", "a")));
        state.observe(cfg);
        assert!(state.is_configuring());

        state.mark_committed(4);
        assert!(state.is_configuring());

        state.mark_committed(5);
        assert!(!state.is_configuring());
    }
}
