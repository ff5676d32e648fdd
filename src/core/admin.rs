//! Cluster bootstrap and membership-change admin calls (§4.3, §4.6, §6
//! `Configure/Join/Leave/Reconfigure`).

use crate::cluster::ClusterConfiguration;
use crate::cluster::Member;
use crate::cluster::MemberRef;
use crate::cluster::MemberStatus;
use crate::cluster::MemberType;
use crate::core::RaftCore;
use crate::core::Role;
use crate::error::ChangeConfigError;
use crate::error::InitializeError;
use crate::log::segment::EntryPayload;
use crate::network::RaftNetwork;
use crate::state_machine::StateMachine;
use crate::NodeId;

impl<N: RaftNetwork, S: StateMachine> RaftCore<N, S> {
    /// Bootstrap a brand-new cluster from this node alone (§8 S1). Only valid before any
    /// entry has ever been appended.
    pub(crate) async fn handle_initialize(&mut self) -> Result<(), InitializeError> {
        if self.log.last_index() != 0 || self.current_term != 0 {
            return Err(InitializeError::NotAllowed);
        }
        self.current_term = 1;
        self.voted_for = Some(self.id);
        self.persist_meta().map_err(crate::error::RaftError::from)?;
        self.become_leader().await?;
        Ok(())
    }

    /// Apply a Join/Leave/Reconfigure request. Rejected outright while a configuration
    /// change is already pending, or while this node is not the leader (§4.3).
    pub(crate) async fn handle_change_membership(&mut self, members: Vec<(NodeId, MemberType, String, String)>) -> Result<(), ChangeConfigError> {
        if self.role != Role::Leader {
            return Err(ChangeConfigError::NodeNotLeader(self.current_leader));
        }
        if self.cluster.is_configuring() {
            return Err(ChangeConfigError::ConfigChangeInProgress);
        }
        if members.is_empty() {
            return Err(ChangeConfigError::InoperableConfig);
        }

        let current = self.cluster.configuration();
        let mut new_members = current.members.clone();
        for (id, member_type, server_address, client_address) in &members {
            new_members.retain(|m| m.0.id != *id);
            new_members.insert(MemberRef(Member {
                id: *id,
                member_type: *member_type,
                status: MemberStatus::Available,
                server_address: server_address.clone(),
                client_address: client_address.clone(),
            }));
        }
        if new_members.iter().filter(|m| m.0.member_type == MemberType::Active).count() == 0 {
            return Err(ChangeConfigError::InoperableConfig);
        }
        if new_members == current.members {
            return Err(ChangeConfigError::Noop);
        }

        let index = self.log.last_index() + 1;
        let cfg = ClusterConfiguration {
            index,
            term: self.current_term,
            timestamp: self.executor.now(),
            members: new_members,
        };
        self.log.append(self.current_term, EntryPayload::Configuration(cfg.clone())).map_err(crate::error::RaftError::from)?;
        // Configuration entries take effect on observation, not commit (§3, §4.3).
        self.cluster.observe(cfg);
        self.persist_meta().map_err(crate::error::RaftError::from)?;
        if let Some(appender) = self.appender.as_mut() {
            appender.sync_members(self.id, &self.cluster.configuration().active_ids(), self.log.last_index());
        }
        Ok(())
    }
}
