//! Vote/Poll handling and the candidate-side election cycle (§4.6).

use crate::core::RaftCore;
use crate::core::Role;
use crate::error::RaftResult;
use crate::log::segment::EntryPayload;
use crate::network::RaftNetwork;
use crate::network::VoteRequest;
use crate::network::VoteResponse;
use crate::quorum::majority_of;
use crate::raft_types::LogId;
use crate::state_machine::StateMachine;

impl<N: RaftNetwork, S: StateMachine> RaftCore<N, S> {
    /// Grant rule shared by Vote and Poll (§4.6: "Vote/Poll handling (follower rule)").
    /// Polls are advisory and never record a vote.
    fn candidate_log_is_up_to_date(&self, candidate_log_term: u64, candidate_log_index: u64) -> bool {
        let mine = self.last_log_id();
        candidate_log_term > mine.term || (candidate_log_term == mine.term && candidate_log_index >= mine.index)
    }

    #[tracing::instrument(level = "debug", skip(self, req))]
    pub(crate) fn handle_vote_request(&mut self, req: VoteRequest) -> RaftResult<VoteResponse> {
        if req.term < self.current_term {
            return Ok(VoteResponse {
                term: self.current_term,
                granted: false,
            });
        }
        if req.term > self.current_term {
            self.update_current_term(req.term, None)?;
        }
        let already_voted_other = matches!(self.voted_for, Some(v) if v != req.candidate);
        let up_to_date = self.candidate_log_is_up_to_date(req.log_term, req.log_index);
        let granted = !already_voted_other && up_to_date;
        if granted {
            self.voted_for = Some(req.candidate);
            self.persist_meta()?;
            self.reset_election_timeout();
        }
        Ok(VoteResponse {
            term: self.current_term,
            granted,
        })
    }

    #[tracing::instrument(level = "debug", skip(self, req))]
    pub(crate) fn handle_poll_request(&mut self, req: VoteRequest) -> RaftResult<VoteResponse> {
        if req.term < self.current_term {
            return Ok(VoteResponse {
                term: self.current_term,
                granted: false,
            });
        }
        let up_to_date = self.candidate_log_is_up_to_date(req.log_term, req.log_index);
        Ok(VoteResponse {
            term: req.term.max(self.current_term),
            granted: up_to_date,
        })
    }

    /// Election timer fired: advance from Follower/Candidate into a fresh election attempt
    /// (§4.6 Candidate: "issues Poll then Vote with incremented term").
    pub(crate) async fn handle_election_timeout(&mut self) -> RaftResult<()> {
        if !self.cluster.configuration().contains(self.id) || self.cluster.configuration().member_type(self.id) != Some(crate::cluster::MemberType::Active) {
            return Ok(());
        }
        self.set_role(Role::Candidate);
        self.reset_election_timeout();

        let targets: Vec<_> = self.cluster.configuration().active_ids().into_iter().filter(|id| *id != self.id).collect();
        let my_log = self.last_log_id();

        // Pre-vote: a poll round that does not increment our term or record a vote,
        // avoiding needless term inflation when we can't actually win (§4.6).
        let poll_req = crate::network::VoteRequest {
            term: self.current_term + 1,
            candidate: self.id,
            log_index: my_log.index,
            log_term: my_log.term,
        };
        let mut granted = 1usize; // ourselves
        for target in &targets {
            if let Ok(resp) = self.network.send_poll(*target, poll_req.clone()).await {
                if resp.term > self.current_term {
                    self.update_current_term(resp.term, None)?;
                    self.set_role(Role::Follower);
                    return Ok(());
                }
                if resp.granted {
                    granted += 1;
                }
            }
        }
        if granted < majority_of(targets.len() + 1) {
            // Not enough pre-votes; stay a candidate and retry at the next timeout.
            return Ok(());
        }

        self.update_current_term(self.current_term + 1, Some(self.id))?;
        let vote_req = crate::network::VoteRequest {
            term: self.current_term,
            candidate: self.id,
            log_index: my_log.index,
            log_term: my_log.term,
        };
        let mut granted = 1usize;
        for target in &targets {
            if let Ok(resp) = self.network.send_vote(*target, vote_req.clone()).await {
                if resp.term > self.current_term {
                    self.update_current_term(resp.term, None)?;
                    self.set_role(Role::Follower);
                    return Ok(());
                }
                if resp.granted {
                    granted += 1;
                }
            }
        }
        if granted >= majority_of(targets.len() + 1) && self.role == Role::Candidate {
            self.become_leader().await?;
        }
        Ok(())
    }

    /// Transition into Leader: append an Initialize (Blank) entry and a Configuration
    /// entry, both of which must commit before client operations are accepted (§4.6).
    pub(crate) async fn become_leader(&mut self) -> RaftResult<()> {
        self.set_role(Role::Leader);
        self.update_current_leader(Some(self.id));
        self.appender = Some(crate::replication::LeaderAppender::new(self.id, &self.cluster.configuration().active_ids(), self.log.last_index()));

        self.log.append(self.current_term, EntryPayload::Blank)?;
        let mut cfg = self.cluster.configuration().clone();
        cfg.index = self.log.last_index() + 1;
        cfg.term = self.current_term;
        self.log.append(self.current_term, EntryPayload::Configuration(cfg.clone()))?;
        self.cluster.observe(cfg);
        self.persist_meta()?;

        self.leader_append_cycle().await?;
        Ok(())
    }

    pub(crate) fn last_committed_log_id(&self) -> LogId {
        LogId::new(self.current_term, self.log.commit_index())
    }
}
