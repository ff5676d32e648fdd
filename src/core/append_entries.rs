//! Append handling, common to every active role (§4.6 "Append handling (all active states)").

use crate::core::RaftCore;
use crate::core::Role;
use crate::error::RaftResult;
use crate::log::segment::EntryPayload;
use crate::network::AppendEntriesRequest;
use crate::network::AppendEntriesResponse;
use crate::network::RaftNetwork;
use crate::state_machine::StateMachine;

impl<N: RaftNetwork, S: StateMachine> RaftCore<N, S> {
    #[tracing::instrument(level = "debug", skip(self, req))]
    pub(crate) async fn handle_append_entries_request(&mut self, req: AppendEntriesRequest) -> RaftResult<AppendEntriesResponse> {
        // Step 1: stale term, reject outright.
        if req.term < self.current_term {
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                succeeded: false,
                log_index: self.log.last_index(),
            });
        }

        // Step 2: adopt the newer term / leader.
        if req.term > self.current_term {
            self.update_current_term(req.term, None)?;
        }
        if self.current_leader != Some(req.leader) {
            self.update_current_leader(Some(req.leader));
        }
        if self.role != Role::Leader {
            self.reset_election_timeout();
        }
        if !matches!(self.role, Role::Follower | Role::Passive | Role::Reserve) {
            self.set_role(Role::Follower);
        }

        // Step 3: previous-entry check.
        let last_index = self.log.last_index();
        if req.log_index > last_index {
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                succeeded: false,
                log_index: last_index,
            });
        }
        if req.log_index > 0 {
            let prev_term = self.log.get(req.log_index).map(|e| e.log_id.term);
            if prev_term != Some(req.log_term) {
                return Ok(AppendEntriesResponse {
                    term: self.current_term,
                    succeeded: false,
                    log_index: req.log_index.saturating_sub(1),
                });
            }
        }

        // Step 4: append each provided entry, resolving conflicts by truncating the suffix.
        let mut next_index = req.log_index + 1;
        for entry in req.entries {
            match self.log.get(next_index) {
                None => {
                    if next_index > self.log.last_index() + 1 {
                        self.log.skip(next_index - self.log.last_index() - 1)?;
                    }
                    self.append_replicated_entry(entry)?;
                }
                Some(existing) if existing.log_id.term == entry.log_id.term => {
                    // Already present with matching term; nothing to do.
                }
                Some(_) => {
                    self.log.truncate(next_index)?;
                    self.append_replicated_entry(entry)?;
                }
            }
            next_index += 1;
        }

        // Step 5: advance commit index.
        let new_commit = req.commit_index.min(self.log.last_index());
        self.log.commit(new_commit);

        // Step 6: schedule apply of everything newly committed.
        self.apply_committed();

        Ok(AppendEntriesResponse {
            term: self.current_term,
            succeeded: true,
            log_index: self.log.last_index(),
        })
    }

    /// Append an entry received over the wire, observing a `Configuration` payload
    /// immediately (§3: "takes effect on observation, not commit").
    fn append_replicated_entry(&mut self, entry: crate::log::segment::LogEntry) -> std::io::Result<()> {
        if let EntryPayload::Configuration(cfg) = &entry.payload {
            self.cluster.observe(cfg.clone());
            self.persist_meta()?;
        }
        self.log.append(entry.log_id.term, entry.payload)?;
        Ok(())
    }
}
