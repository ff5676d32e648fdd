//! Snapshot installation, receiver side (§4.2, §6 `Install`).

use crate::core::RaftCore;
use crate::core::Role;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::network::InstallSnapshotRequest;
use crate::network::InstallSnapshotResponse;
use crate::network::RaftNetwork;
use crate::state_machine::StateMachine;

impl<N: RaftNetwork, S: StateMachine> RaftCore<N, S> {
    #[tracing::instrument(level = "debug", skip(self, req))]
    pub(crate) async fn handle_install_snapshot_request(&mut self, req: InstallSnapshotRequest) -> RaftResult<InstallSnapshotResponse> {
        if req.term < self.current_term {
            return Ok(InstallSnapshotResponse { term: self.current_term });
        }
        if req.term > self.current_term {
            self.update_current_term(req.term, None).map_err(RaftError::from)?;
        }
        if self.current_leader != Some(req.leader) {
            self.update_current_leader(Some(req.leader));
        }
        if !matches!(self.role, Role::Follower | Role::Passive | Role::Reserve) {
            self.set_role(Role::Follower);
        }
        self.reset_election_timeout();

        // Each chunk reopens the same `.tmp` path by construction (`stem` is derived purely
        // from `log_id`), so out-of-order or retried chunks still land at the right offset.
        let mut writer = self.snapshots.create_temporary(req.log_id, self.cluster.configuration().index).map_err(RaftError::from)?;
        writer.write_chunk(req.offset, &req.data).map_err(RaftError::from)?;

        if req.complete {
            writer.finalize().map_err(RaftError::from)?;
            self.snapshots.note_persisted(crate::snapshot::SnapshotMeta {
                log_id: req.log_id,
                membership_index: self.cluster.configuration().index,
            });
            self.snapshots.mark_complete(req.log_id);
            if let Ok(Some(mut reader)) = self.snapshots.get_snapshot_by_id(req.log_id) {
                let bytes = reader.read_all()?;
                let meta = reader.meta.clone();
                self.executor.restore_snapshot(&meta, &bytes);
                let _ = self.log.compact(req.log_id.index);
                self.log.restore_commit_index(req.log_id.index.max(self.log.commit_index()));
            }
        }

        Ok(InstallSnapshotResponse { term: self.current_term })
    }
}
