//! Snapshot storage and its temporary → persisted → complete lifecycle (§4.2, §6).
//!
//! A snapshot is identified by the `(lastIncludedIndex, lastIncludedTerm)` pair it was
//! taken at, named on disk as `{name}-{index}-{term}.snapshot`. While being written it
//! lives under a `.tmp` suffix; `SnapshotStore::create_temporary` hands out a writer for
//! this, and `finalize` performs the durable rename that the rest of the system treats as
//! "persisted". A snapshot only becomes eligible for the old log entries to be discarded
//! once every session's `lastCompleted` counter has caught up to its index (§4.4) — that
//! final transition to "complete" is tracked by `SnapshotStore::mark_complete`.

use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::raft_types::LogId;

/// Metadata describing a persisted snapshot, stored alongside the snapshot bytes
/// themselves so a restart can enumerate snapshots without reading every payload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub log_id: LogId,
    /// The cluster configuration in effect as of `log_id`, so a restored node knows its
    /// membership before replaying any log suffix (§4.2).
    pub membership_index: u64,
}

/// Where a snapshot currently sits in its lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SnapshotStatus {
    /// Being written; not yet durable, not visible to `get_snapshot_by_id`.
    Temporary,
    /// Durably renamed into place; visible, but log entries below it are not yet safe to
    /// discard because not every session has observed it.
    Persisted,
    /// Every session's `lastCompleted` has reached this snapshot's index; the log may be
    /// compacted up to it.
    Complete,
}

/// A handle for streaming bytes into a not-yet-durable snapshot file.
pub struct SnapshotWriter {
    tmp_path: PathBuf,
    final_path: PathBuf,
    meta_path: PathBuf,
    meta: SnapshotMeta,
    file: File,
}

impl SnapshotWriter {
    pub fn write_chunk(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        use std::io::Seek;
        use std::io::SeekFrom;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Durably rename the temporary file into place and write its metadata sidecar,
    /// transitioning the snapshot from Temporary to Persisted.
    pub fn finalize(mut self) -> io::Result<()> {
        self.file.flush()?;
        std::fs::rename(&self.tmp_path, &self.final_path)?;
        let meta_bytes = serde_json::to_vec(&self.meta).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        std::fs::write(&self.meta_path, meta_bytes)?;
        Ok(())
    }
}

/// A handle for reading a persisted snapshot's bytes, chunked for InstallSnapshot transfer
/// (§6 `snapshotMaxChunkSize`).
pub struct SnapshotReader {
    file: File,
    pub meta: SnapshotMeta,
}

impl SnapshotReader {
    pub fn read_chunk(&mut self, offset: u64, max_len: usize) -> io::Result<Vec<u8>> {
        use std::io::Seek;
        use std::io::SeekFrom;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; max_len];
        let n = self.file.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Read the entire snapshot into memory, used on the apply path where the whole
    /// payload is handed to the user state machine's `restore`.
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        use std::io::Seek;
        use std::io::SeekFrom;
        self.file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

/// Manages the set of snapshot files for one server.
pub struct SnapshotStore {
    dir: PathBuf,
    name: String,
    /// The most recently completed (all-sessions-caught-up) snapshot, if any.
    complete: Option<SnapshotMeta>,
    /// Snapshots that are persisted but not yet complete, oldest first.
    persisted: Vec<SnapshotMeta>,
}

impl SnapshotStore {
    pub fn open(dir: &Path, name: &str) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut persisted = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if let Some(rest) = file_name.strip_prefix(&format!("{}-", name)) {
                if let Some(idx_term) = rest.strip_suffix(".meta") {
                    if idx_term.contains('-') {
                        let bytes = std::fs::read(entry.path())?;
                        if let Ok(meta) = serde_json::from_slice::<SnapshotMeta>(&bytes) {
                            persisted.push(meta);
                        }
                    }
                }
            }
        }
        persisted.sort_by_key(|m| m.log_id.index);
        Ok(Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            complete: None,
            persisted,
        })
    }

    fn stem(&self, log_id: LogId) -> PathBuf {
        self.dir.join(format!("{}-{}-{}", self.name, log_id.index, log_id.term))
    }

    /// Begin writing a new snapshot at `log_id`, taken while the cluster configuration in
    /// effect is the one observed as of `membership_index`.
    pub fn create_temporary(&self, log_id: LogId, membership_index: u64) -> io::Result<SnapshotWriter> {
        let stem = self.stem(log_id);
        let tmp_path = stem.with_extension("snapshot.tmp");
        let final_path = stem.with_extension("snapshot");
        let meta_path = stem.with_extension("meta");
        // Deliberately not `.truncate(true)`: a chunked transfer reopens this same `.tmp`
        // path per chunk (driven purely by `log_id`), and truncating would wipe bytes
        // already written by an earlier chunk.
        let file = OpenOptions::new().create(true).read(true).write(true).open(&tmp_path)?;
        Ok(SnapshotWriter {
            tmp_path,
            final_path,
            meta_path,
            meta: SnapshotMeta {
                log_id,
                membership_index,
            },
            file,
        })
    }

    /// Record a freshly-finalized snapshot as persisted (caller must have already called
    /// `SnapshotWriter::finalize`).
    pub fn note_persisted(&mut self, meta: SnapshotMeta) {
        self.persisted.retain(|m| m.log_id.index != meta.log_id.index);
        self.persisted.push(meta);
        self.persisted.sort_by_key(|m| m.log_id.index);
    }

    pub fn get_snapshot_by_id(&self, log_id: LogId) -> io::Result<Option<SnapshotReader>> {
        let stem = self.stem(log_id);
        let final_path = stem.with_extension("snapshot");
        if !final_path.exists() {
            return Ok(None);
        }
        let meta_bytes = std::fs::read(stem.with_extension("meta"))?;
        let meta: SnapshotMeta = serde_json::from_slice(&meta_bytes).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let file = OpenOptions::new().read(true).open(&final_path)?;
        Ok(Some(SnapshotReader { file, meta }))
    }

    /// The newest persisted snapshot, used to answer InstallSnapshot / restart recovery.
    pub fn latest(&self) -> Option<&SnapshotMeta> {
        self.persisted.last()
    }

    /// Mark the snapshot at `log_id` complete: every session's `lastCompleted` has reached
    /// it, so the log may now be compacted up to `log_id.index` (§4.2, §4.4).
    pub fn mark_complete(&mut self, log_id: LogId) {
        if let Some(meta) = self.persisted.iter().find(|m| m.log_id == log_id).cloned() {
            self.complete = Some(meta);
            self.persisted.retain(|m| m.log_id.index < log_id.index);
        }
    }

    pub fn complete(&self) -> Option<&SnapshotMeta> {
        self.complete.as_ref()
    }

    /// Remove every persisted-but-superseded snapshot file older than `keep`, once a newer
    /// one has gone complete.
    pub fn prune_before(&mut self, keep: LogId) -> io::Result<()> {
        let (keep_metas, drop_metas): (Vec<_>, Vec<_>) = self.persisted.drain(..).partition(|m| m.log_id.index >= keep.index);
        self.persisted = keep_metas;
        for meta in drop_metas {
            let stem = self.stem(meta.log_id);
            let _ = std::fs::remove_file(stem.with_extension("snapshot"));
            let _ = std::fs::remove_file(stem.with_extension("meta"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_then_finalize_becomes_visible() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SnapshotStore::open(dir.path(), "snap").unwrap();
        let log_id = LogId::new(2, 100);
        let mut writer = store.create_temporary(log_id, 5).unwrap();
        writer.write_chunk(0, b"hello").unwrap();
        let meta = SnapshotMeta {
            log_id,
            membership_index: 5,
        };
        writer.finalize().unwrap();
        store.note_persisted(meta);

        let mut reader = store.get_snapshot_by_id(log_id).unwrap().expect("snapshot should be visible");
        let chunk = reader.read_chunk(0, 16).unwrap();
        assert_eq!(&chunk, b"hello");
    }

    #[test]
    fn complete_requires_explicit_mark() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SnapshotStore::open(dir.path(), "snap").unwrap();
        let log_id = LogId::new(1, 50);
        let writer = store.create_temporary(log_id, 1).unwrap();
        writer.finalize().unwrap();
        store.note_persisted(SnapshotMeta {
            log_id,
            membership_index: 1,
        });
        assert!(store.complete().is_none());
        store.mark_complete(log_id);
        assert_eq!(store.complete().unwrap().log_id, log_id);
    }
}
