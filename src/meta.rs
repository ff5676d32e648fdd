//! Persistent hard state: `currentTerm`, `votedFor`, and the last observed cluster
//! configuration, stored at `{name}.meta` so a restarted node recovers them instead of
//! starting over as a blank node (§5, persistent meta).
//!
//! Written with the same temporary-file-then-rename idiom as [`crate::snapshot`]: every
//! `save` lands in a fresh `.tmp` file and is renamed into place, so a crash mid-write
//! leaves the previous, still-valid file behind rather than a half-written one.

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::cluster::ClusterConfiguration;
use crate::NodeId;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
struct MetaContents {
    current_term: u64,
    voted_for: Option<NodeId>,
    configuration: Option<ClusterConfiguration>,
}

/// A server's persistent hard state, reopened from (or newly created under) `{name}.meta`.
pub struct PersistentMeta {
    path: PathBuf,
    contents: MetaContents,
}

impl PersistentMeta {
    /// Load `{dir}/{name}.meta` if it exists, otherwise start from blank hard state. The
    /// directory is created if missing, matching `Log::create`/`SnapshotStore::open`.
    pub fn open(dir: &Path, name: &str) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.meta", name));
        let contents = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => MetaContents::default(),
            Err(e) => return Err(e),
        };
        Ok(Self { path, contents })
    }

    pub fn current_term(&self) -> u64 {
        self.contents.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.contents.voted_for
    }

    pub fn configuration(&self) -> Option<&ClusterConfiguration> {
        self.contents.configuration.as_ref()
    }

    /// Durably record a new snapshot of hard state. Called whenever `currentTerm`,
    /// `votedFor`, or the observed configuration changes (§4.6, §4.3).
    pub fn save(&mut self, current_term: u64, voted_for: Option<NodeId>, configuration: &ClusterConfiguration) -> io::Result<()> {
        self.contents = MetaContents {
            current_term,
            voted_for,
            configuration: Some(configuration.clone()),
        };
        let bytes = serde_json::to_vec(&self.contents).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let tmp_path = self.path.with_extension("meta.tmp");
        fs::write(&tmp_path, &bytes)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_meta_is_blank() {
        let dir = tempfile::tempdir().unwrap();
        let meta = PersistentMeta::open(dir.path(), "test").unwrap();
        assert_eq!(meta.current_term(), 0);
        assert_eq!(meta.voted_for(), None);
        assert!(meta.configuration().is_none());
    }

    #[test]
    fn save_then_reopen_recovers_hard_state() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ClusterConfiguration::new_initial(7);
        {
            let mut meta = PersistentMeta::open(dir.path(), "test").unwrap();
            meta.save(3, Some(7), &cfg).unwrap();
        }
        let reopened = PersistentMeta::open(dir.path(), "test").unwrap();
        assert_eq!(reopened.current_term(), 3);
        assert_eq!(reopened.voted_for(), Some(7));
        assert_eq!(reopened.configuration(), Some(&cfg));
    }
}
