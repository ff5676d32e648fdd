//! The segmented, compactible, append-only replicated log (§4.1).
//!
//! A `Log` owns an ordered run of [`Segment`]s, rolling over to a new one once the active
//! segment is full (`maxEntriesPerSegment` / `maxSegmentSize`, §6), and tracks `firstIndex`
//! (the oldest index still retained after compaction) and `commitIndex` (the highest index
//! known to be safely replicated). Reads below `commitIndex` use the offset index's binary
//! search path; reads at or above it use the direct, dense-append path (§4.1).

pub mod offset_index;
pub mod segment;

use std::io;
use std::path::Path;
use std::path::PathBuf;

use crate::config::Config;
use crate::log::segment::EntryPayload;
use crate::log::segment::LogEntry;
use crate::log::segment::Segment;
use crate::raft_types::LogId;

/// The result of a successful `append`, giving the caller the assigned index without
/// forcing it to re-derive it from log state (§4.1 `append(term, entry) → Indexed`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Indexed {
    pub log_id: LogId,
}

pub struct Log {
    dir: PathBuf,
    name: String,
    storage_level: crate::config::StorageLevel,
    max_entries_per_segment: u64,
    max_segment_size: u64,
    segments: Vec<Segment>,
    next_segment_id: u64,
    /// Lowest index still present in the log after compaction. Entries below this index
    /// must be served from a snapshot instead.
    first_index: u64,
    /// Highest index known to be committed (replicated to a quorum).
    commit_index: u64,
}

impl Log {
    /// Create a fresh, empty log rooted at `dir` (the directory is created if missing).
    pub fn create(dir: &Path, name: &str, config: &Config) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut log = Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            storage_level: config.storage_level,
            max_entries_per_segment: config.max_entries_per_segment,
            max_segment_size: config.max_segment_size,
            segments: Vec::new(),
            next_segment_id: 0,
            first_index: 0,
            commit_index: 0,
        };
        log.roll_new_segment(0)?;
        Ok(log)
    }

    /// Reopen a log directory, scanning each segment's index once to reconstruct
    /// `first_index`/`commit_index` bookkeeping the caller must then restore from its own
    /// persisted metadata (commit_index is not itself durable in the log; it is restored by
    /// the owning server context from the last known value).
    pub fn open(dir: &Path, name: &str, config: &Config) -> io::Result<Self> {
        if !dir.exists() {
            return Self::create(dir, name, config);
        }
        let mut stems = discover_segment_stems(dir, name)?;
        stems.sort_by_key(|(id, version)| (*id, *version));
        if stems.is_empty() {
            return Self::create(dir, name, config);
        }
        let mut segments = Vec::new();
        let mut base_index = 0u64;
        let mut next_segment_id = 0u64;
        for (id, version) in stems {
            let segment = Segment::open(
                dir,
                name,
                id,
                version,
                base_index,
                config.storage_level,
                config.max_entries_per_segment,
                config.max_segment_size,
            )?;
            base_index = segment.last_index().map(|i| i + 1).unwrap_or(base_index);
            next_segment_id = next_segment_id.max(id + 1);
            segments.push(segment);
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            storage_level: config.storage_level,
            max_entries_per_segment: config.max_entries_per_segment,
            max_segment_size: config.max_segment_size,
            segments,
            next_segment_id,
            first_index: 0,
            commit_index: 0,
        })
    }

    fn roll_new_segment(&mut self, base_index: u64) -> io::Result<()> {
        let id = self.next_segment_id;
        self.next_segment_id += 1;
        let segment = Segment::create(
            &self.dir,
            &self.name,
            id,
            0,
            base_index,
            self.storage_level,
            self.max_entries_per_segment,
            self.max_segment_size,
        )?;
        self.segments.push(segment);
        Ok(())
    }

    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    pub fn last_index(&self) -> u64 {
        self.segments.iter().rev().find_map(|s| s.last_index()).unwrap_or_else(|| self.first_index.saturating_sub(1))
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    /// Restore `commit_index` from durable server-context metadata on startup.
    pub fn restore_commit_index(&mut self, commit_index: u64) {
        self.commit_index = commit_index;
    }

    pub fn commit(&mut self, index: u64) {
        if index > self.commit_index {
            self.commit_index = index;
        }
    }

    /// Append a new entry for `term` at the next index, rolling to a fresh segment first if
    /// the active one is full (§4.1).
    pub fn append(&mut self, term: u64, payload: EntryPayload) -> io::Result<Indexed> {
        let index = self.last_index() + 1;
        if self.segments.last().map(|s| s.is_full()).unwrap_or(true) {
            self.roll_new_segment(index)?;
        }
        let log_id = LogId::new(term, index);
        let entry = LogEntry {
            log_id,
            payload,
        };
        self.segments.last_mut().expect("segment just rolled").append(entry)?;
        Ok(Indexed { log_id })
    }

    /// Reserve `n` indices without writing entries, used when a follower must skip a gap
    /// left by a leader's batched replication (§4.1 `skip(n)`).
    pub fn skip(&mut self, n: u64) -> io::Result<()> {
        let mut base = self.last_index() + 1;
        for _ in 0..n {
            if self.segments.last().map(|s| s.is_full()).unwrap_or(true) {
                self.roll_new_segment(base)?;
            }
            let entry = LogEntry {
                log_id: LogId::new(0, base),
                payload: EntryPayload::Blank,
            };
            self.segments.last_mut().expect("segment just rolled").append(entry)?;
            base += 1;
        }
        Ok(())
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index < self.first_index || index > self.last_index() {
            return None;
        }
        let committed = index <= self.commit_index;
        self.segments.iter().rev().find_map(|s| s.get(index, committed))
    }

    /// Drop every entry at or after `index` — used when a follower's log diverges from a
    /// new leader and must be rolled back to match (§4.1 `truncate(index)`). Fails if
    /// `index <= commitIndex`: a committed entry is never rewritten (§4.1, §8 property 1).
    pub fn truncate(&mut self, index: u64) -> io::Result<()> {
        if index <= self.commit_index {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing to truncate at {index}, at or behind commit index {}", self.commit_index),
            ));
        }
        while let Some(last) = self.segments.last() {
            match last.last_index() {
                Some(last_idx) if last_idx >= index => {
                    let base = last.base_index;
                    if base >= index {
                        let mut removed = self.segments.pop().expect("checked above");
                        removed.delete_files()?;
                    } else {
                        self.segments.last_mut().expect("checked above").truncate_suffix(index)?;
                        break;
                    }
                }
                _ => break,
            }
        }
        if self.segments.is_empty() {
            self.roll_new_segment(index.min(self.first_index))?;
        }
        Ok(())
    }

    /// Delete entries and whole segments entirely before `index`, advancing `first_index`
    /// (§4.1 `compact(index)`). Segments fully below `index` are deleted outright; a segment
    /// straddling the boundary has its below-boundary entries marked cleaned and is then
    /// rewritten without them.
    pub fn compact(&mut self, index: u64) -> io::Result<()> {
        if index <= self.first_index {
            return Ok(());
        }
        let mut retained = Vec::with_capacity(self.segments.len());
        for mut segment in std::mem::take(&mut self.segments) {
            let seg_last = segment.last_index();
            match seg_last {
                Some(last) if last < index => {
                    segment.delete_files()?;
                }
                Some(last) if last >= index => {
                    if segment.base_index < index {
                        for i in segment.base_index..index {
                            segment.mark_cleaned(i)?;
                        }
                        segment.compact_rewrite()?;
                    }
                    retained.push(segment);
                }
                _ => retained.push(segment),
            }
        }
        self.segments = retained;
        self.first_index = index;
        Ok(())
    }
}

fn discover_segment_stems(dir: &Path, name: &str) -> io::Result<Vec<(u64, u64)>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if let Some(rest) = file_name.strip_prefix(&format!("{}-", name)) {
            if let Some(stem) = rest.strip_suffix(".log") {
                let parts: Vec<&str> = stem.splitn(2, '-').collect();
                if parts.len() == 2 {
                    if let (Ok(id), Ok(version)) = (parts[0].parse(), parts[1].parse()) {
                        out.push((id, version));
                    }
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config() -> Config {
        Config::build("test")
            .storage_level(crate::config::StorageLevel::Disk)
            .max_entries_per_segment(4)
            .max_segment_size(1 << 20)
            .validate()
            .unwrap()
    }

    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn append_assigns_sequential_indices() {
        let dir = tmp_dir();
        let config = test_config();
        let mut log = Log::create(dir.path(), "log", &config).unwrap();
        let a = log.append(1, EntryPayload::Blank).unwrap();
        let b = log.append(1, EntryPayload::Blank).unwrap();
        assert_eq!(a.log_id.index, 1);
        assert_eq!(b.log_id.index, 2);
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn rolls_to_new_segment_once_full() {
        let dir = tmp_dir();
        let config = test_config();
        let mut log = Log::create(dir.path(), "log", &config).unwrap();
        for _ in 0..10 {
            log.append(1, EntryPayload::Blank).unwrap();
        }
        assert!(log.segments.len() >= 2);
        assert_eq!(log.last_index(), 10);
    }

    #[test]
    fn truncate_drops_suffix_and_get_reflects_it() {
        let dir = tmp_dir();
        let config = test_config();
        let mut log = Log::create(dir.path(), "log", &config).unwrap();
        for _ in 0..6 {
            log.append(1, EntryPayload::Blank).unwrap();
        }
        log.truncate(4).unwrap();
        assert_eq!(log.last_index(), 3);
        assert!(log.get(4).is_none());
        assert!(log.get(3).is_some());
    }

    #[test]
    fn truncate_refuses_to_cross_commit_index() {
        let dir = tmp_dir();
        let config = test_config();
        let mut log = Log::create(dir.path(), "log", &config).unwrap();
        for _ in 0..6 {
            log.append(1, EntryPayload::Blank).unwrap();
        }
        log.commit(4);
        assert!(log.truncate(4).is_err(), "truncate at the committed index must fail");
        assert!(log.truncate(3).is_err(), "truncate behind the committed index must fail");
        assert_eq!(log.last_index(), 6, "a refused truncate must not mutate the log");
        log.truncate(5).unwrap();
        assert_eq!(log.last_index(), 4);
    }

    #[test]
    fn compact_advances_first_index_and_hides_old_entries() {
        let dir = tmp_dir();
        let config = test_config();
        let mut log = Log::create(dir.path(), "log", &config).unwrap();
        for _ in 0..10 {
            log.append(1, EntryPayload::Blank).unwrap();
        }
        log.commit(10);
        log.compact(6).unwrap();
        assert_eq!(log.first_index(), 6);
        assert!(log.get(5).is_none());
        assert!(log.get(6).is_some());
        assert!(log.get(10).is_some());
    }
}
