//! A single log segment: a data file of length-prefixed entries plus its offset index
//! (§3 `Segment`, §6 on-disk layout `{name}-{segmentId}-{segmentVersion}.log`/`.index`).

use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

use crate::cluster::ClusterConfiguration;
use crate::config::StorageLevel;
use crate::log::offset_index::segment_stem;
use crate::log::offset_index::OffsetIndex;
use crate::raft_types::LogId;

/// The payload carried by a log entry: a user-opaque `Normal` command, a `Configuration`
/// change that the cluster state machine interprets itself, and `Blank` no-ops used by a
/// new leader to commit across a term (§3, §4.3, §4.6).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntryPayload {
    Blank,
    Normal(Bytes),
    Configuration(ClusterConfiguration),
}

impl EntryPayload {
    fn type_tag(&self) -> u8 {
        match self {
            EntryPayload::Blank => 0,
            EntryPayload::Normal(_) => 1,
            EntryPayload::Configuration(_) => 2,
        }
    }
}

/// One entry in the replicated log.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub log_id: LogId,
    pub payload: EntryPayload,
}

impl crate::raft_types::MessageSummary for LogEntry {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.payload.type_tag())
    }
}

/// A segment's data + index file pair, plus the in-memory bookkeeping needed to append,
/// read, truncate and compact it.
pub struct Segment {
    pub id: u64,
    pub version: u64,
    /// The log index of the first entry this segment may ever hold.
    pub base_index: u64,
    dir: PathBuf,
    name: String,
    storage_level: StorageLevel,
    data_file: Option<File>,
    /// In-memory mirror of every still-present (non-rewritten-away) entry, used directly
    /// when `storage_level == Memory` and kept as a read cache otherwise.
    cache: Vec<LogEntry>,
    index: OffsetIndex,
    size_bytes: u64,
    max_entries: u64,
    max_bytes: u64,
}

impl Segment {
    /// Create a brand-new, empty segment.
    pub fn create(
        dir: &Path,
        name: &str,
        id: u64,
        version: u64,
        base_index: u64,
        storage_level: StorageLevel,
        max_entries: u64,
        max_bytes: u64,
    ) -> io::Result<Self> {
        let stem = segment_stem(dir, name, id, version);
        let data_file = if storage_level != StorageLevel::Memory {
            Some(OpenOptions::new().create(true).read(true).write(true).truncate(true).open(stem.with_extension("log"))?)
        } else {
            None
        };
        let index = OffsetIndex::create(&stem.with_extension("index"), storage_level)?;
        Ok(Self {
            id,
            version,
            base_index,
            dir: dir.to_path_buf(),
            name: name.to_string(),
            storage_level,
            data_file,
            cache: Vec::new(),
            index,
            size_bytes: 0,
            max_entries,
            max_bytes,
        })
    }

    /// Reopen an existing segment, replaying its data file once to rebuild `cache` and
    /// relying on `OffsetIndex::open` to rebuild the index (§4.1 scan-once guarantee).
    pub fn open(
        dir: &Path,
        name: &str,
        id: u64,
        version: u64,
        base_index: u64,
        storage_level: StorageLevel,
        max_entries: u64,
        max_bytes: u64,
    ) -> io::Result<Self> {
        let stem = segment_stem(dir, name, id, version);
        let index = OffsetIndex::open(&stem.with_extension("index"), storage_level)?;
        let mut cache = Vec::new();
        let mut size_bytes = 0u64;
        let mut data_file = if storage_level != StorageLevel::Memory {
            Some(OpenOptions::new().read(true).write(true).open(stem.with_extension("log"))?)
        } else {
            None
        };
        if let Some(file) = data_file.as_mut() {
            file.seek(SeekFrom::Start(0))?;
            loop {
                match read_frame(file) {
                    Ok(Some((mut entry, len))) => {
                        entry.log_id.index = base_index + cache.len() as u64;
                        size_bytes += len;
                        cache.push(entry);
                    }
                    Ok(None) => break,
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(Self {
            id,
            version,
            base_index,
            dir: dir.to_path_buf(),
            name: name.to_string(),
            storage_level,
            data_file,
            cache,
            index,
            size_bytes,
            max_entries,
            max_bytes,
        })
    }

    pub fn last_index(&self) -> Option<u64> {
        self.index.last_offset().map(|rel| self.base_index + rel as u64)
    }

    pub fn entry_count(&self) -> u64 {
        self.index.len() as u64
    }

    pub fn is_full(&self) -> bool {
        self.entry_count() >= self.max_entries || self.size_bytes >= self.max_bytes
    }

    /// Append `entry` at the next dense offset. The caller is responsible for guaranteeing
    /// `entry.log_id.index == base_index + entry_count()`.
    pub fn append(&mut self, entry: LogEntry) -> io::Result<()> {
        let rel_offset = self.entry_count() as u32;
        let position = self.size_bytes as u32;
        let frame = encode_frame(&entry)?;
        if let Some(file) = self.data_file.as_mut() {
            file.seek(SeekFrom::End(0))?;
            file.write_all(&frame)?;
            if self.storage_level == StorageLevel::Disk {
                file.flush()?;
            }
        }
        self.size_bytes += frame.len() as u64;
        self.index.append(rel_offset, position)?;
        self.cache.push(entry);
        Ok(())
    }

    /// Read the entry at absolute log `index`, if this segment holds it. `committed`
    /// selects the binary-search vs. direct-index lookup strategy on the offset index.
    pub fn get(&self, index: u64, committed: bool) -> Option<&LogEntry> {
        if index < self.base_index {
            return None;
        }
        let rel = (index - self.base_index) as u32;
        let _ = self.index.position(rel, committed)?;
        self.cache.get(rel as usize)
    }

    pub fn is_cleaned(&self, index: u64) -> bool {
        if index < self.base_index {
            return true;
        }
        self.index.is_cleaned((index - self.base_index) as u32)
    }

    pub fn mark_cleaned(&mut self, index: u64) -> io::Result<()> {
        if index >= self.base_index {
            self.index.mark_cleaned((index - self.base_index) as u32)?;
        }
        Ok(())
    }

    /// Drop every entry at or after `index`, truncating both files (§4.1 `truncate`).
    pub fn truncate_suffix(&mut self, index: u64) -> io::Result<()> {
        if index <= self.base_index {
            self.cache.clear();
            self.size_bytes = 0;
            self.index.clear()?;
            if let Some(file) = self.data_file.as_mut() {
                file.set_len(0)?;
            }
            return Ok(());
        }
        let rel = (index - self.base_index) as u32;
        let keep = rel as usize;
        if keep >= self.cache.len() {
            return Ok(());
        }
        let cut_position = self.index.position(rel, false).unwrap_or(self.size_bytes as u32);
        self.cache.truncate(keep);
        self.index.truncate(rel.saturating_sub(1))?;
        self.size_bytes = cut_position as u64;
        if let Some(file) = self.data_file.as_mut() {
            file.set_len(cut_position as u64)?;
        }
        Ok(())
    }

    /// Rewrite this segment's data file keeping only entries not marked cleaned, bumping
    /// `version` (§3: "segment version increments on compaction-rewrite").
    pub fn compact_rewrite(&mut self) -> io::Result<()> {
        let keep: Vec<LogEntry> = self
            .cache
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.index.is_cleaned(*i as u32))
            .map(|(_, e)| e.clone())
            .collect();
        let new_version = self.version + 1;
        let new_base = keep.first().map(|e| e.log_id.index).unwrap_or(self.base_index);
        let mut rebuilt = Segment::create(
            &self.dir,
            &self.name,
            self.id,
            new_version,
            new_base,
            self.storage_level,
            self.max_entries,
            self.max_bytes,
        )?;
        for entry in keep {
            rebuilt.append(entry)?;
        }
        let old_stem = segment_stem(&self.dir, &self.name, self.id, self.version);
        let _ = std::fs::remove_file(old_stem.with_extension("log"));
        let _ = std::fs::remove_file(old_stem.with_extension("index"));
        *self = rebuilt;
        Ok(())
    }

    pub fn delete_files(&self) -> io::Result<()> {
        let stem = segment_stem(&self.dir, &self.name, self.id, self.version);
        if stem.with_extension("log").exists() {
            std::fs::remove_file(stem.with_extension("log"))?;
        }
        if stem.with_extension("index").exists() {
            std::fs::remove_file(stem.with_extension("index"))?;
        }
        Ok(())
    }
}

fn encode_frame(entry: &LogEntry) -> io::Result<Vec<u8>> {
    let payload_bytes = serde_json::to_vec(&entry.payload).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    let mut out = Vec::with_capacity(4 + 8 + 1 + payload_bytes.len());
    let total_len = (8 + 1 + payload_bytes.len()) as u32;
    out.extend_from_slice(&total_len.to_be_bytes());
    out.extend_from_slice(&entry.log_id.term.to_be_bytes());
    out.push(entry.payload.type_tag());
    out.extend_from_slice(&payload_bytes);
    Ok(out)
}

/// Read one `{length:u32, term:u64, type:u8, payload:bytes}` frame, returning `None` at a
/// clean EOF and the encoded on-disk length (including the 4-byte length prefix) alongside
/// the decoded entry.
fn read_frame(file: &mut File) -> io::Result<Option<(LogEntry, u64)>> {
    let mut len_buf = [0u8; 4];
    match file.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let total_len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; total_len];
    file.read_exact(&mut body)?;
    let term = u64::from_be_bytes(body[0..8].try_into().unwrap());
    let type_tag = body[8];
    let payload: EntryPayload = serde_json::from_slice(&body[9..]).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    debug_assert_eq!(type_tag, payload.type_tag());
    // The absolute index is reconstructed by the caller (`Log`), which knows base_index and
    // the position of this entry in sequence; we stash term only here, index is patched by
    // `Log::open` during rehydration. To keep this self-contained we reconstruct LogId with
    // index 0 and let `Log::open` overwrite it -- see that call site.
    let entry = LogEntry {
        log_id: LogId::new(term, 0),
        payload,
    };
    Ok(Some((entry, 4 + total_len as u64)))
}
