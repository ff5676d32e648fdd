//! The per-segment offset index (§3 `Segment`, §6 on-disk layout).
//!
//! Each segment keeps a side file mapping an in-segment relative offset to the byte
//! position of that entry within the segment's data file: a 16-byte header followed by an
//! 8-byte record per entry, `{statusFlag:u8, relOffset:u24, position:u32}`. The status
//! flag doubles as the "cleaned" bit-array from §4.1: bit 0 set means the entry has been
//! logically deleted by compaction but not yet physically rewritten out of the segment.

use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use crate::config::StorageLevel;

const HEADER_LEN: u64 = 16;
const RECORD_LEN: u64 = 8;
const MAGIC: u32 = 0x4f52_4958; // "ORIX"
const CLEANED_BIT: u8 = 0x01;

/// Maximum addressable relative offset within one segment (24 bits, per §6).
pub const MAX_OFFSET: u32 = (1 << 24) - 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct IndexRecord {
    status: u8,
    rel_offset: u32,
    position: u32,
}

/// A segment's offset index. Supports binary search over a stable (committed) prefix and
/// direct indexing over the dense, append-only hot suffix (§4.1 `position(offset,
/// committed)`).
pub struct OffsetIndex {
    records: Vec<IndexRecord>,
    file: Option<File>,
    storage_level: StorageLevel,
}

impl OffsetIndex {
    /// Create a brand new, empty index at `path`.
    pub fn create(path: &Path, storage_level: StorageLevel) -> io::Result<Self> {
        let mut this = Self {
            records: Vec::new(),
            file: None,
            storage_level,
        };
        if storage_level != StorageLevel::Memory {
            let mut file = OpenOptions::new().create(true).read(true).write(true).truncate(true).open(path)?;
            this.write_header(&mut file)?;
            this.file = Some(file);
        }
        Ok(this)
    }

    /// Reopen an existing index file, reconstructing `records` with a single linear scan
    /// (§4.1: "at segment scan it is read once to reconstruct lastOffset and size").
    pub fn open(path: &Path, storage_level: StorageLevel) -> io::Result<Self> {
        if storage_level == StorageLevel::Memory || !path.exists() {
            return Self::create(path, storage_level);
        }
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        file.seek(SeekFrom::Start(HEADER_LEN))?;
        let mut records = Vec::new();
        let mut buf = [0u8; RECORD_LEN as usize];
        loop {
            match file.read_exact(&mut buf) {
                Ok(()) => {
                    let status = buf[0];
                    let rel_offset = u32::from_be_bytes([0, buf[1], buf[2], buf[3]]);
                    let position = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
                    records.push(IndexRecord {
                        status,
                        rel_offset,
                        position,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err),
            }
        }
        Ok(Self {
            records,
            file: Some(file),
            storage_level,
        })
    }

    fn write_header(&self, file: &mut File) -> io::Result<()> {
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&MAGIC.to_be_bytes())?;
        file.write_all(&1u32.to_be_bytes())?; // version
        file.write_all(&0u64.to_be_bytes())?; // reserved
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last_offset(&self) -> Option<u32> {
        self.records.last().map(|r| r.rel_offset)
    }

    /// Append a new, dense record. `offset` must be exactly `last_offset + 1` (or `0` for
    /// the first record) — segments never have gaps within themselves; gaps are handled by
    /// `Log::skip` reserving whole indices before a segment is opened.
    pub fn append(&mut self, offset: u32, position: u32) -> io::Result<()> {
        debug_assert!(offset <= MAX_OFFSET, "offset exceeds 24-bit addressable range");
        let record = IndexRecord {
            status: 0,
            rel_offset: offset,
            position,
        };
        if let Some(file) = self.file.as_mut() {
            file.seek(SeekFrom::Start(HEADER_LEN + self.records.len() as u64 * RECORD_LEN))?;
            file.write_all(&[record.status])?;
            let ob = record.rel_offset.to_be_bytes();
            file.write_all(&ob[1..])?;
            file.write_all(&record.position.to_be_bytes())?;
            if self.storage_level == StorageLevel::Disk {
                file.flush()?;
            }
        }
        self.records.push(record);
        Ok(())
    }

    /// Look up the file position for `offset`.
    ///
    /// When `committed` is true, a binary search is used — this is the path taken for
    /// entries known to be stable. When `false`, the record is fetched directly by its
    /// position in the dense in-segment order, trusting the hot-append path (§4.1).
    pub fn position(&self, offset: u32, committed: bool) -> Option<u32> {
        if committed {
            self.records.binary_search_by_key(&offset, |r| r.rel_offset).ok().map(|i| self.records[i].position)
        } else {
            self.records.get(offset as usize).map(|r| r.position)
        }
    }

    pub fn is_cleaned(&self, offset: u32) -> bool {
        self.records
            .binary_search_by_key(&offset, |r| r.rel_offset)
            .ok()
            .map(|i| self.records[i].status & CLEANED_BIT != 0)
            .unwrap_or(false)
    }

    pub fn mark_cleaned(&mut self, offset: u32) -> io::Result<()> {
        if let Ok(i) = self.records.binary_search_by_key(&offset, |r| r.rel_offset) {
            self.records[i].status |= CLEANED_BIT;
            if let Some(file) = self.file.as_mut() {
                file.seek(SeekFrom::Start(HEADER_LEN + i as u64 * RECORD_LEN))?;
                file.write_all(&[self.records[i].status])?;
            }
        }
        Ok(())
    }

    /// Drop every record, resetting the index to empty.
    pub fn clear(&mut self) -> io::Result<()> {
        self.records.clear();
        if let Some(file) = self.file.as_mut() {
            file.set_len(HEADER_LEN)?;
            file.seek(SeekFrom::Start(HEADER_LEN))?;
        }
        Ok(())
    }

    /// Truncate the index to retain only offsets `<= o`, zero-filling the tail on disk and
    /// resetting the write cursor (§4.1 `truncate(offset)`).
    pub fn truncate(&mut self, o: u32) -> io::Result<()> {
        let keep = self.records.partition_point(|r| r.rel_offset <= o);
        let dropped = self.records.len() - keep;
        self.records.truncate(keep);
        if dropped > 0 {
            if let Some(file) = self.file.as_mut() {
                let new_len = HEADER_LEN + keep as u64 * RECORD_LEN;
                file.set_len(new_len)?;
                file.seek(SeekFrom::Start(new_len))?;
            }
        }
        Ok(())
    }
}

/// Build the conventional segment file pair path stems for `{name}-{id}-{version}`.
pub fn segment_stem(dir: &Path, name: &str, id: u64, version: u64) -> PathBuf {
    dir.join(format!("{}-{}-{}", name, id, version))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_lookup_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.index");
        let mut idx = OffsetIndex::create(&path, StorageLevel::Disk).unwrap();
        idx.append(0, 16).unwrap();
        idx.append(1, 40).unwrap();
        idx.append(2, 88).unwrap();

        assert_eq!(idx.position(1, true), Some(40));
        assert_eq!(idx.position(1, false), Some(40));
        assert_eq!(idx.last_offset(), Some(2));
    }

    #[test]
    fn truncate_drops_tail_and_updates_last_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test2.index");
        let mut idx = OffsetIndex::create(&path, StorageLevel::Disk).unwrap();
        for i in 0..5u32 {
            idx.append(i, i * 10).unwrap();
        }
        idx.truncate(2).unwrap();
        assert_eq!(idx.last_offset(), Some(2));
        assert_eq!(idx.position(3, true), None);
        assert_eq!(idx.position(2, true), Some(20));
    }

    #[test]
    fn mark_cleaned_is_observable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test3.index");
        let mut idx = OffsetIndex::create(&path, StorageLevel::Disk).unwrap();
        idx.append(0, 0).unwrap();
        idx.append(1, 10).unwrap();
        assert!(!idx.is_cleaned(0));
        idx.mark_cleaned(0).unwrap();
        assert!(idx.is_cleaned(0));
        assert!(!idx.is_cleaned(1));
    }

    #[test]
    fn reopen_reconstructs_records_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test4.index");
        {
            let mut idx = OffsetIndex::create(&path, StorageLevel::Disk).unwrap();
            idx.append(0, 1).unwrap();
            idx.append(1, 2).unwrap();
        }
        let reopened = OffsetIndex::open(&path, StorageLevel::Disk).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.position(1, true), Some(2));
    }
}
