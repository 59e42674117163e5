//! The disk-backed, segmented Raft log (`C2`). This is the concrete type the vendored Raft
//! library is driven over: it implements [`raft::log::Log`] directly, so every append, random
//! read, and truncation the Raft core performs flows straight through to disk.

mod segment;

use std::fs;
use std::path::{Path, PathBuf};

use raft::log::Log;
use raft::message::{LogEntry, LogIndex, TermId};

use segment::{EntryType, Segment};

use crate::error::{KeeperError, Result as KeeperResult};

/// An append-only, segmented log store. Exactly one segment is "open" (being appended to); the
/// rest are sealed and immutable. See `SPEC_FULL.md` §4.2/§6.3 for the on-disk layout.
pub struct SegmentLog {
    dir: PathBuf,
    sealed: Vec<Segment>,
    open: Segment,
    prev_index: LogIndex,
    prev_term: TermId,
    last_taken: LogIndex,
    segment_max_bytes: u64,
    fsync_interval_entries: u64,
    entries_since_fsync: u64,
}

fn idx(id: u64) -> LogIndex {
    LogIndex { id }
}

fn term(id: u64) -> TermId {
    TermId { id }
}

impl SegmentLog {
    /// Opens (creating if necessary) a log store rooted at `dir`, recovering sealed segments by
    /// directory scan and tail-scanning the open segment to find the true end of the log.
    pub fn open(dir: impl AsRef<Path>, segment_max_bytes: u64) -> KeeperResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut sealed = Vec::new();
        let mut open_path: Option<(PathBuf, u64)> = None;

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix("log_open_") {
                let start: u64 = rest
                    .parse()
                    .map_err(|_| KeeperError::CorruptSegment {
                        path: name.to_string(),
                        reason: "bad open-segment filename".to_string(),
                    })?;
                open_path = Some((entry.path(), start));
            } else if let Some(rest) = name.strip_prefix("log_") {
                let mut parts = rest.splitn(2, '_');
                let start: u64 = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| KeeperError::CorruptSegment {
                        path: name.to_string(),
                        reason: "bad sealed-segment filename".to_string(),
                    })?;
                let end: u64 = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| KeeperError::CorruptSegment {
                        path: name.to_string(),
                        reason: "bad sealed-segment filename".to_string(),
                    })?;
                sealed.push(Segment::open_sealed(entry.path(), start, end)?);
            }
        }

        sealed.sort_by_key(|s| s.start_index());

        let (open, prev_index, prev_term) = match open_path {
            Some((path, start)) => {
                let prev = sealed.last().map(|s| s.last_term()).unwrap_or_default();
                let open = Segment::recover_open(path, start)?;
                let prev_index = if start > 1 { idx(start - 1) } else { idx(0) };
                (open, prev_index, prev.unwrap_or_else(|| term(0)))
            }
            None => {
                let next_start = sealed.last().map(|s| s.end_index() + 1).unwrap_or(1);
                let prev_index = if next_start > 1 {
                    idx(next_start - 1)
                } else {
                    idx(0)
                };
                let prev_term = sealed
                    .last()
                    .and_then(|s| s.last_term())
                    .unwrap_or_else(|| term(0));
                let path = dir.join(format!("log_open_{}", next_start));
                (Segment::create_open(path, next_start)?, prev_index, prev_term)
            }
        };

        Ok(SegmentLog {
            dir,
            sealed,
            open,
            prev_index,
            prev_term,
            last_taken: LogIndex::default(),
            segment_max_bytes,
            fsync_interval_entries: 1,
            entries_since_fsync: 0,
        })
    }

    pub fn set_fsync_interval_entries(&mut self, n: u64) {
        self.fsync_interval_entries = n.max(1);
    }

    /// Forces an fsync of the open segment regardless of the entry-count threshold, for the
    /// time-based `log.fsync_interval_ms` trigger driven by the Raft adapter's tick loop.
    pub fn fsync_now(&mut self) -> KeeperResult<()> {
        self.open.fsync()?;
        self.entries_since_fsync = 0;
        Ok(())
    }

    /// Advances `last_taken` past every entry already folded into an installed snapshot, without
    /// reading them back (they may already be gone from a truncated prefix). Must be called right
    /// after a snapshot install and before the log is driven by the Raft node, or
    /// `take_committed()` would try to re-deliver entries the snapshot already covers and get
    /// stuck the first time it reaches a truncated index.
    pub fn fast_forward_taken(&mut self, index: LogIndex) {
        self.last_taken = index;
    }

    fn seal_open_if_full(&mut self) -> KeeperResult<()> {
        if self.open.byte_len() < self.segment_max_bytes {
            return Ok(());
        }
        self.open.fsync()?;
        let next_start = self.open.end_index() + 1;
        let sealed_path = self.dir.join(format!(
            "log_{}_{}",
            self.open.start_index(),
            self.open.end_index()
        ));
        let open_path = self.open.path().to_path_buf();
        fs::rename(&open_path, &sealed_path)?;
        let sealed = Segment::open_sealed(sealed_path, self.open.start_index(), self.open.end_index())?;
        let new_open_path = self.dir.join(format!("log_open_{}", next_start));
        let new_open = Segment::create_open(new_open_path, next_start)?;
        self.sealed.push(std::mem::replace(&mut self.open, new_open));
        let _ = sealed; // re-read copy dropped; self.sealed already holds the in-memory segment
        Ok(())
    }

    fn find_segment(&mut self, index: LogIndex) -> Option<SegmentRef<'_>> {
        if index.id >= self.open.start_index() && index.id <= self.open.end_index() {
            return Some(SegmentRef::Open(&mut self.open));
        }
        self.sealed
            .iter_mut()
            .find(|s| index.id >= s.start_index() && index.id <= s.end_index())
            .map(SegmentRef::Sealed)
    }

    /// Deletes sealed segments wholly covered by a snapshot up to and including `upto`, updating
    /// `prev_index`/`prev_term` to the last discarded entry's position.
    pub fn truncate_prefix(&mut self, upto: LogIndex) -> KeeperResult<()> {
        while let Some(seg) = self.sealed.first() {
            if seg.end_index() > upto.id {
                break;
            }
            let last_term = seg
                .last_term()
                .unwrap_or(self.prev_term);
            self.prev_index = idx(seg.end_index());
            self.prev_term = last_term;
            fs::remove_file(seg.path())?;
            self.sealed.remove(0);
        }
        Ok(())
    }
}

enum SegmentRef<'a> {
    Open(&'a mut Segment),
    Sealed(&'a mut Segment),
}

impl Log for SegmentLog {
    type Error = KeeperError;

    fn append(&mut self, entry: LogEntry) -> Result<(), Self::Error> {
        let entry_type = if entry.data.is_empty() {
            EntryType::Noop
        } else {
            EntryType::App
        };
        self.open.append(entry.term, entry_type, &entry.data)?;
        self.entries_since_fsync += 1;
        if self.entries_since_fsync >= self.fsync_interval_entries {
            self.open.fsync()?;
            self.entries_since_fsync = 0;
        }
        self.seal_open_if_full()?;
        Ok(())
    }

    fn cancel_from(&mut self, from_index: LogIndex) -> Result<usize, Self::Error> {
        if from_index.id <= self.prev_index.id {
            return Err(KeeperError::RaftLog);
        }
        // sealed segments are immutable once written; in this design suffix truncation only
        // ever needs to reach back into the open segment, because a segment only seals once
        // every entry in it is already committed durability-wise on this node.
        if from_index.id < self.open.start_index() {
            return Err(KeeperError::RaftLog);
        }
        let removed = self.open.truncate_from(from_index.id)?;
        if self.last_taken.id >= from_index.id {
            self.last_taken = idx(from_index.id - 1);
        }
        Ok(removed)
    }

    fn entry_len(&self, entry: &LogEntry) -> usize {
        segment::ENTRY_HEADER_LEN + entry.data.len()
    }

    fn get(&mut self, index: LogIndex) -> Option<LogEntry> {
        match self.find_segment(index)? {
            SegmentRef::Open(seg) | SegmentRef::Sealed(seg) => seg.read(index.id).ok().flatten(),
        }
    }

    fn get_term(&mut self, index: LogIndex) -> Option<TermId> {
        if index == self.prev_index {
            return Some(self.prev_term);
        }
        self.get(index).map(|e| e.term)
    }

    fn last_taken_index(&self) -> LogIndex {
        self.last_taken
    }

    fn last_index(&self) -> LogIndex {
        idx(self.open.end_index().max(self.prev_index.id))
    }

    fn last_term(&self) -> TermId {
        self.open.last_term().unwrap_or(self.prev_term)
    }

    fn prev_index(&self) -> LogIndex {
        self.prev_index
    }

    fn prev_term(&self) -> TermId {
        self.prev_term
    }

    fn take_next(&mut self) -> Option<LogEntry> {
        let next = idx(self.last_taken.id + 1);
        let entry = self.get(next)?;
        self.last_taken = next;
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn entry(term_id: u64, data: &[u8]) -> LogEntry {
        LogEntry {
            term: term(term_id),
            data: Bytes::copy_from_slice(data),
        }
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = SegmentLog::open(dir.path(), 64 * 1024 * 1024).unwrap();
        log.append(entry(1, b"hello")).unwrap();
        log.append(entry(1, b"world")).unwrap();
        assert_eq!(log.last_index(), idx(2));
        assert_eq!(log.get(idx(1)).unwrap().data.as_ref(), b"hello");
        assert_eq!(log.get(idx(2)).unwrap().data.as_ref(), b"world");
        assert_eq!(log.get_term(idx(2)), Some(term(1)));
    }

    #[test]
    fn recovers_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = SegmentLog::open(dir.path(), 64 * 1024 * 1024).unwrap();
            for i in 0..10 {
                log.append(entry(1, format!("entry-{}", i).as_bytes())).unwrap();
            }
        }
        let mut log = SegmentLog::open(dir.path(), 64 * 1024 * 1024).unwrap();
        assert_eq!(log.last_index(), idx(10));
        assert_eq!(log.get(idx(5)).unwrap().data.as_ref(), b"entry-4");
    }

    #[test]
    fn take_next_is_sequential_and_single_shot() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = SegmentLog::open(dir.path(), 64 * 1024 * 1024).unwrap();
        log.append(entry(1, b"a")).unwrap();
        log.append(entry(1, b"b")).unwrap();
        assert_eq!(log.take_next().unwrap().data.as_ref(), b"a");
        assert_eq!(log.take_next().unwrap().data.as_ref(), b"b");
        assert!(log.take_next().is_none());
    }

    #[test]
    fn truncate_suffix_drops_uncommitted_tail() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = SegmentLog::open(dir.path(), 64 * 1024 * 1024).unwrap();
        log.append(entry(1, b"a")).unwrap();
        log.append(entry(1, b"b")).unwrap();
        log.append(entry(2, b"c")).unwrap();
        let removed = log.cancel_from(idx(2)).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(log.last_index(), idx(1));
        assert!(log.get(idx(2)).is_none());
    }

    #[test]
    fn recovers_entries_written_after_an_empty_noop_entry() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = SegmentLog::open(dir.path(), 64 * 1024 * 1024).unwrap();
            log.append(entry(1, b"before")).unwrap();
            log.append(entry(2, b"")).unwrap();
            log.append(entry(2, b"after")).unwrap();
        }
        let mut log = SegmentLog::open(dir.path(), 64 * 1024 * 1024).unwrap();
        assert_eq!(log.last_index(), idx(3));
        assert_eq!(log.get(idx(1)).unwrap().data.as_ref(), b"before");
        assert_eq!(log.get(idx(2)).unwrap().data.as_ref(), b"" as &[u8]);
        assert_eq!(log.get(idx(3)).unwrap().data.as_ref(), b"after");
    }

    #[test]
    fn seals_segments_past_the_byte_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = SegmentLog::open(dir.path(), 64).unwrap();
        for i in 0..20 {
            log.append(entry(1, format!("payload-{:03}", i).as_bytes()))
                .unwrap();
        }
        assert!(!log.sealed.is_empty());
        assert_eq!(log.last_index(), idx(20));
        for i in 0..20 {
            assert_eq!(
                log.get(idx(i + 1)).unwrap().data.as_ref(),
                format!("payload-{:03}", i).as_bytes()
            );
        }
    }
}
