//! A single log segment file: `[entry...]`, entry = `[len:u32][term:u64][type:u8][crc32c:u32]
//! [payload]`. Sealed segments are immutable; the open segment is appended to and tail-scanned
//! on recovery.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use raft::message::{LogEntry, TermId};

use crate::error::{KeeperError, Result as KeeperResult};

pub const ENTRY_HEADER_LEN: usize = 4 + 8 + 1 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    App = 1,
    Conf = 2,
    Noop = 3,
}

impl EntryType {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(EntryType::App),
            2 => Some(EntryType::Conf),
            3 => Some(EntryType::Noop),
            _ => None,
        }
    }
}

pub struct Segment {
    path: PathBuf,
    file: File,
    start_index: u64,
    offsets: Vec<u64>,
    terms: Vec<u64>,
    byte_len: u64,
}

fn entry_crc(term: u64, entry_type: u8, payload: &[u8]) -> u32 {
    let mut buf = Vec::with_capacity(9 + payload.len());
    buf.write_u64::<BigEndian>(term).unwrap();
    buf.write_u8(entry_type).unwrap();
    buf.extend_from_slice(payload);
    crc32c::crc32c(&buf)
}

impl Segment {
    pub fn create_open(path: PathBuf, start_index: u64) -> KeeperResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Segment {
            path,
            file,
            start_index,
            offsets: Vec::new(),
            terms: Vec::new(),
            byte_len: 0,
        })
    }

    /// Tail-scans an existing open-segment file, validating each entry's CRC and stopping (and
    /// truncating the file) at the first short read or checksum mismatch.
    pub fn recover_open(path: PathBuf, start_index: u64) -> KeeperResult<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let (offsets, terms, valid_len) = scan_entries(&mut file)?;
        file.set_len(valid_len)?;
        file.seek(SeekFrom::End(0))?;
        Ok(Segment {
            path,
            file,
            start_index,
            offsets,
            terms,
            byte_len: valid_len,
        })
    }

    /// Opens a sealed segment, validating it contains exactly `end_index - start_index + 1`
    /// entries. Any corruption here is fatal: sealed segments are assumed durable.
    pub fn open_sealed(path: PathBuf, start_index: u64, end_index: u64) -> KeeperResult<Self> {
        let mut file = OpenOptions::new().read(true).open(&path)?;
        let (offsets, terms, valid_len) = scan_entries(&mut file)?;
        let expected = (end_index - start_index + 1) as usize;
        if offsets.len() != expected {
            return Err(KeeperError::CorruptSegment {
                path: path.display().to_string(),
                reason: format!(
                    "expected {} entries, found {} valid entries",
                    expected,
                    offsets.len()
                ),
            });
        }
        Ok(Segment {
            path,
            file,
            start_index,
            offsets,
            terms,
            byte_len: valid_len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn start_index(&self) -> u64 {
        self.start_index
    }

    pub fn end_index(&self) -> u64 {
        self.start_index + self.offsets.len() as u64 - 1
    }

    pub fn byte_len(&self) -> u64 {
        self.byte_len
    }

    pub fn last_term(&self) -> Option<TermId> {
        self.terms.last().map(|&id| TermId { id })
    }

    pub fn append(&mut self, term: TermId, entry_type: EntryType, payload: &[u8]) -> KeeperResult<()> {
        let offset = self.byte_len;
        let crc = entry_crc(term.id, entry_type as u8, payload);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_u32::<BigEndian>(payload.len() as u32)?;
        self.file.write_u64::<BigEndian>(term.id)?;
        self.file.write_u8(entry_type as u8)?;
        self.file.write_u32::<BigEndian>(crc)?;
        self.file.write_all(payload)?;
        self.byte_len = offset + ENTRY_HEADER_LEN as u64 + payload.len() as u64;
        self.offsets.push(offset);
        self.terms.push(term.id);
        Ok(())
    }

    pub fn fsync(&self) -> KeeperResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn read(&mut self, global_index: u64) -> KeeperResult<Option<LogEntry>> {
        let local = match global_index.checked_sub(self.start_index) {
            Some(i) => i as usize,
            None => return Ok(None),
        };
        let offset = match self.offsets.get(local) {
            Some(&o) => o,
            None => return Ok(None),
        };
        self.file.seek(SeekFrom::Start(offset))?;
        let len = self.file.read_u32::<BigEndian>()? as usize;
        let term = self.file.read_u64::<BigEndian>()?;
        let entry_type = self.file.read_u8()?;
        let crc = self.file.read_u32::<BigEndian>()?;
        let mut payload = vec![0u8; len];
        self.file.read_exact(&mut payload)?;
        let expected_crc = entry_crc(term, entry_type, &payload);
        if crc != expected_crc {
            return Err(KeeperError::CorruptSegment {
                path: self.path.display().to_string(),
                reason: format!("crc mismatch at index {}", global_index),
            });
        }
        Ok(Some(LogEntry {
            term: TermId { id: term },
            data: payload.into(),
        }))
    }

    /// Truncates this segment to drop every entry from `global_index` onward. Returns the
    /// number of entries removed.
    pub fn truncate_from(&mut self, global_index: u64) -> KeeperResult<usize> {
        let local = (global_index - self.start_index) as usize;
        if local >= self.offsets.len() {
            return Ok(0);
        }
        let new_len = self.offsets[local];
        let removed = self.offsets.len() - local;
        self.offsets.truncate(local);
        self.terms.truncate(local);
        self.file.set_len(new_len)?;
        self.byte_len = new_len;
        Ok(removed)
    }
}

/// Sequentially scans entries from the start of `file`, returning the valid entries' offsets and
/// terms plus the byte length up to (and including) the last fully valid entry. Stops silently at
/// the first short read or CRC mismatch, which is how the open segment's tail scan discards a
/// partially-written entry after a crash.
fn scan_entries(file: &mut File) -> KeeperResult<(Vec<u64>, Vec<u64>, u64)> {
    file.seek(SeekFrom::Start(0))?;
    let mut offsets = Vec::new();
    let mut terms = Vec::new();
    let mut pos = 0u64;

    loop {
        let header_start = pos;
        // A zero-length payload is a legitimate entry (the Raft core appends an empty-data
        // noop on every leadership change), so only a short read marks real EOF.
        let len = match file.read_u32::<BigEndian>() {
            Ok(n) => n as usize,
            Err(_) => break,
        };
        let term = match file.read_u64::<BigEndian>() {
            Ok(t) => t,
            Err(_) => break,
        };
        let entry_type = match file.read_u8() {
            Ok(t) => t,
            Err(_) => break,
        };
        if EntryType::from_u8(entry_type).is_none() {
            break;
        }
        let crc = match file.read_u32::<BigEndian>() {
            Ok(c) => c,
            Err(_) => break,
        };
        let mut payload = vec![0u8; len];
        if file.read_exact(&mut payload).is_err() {
            break;
        }
        if entry_crc(term, entry_type, &payload) != crc {
            break;
        }
        offsets.push(header_start);
        terms.push(term);
        pos = header_start + ENTRY_HEADER_LEN as u64 + len as u64;
    }

    Ok((offsets, terms, pos))
}
