//! The snapshot store (`C3`): periodic logical dumps of the keeper store, used to bound log
//! growth and to bootstrap a follower that has fallen too far behind the leader's log.

mod record;

use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{KeeperError, Result};
use crate::keeper::acl_map::AclMap;
use crate::keeper::session::Session;
use crate::keeper::znode::Znode;
use crate::keeper::KeeperStore;

const MAGIC_HEAD: &[u8; 8] = b"SnapHead";
const MAGIC_TAIL: &[u8; 8] = b"SnapTail";
const FORMAT_VERSION: &str = "v3";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordKind {
    Acl = 0,
    Session = 1,
    Node = 2,
    Ephemeral = 3,
    Counter = 4,
}

/// Small Raft state that must survive a restart but that the vendored Raft library keeps purely
/// in memory; persisted alongside the snapshot since there is no other durable home for it. See
/// `SPEC_FULL.md` §6.2.
#[derive(Debug, Clone, Copy, Default)]
pub struct RaftPersisted {
    pub term: u64,
    pub voted_for: Option<u64>,
    pub commit_index: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct SnapshotMeta {
    pub last_applied_index: u64,
    pub last_applied_term: u64,
    pub raft: RaftPersisted,
    pub object_count: u32,
}

/// Everything needed to rebuild a `KeeperStore` after a snapshot install.
pub struct SnapshotContents {
    pub nodes: HashMap<String, Znode>,
    pub sessions: HashMap<i64, Session>,
    pub acl_map: AclMap,
    pub counters: HashMap<String, u64>,
    pub meta: SnapshotMeta,
}

pub struct SnapshotStore {
    dir: PathBuf,
    save_batch_size: usize,
    keep_snapshots: usize,
}

impl SnapshotStore {
    pub fn open(dir: impl AsRef<Path>, save_batch_size: usize, keep_snapshots: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(SnapshotStore {
            dir,
            save_batch_size: save_batch_size.max(1),
            keep_snapshots: keep_snapshots.max(1),
        })
    }

    fn snapshot_dir_name(last_idx: u64, last_term: u64) -> String {
        format!("snapshot_{}_{}_{}", last_idx, last_term, FORMAT_VERSION)
    }

    /// Lists every installed snapshot directory, newest (`last_applied_index`) first.
    pub fn list(&self) -> Result<Vec<(PathBuf, u64, u64)>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix("snapshot_") {
                let mut parts = rest.splitn(3, '_');
                let idx: u64 = match parts.next().and_then(|s| s.parse().ok()) {
                    Some(v) => v,
                    None => continue,
                };
                let term: u64 = match parts.next().and_then(|s| s.parse().ok()) {
                    Some(v) => v,
                    None => continue,
                };
                out.push((entry.path(), idx, term));
            }
        }
        out.sort_by_key(|(_, idx, _)| *idx);
        Ok(out)
    }

    pub fn latest(&self) -> Result<Option<(PathBuf, u64, u64)>> {
        Ok(self.list()?.into_iter().last())
    }

    /// Writes a consistent logical dump of `store` at `last_applied_index`/`last_applied_term`,
    /// persisting `raft` state alongside it (see §6.2). Writes to a temp directory first, then
    /// renames into place so a crash mid-write never leaves a partially-named snapshot visible to
    /// `list`.
    pub fn create(
        &self,
        store: &KeeperStore,
        last_applied_index: u64,
        last_applied_term: u64,
        raft: RaftPersisted,
    ) -> Result<PathBuf> {
        let final_name = Self::snapshot_dir_name(last_applied_index, last_applied_term);
        let tmp_dir = self.dir.join(format!("{}.tmp", final_name));
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)?;
        }
        fs::create_dir_all(&tmp_dir)?;

        let mut object_count = 0u32;

        object_count += self.write_object(
            &tmp_dir,
            object_count,
            RecordKind::Acl,
            store.acl_map().entries().map(|(id, acl, rc)| record::encode_acl(id, acl, rc)),
        )?;
        object_count += self.write_object(
            &tmp_dir,
            object_count,
            RecordKind::Session,
            store.sessions().values().map(record::encode_session),
        )?;
        object_count += self.write_object(
            &tmp_dir,
            object_count,
            RecordKind::Node,
            store.nodes().iter().map(|(path, node)| record::encode_node(path, node)),
        )?;
        object_count += self.write_object(
            &tmp_dir,
            object_count,
            RecordKind::Ephemeral,
            store
                .all_ephemerals()
                .filter(|(_, paths)| !paths.is_empty())
                .map(|(id, paths)| record::encode_ephemerals(id, paths)),
        )?;
        object_count += self.write_object(
            &tmp_dir,
            object_count,
            RecordKind::Counter,
            store.counters().iter().map(|(path, counter)| record::encode_counter(path, *counter)),
        )?;

        let meta = SnapshotMeta {
            last_applied_index,
            last_applied_term,
            raft,
            object_count,
        };
        write_meta(&tmp_dir.join("meta"), &meta)?;

        let final_dir = self.dir.join(&final_name);
        if final_dir.exists() {
            fs::remove_dir_all(&final_dir)?;
        }
        fs::rename(&tmp_dir, &final_dir)?;
        Ok(final_dir)
    }

    /// Writes one object file containing every record from `records`, split into batches of
    /// `save_batch_size`. Returns `1` if anything was written, `0` if `records` was empty (no
    /// empty object file is created).
    fn write_object(
        &self,
        dir: &Path,
        object_id: u32,
        kind: RecordKind,
        records: impl Iterator<Item = Vec<u8>>,
    ) -> Result<u32> {
        let records: Vec<Vec<u8>> = records.collect();
        if records.is_empty() {
            return Ok(0);
        }
        let path = dir.join(format!("obj_{}", object_id));
        let mut file = fs::File::create(&path)?;
        file.write_all(MAGIC_HEAD)?;
        let mut rolling_crc = 0u32;

        for chunk in records.chunks(self.save_batch_size) {
            let mut data = Vec::new();
            data.write_u8(kind as u8)?;
            data.write_u32::<BigEndian>(chunk.len() as u32)?;
            for record in chunk {
                data.write_u32::<BigEndian>(record.len() as u32)?;
                data.extend_from_slice(record);
            }
            let crc = crc32c::crc32c(&data);
            file.write_u32::<BigEndian>(data.len() as u32)?;
            file.write_u32::<BigEndian>(crc)?;
            file.write_all(&data)?;
            rolling_crc = crc32c::crc32c_append(rolling_crc, &data);
        }

        file.write_all(MAGIC_TAIL)?;
        file.write_u32::<BigEndian>(rolling_crc)?;
        file.sync_all()?;
        Ok(1)
    }

    /// Loads the snapshot directory at `path`, validating every magic header/tail, per-batch CRC,
    /// and the rolling whole-object checksum. On any mismatch the install is refused (fatal,
    /// matching §7's "CRC mismatch in sealed segment" disposition — a corrupt snapshot is treated
    /// the same way).
    pub fn install(&self, path: &Path) -> Result<SnapshotContents> {
        let meta = read_meta(&path.join("meta"))?;

        let mut nodes = HashMap::new();
        let mut sessions = HashMap::new();
        let mut acl_map = AclMap::new();
        let mut counters = HashMap::new();
        let mut ephemerals: HashMap<i64, Vec<String>> = HashMap::new();

        for object_id in 0..meta.object_count {
            let obj_path = path.join(format!("obj_{}", object_id));
            let bytes = fs::read(&obj_path)?;
            self.load_object(&bytes, &obj_path, &mut nodes, &mut sessions, &mut acl_map, &mut counters, &mut ephemerals)?;
        }

        for (session_id, paths) in ephemerals {
            if let Some(session) = sessions.get_mut(&session_id) {
                session.ephemerals.extend(paths);
            }
        }

        Ok(SnapshotContents {
            nodes,
            sessions,
            acl_map,
            counters,
            meta,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn load_object(
        &self,
        bytes: &[u8],
        path: &Path,
        nodes: &mut HashMap<String, Znode>,
        sessions: &mut HashMap<i64, Session>,
        acl_map: &mut AclMap,
        counters: &mut HashMap<String, u64>,
        ephemerals: &mut HashMap<i64, Vec<String>>,
    ) -> Result<()> {
        let corrupt = |reason: String| KeeperError::CorruptSnapshot {
            name: path.display().to_string(),
            reason,
        };

        if bytes.len() < 8 || &bytes[..8] != MAGIC_HEAD {
            return Err(corrupt("missing head magic".to_string()));
        }
        if bytes.len() < 16 || &bytes[bytes.len() - 12..bytes.len() - 4] != MAGIC_TAIL {
            return Err(corrupt("missing tail magic".to_string()));
        }
        let expected_rolling = (&bytes[bytes.len() - 4..]).read_u32::<BigEndian>()?;
        let body = &bytes[8..bytes.len() - 12];

        let mut cursor = Cursor::new(body);
        let mut rolling_crc = 0u32;

        while (cursor.position() as usize) < body.len() {
            let data_len = cursor.read_u32::<BigEndian>()? as usize;
            let data_crc = cursor.read_u32::<BigEndian>()?;
            let start = cursor.position() as usize;
            let end = start + data_len;
            let data = body.get(start..end).ok_or_else(|| corrupt("truncated batch".to_string()))?;
            if crc32c::crc32c(data) != data_crc {
                return Err(corrupt("batch crc mismatch".to_string()));
            }
            rolling_crc = crc32c::crc32c_append(rolling_crc, data);

            let mut batch_cursor = Cursor::new(data);
            let kind = batch_cursor.read_u8()?;
            let count = batch_cursor.read_u32::<BigEndian>()?;
            for _ in 0..count {
                let record_len = batch_cursor.read_u32::<BigEndian>()? as usize;
                let record_start = batch_cursor.position() as usize;
                let record_end = record_start + record_len;
                let record_bytes = data
                    .get(record_start..record_end)
                    .ok_or_else(|| corrupt("truncated record".to_string()))?;
                let mut record_cursor = Cursor::new(record_bytes);
                match kind {
                    k if k == RecordKind::Acl as u8 => {
                        let (id, acl, refcount) = record::decode_acl(&mut record_cursor)?;
                        acl_map.insert_with_refcount(id, acl, refcount);
                    }
                    k if k == RecordKind::Session as u8 => {
                        let session = record::decode_session(&mut record_cursor)?;
                        sessions.insert(session.id, session);
                    }
                    k if k == RecordKind::Node as u8 => {
                        let (path, node) = record::decode_node(&mut record_cursor)?;
                        nodes.insert(path, node);
                    }
                    k if k == RecordKind::Ephemeral as u8 => {
                        let (session_id, paths) = record::decode_ephemerals(&mut record_cursor)?;
                        ephemerals.entry(session_id).or_default().extend(paths);
                    }
                    k if k == RecordKind::Counter as u8 => {
                        let (path, counter) = record::decode_counter(&mut record_cursor)?;
                        counters.insert(path, counter);
                    }
                    _ => return Err(corrupt(format!("unknown record kind {}", kind))),
                }
                batch_cursor.set_position((record_start + record_len) as u64);
            }
            cursor.set_position((start + data_len) as u64);
        }

        if rolling_crc != expected_rolling {
            return Err(corrupt("rolling checksum mismatch".to_string()));
        }
        Ok(())
    }

    /// Deletes every snapshot directory except the newest `keep_snapshots`.
    pub fn prune(&self) -> Result<()> {
        let all = self.list()?;
        if all.len() <= self.keep_snapshots {
            return Ok(());
        }
        for (path, _, _) in &all[..all.len() - self.keep_snapshots] {
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }
}

fn write_meta(path: &Path, meta: &SnapshotMeta) -> Result<()> {
    let mut buf = Vec::new();
    buf.write_u64::<BigEndian>(meta.last_applied_index)?;
    buf.write_u64::<BigEndian>(meta.last_applied_term)?;
    buf.write_u64::<BigEndian>(meta.raft.term)?;
    buf.write_u8(meta.raft.voted_for.is_some() as u8)?;
    buf.write_u64::<BigEndian>(meta.raft.voted_for.unwrap_or(0))?;
    buf.write_u64::<BigEndian>(meta.raft.commit_index)?;
    buf.write_u32::<BigEndian>(meta.object_count)?;
    fs::write(path, buf)?;
    Ok(())
}

fn read_meta(path: &Path) -> Result<SnapshotMeta> {
    let bytes = fs::read(path)?;
    let mut cursor = Cursor::new(bytes.as_slice());
    let last_applied_index = cursor.read_u64::<BigEndian>()?;
    let last_applied_term = cursor.read_u64::<BigEndian>()?;
    let term = cursor.read_u64::<BigEndian>()?;
    let has_voted_for = cursor.read_u8()? != 0;
    let voted_for_raw = cursor.read_u64::<BigEndian>()?;
    let commit_index = cursor.read_u64::<BigEndian>()?;
    let object_count = cursor.read_u32::<BigEndian>()?;
    Ok(SnapshotMeta {
        last_applied_index,
        last_applied_term,
        raft: RaftPersisted {
            term,
            voted_for: if has_voted_for { Some(voted_for_raw) } else { None },
            commit_index,
        },
        object_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::request::{ConnectRequest, CreateRequest, GetDataRequest};
    use crate::wire::{CreateFlags, Request};

    fn populated_store() -> KeeperStore {
        let mut store = KeeperStore::new(1024 * 1024);
        let connect = store.apply(
            0,
            0,
            0,
            &Request::Connect(ConnectRequest {
                protocol_version: 0,
                last_zxid_seen: 0,
                timeout_ms: 10_000,
                session_id: 0,
                password: Vec::new(),
            }),
        );
        let session_id = match connect.response {
            crate::wire::Response::Connect(c) => c.session_id,
            _ => unreachable!(),
        };
        store.apply(
            session_id,
            0,
            1,
            &Request::Create(CreateRequest {
                path: "/a".to_string(),
                data: b"hello".to_vec(),
                acl: Vec::new(),
                flags: CreateFlags {
                    ephemeral: true,
                    sequential: false,
                },
            }),
        );
        store
    }

    #[test]
    fn round_trips_a_populated_store() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = SnapshotStore::open(dir.path(), 10_000, 3).unwrap();
        let store = populated_store();

        let path = snapshots
            .create(&store, 42, 3, RaftPersisted { term: 3, voted_for: Some(1), commit_index: 42 })
            .unwrap();

        let contents = snapshots.install(&path).unwrap();
        assert_eq!(contents.meta.last_applied_index, 42);
        assert_eq!(contents.meta.raft.term, 3);
        assert_eq!(contents.meta.raft.voted_for, Some(1));
        assert!(contents.nodes.contains_key("/a"));
        assert!(contents.nodes.contains_key("/"));
        assert_eq!(contents.sessions.len(), 1);
        let session = contents.sessions.values().next().unwrap();
        assert!(session.ephemerals.contains("/a"));

        let _ = GetDataRequest {
            path: "/a".to_string(),
            watch: false,
        };
    }

    #[test]
    fn prune_keeps_only_the_newest() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = SnapshotStore::open(dir.path(), 10_000, 2).unwrap();
        let store = populated_store();
        for idx in 1..=4u64 {
            snapshots
                .create(&store, idx * 10, 1, RaftPersisted::default())
                .unwrap();
        }
        snapshots.prune().unwrap();
        let remaining = snapshots.list().unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].1, 30);
        assert_eq!(remaining[1].1, 40);
    }
}
