//! The Raft adapter (`C5`): owns the Raft node, the keeper store, and the snapshot store, and is
//! the only component allowed to call [`KeeperStore::apply`]. Everything else — the request
//! pipeline (`C6`), the forwarder (`C7`), the peer transport (`cluster`) — talks to a single
//! `RaftAdapter` instance over channels; see `SPEC_FULL.md` §4.5.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use rand::Rng;
use rand_chacha::ChaChaRng;
use rand_core::SeedableRng;

use raft::message::{LogIndex, SendableMessage};
use raft::node::{AppendError, Config as RaftConfig, Node};

use crate::config::Config;
use crate::error::{KeeperError, Result};
use crate::keeper::{ApplyResult, KeeperStore};
use crate::log_store::SegmentLog;
use crate::snapshot::{RaftPersisted, SnapshotStore};
use crate::wire::log_entry::LogPayload;
use crate::wire::Request;

/// Concrete Raft node type this crate drives. The vendored library is generic over the log, the
/// RNG and the node-id type; we fix all three here so the rest of the crate can name `RaftNode`
/// directly instead of repeating the parameter list.
pub type RaftNode = Node<SegmentLog, ChaChaRng, u64>;

/// Minimum number of timer ticks before a node with no leader calls an election. Not exposed via
/// `Config` — the wire-visible config surface in `SPEC_FULL.md` §6.4 only lists `server`,
/// `coordination`, `log`, `forwarder` and `logging`; these are internal tuning constants for the
/// embedded Raft core.
pub const ELECTION_TIMEOUT_TICKS: u32 = 10;
pub const HEARTBEAT_INTERVAL_TICKS: u32 = 3;
pub const REPLICATION_CHUNK_SIZE: usize = 256 * 1024;
/// Wall-clock spacing between calls to `RaftNode::timer_tick`, driven by the `cluster` transport
/// loop. Combined with the tick constants above this yields an election timeout around 1s and a
/// heartbeat interval around 300ms.
pub const TICK_INTERVAL_MS: u64 = 100;

fn idx(id: u64) -> LogIndex {
    LogIndex { id }
}

/// Error proposing a new write: either this node isn't (or stopped being) the leader and the
/// caller should redirect through the forwarder (`C7`), or the backing log store itself failed,
/// which is fatal for this node.
#[derive(Debug)]
pub enum ProposeError {
    NotLeader,
    Log(KeeperError),
}

/// One committed, applied log entry ready for `C6` to route a response for.
pub struct Applied {
    pub log_index: u64,
    pub session_id: i64,
    pub xid: i64,
    pub arrival_time_ms: i64,
    pub result: ApplyResult,
}

/// Shared handle to the keeper store. Writes only ever happen from the single thread that owns
/// `RaftAdapter::drain_committed`; the `RwLock` exists so the read worker pool (`C6`) can serve
/// local reads concurrently, matching the teacher crate's `Arc<Mutex<Storage>>` connection-handler
/// pattern but widened to a reader-writer lock since reads vastly outnumber writes here.
pub type SharedStore = Arc<RwLock<KeeperStore>>;

pub struct RaftAdapter {
    node: RaftNode,
    store: SharedStore,
    snapshots: SnapshotStore,
    snapshot_distance: u64,
    last_snapshot_index: u64,
    /// The index the next entry drained from `take_committed` must carry; enforced as an
    /// invariant (`SPEC_FULL.md` §4.5) rather than trusted.
    next_apply_index: u64,
}

impl RaftAdapter {
    /// Opens the log and snapshot stores rooted at `config.data_dir()`, replays the newest
    /// snapshot (if any) into a fresh `KeeperStore`, and constructs the Raft node on top of the
    /// recovered log. Must run once at process startup, before any peer or client traffic is
    /// accepted.
    pub fn open(config: &Config) -> Result<Self> {
        let data_dir = Path::new(config.data_dir());
        let log_dir = data_dir.join("log");
        let snapshot_dir = data_dir.join("snapshots");

        let mut log = SegmentLog::open(&log_dir, config.log.segment_max_bytes)?;
        log.set_fsync_interval_entries(config.log.fsync_interval_entries.max(1));

        let snapshots = SnapshotStore::open(
            &snapshot_dir,
            config.coordination.snapshot_save_batch_size,
            config.coordination.keep_snapshots,
        )?;

        let mut store = KeeperStore::new(config.coordination.max_node_size);
        let mut last_snapshot_index = 0u64;

        if let Some((path, _last_idx, _last_term)) = snapshots.latest()? {
            let contents = snapshots.install(&path)?;
            let next_session_id = contents.sessions.keys().max().copied().map(|id| id + 1).unwrap_or(1);
            store.replace_with(
                contents.nodes,
                contents.sessions,
                contents.acl_map,
                contents.counters,
                next_session_id,
            );
            store.set_last_applied(contents.meta.last_applied_index, contents.meta.last_applied_term);
            last_snapshot_index = contents.meta.last_applied_index;
            // `contents.meta.raft` (persisted term/voted_for/commit_index) has no public API to
            // feed back into a fresh `Node` — see the restart-state limitation documented below
            // and in DESIGN.md. It is read here only implicitly via the `install` call above and
            // otherwise dropped.

            // The log may still physically hold entries below the snapshot boundary (truncation
            // is best-effort cleanup, not a correctness requirement) but they must never be
            // re-delivered, and `take_next` may not even be able to read them back if an earlier
            // run already dropped that prefix. Advance past them before the Raft node ever starts
            // walking the log.
            log.truncate_prefix(idx(last_snapshot_index))?;
            log.fast_forward_taken(idx(last_snapshot_index));
        }

        let next_apply_index = store.last_applied_index() + 1;
        let store = Arc::new(RwLock::new(store));

        let mut peers: BTreeSet<u64> = config
            .server
            .peers
            .iter()
            .filter(|p| p.voting)
            .map(|p| p.id)
            .collect();
        peers.insert(config.server.my_id);

        let seed: u64 = rand::thread_rng().gen();
        let random = ChaChaRng::seed_from_u64(seed);

        let raft_config = RaftConfig {
            election_timeout_ticks: ELECTION_TIMEOUT_TICKS,
            heartbeat_interval_ticks: HEARTBEAT_INTERVAL_TICKS,
            replication_chunk_size: REPLICATION_CHUNK_SIZE,
        };
        let node = Node::new(config.server.my_id, peers, log, random, raft_config);

        Ok(RaftAdapter {
            node,
            store,
            snapshots,
            snapshot_distance: config.coordination.snapshot_distance.max(1),
            last_snapshot_index,
            next_apply_index,
        })
    }

    pub fn node(&self) -> &RaftNode {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut RaftNode {
        &mut self.node
    }

    /// Returns a cloned handle to the shared store for the read worker pool (`C6`) to serve local
    /// reads without routing through the coordinator thread.
    pub fn store_handle(&self) -> SharedStore {
        Arc::clone(&self.store)
    }

    pub fn is_leader(&self) -> bool {
        self.node.is_leader()
    }

    pub fn leader_id(&self) -> Option<u64> {
        self.node.leader().0.copied()
    }

    pub fn my_id(&self) -> u64 {
        *self.node.node_id()
    }

    /// Submits one client write for replication. Returns the messages the caller must deliver to
    /// peers (same contract as `RaftNode::append`/`receive`/`timer_tick`).
    pub fn propose(
        &mut self,
        payload: &LogPayload,
    ) -> std::result::Result<Vec<SendableMessage<u64>>, ProposeError> {
        let bytes = Bytes::from(payload.encode());
        match self.node.append(bytes) {
            Ok(messages) => Ok(messages.collect()),
            Err(AppendError::Cancelled { .. }) => Err(ProposeError::NotLeader),
            Err(AppendError::LogErr(e)) => Err(ProposeError::Log(e)),
        }
    }

    /// Drains every newly-committed log entry, applies it to the keeper store in order, and
    /// triggers a new snapshot if enough entries have accumulated since the last one.
    pub fn drain_committed(&mut self) -> Result<Vec<Applied>> {
        let entries: Vec<_> = self.node.take_committed().collect();
        let mut out = Vec::with_capacity(entries.len());

        for entry in entries {
            let index = self.next_apply_index;
            let mut store = self.store.write().expect("keeper store lock poisoned");
            assert_eq!(
                store.last_applied_index() + 1,
                index,
                "raft adapter observed an index gap applying committed entries"
            );
            self.next_apply_index += 1;

            if entry.data.is_empty() {
                // An empty-data entry is the noop a new leader appends on election (see
                // `raft::core::State::become_leader`); there is nothing to apply, but the index
                // still counts.
                store.set_last_applied(index, entry.term.id);
                continue;
            }

            let payload = LogPayload::decode(&entry.data)
                .map_err(|_| KeeperError::Marshalling("corrupt committed log payload".to_string()))?;
            let request = Request::decode(payload.opcode, &payload.body)
                .map_err(|_| KeeperError::Marshalling("corrupt committed request body".to_string()))?;

            let result = store.apply(
                payload.session_id,
                payload.arrival_time_ms,
                index as i64,
                &request,
            );
            store.set_last_applied(index, entry.term.id);
            drop(store);

            out.push(Applied {
                log_index: index,
                session_id: payload.session_id,
                xid: payload.xid,
                arrival_time_ms: payload.arrival_time_ms,
                result,
            });
        }

        if !out.is_empty() {
            self.maybe_snapshot()?;
        }
        Ok(out)
    }

    fn maybe_snapshot(&mut self) -> Result<()> {
        let last_applied = self.store.read().expect("keeper store lock poisoned").last_applied_index();
        let distance = last_applied.saturating_sub(self.last_snapshot_index);
        if distance >= self.snapshot_distance {
            self.create_snapshot()?;
        }
        Ok(())
    }

    /// Writes a new snapshot at the current `last_applied_index`, truncates the log prefix it
    /// covers, and prunes older snapshots past `coordination.keep_snapshots`.
    pub fn create_snapshot(&mut self) -> Result<PathBuf> {
        let store = self.store.read().expect("keeper store lock poisoned");
        let last_idx = store.last_applied_index();
        let last_term = store.last_applied_term();
        let raft = RaftPersisted {
            // The vendored core exposes no public accessor for its own `current_term`/`voted_for`
            // once a `Node` exists (`leader()` only returns the term of the best-known leader, not
            // this node's local view); `voted_for` has no accessor at all. Both are therefore
            // recorded best-effort for operational inspection of the snapshot meta file only, and
            // are never fed back into `Node::new` on restart. See DESIGN.md.
            term: self.node.leader().1.id,
            voted_for: None,
            commit_index: self.node.last_committed_log_index().id,
        };
        let path = self.snapshots.create(&store, last_idx, last_term, raft)?;
        drop(store);
        self.node.log_mut().truncate_prefix(idx(last_idx))?;
        self.snapshots.prune()?;
        self.last_snapshot_index = last_idx;
        Ok(path)
    }

    /// Forces an fsync of the open log segment; called periodically by the `cluster` transport
    /// loop at `log.fsync_interval_ms`, independent of the entry-count trigger.
    pub fn fsync_log(&mut self) -> Result<()> {
        self.node.log_mut().fsync_now()
    }

    pub fn snapshot_distance(&self) -> u64 {
        self.snapshot_distance
    }
}
