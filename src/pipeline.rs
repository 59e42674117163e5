//! Shared types for the request pipeline (`C6`): the unit of work handed from a client
//! connection (or the session manager, or a forwarded follower request) to the coordinator that
//! owns the Raft adapter, and the channel back to whoever is waiting on its outcome.
//!
//! Every write — whether it arrived on a directly-connected client socket, was relayed from a
//! follower by `crate::forwarder`, or was synthesized internally by `crate::session_manager` to
//! expire a session — flows through exactly this type, so `crate::cluster::Coordinator` has a
//! single intake queue and a single correlation table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crossbeam_channel::Sender;

use crate::config::Config;
use crate::wire::{ErrorCode, Response, WatchEvent};

/// Everything the coordinator ever pushes out to a single locally-connected client: the outcome
/// of one of its own writes, or a watch notification triggered by *any* mutation (its own or
/// someone else's). Both flow down the same per-connection channel so `crate::server`'s writer
/// task needs no cross-channel ordering — a response and the notifications it causes are always
/// enqueued by `crate::cluster`'s single coordinator thread in causal order (`SPEC_FULL.md` §4.6:
/// "a watch notification for operation at zxid=Z is delivered no earlier than the response whose
/// zxid=Z"), and a single channel preserves whatever order its one producer thread sent in.
pub enum ConnDelivery {
    Response(WriteOutcome),
    Watch(WatchEvent),
}

/// How the coordinator should deliver the outcome of a proposed write once it knows one (either
/// because proposing it failed outright, or because it was later observed committed).
pub enum ReplyTarget {
    /// A client connected directly to this node is blocked waiting on `rx`.
    Connection(Sender<ConnDelivery>),
    /// This node is the leader and the write was relayed here by a follower's forwarder (`C7`).
    /// Nobody on this node is waiting for the *result*; the follower learns it from its own
    /// local apply (see `SPEC_FULL.md` §2). This node owes the follower only a fast ack/nack at
    /// propose time, sent over `lane` keyed by the same `(session_id, xid)` pair the follower is
    /// tracking it under.
    Ack {
        lane: Sender<Vec<u8>>,
        key: PendingKey,
    },
    /// Internally generated (session expiry); nobody is waiting at all.
    None,
}

/// One write destined for the Raft log: a client mutation, a `createSession`/`closeSession`, or
/// a forwarded equivalent. `session_id` is `0` only for a brand-new `connect`; `crate::forwarder`
/// substitutes a per-node-unique negative placeholder in that case so that concurrent connects on
/// the same node never collide in the coordinator's pending table (see `SPEC_FULL.md` §4.6/§4.7).
pub struct WriteWork {
    pub session_id: i64,
    pub xid: i64,
    pub opcode: i32,
    pub arrival_time_ms: i64,
    pub body: Vec<u8>,
    pub reply: ReplyTarget,
}

/// The result delivered back to whoever is holding a [`ReplyTarget::Connection`] receiver. Carries
/// the client's own `xid` back since a connection's writer drains replies to many in-flight
/// requests (and watch notifications) off one shared channel and needs it to frame the reply.
pub struct WriteOutcome {
    pub xid: i64,
    pub zxid: i64,
    pub err: ErrorCode,
    pub response: Response,
}

impl WriteOutcome {
    pub fn connection_loss(xid: i64) -> Self {
        WriteOutcome {
            xid,
            zxid: -1,
            err: ErrorCode::ConnectionLoss,
            response: Response::Void,
        }
    }

    pub fn operation_timeout(xid: i64) -> Self {
        WriteOutcome {
            xid,
            zxid: -1,
            err: ErrorCode::OperationTimeout,
            response: Response::Void,
        }
    }
}

/// A key a [`WriteWork`] is tracked under in the coordinator's pending table: the submitting
/// session (or a forwarder placeholder) and the client-chosen `xid`.
pub type PendingKey = (i64, i64);

/// Handle shared by every producer of [`WriteWork`] — client connections, the session manager,
/// the forwarder's server side — so they all feed the same coordinator intake queue.
#[derive(Clone)]
pub struct WriteSink {
    tx: Sender<WriteWork>,
}

impl WriteSink {
    pub fn new(tx: Sender<WriteWork>) -> Self {
        WriteSink { tx }
    }

    pub fn submit(&self, work: WriteWork) {
        // The coordinator never exits while the process is alive; a send error here means
        // shutdown is already underway, which the caller's own timeout handling will surface.
        let _ = self.tx.send(work);
    }
}

pub type SharedWriteSink = Arc<WriteSink>;

/// Maps a session to the watch channel of whichever locally-connected client owns it. Every node
/// applies every committed entry (that's the point of replication), so every node's coordinator
/// independently discovers which of its *own* locally-connected sessions have a watch firing and
/// looks them up here; a session owned by a client connected to a different node is simply absent
/// and the notification is dropped, because that other node is doing the same lookup against its
/// own copy of this table and will deliver it from there.
pub type ConnectionDirectory = Arc<RwLock<HashMap<i64, Sender<ConnDelivery>>>>;

pub fn new_connection_directory() -> ConnectionDirectory {
    Arc::new(RwLock::new(HashMap::new()))
}

/// This node's live view of cluster leadership, updated by `crate::cluster::Coordinator` on every
/// tick and read by `crate::server` (to decide whether a read may be served locally) and
/// `crate::forwarder` (to decide whether a write must be relayed, and to whom).
pub struct RoleState {
    is_leader: AtomicBool,
    leader_id: AtomicU64,
    /// The best-known Raft commit index, refreshed by `crate::cluster`'s coordinator loop on
    /// every tick and gossip message. `crate::server` polls this to implement the `sync` barrier
    /// (`SPEC_FULL.md` §4.4, §5 point 4): a `sync` response is only sent once this node's own
    /// `last_applied_index` has caught up to the value read here.
    commit_index: AtomicU64,
}

impl RoleState {
    pub fn new() -> Self {
        RoleState {
            is_leader: AtomicBool::new(false),
            leader_id: AtomicU64::new(0),
            commit_index: AtomicU64::new(0),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    /// `0` means no leader is currently known.
    pub fn leader_id(&self) -> u64 {
        self.leader_id.load(Ordering::Acquire)
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index.load(Ordering::Acquire)
    }

    pub fn update(&self, is_leader: bool, leader_id: Option<u64>, commit_index: u64) {
        self.is_leader.store(is_leader, Ordering::Release);
        self.leader_id.store(leader_id.unwrap_or(0), Ordering::Release);
        // The commit index only ever advances; a stale caller (e.g. a gossip message processed
        // out of order with a tick) must never move it backwards.
        self.commit_index.fetch_max(commit_index, Ordering::AcqRel);
    }
}

pub type SharedRoleState = Arc<RoleState>;

/// Every peer's internal (Raft + forwarder) endpoint, keyed by node id. Built once from
/// `server.peers` at startup; this crate has no dynamic membership change, so the table never
/// needs to be updated afterwards (see `SPEC_FULL.md` §9 Open Questions).
pub fn build_peer_table(config: &Config) -> HashMap<u64, String> {
    config
        .server
        .peers
        .iter()
        .map(|p| (p.id, p.endpoint.clone()))
        .collect()
}

/// Issues the placeholder session ids a connection uses in place of the real (not yet known)
/// session id of an in-flight `connect`, so concurrent connects on the same node never collide in
/// the coordinator's pending table. Always negative; real session ids start at `1`
/// (`KeeperStore::next_session_id`), so the two ranges never overlap.
pub struct SynthSessionIds {
    next: std::sync::atomic::AtomicI64,
}

impl SynthSessionIds {
    pub fn new() -> Self {
        SynthSessionIds {
            next: std::sync::atomic::AtomicI64::new(-1),
        }
    }

    pub fn next(&self) -> i64 {
        self.next.fetch_sub(1, Ordering::Relaxed)
    }
}

pub type SharedSynthSessionIds = Arc<SynthSessionIds>;
