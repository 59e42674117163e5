//! Raft peer transport and replication coordinator (`cluster`).
//!
//! Owns the single `RaftAdapter` instance for this node and is the only thread that ever calls
//! into it. Drives the vendored Raft node's timer, ships its messages to peers, proposes writes
//! handed to it by `crate::server`/`crate::forwarder`/`crate::session_manager` through
//! `crate::pipeline`, and routes each committed entry's outcome — and any watch notifications it
//! produced — back to whoever is waiting.
//!
//! Grounded on the teacher's own `redisless::cluster` skeleton (rayon accept pool, crossbeam
//! channel, 100ms tick loop) — this is that skeleton with every `// TODO` filled in.

mod transport;

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Select, Sender};

use raft::message::{Message, MessageDestination, SendableMessage};

use crate::config::Config;
use crate::error::Result;
use crate::keeper::ApplyResult;
use crate::pipeline::{
    self, ConnectionDirectory, PendingKey, ReplyTarget, RoleState, SharedRoleState,
    SharedWriteSink, WriteOutcome, WriteSink, WriteWork,
};
use crate::raft_adapter::{Applied, ProposeError, RaftAdapter, SharedStore, TICK_INTERVAL_MS};
use crate::wire::log_entry::LogPayload;
use crate::wire::{ErrorCode, Response};

pub use transport::{dial_forwarder, Inbound};

/// Reported by `crate::forwarder` when it learns that a write it relayed was rejected by the
/// leader at propose time (or never made it there at all). A `Ok` ack never reaches here — it
/// carries no information this node needs, since it still waits for its own local commit.
pub struct ForwardedAck {
    pub key: PendingKey,
    pub err: ErrorCode,
}

/// Everything `bin/keeperd` needs to wire up the client-facing server and the forwarder once the
/// cluster transport and coordinator are running.
pub struct Cluster {
    pub role: SharedRoleState,
    pub store: SharedStore,
    /// Single intake queue for every write this node originates or relays, whether or not this
    /// node is currently leader — see [`run_coordinator`]/[`handle_write`] for how a non-leader
    /// transparently turns a submission into a forwarded one instead of rejecting it outright.
    pub write_sink: SharedWriteSink,
    /// Handle used by `crate::session_manager` to bulk-refresh session deadlines on the leader
    /// (`SPEC_FULL.md` §4.7/§4.8); `crate::server` never touches this directly, it only ever
    /// submits through `write_sink`.
    pub forwarder: crate::forwarder::Forwarder,
    pub forwarder_incoming: Receiver<TcpStream>,
    pub peer_table: HashMap<u64, String>,
}

/// Binds the peer listener, starts one dial thread per peer, and starts the coordinator thread
/// that owns `adapter`. Everything spawned here runs for the lifetime of the process.
pub fn start(
    config: &Config,
    adapter: RaftAdapter,
    connection_directory: ConnectionDirectory,
) -> Result<Cluster> {
    let peer_table = pipeline::build_peer_table(config);
    let my_id = config.server.my_id;
    let peer_endpoint = config.peer_endpoint()?;

    let (gossip_in_tx, gossip_in_rx) = unbounded();
    let (forward_conn_tx, forward_conn_rx) = unbounded();
    let listener = TcpListener::bind(&peer_endpoint)?;
    tracing::info!(addr = %peer_endpoint, "cluster transport listening");
    thread::Builder::new()
        .name("cluster-accept".to_string())
        .spawn(move || transport::accept_loop(listener, gossip_in_tx, forward_conn_tx))
        .expect("failed to spawn cluster accept thread");

    let mut peer_senders = HashMap::new();
    for (&peer_id, addr) in &peer_table {
        let (tx, rx) = unbounded::<Message>();
        peer_senders.insert(peer_id, tx);
        let addr = addr.clone();
        thread::Builder::new()
            .name(format!("cluster-dial-{}", peer_id))
            .spawn(move || transport::dial_loop(my_id, peer_id, addr, rx))
            .expect("failed to spawn cluster dial thread");
    }

    let role = Arc::new(RoleState::new());
    let store = adapter.store_handle();
    let (write_tx, write_rx) = unbounded::<WriteWork>();
    let write_sink = Arc::new(WriteSink::new(write_tx));

    let (forward_ack_tx, forward_ack_rx) = unbounded::<ForwardedAck>();
    let forwarder = crate::forwarder::start_client(
        config,
        Arc::clone(&role),
        Arc::new(peer_table.clone()),
        forward_ack_tx.clone(),
    );

    let fsync_interval = Duration::from_millis(config.log.fsync_interval_ms.max(1));
    let coordinator_role = Arc::clone(&role);
    let coordinator_forwarder = forwarder.clone();
    let coordinator_ack_tx = forward_ack_tx.clone();
    thread::Builder::new()
        .name("cluster-coordinator".to_string())
        .spawn(move || {
            run_coordinator(
                adapter,
                coordinator_role,
                peer_senders,
                gossip_in_rx,
                write_rx,
                forward_ack_rx,
                coordinator_forwarder,
                coordinator_ack_tx,
                connection_directory,
                fsync_interval,
            )
        })
        .expect("failed to spawn cluster coordinator thread");

    Ok(Cluster {
        role,
        store,
        write_sink,
        forwarder,
        forwarder_incoming: forward_conn_rx,
        peer_table,
    })
}

fn dispatch(peer_senders: &HashMap<u64, Sender<Message>>, messages: Vec<SendableMessage<u64>>) {
    for sendable in messages {
        match sendable.dest {
            MessageDestination::Broadcast => {
                for tx in peer_senders.values() {
                    let _ = tx.send(sendable.message.clone());
                }
            }
            MessageDestination::To(peer_id) => {
                if let Some(tx) = peer_senders.get(&peer_id) {
                    let _ = tx.send(sendable.message);
                }
            }
        }
    }
}

fn deliver(reply: ReplyTarget, outcome: WriteOutcome) {
    match reply {
        ReplyTarget::Connection(tx) => {
            let _ = tx.send(pipeline::ConnDelivery::Response(outcome));
        }
        ReplyTarget::Ack { lane, key } => send_ack(&lane, key, outcome.err),
        ReplyTarget::None => {}
    }
}

/// Encodes `[session_id:i64][xid:i64][err:i32]`, the entire ack frame a follower's forwarder lane
/// gets in reply to a relayed write (see `SPEC_FULL.md` §4.7) — no body, since the follower never
/// uses this for the actual response, only to fail fast when the leader rejects it outright.
fn send_ack(lane: &Sender<Vec<u8>>, key: PendingKey, err: ErrorCode) {
    let mut buf = Vec::with_capacity(20);
    buf.extend_from_slice(&key.0.to_be_bytes());
    buf.extend_from_slice(&key.1.to_be_bytes());
    buf.extend_from_slice(&err.code().to_be_bytes());
    let _ = lane.send(buf);
}

/// A non-leader receiving a [`WriteWork`] never rejects it outright: `crate::server` submits every
/// write to this same intake regardless of whether this node happens to be leader, so a follower
/// transparently relays it to the leader through `crate::forwarder` instead, and registers the
/// same pending entry a leader would — the reply still arrives once the entry replicates back and
/// is applied locally (`SPEC_FULL.md` §2, §4.6, §4.7). A relayed write arriving here (`ReplyTarget
/// ::Ack`) on a node that isn't leader means leadership just moved out from under it; fail fast so
/// the still-follower who sent it can retry against the new leader.
fn handle_write(
    adapter: &mut RaftAdapter,
    peer_senders: &HashMap<u64, Sender<Message>>,
    pending: &mut HashMap<PendingKey, ReplyTarget>,
    forwarder: &crate::forwarder::Forwarder,
    forward_ack_tx: &Sender<ForwardedAck>,
    work: WriteWork,
) {
    if !adapter.is_leader() {
        match work.reply {
            ReplyTarget::Ack { .. } => {
                let xid = work.xid;
                deliver(work.reply, WriteOutcome::connection_loss(xid));
            }
            other => {
                let key = (work.session_id, work.xid);
                pending.insert(key, other);
                forwarder.submit(
                    crate::forwarder::RelayedWrite {
                        session_id: work.session_id,
                        xid: work.xid,
                        opcode: work.opcode,
                        arrival_time_ms: work.arrival_time_ms,
                        body: work.body,
                    },
                    forward_ack_tx,
                );
            }
        }
        return;
    }

    let key = (work.session_id, work.xid);
    let payload = LogPayload {
        session_id: work.session_id,
        xid: work.xid,
        opcode: work.opcode,
        arrival_time_ms: work.arrival_time_ms,
        body: work.body,
    };

    match adapter.propose(&payload) {
        Ok(messages) => {
            dispatch(peer_senders, messages);
            match work.reply {
                ReplyTarget::Ack { lane, key } => {
                    send_ack(&lane, key, ErrorCode::Ok);
                }
                other => {
                    pending.insert(key, other);
                }
            }
        }
        Err(ProposeError::NotLeader) => {
            let xid = work.xid;
            deliver(work.reply, WriteOutcome::connection_loss(xid));
        }
        Err(ProposeError::Log(e)) => {
            tracing::error!(error = %e, "fatal error appending to local raft log");
            let xid = work.xid;
            deliver(
                work.reply,
                WriteOutcome {
                    xid,
                    zxid: -1,
                    err: ErrorCode::SystemError,
                    response: Response::Void,
                },
            );
            std::process::exit(1);
        }
    }
}

fn route_applied(
    applied: Vec<Applied>,
    pending: &mut HashMap<PendingKey, ReplyTarget>,
    connection_directory: &ConnectionDirectory,
) {
    for entry in applied {
        let key = (entry.session_id, entry.xid);
        let Applied { log_index, xid, result, .. } = entry;
        let ApplyResult { response, err, notifications } = result;

        if let Some(reply) = pending.remove(&key) {
            deliver(
                reply,
                WriteOutcome {
                    xid,
                    zxid: log_index as i64,
                    err,
                    response,
                },
            );
        }

        if !notifications.is_empty() {
            let directory = connection_directory
                .read()
                .expect("connection directory lock poisoned");
            for (session_id, event) in notifications {
                if let Some(tx) = directory.get(&session_id) {
                    let _ = tx.send(pipeline::ConnDelivery::Watch(event));
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_coordinator(
    mut adapter: RaftAdapter,
    role: SharedRoleState,
    peer_senders: HashMap<u64, Sender<Message>>,
    gossip_in_rx: Receiver<Inbound>,
    write_rx: Receiver<WriteWork>,
    forward_ack_rx: Receiver<ForwardedAck>,
    forwarder: crate::forwarder::Forwarder,
    forward_ack_tx: Sender<ForwardedAck>,
    connection_directory: ConnectionDirectory,
    fsync_interval: Duration,
) {
    let tick_interval = Duration::from_millis(TICK_INTERVAL_MS);
    let mut next_tick = Instant::now() + tick_interval;
    let mut last_fsync = Instant::now();
    let mut pending: HashMap<PendingKey, ReplyTarget> = HashMap::new();

    let refresh_role = |adapter: &RaftAdapter, role: &SharedRoleState| {
        role.update(
            adapter.is_leader(),
            adapter.leader_id(),
            adapter.node().last_committed_log_index().id,
        );
    };

    refresh_role(&adapter, &role);

    loop {
        let mut sel = Select::new();
        let gossip_idx = sel.recv(&gossip_in_rx);
        let write_idx = sel.recv(&write_rx);
        let ack_idx = sel.recv(&forward_ack_rx);

        let timeout = next_tick.saturating_duration_since(Instant::now());
        match sel.select_timeout(timeout) {
            Ok(op) if op.index() == gossip_idx => match op.recv(&gossip_in_rx) {
                Ok(inbound) => {
                    let messages: Vec<_> = adapter
                        .node_mut()
                        .receive(inbound.message, inbound.from)
                        .collect();
                    dispatch(&peer_senders, messages);
                    refresh_role(&adapter, &role);
                }
                Err(_) => return,
            },
            Ok(op) if op.index() == write_idx => match op.recv(&write_rx) {
                Ok(work) => handle_write(
                    &mut adapter,
                    &peer_senders,
                    &mut pending,
                    &forwarder,
                    &forward_ack_tx,
                    work,
                ),
                Err(_) => return,
            },
            Ok(op) if op.index() == ack_idx => match op.recv(&forward_ack_rx) {
                Ok(ack) => {
                    if ack.err != ErrorCode::Ok {
                        if let Some(target) = pending.remove(&ack.key) {
                            deliver(
                                target,
                                WriteOutcome {
                                    xid: ack.key.1,
                                    zxid: -1,
                                    err: ack.err,
                                    response: Response::Void,
                                },
                            );
                        }
                    }
                }
                Err(_) => return,
            },
            Ok(_) => unreachable!("select returned an index not registered above"),
            Err(_) => {} // timed out; fall through to the tick below
        }

        if Instant::now() >= next_tick {
            let messages: Vec<_> = adapter.node_mut().timer_tick().collect();
            dispatch(&peer_senders, messages);
            next_tick = Instant::now() + tick_interval;
            refresh_role(&adapter, &role);
        }

        match adapter.drain_committed() {
            Ok(applied) if !applied.is_empty() => {
                route_applied(applied, &mut pending, &connection_directory);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "fatal error applying committed raft log entries");
                std::process::exit(1);
            }
        }

        if last_fsync.elapsed() >= fsync_interval {
            if let Err(e) = adapter.fsync_log() {
                tracing::error!(error = %e, "fatal error fsyncing raft log");
                std::process::exit(1);
            }
            last_fsync = Instant::now();
        }
    }
}
