//! Request forwarder (`C7`): relays writes from a follower to the leader, and on the leader,
//! accepts those relayed writes and feeds them into the same request pipeline (`crate::pipeline`)
//! as directly-connected clients.
//!
//! A follower never waits on the leader's reply to learn the result of a forwarded write — only
//! to learn, fast, that the leader rejected it outright. The actual response comes from the
//! follower's own local apply once the entry replicates back to it (`SPEC_FULL.md` §2, §4.7);
//! `crate::cluster::Coordinator` owns that half of the correlation.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError};

use crate::cluster::ForwardedAck;
use crate::config::Config;
use crate::pipeline::{PendingKey, ReplyTarget, SharedRoleState, SharedWriteSink, WriteWork};
use crate::raft_adapter::SharedStore;
use crate::wire::ErrorCode;
use crate::wire::log_entry::LogPayload;

const RECONNECT_DELAY: Duration = Duration::from_millis(250);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Tags the two kinds of frame a follower sends up its forwarder lanes, so the leader's acceptor
/// knows how to interpret the body without a second round trip (`SPEC_FULL.md` §4.7).
#[repr(u8)]
enum FrameKind {
    Request = 0,
    SessionSync = 1,
}

/// One write relayed to the leader, still missing the placeholder session id a `connect` needs
/// (see `crate::pipeline::SynthSessionIds`) — that substitution happens before this is built.
pub struct RelayedWrite {
    pub session_id: i64,
    pub xid: i64,
    pub opcode: i32,
    pub arrival_time_ms: i64,
    pub body: Vec<u8>,
}

/// One session's remaining time as last observed on the follower that still has a live client
/// connection for it, relayed to the leader so it never expires a session that is still
/// heartbeating on a different node (`SPEC_FULL.md` §4.7, `§4.8`/`crate::session_manager`).
pub struct SessionSyncEntry {
    pub session_id: i64,
    pub remaining_ms: i64,
}

/// Follower-side handle: spreads outgoing writes across `lane_count` persistent connections to
/// whichever node is currently leader.
#[derive(Clone)]
pub struct Forwarder {
    lanes: Arc<Vec<Sender<Vec<u8>>>>,
    next_lane: Arc<std::sync::atomic::AtomicUsize>,
}

impl Forwarder {
    /// Submits `write` to the leader, returning `Ok(())` once it is queued on a lane. A queue-full
    /// or disconnected lane resolves `write` with `ConnectionLoss` immediately via `ack_tx` rather
    /// than blocking the caller.
    pub fn submit(&self, write: RelayedWrite, ack_tx: &Sender<ForwardedAck>) {
        let key = (write.session_id, write.xid);
        let payload = LogPayload {
            session_id: write.session_id,
            xid: write.xid,
            opcode: write.opcode,
            arrival_time_ms: write.arrival_time_ms,
            body: write.body,
        };
        let mut frame = vec![FrameKind::Request as u8];
        frame.extend_from_slice(&payload.encode());
        let lane = self.pick_lane();
        if lane.try_send(frame).is_err() {
            let _ = ack_tx.send(ForwardedAck {
                key,
                err: ErrorCode::ConnectionLoss,
            });
        }
    }

    /// Best-effort bulk refresh of this node's locally-touched session deadlines. Unlike
    /// [`Self::submit`], there is no outcome to resolve — a dropped or queue-full send just costs
    /// the leader one `session_sync_period_ms` cycle of staleness, never correctness, since the
    /// next periodic call will retry it.
    pub fn submit_session_sync(&self, entries: &[SessionSyncEntry]) {
        if entries.is_empty() {
            return;
        }
        let mut frame = vec![FrameKind::SessionSync as u8];
        frame
            .write_u32::<BigEndian>(entries.len() as u32)
            .expect("writing to a Vec never fails");
        for entry in entries {
            frame
                .write_i64::<BigEndian>(entry.session_id)
                .expect("writing to a Vec never fails");
            frame
                .write_i64::<BigEndian>(entry.remaining_ms)
                .expect("writing to a Vec never fails");
        }
        let _ = self.lanes[0].try_send(frame);
    }

    fn pick_lane(&self) -> &Sender<Vec<u8>> {
        let i = self
            .next_lane
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            % self.lanes.len();
        &self.lanes[i]
    }
}

/// Starts `forwarder.lane_count` reconnecting lanes to the current leader. Returns immediately;
/// every lane runs for the lifetime of the process.
pub fn start_client(
    config: &Config,
    role: SharedRoleState,
    peer_table: Arc<HashMap<u64, String>>,
    ack_tx: Sender<ForwardedAck>,
) -> Forwarder {
    let my_id = config.server.my_id;
    let mut lanes = Vec::with_capacity(config.forwarder.lane_count);
    for lane_id in 0..config.forwarder.lane_count {
        let (tx, rx) = bounded::<Vec<u8>>(config.forwarder.max_pending_per_lane);
        lanes.push(tx);
        let role = Arc::clone(&role);
        let peer_table = Arc::clone(&peer_table);
        let ack_tx = ack_tx.clone();
        thread::Builder::new()
            .name(format!("forwarder-lane-{}", lane_id))
            .spawn(move || run_lane(my_id, role, peer_table, rx, ack_tx))
            .expect("failed to spawn forwarder lane thread");
    }

    Forwarder {
        lanes: Arc::new(lanes),
        next_lane: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
    }
}

fn run_lane(
    my_id: u64,
    role: SharedRoleState,
    peer_table: Arc<HashMap<u64, String>>,
    outbound_rx: Receiver<Vec<u8>>,
    ack_tx: Sender<ForwardedAck>,
) {
    loop {
        let leader_id = role.leader_id();
        if leader_id == 0 || leader_id == my_id {
            thread::sleep(RECONNECT_DELAY);
            continue;
        }
        let addr = match peer_table.get(&leader_id) {
            Some(a) => a.clone(),
            None => {
                thread::sleep(RECONNECT_DELAY);
                continue;
            }
        };
        let mut stream = match crate::cluster::dial_forwarder(&addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(leader = leader_id, error = %e, "forwarder dial failed, retrying");
                thread::sleep(RECONNECT_DELAY);
                continue;
            }
        };
        if stream.set_read_timeout(Some(POLL_INTERVAL)).is_err() {
            thread::sleep(RECONNECT_DELAY);
            continue;
        }

        'connection: loop {
            if role.leader_id() != leader_id {
                break 'connection;
            }
            match outbound_rx.try_recv() {
                Ok(frame) => {
                    if write_frame(&mut stream, &frame).is_err() {
                        break 'connection;
                    }
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => return,
            }
            match read_ack(&mut stream) {
                Ok(Some((key, err))) => {
                    let _ = ack_tx.send(ForwardedAck { key, err });
                }
                Ok(None) => {}
                Err(_) => break 'connection,
            }
        }
        thread::sleep(RECONNECT_DELAY);
    }
}

fn write_frame(stream: &mut TcpStream, bytes: &[u8]) -> io::Result<()> {
    stream.write_u32::<BigEndian>(bytes.len() as u32)?;
    stream.write_all(bytes)
}

/// Reads one `[session_id:i64][xid:i64][err:i32]` ack frame, or `None` if nothing has arrived
/// within the socket's read timeout. Once the length header is read the timeout is cleared for
/// the (tiny, fixed-size) body so a slow partial read can never desynchronize the stream.
fn read_ack(stream: &mut TcpStream) -> io::Result<Option<(PendingKey, ErrorCode)>> {
    let len = match stream.read_u32::<BigEndian>() {
        Ok(n) => n,
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            return Ok(None)
        }
        Err(e) => return Err(e),
    };
    stream.set_read_timeout(None)?;
    let mut buf = vec![0u8; len as usize];
    let result = stream.read_exact(&mut buf);
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    result?;

    if buf.len() != 20 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "malformed ack frame"));
    }
    let session_id = i64::from_be_bytes(buf[0..8].try_into().unwrap());
    let xid = i64::from_be_bytes(buf[8..16].try_into().unwrap());
    let code = i32::from_be_bytes(buf[16..20].try_into().unwrap());
    let err = ErrorCode::from_code(code)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown error code in ack frame"))?;
    Ok(Some(((session_id, xid), err)))
}

/// Runs the leader-side acceptor: each connection handed over by `crate::cluster`'s transport
/// listener (already past the channel-kind byte) becomes one long-lived relay of `WriteWork` into
/// `write_sink`, with acks routed back as the coordinator produces them. `store` is touched
/// directly (never through Raft) for `session_sync` frames — see `SPEC_FULL.md` §4.7.
pub fn start_server(incoming: Receiver<TcpStream>, write_sink: SharedWriteSink, store: SharedStore) {
    thread::Builder::new()
        .name("forwarder-accept".to_string())
        .spawn(move || {
            for stream in incoming {
                let write_sink = write_sink.clone();
                let store = store.clone();
                thread::spawn(move || {
                    if let Err(e) = serve_connection(stream, write_sink, store) {
                        tracing::debug!(error = %e, "forwarder connection closed");
                    }
                });
            }
        })
        .expect("failed to spawn forwarder accept thread");
}

fn serve_connection(mut stream: TcpStream, write_sink: SharedWriteSink, store: SharedStore) -> io::Result<()> {
    let writer_stream = stream.try_clone()?;
    let (ack_tx, ack_rx) = unbounded::<Vec<u8>>();

    thread::spawn(move || {
        let mut writer_stream = writer_stream;
        for frame in ack_rx {
            if write_frame(&mut writer_stream, &frame).is_err() {
                return;
            }
        }
    });

    loop {
        let len = stream.read_u32::<BigEndian>()?;
        let mut buf = vec![0u8; len as usize];
        stream.read_exact(&mut buf)?;
        if buf.is_empty() {
            continue;
        }
        let kind = buf[0];
        let body = &buf[1..];

        if kind == FrameKind::SessionSync as u8 {
            handle_session_sync(body, &store)?;
            continue;
        }

        let payload = LogPayload::decode(body)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed forwarded request"))?;

        let key = (payload.session_id, payload.xid);
        write_sink.submit(WriteWork {
            session_id: payload.session_id,
            xid: payload.xid,
            opcode: payload.opcode,
            arrival_time_ms: payload.arrival_time_ms,
            body: payload.body,
            reply: ReplyTarget::Ack {
                lane: ack_tx.clone(),
                key,
            },
        });
    }
}

fn handle_session_sync(mut body: &[u8], store: &SharedStore) -> io::Result<()> {
    let count = body
        .read_u32::<BigEndian>()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed session_sync frame"))?;
    let now_ms = chrono::Utc::now().timestamp_millis();
    let mut guard = store.write().expect("keeper store lock poisoned");
    for _ in 0..count {
        let session_id = body
            .read_i64::<BigEndian>()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed session_sync entry"))?;
        let remaining_ms = body
            .read_i64::<BigEndian>()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed session_sync entry"))?;
        guard.extend_session_deadline(session_id, now_ms, remaining_ms);
    }
    Ok(())
}
