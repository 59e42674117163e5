//! Client-facing wire server (`C6`): accepts client connections, runs the handshake, and
//! dispatches every subsequent request either to a local read or into the replicated write
//! pipeline (`crate::pipeline`).
//!
//! Grounded on the teacher's own `Server`/`ServerState` lifecycle (an `mpb` state bus driving a
//! blocking `TcpListener` accept loop on a dedicated thread, started/stopped by `change_state`) —
//! kept verbatim here, with the RESP/`Storage` connection handler it used to drive replaced by the
//! ZooKeeper wire protocol's handshake-then-pipeline shape.

use std::io::{self, ErrorKind};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use mpb::MPB;

use crate::config::Config;
use crate::pipeline::{
    ConnDelivery, ConnectionDirectory, ReplyTarget, SharedRoleState, SharedSynthSessionIds,
    SharedWriteSink, WriteOutcome, WriteWork,
};
use crate::raft_adapter::SharedStore;
use crate::wire::frame::{write_bytes, write_i32, write_i64, FrameError};
use crate::wire::request::ConnectRequest;
use crate::wire::{ErrorCode, OpCode, Request, RequestFrame, Response, ResponseFrame};

#[derive(Debug, Eq, PartialEq, Clone)]
pub enum ServerState {
    Start,
    Started,
    Stop,
    Stopped,
    Timeout,
    Error(String),
}

/// Everything a connection handler needs, shared across every connection on this node.
#[derive(Clone)]
pub struct ServerContext {
    pub store: SharedStore,
    pub write_sink: SharedWriteSink,
    pub role: SharedRoleState,
    pub connection_directory: ConnectionDirectory,
    pub synth_session_ids: SharedSynthSessionIds,
    pub allow_follower_reads: bool,
    pub operation_timeout: Duration,
    pub min_session_timeout_ms: i32,
    pub max_session_timeout_ms: i32,
}

impl ServerContext {
    pub fn new(
        config: &Config,
        store: SharedStore,
        write_sink: SharedWriteSink,
        role: SharedRoleState,
        connection_directory: ConnectionDirectory,
        synth_session_ids: SharedSynthSessionIds,
    ) -> Self {
        ServerContext {
            store,
            write_sink,
            role,
            connection_directory,
            synth_session_ids,
            allow_follower_reads: config.coordination.allow_follower_reads,
            operation_timeout: Duration::from_millis(config.coordination.operation_timeout_ms.max(1)),
            min_session_timeout_ms: config.coordination.min_session_timeout_ms as i32,
            max_session_timeout_ms: config.coordination.max_session_timeout_ms as i32,
        }
    }
}

pub struct Server {
    server_state_bus: MPB<ServerState>,
}

impl Server {
    pub fn new(endpoint: String, ctx: ServerContext) -> Self {
        let server = Server {
            server_state_bus: MPB::new(),
        };
        server.init(endpoint, ctx);
        server
    }

    fn init(&self, endpoint: String, ctx: ServerContext) {
        let state_send = self.server_state_bus.sender();
        let state_recv = self.server_state_bus.receiver();

        let _ = thread::Builder::new()
            .name("server-lifecycle".to_string())
            .spawn(move || loop {
                if let Ok(server_state) = state_recv.recv() {
                    if server_state == ServerState::Start {
                        run_accept_loop(&endpoint, &state_send, &state_recv, &ctx);
                    }
                }
            });
    }

    fn change_state(&self, change_to: ServerState) -> Option<ServerState> {
        let send_state_ch = self.server_state_bus.sender();

        let post_change_to_state = match change_to {
            ServerState::Start => ServerState::Started,
            ServerState::Stop => ServerState::Stopped,
            ServerState::Started
            | ServerState::Stopped
            | ServerState::Timeout
            | ServerState::Error(_) => return None,
        };

        let _ = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            let _ = send_state_ch.send(change_to);
        });

        let receiver = self.server_state_bus.receiver();
        while let Ok(server_state) = receiver.recv_timeout(Duration::from_secs(5)) {
            if server_state == post_change_to_state {
                return Some(server_state);
            }
        }
        Some(ServerState::Timeout)
    }

    /// Starts accepting client connections. Blocks (briefly) until the listener is bound.
    pub fn start(&self) -> Option<ServerState> {
        self.change_state(ServerState::Start)
    }

    /// Stops accepting new connections; connections already open are left to wind down on their
    /// own (the keeper store and coordinator outlive this call).
    pub fn stop(&self) -> Option<ServerState> {
        self.change_state(ServerState::Stop)
    }
}

fn stop_sig_received(state_recv: &Receiver<ServerState>, state_send: &Sender<ServerState>) -> bool {
    if let Ok(ServerState::Stop) = state_recv.try_recv() {
        let _ = state_send.send(ServerState::Stopped);
        return true;
    }
    false
}

fn run_accept_loop(
    addr: &str,
    state_send: &Sender<ServerState>,
    state_recv: &Receiver<ServerState>,
    ctx: &ServerContext,
) {
    let listener = match TcpListener::bind(addr) {
        Ok(listener) => {
            let _ = state_send.send(ServerState::Started);
            let _ = listener.set_nonblocking(true);
            listener
        }
        Err(e) => {
            tracing::error!(addr, error = %e, "failed to bind client listener");
            let _ = state_send.send(ServerState::Error(e.to_string()));
            return;
        }
    };

    let thread_pool = match rayon::ThreadPoolBuilder::new()
        .thread_name(|i| format!("client-conn-{}", i))
        .num_threads(8)
        .build()
    {
        Ok(pool) => pool,
        Err(err) => panic!("{:?}", err),
    };

    tracing::info!(addr, "client server listening");

    for stream in listener.incoming() {
        match stream {
            Ok(tcp_stream) => {
                let ctx = ctx.clone();
                thread_pool.spawn(move || {
                    let _ = tcp_stream.set_nonblocking(false);
                    if let Err(e) = serve_connection(tcp_stream, ctx) {
                        tracing::debug!(error = %e, "client connection closed");
                    }
                });
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(10));
            }
            Err(_) => break,
        }

        if stop_sig_received(state_recv, state_send) {
            break;
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn frame_read_err(e: FrameError) -> io::Error {
    match e {
        FrameError::Io(e) => e,
        other => io::Error::new(ErrorKind::InvalidData, other.to_string()),
    }
}

/// Handles one client connection end to end: the `connect` handshake synchronously, then a
/// pipelined read/write loop until the client closes the session or the socket drops.
///
/// The handshake is answered directly on `stream` before any writer thread exists, so there is
/// exactly one reader of the one-shot channel it waits on. Once a session id is assigned, a
/// dedicated writer thread takes over draining replies (both ordinary responses and watch
/// notifications, see `crate::pipeline::ConnDelivery`) so the reader never blocks on anything but
/// the socket itself — real ZooKeeper clients pipeline several requests ahead of their replies,
/// and `xid` is what lets the writer frame each reply correctly regardless of arrival order.
fn serve_connection(mut stream: TcpStream, ctx: ServerContext) -> io::Result<()> {
    let _ = stream.set_nodelay(true);

    let frame = RequestFrame::read(&mut stream).map_err(frame_read_err)?;
    let request = Request::decode(frame.opcode, &frame.body).map_err(frame_read_err)?;
    let connect_req = match request {
        Request::Connect(req) => req,
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                "first request on a connection must be connect",
            ))
        }
    };

    let (handshake_tx, handshake_rx) = bounded::<ConnDelivery>(1);
    let placeholder = ctx.synth_session_ids.next();
    let timeout_ms = connect_req
        .timeout_ms
        .clamp(ctx.min_session_timeout_ms, ctx.max_session_timeout_ms);
    ctx.write_sink.submit(WriteWork {
        session_id: placeholder,
        xid: frame.xid,
        opcode: OpCode::Connect.code(),
        arrival_time_ms: now_ms(),
        body: encode_connect_request(&connect_req, timeout_ms),
        reply: ReplyTarget::Connection(handshake_tx),
    });

    let outcome = match handshake_rx.recv_timeout(ctx.operation_timeout) {
        Ok(ConnDelivery::Response(outcome)) => outcome,
        Ok(ConnDelivery::Watch(_)) => unreachable!("a brand-new session has no watches yet"),
        Err(_) => WriteOutcome::operation_timeout(frame.xid),
    };

    write_response(&mut stream, &outcome)?;
    if outcome.err != ErrorCode::Ok {
        return Ok(());
    }
    let session_id = match outcome.response {
        Response::Connect(resp) => resp.session_id,
        _ => return Ok(()),
    };

    let writer_stream = stream.try_clone()?;
    let (conn_tx, conn_rx) = unbounded::<ConnDelivery>();
    ctx.connection_directory
        .write()
        .expect("connection directory lock poisoned")
        .insert(session_id, conn_tx.clone());

    let writer = thread::Builder::new()
        .name(format!("client-writer-{}", session_id))
        .spawn(move || run_writer(writer_stream, conn_rx))
        .expect("failed to spawn client writer thread");

    let result = serve_requests(&mut stream, &ctx, &conn_tx, session_id);

    ctx.connection_directory
        .write()
        .expect("connection directory lock poisoned")
        .remove(&session_id);
    drop(conn_tx);
    let _ = writer.join();
    result
}

fn run_writer(mut stream: TcpStream, rx: Receiver<ConnDelivery>) {
    for delivery in rx {
        let frame = match delivery {
            ConnDelivery::Response(outcome) => ResponseFrame {
                xid: outcome.xid,
                zxid: outcome.zxid,
                err: outcome.err,
                body: outcome.response.encode(),
            },
            ConnDelivery::Watch(event) => crate::wire::watch_event_frame(&event),
        };
        if frame.write(&mut stream).is_err() {
            return;
        }
    }
}

fn write_response(stream: &mut TcpStream, outcome: &WriteOutcome) -> io::Result<()> {
    ResponseFrame {
        xid: outcome.xid,
        zxid: outcome.zxid,
        err: outcome.err,
        body: outcome.response.encode(),
    }
    .write(stream)
    .map_err(|e| io::Error::new(ErrorKind::Other, e.to_string()))
}

/// Re-encodes a decoded `connect` request with its negotiated timeout, so the value replicated
/// through Raft (and applied identically on every replica) is the clamped one, not whatever the
/// client asked for.
fn encode_connect_request(req: &ConnectRequest, timeout_ms: i32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32 + req.password.len());
    write_i32(&mut buf, req.protocol_version);
    write_i64(&mut buf, req.last_zxid_seen);
    write_i32(&mut buf, timeout_ms);
    write_i64(&mut buf, req.session_id);
    write_bytes(&mut buf, Some(&req.password));
    buf
}

/// The steady-state loop for an already-connected session: reads one request frame at a time and
/// either submits it to the write pipeline or answers it from the local store, without ever
/// blocking on the reply — `conn_tx`/the writer thread owns delivery order from here on.
fn serve_requests(
    stream: &mut TcpStream,
    ctx: &ServerContext,
    conn_tx: &Sender<ConnDelivery>,
    session_id: i64,
) -> io::Result<()> {
    loop {
        let frame = match RequestFrame::read(stream) {
            Ok(frame) => frame,
            Err(FrameError::Io(e)) => return Err(e),
            Err(_) => return Ok(()),
        };
        let request = match Request::decode(frame.opcode, &frame.body) {
            Ok(request) => request,
            Err(FrameError::UnknownOpcode(_)) => {
                let outcome = WriteOutcome {
                    xid: frame.xid,
                    zxid: -1,
                    err: ErrorCode::Unimplemented,
                    response: Response::Void,
                };
                let _ = conn_tx.send(ConnDelivery::Response(outcome));
                continue;
            }
            Err(_) => return Ok(()),
        };

        match request {
            Request::Connect(_) => return Ok(()),
            Request::Sync(_) => {
                let outcome = handle_sync(ctx, frame.xid);
                let _ = conn_tx.send(ConnDelivery::Response(outcome));
            }
            _ if request.is_write() => {
                let close_after = matches!(request, Request::Close);
                if close_after {
                    ctx.store
                        .write()
                        .expect("keeper store lock poisoned")
                        .mark_session_closing(session_id);
                }
                ctx.write_sink.submit(WriteWork {
                    session_id,
                    xid: frame.xid,
                    opcode: frame.opcode,
                    arrival_time_ms: now_ms(),
                    body: frame.body,
                    reply: ReplyTarget::Connection(conn_tx.clone()),
                });
                if close_after {
                    return Ok(());
                }
            }
            _ => {
                let outcome = handle_local_read(ctx, session_id, frame.xid, &request);
                let _ = conn_tx.send(ConnDelivery::Response(outcome));
            }
        }
    }
}

/// Answers a read-only request (`exists`/`getData`/`getChildren[2]`/`getAcl`/`check`/`auth`/
/// `ping`) from this node's own copy of the store, bypassing Raft entirely. Watch registration is
/// a side effect of these calls and is therefore local to this node too — see
/// `crate::pipeline::ConnectionDirectory` for why that is still correct under replication.
fn handle_local_read(ctx: &ServerContext, session_id: i64, xid: i64, request: &Request) -> WriteOutcome {
    if !ctx.role.is_leader() && !ctx.allow_follower_reads {
        return WriteOutcome::connection_loss(xid);
    }
    let now = now_ms();
    let mut store = ctx.store.write().expect("keeper store lock poisoned");
    if !store.session_exists_and_active(session_id) {
        return WriteOutcome {
            xid,
            zxid: -1,
            err: ErrorCode::SessionExpired,
            response: Response::Void,
        };
    }
    let zxid = store.last_applied_index() as i64;
    let result = store.apply(session_id, now, zxid, request);
    WriteOutcome {
        xid,
        zxid,
        err: result.err,
        response: result.response,
    }
}

/// Implements the `sync` barrier: blocks (this connection's reader thread only) until this node's
/// own applied index has caught up to the cluster's commit index as last observed by the
/// coordinator, so a `sync` issued right after a write on another node is guaranteed to see it.
fn handle_sync(ctx: &ServerContext, xid: i64) -> WriteOutcome {
    if !ctx.role.is_leader() && !ctx.allow_follower_reads {
        return WriteOutcome::connection_loss(xid);
    }
    let target = ctx.role.commit_index();
    let deadline = Instant::now() + ctx.operation_timeout;
    loop {
        let applied = ctx
            .store
            .read()
            .expect("keeper store lock poisoned")
            .last_applied_index();
        if applied >= target {
            return WriteOutcome {
                xid,
                zxid: applied as i64,
                err: ErrorCode::Ok,
                response: Response::Void,
            };
        }
        if Instant::now() >= deadline {
            return WriteOutcome::operation_timeout(xid);
        }
        thread::sleep(Duration::from_millis(5));
    }
}
