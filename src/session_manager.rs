//! Session manager (`C8`): watches session deadlines and drives expiration and cross-node
//! deadline sync, without ever mutating the keeper store directly.
//!
//! Grounded on `crate::cluster`'s coordinator loop: a single dedicated thread on a fixed tick,
//! reading `crate::raft_adapter::SharedStore` under its read lock and submitting through the same
//! `crate::pipeline::WriteSink` every client request uses. Expiration must be replicated — see
//! `SPEC_FULL.md` §4.8 — so this never calls `KeeperStore::apply` itself; it only decides *when*
//! a `closeSession` should be proposed and lets the ordinary write pipeline carry it from there.

use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::forwarder::{Forwarder, SessionSyncEntry};
use crate::pipeline::{ConnectionDirectory, ReplyTarget, SharedRoleState, SharedWriteSink, WriteWork};
use crate::raft_adapter::SharedStore;
use crate::wire::OpCode;

const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Starts the session manager thread. Runs for the lifetime of the process; every tick it:
///
/// - if this node is (or might be) leader, scans for sessions past their deadline and submits a
///   `closeSession` for each one not already pending, so expiry is Raft-ordered on every replica;
/// - if this node is a follower, every `session_sync_period_ms` bundles the remaining time of
///   every session with a client still connected to *this* node and forwards it to the leader, so
///   the leader never expires a session whose only heartbeats are arriving here.
pub fn start(
    config: &Config,
    store: SharedStore,
    role: SharedRoleState,
    write_sink: SharedWriteSink,
    forwarder: Forwarder,
    connection_directory: ConnectionDirectory,
) {
    let sync_period = Duration::from_millis(config.coordination.session_sync_period_ms.max(1));
    thread::Builder::new()
        .name("session-manager".to_string())
        .spawn(move || run(store, role, write_sink, forwarder, connection_directory, sync_period))
        .expect("failed to spawn session manager thread");
}

fn run(
    store: SharedStore,
    role: SharedRoleState,
    write_sink: SharedWriteSink,
    forwarder: Forwarder,
    connection_directory: ConnectionDirectory,
    sync_period: Duration,
) {
    // Sessions already submitted for expiry, so a busy tick doesn't spam the log with duplicate
    // `closeSession` proposals while the first one is still working its way through Raft. Cleared
    // once the session is actually gone (applied, or reused by a new connect).
    let mut pending_expiry: HashSet<i64> = HashSet::new();
    let mut last_sync = std::time::Instant::now();

    loop {
        thread::sleep(TICK_INTERVAL);
        let now_ms = chrono::Utc::now().timestamp_millis();

        {
            let mut guard = store.write().expect("keeper store lock poisoned");
            pending_expiry.retain(|id| guard.session(*id).is_some());

            if role.is_leader() {
                let overdue: Vec<i64> = guard
                    .session_deadlines()
                    .filter(|(_, deadline_ms)| *deadline_ms <= now_ms)
                    .map(|(session_id, _)| session_id)
                    .collect();
                for session_id in overdue {
                    if pending_expiry.insert(session_id) {
                        // Flip to `Expiring` right now, not once the `closeSession` this submits
                        // has committed and applied — otherwise the session is still observably
                        // `Active` for the whole window it's waiting on Raft.
                        guard.mark_session_expiring(session_id);
                        write_sink.submit(WriteWork {
                            session_id,
                            xid: 0,
                            opcode: OpCode::Close.code(),
                            arrival_time_ms: now_ms,
                            body: Vec::new(),
                            reply: ReplyTarget::None,
                        });
                    }
                }
            }
        }

        if !role.is_leader() && last_sync.elapsed() >= sync_period {
            last_sync = std::time::Instant::now();
            let directory = connection_directory
                .read()
                .expect("connection directory lock poisoned");
            if !directory.is_empty() {
                let guard = store.read().expect("keeper store lock poisoned");
                let entries: Vec<SessionSyncEntry> = directory
                    .keys()
                    .filter_map(|session_id| {
                        guard.session(*session_id).map(|s| SessionSyncEntry {
                            session_id: *session_id,
                            remaining_ms: (s.deadline_ms - now_ms).max(0),
                        })
                    })
                    .collect();
                drop(guard);
                forwarder.submit_session_sync(&entries);
            }
        }
    }
}
