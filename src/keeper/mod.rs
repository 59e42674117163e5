//! The keeper store (`C4`): the single source of truth for replicated state. Every mutation
//! flows through [`KeeperStore::apply`], which is deterministic — no wall-clock reads, no
//! randomness, `time_ms` and `zxid` are both supplied by the caller (the Raft adapter, see
//! `crate::raft_adapter`).

pub mod acl_map;
pub mod session;
pub mod znode;

use std::collections::{BTreeSet, HashMap};

use acl_map::AclMap;
use session::{Session, SessionState};
use znode::{format_sequential, split_path, validate_path, Znode};

use crate::wire::request::{AuthRequest, MultiRequest, MultiSubOp};
use crate::wire::response::{
    ConnectResponse, CreateResponse, ExistsResponse, GetAclResponse, GetChildrenResponse,
    GetDataResponse, MultiSubResult, Response,
};
use crate::wire::{Acl, CreateFlags, ErrorCode, Stat, WatchEvent, WatchEventType, WatchKind};

/// A single outstanding watch registration.
#[derive(Debug, Clone)]
struct WatchReg {
    session_id: i64,
    kind: WatchKind,
}

/// The in-memory tree of znodes, session table, watch indices, ACL map and sequential counters.
/// See `SPEC_FULL.md` §3-4 for the full contract.
#[derive(Clone)]
pub struct KeeperStore {
    nodes: HashMap<String, Znode>,
    sessions: HashMap<i64, Session>,
    acl_map: AclMap,
    /// Registered watches by path, for fast trigger on mutation.
    watches_by_path: HashMap<String, Vec<WatchReg>>,
    /// Mirror index by session, for bulk cleanup when a session ends.
    watches_by_session: HashMap<i64, Vec<(String, WatchKind)>>,
    /// Per-parent-path sequential counters; monotonically non-decreasing, never reset by delete.
    counters: HashMap<String, u64>,
    next_session_id: i64,
    max_node_size: usize,
    last_applied_index: u64,
    last_applied_term: u64,
}

/// The outcome of a single [`KeeperStore::apply`] call: the wire response (meaningful only when
/// `err == ErrorCode::Ok`), the error code, and any watch notifications the mutation fired.
pub struct ApplyResult {
    pub response: Response,
    pub err: ErrorCode,
    pub notifications: Vec<(i64, WatchEvent)>,
}

impl ApplyResult {
    fn ok(response: Response, notifications: Vec<(i64, WatchEvent)>) -> Self {
        ApplyResult {
            response,
            err: ErrorCode::Ok,
            notifications,
        }
    }

    fn err(err: ErrorCode) -> Self {
        ApplyResult {
            response: Response::Void,
            err,
            notifications: Vec::new(),
        }
    }
}

impl KeeperStore {
    pub fn new(max_node_size: usize) -> Self {
        let acl_map = AclMap::new();
        let mut nodes = HashMap::new();
        nodes.insert(
            "/".to_string(),
            Znode::new(Vec::new(), acl_map.open_acl_unsafe_id, 0, 0, 0),
        );
        KeeperStore {
            nodes,
            sessions: HashMap::new(),
            acl_map,
            watches_by_path: HashMap::new(),
            watches_by_session: HashMap::new(),
            counters: HashMap::new(),
            next_session_id: 1,
            max_node_size,
            last_applied_index: 0,
            last_applied_term: 0,
        }
    }

    pub fn last_applied_index(&self) -> u64 {
        self.last_applied_index
    }

    pub fn last_applied_term(&self) -> u64 {
        self.last_applied_term
    }

    pub fn set_last_applied(&mut self, index: u64, term: u64) {
        self.last_applied_index = index;
        self.last_applied_term = term;
    }

    pub fn acl_map(&self) -> &AclMap {
        &self.acl_map
    }

    pub fn nodes(&self) -> &HashMap<String, Znode> {
        &self.nodes
    }

    pub fn sessions(&self) -> &HashMap<i64, Session> {
        &self.sessions
    }

    pub fn counters(&self) -> &HashMap<String, u64> {
        &self.counters
    }

    pub fn session(&self, id: i64) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Reconstructs `children` sets from the flat path map; used by the snapshot loader after
    /// streaming in node records with no explicit parent pointers.
    pub fn rebuild_children_index(&mut self) {
        let paths: Vec<String> = self.nodes.keys().cloned().collect();
        for path in &paths {
            if let Some(node) = self.nodes.get_mut(path) {
                node.children.clear();
            }
        }
        for path in paths {
            if let Some((parent, basename)) = split_path(&path) {
                if let Some(parent_node) = self.nodes.get_mut(parent) {
                    parent_node.children.insert(basename.to_string());
                }
            }
        }
        for node in self.nodes.values_mut() {
            node.stat.num_children = node.children.len() as i32;
        }
    }

    /// Replaces the live store wholesale — used only by snapshot install (`C3`).
    pub fn replace_with(
        &mut self,
        nodes: HashMap<String, Znode>,
        sessions: HashMap<i64, Session>,
        acl_map: AclMap,
        counters: HashMap<String, u64>,
        next_session_id: i64,
    ) {
        self.nodes = nodes;
        self.sessions = sessions;
        self.acl_map = acl_map;
        self.counters = counters;
        self.next_session_id = next_session_id;
        self.watches_by_path.clear();
        self.watches_by_session.clear();
        self.rebuild_children_index();
    }

    // ---- watches ----

    fn register_watch(&mut self, session_id: i64, path: &str, kind: WatchKind) {
        self.watches_by_path
            .entry(path.to_string())
            .or_default()
            .push(WatchReg { session_id, kind });
        self.watches_by_session
            .entry(session_id)
            .or_default()
            .push((path.to_string(), kind));
    }

    /// Fires every watch registered on `path` whose kind matches `fired_kinds`, removing each
    /// registration from both indices (at-most-once delivery).
    fn fire_watches(
        &mut self,
        path: &str,
        event_type: WatchEventType,
        fired_kinds: &[WatchKind],
    ) -> Vec<(i64, WatchEvent)> {
        let regs = match self.watches_by_path.remove(path) {
            Some(regs) => regs,
            None => return Vec::new(),
        };
        let mut fired = Vec::new();
        let mut kept = Vec::new();
        for reg in regs {
            if fired_kinds.contains(&reg.kind) {
                if let Some(list) = self.watches_by_session.get_mut(&reg.session_id) {
                    list.retain(|(p, k)| !(p == path && *k == reg.kind));
                }
                fired.push((
                    reg.session_id,
                    WatchEvent {
                        event_type: event_type.clone(),
                        path: path.to_string(),
                    },
                ));
            } else {
                kept.push(reg);
            }
        }
        if !kept.is_empty() {
            self.watches_by_path.insert(path.to_string(), kept);
        }
        fired
    }

    fn drop_session_watches(&mut self, session_id: i64) {
        if let Some(regs) = self.watches_by_session.remove(&session_id) {
            for (path, kind) in regs {
                if let Some(list) = self.watches_by_path.get_mut(&path) {
                    list.retain(|r| !(r.session_id == session_id && r.kind == kind));
                    if list.is_empty() {
                        self.watches_by_path.remove(&path);
                    }
                }
            }
        }
    }

    // ---- top-level dispatch ----

    /// Applies one client request deterministically. `session_id` is `0` for a brand-new
    /// connection whose `Connect` request carries `session_id == 0`; the assigned id is returned
    /// inside `Response::Connect`.
    pub fn apply(
        &mut self,
        session_id: i64,
        time_ms: i64,
        zxid: i64,
        request: &crate::wire::Request,
    ) -> ApplyResult {
        use crate::wire::Request::*;
        // Every request other than the handshake itself refreshes its session's deadline,
        // deterministically, using the same `time_ms` every replica applies this entry with.
        if !matches!(request, Connect(_)) {
            self.touch_session(session_id, time_ms);
        }
        match request {
            Connect(req) => self.apply_connect(req.session_id, req.timeout_ms as u32, time_ms),
            Close => self.apply_close_session(session_id),
            Create(req) => self.apply_create(session_id, time_ms, zxid, req, false),
            Create2(req) => self.apply_create(session_id, time_ms, zxid, req, true),
            Delete(req) => self.apply_delete(zxid, &req.path, req.version),
            SetData(req) => self.apply_set_data(zxid, time_ms, &req.path, &req.data, req.version),
            Exists(req) => self.apply_exists(session_id, &req.path, req.watch),
            GetData(req) => self.apply_get_data(session_id, &req.path, req.watch),
            GetChildren(req) => self.apply_get_children(session_id, &req.path, req.watch, false),
            GetChildren2(req) => self.apply_get_children(session_id, &req.path, req.watch, true),
            GetAcl(req) => self.apply_get_acl(&req.path),
            SetAcl(req) => self.apply_set_acl(zxid, &req.path, &req.acl, req.version),
            Sync(_) => ApplyResult::ok(Response::Void, Vec::new()),
            Check(req) => match self.check_version(&req.path, req.version) {
                Ok(()) => ApplyResult::ok(Response::Void, Vec::new()),
                Err(e) => ApplyResult::err(e),
            },
            Multi(req) => self.apply_multi(session_id, time_ms, zxid, req),
            Auth(req) => self.apply_auth(session_id, req),
            Ping => ApplyResult::ok(Response::Pong, Vec::new()),
        }
    }

    fn apply_connect(&mut self, requested_session: i64, timeout_ms: u32, time_ms: i64) -> ApplyResult {
        let session_id = if requested_session != 0 && self.sessions.contains_key(&requested_session)
        {
            requested_session
        } else {
            let id = self.next_session_id;
            self.next_session_id += 1;
            let mut session = Session::new(id, timeout_ms, time_ms);
            session.state = SessionState::Active;
            self.sessions.insert(id, session);
            id
        };
        if let Some(session) = self.sessions.get_mut(&session_id) {
            // A reconnect on an existing id means the client is still there after all; pull it
            // back out of `Expiring`/`Closing` rather than let a race with the in-flight
            // `closeSession` win just because the deadline scan got there first.
            session.state = SessionState::Active;
            session.touch(time_ms);
        }
        ApplyResult::ok(
            Response::Connect(ConnectResponse {
                protocol_version: 0,
                timeout_ms: timeout_ms as i32,
                session_id,
                password: vec![0u8; 16],
            }),
            Vec::new(),
        )
    }

    /// Records an offered `{scheme, id}` credential against the session so it is carried in
    /// snapshots and visible to an operator inspecting a session. No verification is performed —
    /// there is no password/digest check against any stored credential, and nothing consults
    /// `auth_ids` to gate ACL-protected operations — so every credential is accepted as given.
    fn apply_auth(&mut self, session_id: i64, req: &AuthRequest) -> ApplyResult {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            let id = String::from_utf8_lossy(&req.auth).into_owned();
            let already_held = session
                .auth_ids
                .iter()
                .any(|(scheme, held_id)| *scheme == req.scheme && *held_id == id);
            if !already_held {
                session.auth_ids.push((req.scheme.clone(), id));
            }
        }
        ApplyResult::ok(Response::Void, Vec::new())
    }

    fn apply_close_session(&mut self, session_id: i64) -> ApplyResult {
        let notifications = self.close_session_internal(session_id);
        ApplyResult::ok(Response::Void, notifications)
    }

    /// Removes every ephemeral owned by `session_id`, fires their watches, drops the session's
    /// remaining (non-fired) watch registrations, and removes the session itself. This is the
    /// one path every prior state (`Active`, `Expiring`, `Closing`) funnels through into
    /// `Closed` — removing the row from `self.sessions` *is* the `Closed` state, so there is
    /// nothing further to flip once this runs.
    fn close_session_internal(&mut self, session_id: i64) -> Vec<(i64, WatchEvent)> {
        let mut notifications = Vec::new();
        if let Some(session) = self.sessions.remove(&session_id) {
            for path in session.ephemerals {
                if self.nodes.remove(&path).is_some() {
                    if let Some((parent, basename)) = split_path(&path) {
                        if let Some(parent_node) = self.nodes.get_mut(parent) {
                            parent_node.children.remove(basename);
                            parent_node.stat.num_children = parent_node.children.len() as i32;
                            parent_node.stat.cversion += 1;
                        }
                    }
                    notifications.extend(self.fire_watches(
                        &path,
                        WatchEventType::NodeDeleted,
                        &[WatchKind::Data, WatchKind::Exists],
                    ));
                }
            }
        }
        self.drop_session_watches(session_id);
        notifications
    }

    fn apply_create(
        &mut self,
        session_id: i64,
        time_ms: i64,
        zxid: i64,
        req: &crate::wire::request::CreateRequest,
        with_stat: bool,
    ) -> ApplyResult {
        match self.do_create(session_id, time_ms, zxid, req) {
            Ok((path, stat, notifications)) => ApplyResult::ok(
                Response::Create(CreateResponse {
                    path,
                    stat: if with_stat { Some(stat) } else { None },
                }),
                notifications,
            ),
            Err(e) => ApplyResult::err(e),
        }
    }

    fn do_create(
        &mut self,
        session_id: i64,
        time_ms: i64,
        zxid: i64,
        req: &crate::wire::request::CreateRequest,
    ) -> Result<(String, Stat, Vec<(i64, WatchEvent)>), ErrorCode> {
        if !validate_path(&req.path) {
            return Err(ErrorCode::BadArguments);
        }
        if req.data.len() > self.max_node_size {
            return Err(ErrorCode::BadArguments);
        }
        let (parent_path, basename) = split_path(&req.path).ok_or(ErrorCode::BadArguments)?;
        let parent = self.nodes.get(parent_path).ok_or(ErrorCode::NoNode)?;
        if parent.is_ephemeral() {
            return Err(ErrorCode::NoChildrenForEphemerals);
        }

        let final_path = if req.flags.sequential {
            let counter = *self.counters.get(parent_path).unwrap_or(&0);
            let candidate = format_sequential(basename, counter);
            self.counters.insert(parent_path.to_string(), counter + 1);
            format!(
                "{}/{}",
                if parent_path == "/" { "" } else { parent_path },
                candidate
            )
        } else {
            req.path.clone()
        };

        if self.nodes.contains_key(&final_path) {
            return Err(ErrorCode::NodeExists);
        }

        let acl = if req.acl.is_empty() {
            crate::wire::acl::open_acl_unsafe()
        } else {
            req.acl.clone()
        };
        let acl_id = self.acl_map.intern(acl);
        let ephemeral_owner = if req.flags.ephemeral { session_id } else { 0 };
        let node = Znode::new(req.data.clone(), acl_id, zxid, time_ms, ephemeral_owner);
        let stat = node.stat;
        self.nodes.insert(final_path.clone(), node);

        let (_, final_basename) = split_path(&final_path).unwrap();
        if let Some(parent) = self.nodes.get_mut(parent_path) {
            parent.children.insert(final_basename.to_string());
            parent.stat.num_children = parent.children.len() as i32;
            parent.stat.cversion += 1;
            parent.stat.pzxid = zxid;
        }

        if req.flags.ephemeral {
            if let Some(session) = self.sessions.get_mut(&session_id) {
                session.ephemerals.insert(final_path.clone());
            }
        }

        let mut notifications =
            self.fire_watches(&final_path, WatchEventType::NodeCreated, &[WatchKind::Exists]);
        notifications.extend(self.fire_watches(
            parent_path,
            WatchEventType::NodeChildrenChanged,
            &[WatchKind::Children],
        ));

        Ok((final_path, stat, notifications))
    }

    fn apply_delete(&mut self, zxid: i64, path: &str, version: i32) -> ApplyResult {
        match self.do_delete(zxid, path, version) {
            Ok(notifications) => ApplyResult::ok(Response::Void, notifications),
            Err(e) => ApplyResult::err(e),
        }
    }

    fn do_delete(
        &mut self,
        zxid: i64,
        path: &str,
        version: i32,
    ) -> Result<Vec<(i64, WatchEvent)>, ErrorCode> {
        let node = self.nodes.get(path).ok_or(ErrorCode::NoNode)?;
        if version != -1 && version != node.stat.version {
            return Err(ErrorCode::BadVersion);
        }
        if !node.children.is_empty() {
            return Err(ErrorCode::NotEmpty);
        }
        let acl_id = node.acl_id;
        self.nodes.remove(path);
        self.acl_map.release(acl_id);

        if let Some((parent_path, basename)) = split_path(path) {
            if let Some(parent) = self.nodes.get_mut(parent_path) {
                parent.children.remove(basename);
                parent.stat.num_children = parent.children.len() as i32;
                parent.stat.cversion += 1;
                parent.stat.pzxid = zxid;
            }
        }

        let mut notifications =
            self.fire_watches(path, WatchEventType::NodeDeleted, &[WatchKind::Data, WatchKind::Exists]);
        if let Some((parent_path, _)) = split_path(path) {
            notifications.extend(self.fire_watches(
                parent_path,
                WatchEventType::NodeChildrenChanged,
                &[WatchKind::Children],
            ));
        }
        Ok(notifications)
    }

    fn apply_set_data(
        &mut self,
        zxid: i64,
        time_ms: i64,
        path: &str,
        data: &[u8],
        version: i32,
    ) -> ApplyResult {
        if data.len() > self.max_node_size {
            return ApplyResult::err(ErrorCode::BadArguments);
        }
        let node = match self.nodes.get_mut(path) {
            Some(n) => n,
            None => return ApplyResult::err(ErrorCode::NoNode),
        };
        if version != -1 && version != node.stat.version {
            return ApplyResult::err(ErrorCode::BadVersion);
        }
        node.data = data.to_vec();
        node.stat.mzxid = zxid;
        node.stat.mtime = time_ms;
        node.stat.version += 1;
        node.stat.data_length = node.data.len() as i32;
        let stat = node.stat;
        let notifications = self.fire_watches(path, WatchEventType::NodeDataChanged, &[WatchKind::Data]);
        ApplyResult::ok(Response::Stat(stat), notifications)
    }

    fn apply_exists(&mut self, session_id: i64, path: &str, watch: bool) -> ApplyResult {
        let stat = self.nodes.get(path).map(|n| n.stat);
        if watch {
            self.register_watch(session_id, path, WatchKind::Exists);
        }
        ApplyResult::ok(Response::Exists(ExistsResponse { stat }), Vec::new())
    }

    fn apply_get_data(&mut self, session_id: i64, path: &str, watch: bool) -> ApplyResult {
        let node = match self.nodes.get(path) {
            Some(n) => n,
            None => return ApplyResult::err(ErrorCode::NoNode),
        };
        let data = node.data.clone();
        let stat = node.stat;
        if watch {
            self.register_watch(session_id, path, WatchKind::Data);
        }
        ApplyResult::ok(Response::GetData(GetDataResponse { data, stat }), Vec::new())
    }

    fn apply_get_children(
        &mut self,
        session_id: i64,
        path: &str,
        watch: bool,
        with_stat: bool,
    ) -> ApplyResult {
        let node = match self.nodes.get(path) {
            Some(n) => n,
            None => return ApplyResult::err(ErrorCode::NoNode),
        };
        // Deterministic client-visible order: lexicographic, identical on every replica.
        let children: Vec<String> = node.children.iter().cloned().collect();
        let stat = if with_stat { Some(node.stat) } else { None };
        if watch {
            self.register_watch(session_id, path, WatchKind::Children);
        }
        ApplyResult::ok(
            Response::GetChildren(GetChildrenResponse { children, stat }),
            Vec::new(),
        )
    }

    fn apply_get_acl(&mut self, path: &str) -> ApplyResult {
        let node = match self.nodes.get(path) {
            Some(n) => n,
            None => return ApplyResult::err(ErrorCode::NoNode),
        };
        let acl = self.acl_map.get(node.acl_id).cloned().unwrap_or_default();
        let stat = node.stat;
        ApplyResult::ok(Response::GetAcl(GetAclResponse { acl, stat }), Vec::new())
    }

    fn apply_set_acl(&mut self, zxid: i64, path: &str, acl: &[Acl], version: i32) -> ApplyResult {
        let old_acl_id = {
            let node = match self.nodes.get(path) {
                Some(n) => n,
                None => return ApplyResult::err(ErrorCode::NoNode),
            };
            if version != -1 && version != node.stat.aversion {
                return ApplyResult::err(ErrorCode::BadVersion);
            }
            node.acl_id
        };
        let new_id = self.acl_map.intern(acl.to_vec());
        self.acl_map.release(old_acl_id);
        let node = self.nodes.get_mut(path).unwrap();
        node.acl_id = new_id;
        node.stat.aversion += 1;
        node.stat.mzxid = zxid;
        let stat = node.stat;
        ApplyResult::ok(Response::Stat(stat), Vec::new())
    }

    fn check_version(&self, path: &str, version: i32) -> Result<(), ErrorCode> {
        let node = self.nodes.get(path).ok_or(ErrorCode::NoNode)?;
        if version != -1 && version != node.stat.version {
            return Err(ErrorCode::BadVersion);
        }
        Ok(())
    }

    /// Runs every sub-op of a `multi` against a scratch copy of the tree/ACL-map/session
    /// ephemeral-set; if any sub-op fails, the copy is discarded and the original store is left
    /// byte-identical. Otherwise the copy is committed back and the accumulated watch
    /// notifications are returned. See `SPEC_FULL.md` §4.4, §9 (multi atomicity).
    fn apply_multi(
        &mut self,
        session_id: i64,
        time_ms: i64,
        zxid: i64,
        req: &MultiRequest,
    ) -> ApplyResult {
        let mut scratch = self.clone();
        let mut results = Vec::with_capacity(req.ops.len());
        let mut notifications = Vec::new();
        let mut failed_at: Option<usize> = None;

        for (i, op) in req.ops.iter().enumerate() {
            let outcome = match op {
                MultiSubOp::Create(c) => scratch
                    .do_create(session_id, time_ms, zxid, c)
                    .map(|(path, stat, n)| {
                        notifications.extend(n);
                        Response::Create(CreateResponse {
                            path,
                            stat: Some(stat),
                        })
                    }),
                MultiSubOp::Delete(d) => scratch
                    .do_delete(zxid, &d.path, d.version)
                    .map(|n| {
                        notifications.extend(n);
                        Response::Void
                    }),
                MultiSubOp::SetData(s) => {
                    let res = scratch.apply_set_data(zxid, time_ms, &s.path, &s.data, s.version);
                    if res.err == ErrorCode::Ok {
                        notifications.extend(res.notifications);
                        Ok(res.response)
                    } else {
                        Err(res.err)
                    }
                }
                MultiSubOp::Check(c) => scratch
                    .check_version(&c.path, c.version)
                    .map(|()| Response::Void),
            };
            match outcome {
                Ok(response) => results.push(Ok(response)),
                Err(e) => {
                    failed_at = Some(i);
                    results.push(Err(e));
                    break;
                }
            }
        }

        if let Some(failed_index) = failed_at {
            let sub_results = (0..req.ops.len())
                .map(|i| {
                    if i == failed_index {
                        MultiSubResult {
                            err: *results[i].as_ref().unwrap_err(),
                            body: Vec::new(),
                        }
                    } else {
                        MultiSubResult {
                            err: ErrorCode::RuntimeInconsistency,
                            body: Vec::new(),
                        }
                    }
                })
                .collect();
            return ApplyResult::ok(Response::Multi(sub_results), Vec::new());
        }

        *self = scratch;
        let sub_results = results
            .into_iter()
            .map(|r| MultiSubResult {
                err: ErrorCode::Ok,
                body: r.unwrap().encode(),
            })
            .collect();
        ApplyResult::ok(Response::Multi(sub_results), notifications)
    }

    /// Called by the session manager (`C8`) when a deadline check determines a session should
    /// expire. Like every other mutation, this must go through `apply` so expiration is
    /// replicated and applied in the same order on every replica; this helper exists only so
    /// `C8` can build the `closeSession` request it submits to the write pipeline.
    pub fn session_exists_and_active(&self, session_id: i64) -> bool {
        self.sessions
            .get(&session_id)
            .map(|s| s.is_active())
            .unwrap_or(false)
    }

    /// Marks a still-`Active` session `Expiring` the moment `C8`'s deadline scan decides to
    /// submit its `closeSession`, so `session_exists_and_active` stops treating it as usable for
    /// the window between that decision and the entry actually committing and applying. A no-op
    /// if the session is gone or already past `Active` (reconnect won the race, or it's already
    /// being closed some other way).
    pub fn mark_session_expiring(&mut self, session_id: i64) {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            if session.state == SessionState::Active {
                session.state = SessionState::Expiring;
            }
        }
    }

    /// Marks a still-`Active` session `Closing` the moment a connection's own `close` request is
    /// handed to the write pipeline, for the same reason `mark_session_expiring` exists on the
    /// expiry path: the session is no longer usable the instant the client asked to end it, not
    /// only once the `closeSession` entry applies.
    pub fn mark_session_closing(&mut self, session_id: i64) {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            if session.state == SessionState::Active {
                session.state = SessionState::Closing;
            }
        }
    }

    pub fn session_deadlines(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        self.sessions.iter().map(|(id, s)| (*id, s.deadline_ms))
    }

    pub fn touch_session(&mut self, session_id: i64, time_ms: i64) {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.touch(time_ms);
        }
    }

    /// Raises `session_id`'s deadline to at least `leader_now_ms + remaining_ms`, never lowers
    /// it. Used by the leader when it receives a `session_sync` bulk refresh from a follower
    /// (`SPEC_FULL.md` §4.7): the follower's client may be heartbeating a connection the leader
    /// never sees requests from directly, so the leader must not expire it out from under the
    /// follower.
    pub fn extend_session_deadline(&mut self, session_id: i64, leader_now_ms: i64, remaining_ms: i64) {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            let candidate = leader_now_ms + remaining_ms;
            if candidate > session.deadline_ms {
                session.deadline_ms = candidate;
            }
        }
    }

    pub fn all_ephemerals(&self) -> impl Iterator<Item = (i64, &BTreeSet<String>)> {
        self.sessions.iter().map(|(id, s)| (*id, &s.ephemerals))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::request::*;
    use crate::wire::Request;

    fn store() -> KeeperStore {
        KeeperStore::new(1024 * 1024)
    }

    fn connect(store: &mut KeeperStore) -> i64 {
        let result = store.apply(
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
        match result.response {
            Response::Connect(c) => c.session_id,
            _ => panic!("expected connect response"),
        }
    }

    #[test]
    fn s1_create_get_delete() {
        let mut store = store();
        let session = connect(&mut store);

        let create = store.apply(
            session,
            0,
            1,
            &Request::Create(CreateRequest {
                path: "/a".to_string(),
                data: b"hello".to_vec(),
                acl: Vec::new(),
                flags: CreateFlags::default(),
            }),
        );
        assert_eq!(create.err, ErrorCode::Ok);

        let get = store.apply(
            session,
            0,
            2,
            &Request::GetData(GetDataRequest {
                path: "/a".to_string(),
                watch: false,
            }),
        );
        match get.response {
            Response::GetData(r) => {
                assert_eq!(r.data, b"hello");
                assert_eq!(r.stat.version, 0);
                assert_eq!(r.stat.data_length, 5);
                assert_eq!(r.stat.num_children, 0);
            }
            _ => panic!("unexpected response"),
        }

        let delete = store.apply(
            session,
            0,
            3,
            &Request::Delete(DeleteRequest {
                path: "/a".to_string(),
                version: 0,
            }),
        );
        assert_eq!(delete.err, ErrorCode::Ok);

        let exists = store.apply(
            session,
            0,
            4,
            &Request::Exists(ExistsRequest {
                path: "/a".to_string(),
                watch: false,
            }),
        );
        match exists.response {
            Response::Exists(r) => assert!(r.stat.is_none()),
            _ => panic!("unexpected response"),
        }
    }

    #[test]
    fn s2_sequential_children_sorted() {
        let mut store = store();
        let session = connect(&mut store);
        store.apply(
            session,
            0,
            1,
            &Request::Create(CreateRequest {
                path: "/q".to_string(),
                data: Vec::new(),
                acl: Vec::new(),
                flags: CreateFlags::default(),
            }),
        );
        for zxid in 2..4 {
            let r = store.apply(
                session,
                0,
                zxid,
                &Request::Create(CreateRequest {
                    path: "/q/item-".to_string(),
                    data: Vec::new(),
                    acl: Vec::new(),
                    flags: CreateFlags {
                        ephemeral: false,
                        sequential: true,
                    },
                }),
            );
            assert_eq!(r.err, ErrorCode::Ok);
        }
        let children = store.apply(
            session,
            0,
            4,
            &Request::GetChildren(GetChildrenRequest {
                path: "/q".to_string(),
                watch: false,
            }),
        );
        match children.response {
            Response::GetChildren(r) => {
                assert_eq!(
                    r.children,
                    vec!["item-0000000000".to_string(), "item-0000000001".to_string()]
                );
            }
            _ => panic!("unexpected response"),
        }
    }

    #[test]
    fn s3_watch_fires_exactly_once() {
        let mut store = store();
        let x = connect(&mut store);
        let y = connect(&mut store);
        store.apply(
            x,
            0,
            1,
            &Request::Create(CreateRequest {
                path: "/w".to_string(),
                data: Vec::new(),
                acl: Vec::new(),
                flags: CreateFlags::default(),
            }),
        );
        store.apply(
            x,
            0,
            2,
            &Request::GetData(GetDataRequest {
                path: "/w".to_string(),
                watch: true,
            }),
        );
        let first = store.apply(
            y,
            0,
            3,
            &Request::SetData(SetDataRequest {
                path: "/w".to_string(),
                data: b"v1".to_vec(),
                version: -1,
            }),
        );
        assert_eq!(first.notifications.len(), 1);
        assert_eq!(first.notifications[0].0, x);
        assert_eq!(first.notifications[0].1.event_type, WatchEventType::NodeDataChanged);

        let second = store.apply(
            y,
            0,
            4,
            &Request::SetData(SetDataRequest {
                path: "/w".to_string(),
                data: b"v2".to_vec(),
                version: -1,
            }),
        );
        assert!(second.notifications.is_empty());
    }

    #[test]
    fn s4_ephemeral_cleanup_on_session_close() {
        let mut store = store();
        let x = connect(&mut store);
        let watcher = connect(&mut store);
        store.apply(
            x,
            0,
            1,
            &Request::Create(CreateRequest {
                path: "/e".to_string(),
                data: Vec::new(),
                acl: Vec::new(),
                flags: CreateFlags {
                    ephemeral: true,
                    sequential: false,
                },
            }),
        );
        store.apply(
            watcher,
            0,
            2,
            &Request::Exists(ExistsRequest {
                path: "/e".to_string(),
                watch: true,
            }),
        );
        let close = store.apply(x, 0, 3, &Request::Close);
        assert_eq!(close.notifications.len(), 1);
        assert_eq!(close.notifications[0].0, watcher);
        assert_eq!(
            close.notifications[0].1.event_type,
            WatchEventType::NodeDeleted
        );
        assert!(!store.nodes.contains_key("/e"));
    }

    #[test]
    fn s5_multi_atomicity() {
        let mut store = store();
        let session = connect(&mut store);
        let result = store.apply(
            session,
            0,
            1,
            &Request::Multi(MultiRequest {
                ops: vec![
                    MultiSubOp::Create(CreateRequest {
                        path: "/m".to_string(),
                        data: Vec::new(),
                        acl: Vec::new(),
                        flags: CreateFlags::default(),
                    }),
                    MultiSubOp::SetData(SetDataRequest {
                        path: "/does-not-exist".to_string(),
                        data: b"x".to_vec(),
                        version: -1,
                    }),
                    MultiSubOp::Create(CreateRequest {
                        path: "/m/child".to_string(),
                        data: Vec::new(),
                        acl: Vec::new(),
                        flags: CreateFlags::default(),
                    }),
                ],
            }),
        );
        match result.response {
            Response::Multi(results) => {
                assert_eq!(results[0].err, ErrorCode::RuntimeInconsistency);
                assert_eq!(results[1].err, ErrorCode::NoNode);
                assert_eq!(results[2].err, ErrorCode::RuntimeInconsistency);
            }
            _ => panic!("unexpected response"),
        }
        assert!(!store.nodes.contains_key("/m"));
    }

    #[test]
    fn sequential_counter_never_resets_on_delete() {
        let mut store = store();
        let session = connect(&mut store);
        store.apply(
            session,
            0,
            1,
            &Request::Create(CreateRequest {
                path: "/p".to_string(),
                data: Vec::new(),
                acl: Vec::new(),
                flags: CreateFlags::default(),
            }),
        );
        let first = store.apply(
            session,
            0,
            2,
            &Request::Create(CreateRequest {
                path: "/p/x-".to_string(),
                data: Vec::new(),
                acl: Vec::new(),
                flags: CreateFlags {
                    ephemeral: false,
                    sequential: true,
                },
            }),
        );
        let first_path = match first.response {
            Response::Create(r) => r.path,
            _ => panic!("unexpected"),
        };
        store.apply(
            session,
            0,
            3,
            &Request::Delete(DeleteRequest {
                path: first_path,
                version: -1,
            }),
        );
        let second = store.apply(
            session,
            0,
            4,
            &Request::Create(CreateRequest {
                path: "/p/x-".to_string(),
                data: Vec::new(),
                acl: Vec::new(),
                flags: CreateFlags {
                    ephemeral: false,
                    sequential: true,
                },
            }),
        );
        match second.response {
            Response::Create(r) => assert_eq!(r.path, "/p/x-0000000001"),
            _ => panic!("unexpected"),
        }
    }

    #[test]
    fn expiring_session_is_not_active_until_reconnect() {
        let mut store = store();
        let session = connect(&mut store);
        assert!(store.session_exists_and_active(session));

        store.mark_session_expiring(session);
        assert!(!store.session_exists_and_active(session));

        // A reconnect on the same id before the close commits wins the race back.
        let result = store.apply(
            0,
            0,
            0,
            &Request::Connect(ConnectRequest {
                protocol_version: 0,
                last_zxid_seen: 0,
                timeout_ms: 10_000,
                session_id: session,
                password: Vec::new(),
            }),
        );
        assert!(matches!(result.response, Response::Connect(_)));
        assert!(store.session_exists_and_active(session));

        store.mark_session_expiring(session);
        let close = store.apply(session, 0, 1, &Request::Close);
        assert_eq!(close.err, ErrorCode::Ok);
        assert!(!store.session_exists_and_active(session));
    }

    #[test]
    fn closing_session_is_not_active_until_the_close_applies() {
        let mut store = store();
        let session = connect(&mut store);
        store.mark_session_closing(session);
        assert!(!store.session_exists_and_active(session));
        store.apply(session, 0, 1, &Request::Close);
        assert!(store.session(session).is_none());
    }

    #[test]
    fn auth_is_recorded_but_never_verified() {
        let mut store = store();
        let session = connect(&mut store);
        let result = store.apply(
            session,
            0,
            1,
            &Request::Auth(AuthRequest {
                scheme: "digest".to_string(),
                auth: b"alice:anything".to_vec(),
            }),
        );
        assert_eq!(result.err, ErrorCode::Ok);
        assert_eq!(
            store.session(session).unwrap().auth_ids,
            vec![("digest".to_string(), "alice:anything".to_string())]
        );

        // Submitting the same credential again does not duplicate the entry.
        store.apply(
            session,
            0,
            2,
            &Request::Auth(AuthRequest {
                scheme: "digest".to_string(),
                auth: b"alice:anything".to_vec(),
            }),
        );
        assert_eq!(store.session(session).unwrap().auth_ids.len(), 1);

        // Never verified: a write with no prior auth at all still succeeds, since nothing
        // consults `auth_ids` to gate access.
        let mut unauth_store = store();
        let unauth_session = connect(&mut unauth_store);
        let create = unauth_store.apply(
            unauth_session,
            0,
            1,
            &Request::Create(CreateRequest {
                path: "/a".to_string(),
                data: Vec::new(),
                acl: Vec::new(),
                flags: CreateFlags::default(),
            }),
        );
        assert_eq!(create.err, ErrorCode::Ok);
    }
}
