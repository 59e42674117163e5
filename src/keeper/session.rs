use std::collections::BTreeSet;

/// `NEW` is set by `createSession` before the connect response is even built, `ACTIVE` right
/// after. `EXPIRING`/`CLOSING` are set by the write submitter (the deadline scan, or the
/// connection handling a client's own `close`) the instant it decides the session is done,
/// *before* the `closeSession` entry it submits has committed — closing the window where
/// `is_active` would otherwise still say yes. `CLOSED` has no representation of its own: the
/// session row is removed from the store entirely once `closeSession` applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Active,
    Expiring,
    Closing,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: i64,
    pub timeout_ms: u32,
    pub deadline_ms: i64,
    pub state: SessionState,
    pub auth_ids: Vec<(String, String)>,
    pub ephemerals: BTreeSet<String>,
}

impl Session {
    pub fn new(id: i64, timeout_ms: u32, now_ms: i64) -> Self {
        Session {
            id,
            timeout_ms,
            deadline_ms: now_ms + timeout_ms as i64,
            state: SessionState::New,
            auth_ids: Vec::new(),
            ephemerals: BTreeSet::new(),
        }
    }

    pub fn touch(&mut self, now_ms: i64) {
        self.deadline_ms = now_ms + self.timeout_ms as i64;
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }
}
