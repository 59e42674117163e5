//! The client wire codec (`C1`): ZooKeeper-compatible framing, opcodes, stats and ACLs.
//!
//! Everything here is pure encode/decode. No component other than this module is allowed
//! to know the byte layout of a request, a response, a log entry, or a snapshot record.

pub mod acl;
pub mod frame;
pub mod log_entry;
pub mod request;
pub mod response;

pub use acl::{Acl, Permission};
pub use frame::{FrameError, RequestFrame, ResponseFrame};
pub use request::Request;
pub use response::{watch_event_frame, Response};

/// The well-known ZooKeeper error codes. Precondition failures use these; they are never
/// surfaced as process-level errors (see [`crate::error::KeeperError`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    SystemError = -1,
    RuntimeInconsistency = -2,
    ConnectionLoss = -4,
    MarshallingError = -5,
    Unimplemented = -6,
    OperationTimeout = -7,
    BadArguments = -8,
    NoNode = -101,
    NoAuth = -102,
    BadVersion = -103,
    NoChildrenForEphemerals = -108,
    NodeExists = -110,
    NotEmpty = -111,
    SessionExpired = -112,
    InvalidAcl = -114,
    AuthFailed = -115,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        use ErrorCode::*;
        Some(match code {
            0 => Ok,
            -1 => SystemError,
            -2 => RuntimeInconsistency,
            -4 => ConnectionLoss,
            -5 => MarshallingError,
            -6 => Unimplemented,
            -7 => OperationTimeout,
            -8 => BadArguments,
            -101 => NoNode,
            -102 => NoAuth,
            -103 => BadVersion,
            -108 => NoChildrenForEphemerals,
            -110 => NodeExists,
            -111 => NotEmpty,
            -112 => SessionExpired,
            -114 => InvalidAcl,
            -115 => AuthFailed,
            _ => return None,
        })
    }
}

/// The opcode identifying the kind of a client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum OpCode {
    Connect = 0,
    Create = 1,
    Delete = 2,
    Exists = 3,
    GetData = 4,
    SetData = 5,
    GetAcl = 6,
    SetAcl = 7,
    GetChildren = 8,
    Sync = 9,
    Ping = 11,
    GetChildren2 = 12,
    Check = 13,
    Multi = 14,
    Create2 = 15,
    Reconfig = 16,
    Close = -11,
    Auth = 100,
}

impl OpCode {
    pub fn from_code(code: i32) -> Option<Self> {
        use OpCode::*;
        Some(match code {
            0 => Connect,
            1 => Create,
            2 => Delete,
            3 => Exists,
            4 => GetData,
            5 => SetData,
            6 => GetAcl,
            7 => SetAcl,
            8 => GetChildren,
            9 => Sync,
            11 => Ping,
            12 => GetChildren2,
            13 => Check,
            14 => Multi,
            15 => Create2,
            16 => Reconfig,
            -11 => Close,
            100 => Auth,
            _ => return None,
        })
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Create-flags, bit-compatible with the ZooKeeper `CreateMode` ordinal encoding: bit 0 is
/// ephemeral, bit 1 is sequential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreateFlags {
    pub ephemeral: bool,
    pub sequential: bool,
}

impl CreateFlags {
    pub fn from_code(code: i32) -> Self {
        CreateFlags {
            ephemeral: code & 0b01 != 0,
            sequential: code & 0b10 != 0,
        }
    }

    pub fn code(self) -> i32 {
        (self.ephemeral as i32) | ((self.sequential as i32) << 1)
    }
}

/// The persisted per-node metadata, exposed verbatim to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    pub czxid: i64,
    pub mzxid: i64,
    pub ctime: i64,
    pub mtime: i64,
    pub version: i32,
    pub cversion: i32,
    pub aversion: i32,
    pub ephemeral_owner: i64,
    pub data_length: i32,
    pub num_children: i32,
    pub pzxid: i64,
}

/// What kind of mutation a registered watch should fire on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    Data,
    Children,
    Exists,
}

/// A single watch notification delivered to a client, `xid = -1` per the wire contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEventType {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

impl WatchEventType {
    /// Ordinal matching ZooKeeper's `EventType`, carried in the notification body.
    pub fn code(&self) -> i32 {
        match self {
            WatchEventType::NodeCreated => 1,
            WatchEventType::NodeDeleted => 2,
            WatchEventType::NodeDataChanged => 3,
            WatchEventType::NodeChildrenChanged => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub path: String,
}
