use std::io;

use thiserror::Error;

/// Process-level errors: things that abort startup or a single node's operation.
///
/// This is distinct from [`crate::wire::ErrorCode`], which is the per-request
/// wire-protocol error returned to clients and never terminates the process.
#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("corrupt log segment {path}: {reason}")]
    CorruptSegment { path: String, reason: String },

    #[error("corrupt snapshot {name}: {reason}")]
    CorruptSnapshot { name: String, reason: String },

    #[error("raft log error")]
    RaftLog,

    #[error("malformed wire frame: {0}")]
    Marshalling(String),
}

pub type Result<T> = std::result::Result<T, KeeperError>;
