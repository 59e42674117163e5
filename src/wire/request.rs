//! Per-opcode request bodies, decoded from the bytes following the frame envelope.

use super::acl::{decode_acl_list, Acl};
use super::frame::*;
use super::{CreateFlags, OpCode};

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub protocol_version: i32,
    pub last_zxid_seen: i64,
    pub timeout_ms: i32,
    pub session_id: i64,
    pub password: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub path: String,
    pub data: Vec<u8>,
    pub acl: Vec<Acl>,
    pub flags: CreateFlags,
}

#[derive(Debug, Clone)]
pub struct DeleteRequest {
    pub path: String,
    pub version: i32,
}

#[derive(Debug, Clone)]
pub struct ExistsRequest {
    pub path: String,
    pub watch: bool,
}

#[derive(Debug, Clone)]
pub struct GetDataRequest {
    pub path: String,
    pub watch: bool,
}

#[derive(Debug, Clone)]
pub struct SetDataRequest {
    pub path: String,
    pub data: Vec<u8>,
    pub version: i32,
}

#[derive(Debug, Clone)]
pub struct GetChildrenRequest {
    pub path: String,
    pub watch: bool,
}

#[derive(Debug, Clone)]
pub struct GetAclRequest {
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct SetAclRequest {
    pub path: String,
    pub acl: Vec<Acl>,
    pub version: i32,
}

#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub path: String,
    pub version: i32,
}

#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub scheme: String,
    pub auth: Vec<u8>,
}

/// A single sub-operation inside a [`Request::Multi`]. Spec-scoped to the kinds exercised by the
/// multi-atomicity property (create/delete/setData/check); other opcodes are rejected with
/// `BadArguments` if nested.
#[derive(Debug, Clone)]
pub enum MultiSubOp {
    Create(CreateRequest),
    Delete(DeleteRequest),
    SetData(SetDataRequest),
    Check(CheckRequest),
}

#[derive(Debug, Clone)]
pub struct MultiRequest {
    pub ops: Vec<MultiSubOp>,
}

#[derive(Debug, Clone)]
pub enum Request {
    Connect(ConnectRequest),
    Create(CreateRequest),
    Create2(CreateRequest),
    Delete(DeleteRequest),
    Exists(ExistsRequest),
    GetData(GetDataRequest),
    SetData(SetDataRequest),
    GetChildren(GetChildrenRequest),
    GetChildren2(GetChildrenRequest),
    GetAcl(GetAclRequest),
    SetAcl(SetAclRequest),
    Sync(SyncRequest),
    Check(CheckRequest),
    Multi(MultiRequest),
    Auth(AuthRequest),
    Ping,
    Close,
}

impl Request {
    /// Whether this request mutates the keeper store and must be replicated through Raft.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Request::Create(_)
                | Request::Create2(_)
                | Request::Delete(_)
                | Request::SetData(_)
                | Request::SetAcl(_)
                | Request::Multi(_)
                | Request::Close
        )
    }

    pub fn decode(opcode: i32, body: &[u8]) -> Result<Self, FrameError> {
        let op = OpCode::from_code(opcode).ok_or(FrameError::UnknownOpcode(opcode))?;
        let mut cursor = body;
        Ok(match op {
            OpCode::Connect => Request::Connect(decode_connect(&mut cursor)?),
            OpCode::Create => Request::Create(decode_create(&mut cursor)?),
            OpCode::Create2 => Request::Create2(decode_create(&mut cursor)?),
            OpCode::Delete => Request::Delete(decode_delete(&mut cursor)?),
            OpCode::Exists => Request::Exists(decode_exists(&mut cursor)?),
            OpCode::GetData => Request::GetData(decode_get_data(&mut cursor)?),
            OpCode::SetData => Request::SetData(decode_set_data(&mut cursor)?),
            OpCode::GetChildren => Request::GetChildren(decode_get_children(&mut cursor)?),
            OpCode::GetChildren2 => Request::GetChildren2(decode_get_children(&mut cursor)?),
            OpCode::GetAcl => Request::GetAcl(GetAclRequest {
                path: read_string(&mut cursor)?,
            }),
            OpCode::SetAcl => Request::SetAcl(decode_set_acl(&mut cursor)?),
            OpCode::Sync => Request::Sync(SyncRequest {
                path: read_string(&mut cursor)?,
            }),
            OpCode::Check => Request::Check(decode_check(&mut cursor)?),
            OpCode::Multi => Request::Multi(decode_multi(&mut cursor)?),
            OpCode::Auth => Request::Auth(decode_auth(&mut cursor)?),
            OpCode::Ping => Request::Ping,
            OpCode::Close => Request::Close,
            OpCode::Reconfig => {
                // accepted by the wire codec; static-peer-set semantics are handled in the
                // dispatcher (see DESIGN.md for the reconfig open question).
                Request::Sync(SyncRequest {
                    path: read_string(&mut cursor)?,
                })
            }
        })
    }
}

fn decode_connect(cursor: &mut &[u8]) -> Result<ConnectRequest, FrameError> {
    Ok(ConnectRequest {
        protocol_version: read_i32(cursor)?,
        last_zxid_seen: read_i64(cursor)?,
        timeout_ms: read_i32(cursor)?,
        session_id: read_i64(cursor)?,
        password: read_bytes(cursor)?.unwrap_or_default(),
    })
}

fn decode_create(cursor: &mut &[u8]) -> Result<CreateRequest, FrameError> {
    let path = read_string(cursor)?;
    let data = read_bytes(cursor)?.unwrap_or_default();
    let acl = decode_acl_list(cursor)?;
    let flags = CreateFlags::from_code(read_i32(cursor)?);
    Ok(CreateRequest {
        path,
        data,
        acl,
        flags,
    })
}

fn decode_delete(cursor: &mut &[u8]) -> Result<DeleteRequest, FrameError> {
    Ok(DeleteRequest {
        path: read_string(cursor)?,
        version: read_i32(cursor)?,
    })
}

fn decode_exists(cursor: &mut &[u8]) -> Result<ExistsRequest, FrameError> {
    Ok(ExistsRequest {
        path: read_string(cursor)?,
        watch: read_bool(cursor)?,
    })
}

fn decode_get_data(cursor: &mut &[u8]) -> Result<GetDataRequest, FrameError> {
    Ok(GetDataRequest {
        path: read_string(cursor)?,
        watch: read_bool(cursor)?,
    })
}

fn decode_set_data(cursor: &mut &[u8]) -> Result<SetDataRequest, FrameError> {
    Ok(SetDataRequest {
        path: read_string(cursor)?,
        data: read_bytes(cursor)?.unwrap_or_default(),
        version: read_i32(cursor)?,
    })
}

fn decode_get_children(cursor: &mut &[u8]) -> Result<GetChildrenRequest, FrameError> {
    Ok(GetChildrenRequest {
        path: read_string(cursor)?,
        watch: read_bool(cursor)?,
    })
}

fn decode_set_acl(cursor: &mut &[u8]) -> Result<SetAclRequest, FrameError> {
    let path = read_string(cursor)?;
    let acl = decode_acl_list(cursor)?;
    let version = read_i32(cursor)?;
    Ok(SetAclRequest {
        path,
        acl,
        version,
    })
}

fn decode_check(cursor: &mut &[u8]) -> Result<CheckRequest, FrameError> {
    Ok(CheckRequest {
        path: read_string(cursor)?,
        version: read_i32(cursor)?,
    })
}

fn decode_auth(cursor: &mut &[u8]) -> Result<AuthRequest, FrameError> {
    Ok(AuthRequest {
        scheme: read_string(cursor)?,
        auth: read_bytes(cursor)?.unwrap_or_default(),
    })
}

/// `multi` sub-ops are tagged `[opcode:i32][done:bool][err:i32]` followed by the sub-op body,
/// terminated by a header with `done = true`.
fn decode_multi(cursor: &mut &[u8]) -> Result<MultiRequest, FrameError> {
    let mut ops = Vec::new();
    loop {
        let opcode = read_i32(cursor)?;
        let done = read_bool(cursor)?;
        let _err = read_i32(cursor)?;
        if done {
            break;
        }
        let op = OpCode::from_code(opcode).ok_or(FrameError::Truncated)?;
        let sub_op = match op {
            OpCode::Create | OpCode::Create2 => MultiSubOp::Create(decode_create(cursor)?),
            OpCode::Delete => MultiSubOp::Delete(decode_delete(cursor)?),
            OpCode::SetData => MultiSubOp::SetData(decode_set_data(cursor)?),
            OpCode::Check => MultiSubOp::Check(decode_check(cursor)?),
            _ => return Err(FrameError::Truncated),
        };
        ops.push(sub_op);
    }
    Ok(MultiRequest { ops })
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::acl::{encode_acl_list, open_acl_unsafe};
    use super::super::OpCode;

    fn encode_create_body(path: &str, data: &[u8], flags: CreateFlags) -> Vec<u8> {
        let mut buf = Vec::new();
        write_string(&mut buf, path);
        write_bytes(&mut buf, Some(data));
        encode_acl_list(&mut buf, &open_acl_unsafe());
        write_i32(&mut buf, flags.code());
        buf
    }

    #[test]
    fn decodes_create_request() {
        let body = encode_create_body(
            "/foo",
            b"bar",
            CreateFlags {
                ephemeral: true,
                sequential: false,
            },
        );
        match Request::decode(OpCode::Create.code(), &body).unwrap() {
            Request::Create(r) => {
                assert_eq!(r.path, "/foo");
                assert_eq!(r.data, b"bar");
                assert!(r.flags.ephemeral);
                assert!(!r.flags.sequential);
                assert_eq!(r.acl.len(), 1);
            }
            other => panic!("expected Create, got {:?}", other),
        }
    }

    #[test]
    fn create2_shares_create_body_layout() {
        let body = encode_create_body("/baz", b"", CreateFlags::default());
        match Request::decode(OpCode::Create2.code(), &body).unwrap() {
            Request::Create2(r) => assert_eq!(r.path, "/baz"),
            other => panic!("expected Create2, got {:?}", other),
        }
    }

    #[test]
    fn decodes_delete_request() {
        let mut buf = Vec::new();
        write_string(&mut buf, "/foo");
        write_i32(&mut buf, 3);
        match Request::decode(OpCode::Delete.code(), &buf).unwrap() {
            Request::Delete(r) => {
                assert_eq!(r.path, "/foo");
                assert_eq!(r.version, 3);
            }
            other => panic!("expected Delete, got {:?}", other),
        }
    }

    #[test]
    fn decodes_exists_with_watch_flag() {
        let mut buf = Vec::new();
        write_string(&mut buf, "/foo");
        write_bool(&mut buf, true);
        match Request::decode(OpCode::Exists.code(), &buf).unwrap() {
            Request::Exists(r) => {
                assert_eq!(r.path, "/foo");
                assert!(r.watch);
            }
            other => panic!("expected Exists, got {:?}", other),
        }
    }

    #[test]
    fn reconfig_opcode_decodes_as_sync() {
        let mut buf = Vec::new();
        write_string(&mut buf, "/zookeeper/config");
        match Request::decode(OpCode::Reconfig.code(), &buf).unwrap() {
            Request::Sync(r) => assert_eq!(r.path, "/zookeeper/config"),
            other => panic!("expected Sync fallback, got {:?}", other),
        }
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        match Request::decode(9999, &[]) {
            Err(FrameError::UnknownOpcode(9999)) => {}
            other => panic!("expected UnknownOpcode, got {:?}", other),
        }
    }

    #[test]
    fn decodes_ping_and_close_with_empty_body() {
        assert!(matches!(
            Request::decode(OpCode::Ping.code(), &[]).unwrap(),
            Request::Ping
        ));
        assert!(matches!(
            Request::decode(OpCode::Close.code(), &[]).unwrap(),
            Request::Close
        ));
    }

    #[test]
    fn decodes_multi_with_create_and_delete() {
        let mut buf = Vec::new();
        write_i32(&mut buf, OpCode::Create.code());
        write_bool(&mut buf, false);
        write_i32(&mut buf, 0);
        buf.extend(encode_create_body("/a", b"1", CreateFlags::default()));

        write_i32(&mut buf, OpCode::Delete.code());
        write_bool(&mut buf, false);
        write_i32(&mut buf, 0);
        write_string(&mut buf, "/b");
        write_i32(&mut buf, -1);

        write_i32(&mut buf, 0);
        write_bool(&mut buf, true);
        write_i32(&mut buf, 0);

        match Request::decode(OpCode::Multi.code(), &buf).unwrap() {
            Request::Multi(multi) => {
                assert_eq!(multi.ops.len(), 2);
                assert!(matches!(multi.ops[0], MultiSubOp::Create(_)));
                assert!(matches!(multi.ops[1], MultiSubOp::Delete(_)));
            }
            other => panic!("expected Multi, got {:?}", other),
        }
    }

    #[test]
    fn is_write_classifies_mutating_opcodes() {
        assert!(Request::Close.is_write());
        assert!(Request::Multi(MultiRequest { ops: vec![] }).is_write());
        assert!(!Request::Ping.is_write());
        assert!(!Request::Sync(SyncRequest {
            path: "/".to_string()
        })
        .is_write());
    }
}
