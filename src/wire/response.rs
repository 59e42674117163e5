//! Per-opcode response bodies, encoded to the bytes that follow the frame envelope.

use super::acl::{encode_acl_list, Acl};
use super::frame::*;
use super::{ErrorCode, Stat, WatchEvent};

#[derive(Debug, Clone)]
pub struct ConnectResponse {
    pub protocol_version: i32,
    pub timeout_ms: i32,
    pub session_id: i64,
    pub password: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CreateResponse {
    pub path: String,
    pub stat: Option<Stat>,
}

#[derive(Debug, Clone)]
pub struct ExistsResponse {
    pub stat: Option<Stat>,
}

#[derive(Debug, Clone)]
pub struct GetDataResponse {
    pub data: Vec<u8>,
    pub stat: Stat,
}

#[derive(Debug, Clone)]
pub struct GetChildrenResponse {
    pub children: Vec<String>,
    pub stat: Option<Stat>,
}

#[derive(Debug, Clone)]
pub struct GetAclResponse {
    pub acl: Vec<Acl>,
    pub stat: Stat,
}

/// The outcome of one `multi` sub-operation: its own error if it is the one that failed, or
/// `RuntimeInconsistency` for every sibling when a different sub-op failed.
#[derive(Debug, Clone)]
pub struct MultiSubResult {
    pub err: ErrorCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum Response {
    Connect(ConnectResponse),
    Create(CreateResponse),
    Void,
    Exists(ExistsResponse),
    GetData(GetDataResponse),
    Stat(Stat),
    GetChildren(GetChildrenResponse),
    GetAcl(GetAclResponse),
    Multi(Vec<MultiSubResult>),
    Pong,
}

impl Response {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        match self {
            Response::Connect(r) => {
                write_i32(&mut buf, r.protocol_version);
                write_i32(&mut buf, r.timeout_ms);
                write_i64(&mut buf, r.session_id);
                write_bytes(&mut buf, Some(&r.password));
            }
            Response::Create(r) => {
                write_string(&mut buf, &r.path);
                if let Some(stat) = &r.stat {
                    write_stat(&mut buf, stat);
                }
            }
            Response::Void | Response::Pong => {}
            Response::Exists(r) => {
                write_bool(&mut buf, r.stat.is_some());
                if let Some(stat) = &r.stat {
                    write_stat(&mut buf, stat);
                }
            }
            Response::GetData(r) => {
                write_bytes(&mut buf, Some(&r.data));
                write_stat(&mut buf, &r.stat);
            }
            Response::Stat(stat) => write_stat(&mut buf, stat),
            Response::GetChildren(r) => {
                write_i32(&mut buf, r.children.len() as i32);
                for child in &r.children {
                    write_string(&mut buf, child);
                }
                if let Some(stat) = &r.stat {
                    write_stat(&mut buf, stat);
                }
            }
            Response::GetAcl(r) => {
                encode_acl_list(&mut buf, &r.acl);
                write_stat(&mut buf, &r.stat);
            }
            Response::Multi(results) => {
                for result in results {
                    write_i32(&mut buf, 0);
                    write_bool(&mut buf, false);
                    write_i32(&mut buf, result.err.code());
                    buf.extend_from_slice(&result.body);
                }
                // terminator header: done = true
                write_i32(&mut buf, 0);
                write_bool(&mut buf, true);
                write_i32(&mut buf, 0);
            }
        }
        buf
    }
}

/// Encodes a watch notification body: `[type:i32][state:i32][path]`. `state` is always
/// `3` (`SyncConnected`) — this crate never surfaces session-state transitions as watch events.
pub fn encode_watch_event(event: &WatchEvent) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + event.path.len());
    write_i32(&mut buf, event.event_type.code());
    write_i32(&mut buf, 3);
    write_string(&mut buf, &event.path);
    buf
}

/// Builds the wire frame for a watch notification: `xid = -1`, `zxid = -1`, per `§6.1`.
pub fn watch_event_frame(event: &WatchEvent) -> ResponseFrame {
    ResponseFrame {
        xid: XID_NOTIFICATION,
        zxid: -1,
        err: ErrorCode::Ok,
        body: encode_watch_event(event),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::WatchEventType;

    fn sample_stat() -> Stat {
        Stat {
            czxid: 1,
            mzxid: 2,
            ctime: 3,
            mtime: 4,
            version: 5,
            cversion: 6,
            aversion: 7,
            ephemeral_owner: 0,
            data_length: 3,
            num_children: 0,
            pzxid: 1,
        }
    }

    #[test]
    fn create_response_without_stat_omits_stat_bytes() {
        let body = Response::Create(CreateResponse {
            path: "/foo".to_string(),
            stat: None,
        })
        .encode();
        // just the length-prefixed path: 4 + 4 bytes
        assert_eq!(body.len(), 4 + "/foo".len());
    }

    #[test]
    fn create_response_with_stat_appends_stat_bytes() {
        let body = Response::Create(CreateResponse {
            path: "/foo".to_string(),
            stat: Some(sample_stat()),
        })
        .encode();
        assert_eq!(body.len(), 4 + "/foo".len() + 8 * 6 + 4 * 5);
    }

    #[test]
    fn exists_response_encodes_presence_flag() {
        let present = Response::Exists(ExistsResponse {
            stat: Some(sample_stat()),
        })
        .encode();
        assert_eq!(present[0], 1);

        let absent = Response::Exists(ExistsResponse { stat: None }).encode();
        assert_eq!(absent, vec![0u8]);
    }

    #[test]
    fn get_children_response_lists_every_child() {
        let body = Response::GetChildren(GetChildrenResponse {
            children: vec!["a".to_string(), "b".to_string()],
            stat: None,
        })
        .encode();
        let mut cursor = &body[..];
        assert_eq!(read_i32(&mut cursor).unwrap(), 2);
        assert_eq!(read_string(&mut cursor).unwrap(), "a");
        assert_eq!(read_string(&mut cursor).unwrap(), "b");
        assert!(cursor.is_empty());
    }

    #[test]
    fn void_and_pong_encode_to_empty_body() {
        assert!(Response::Void.encode().is_empty());
        assert!(Response::Pong.encode().is_empty());
    }

    #[test]
    fn multi_response_terminates_with_done_header() {
        let body = Response::Multi(vec![
            MultiSubResult {
                err: ErrorCode::Ok,
                body: vec![],
            },
            MultiSubResult {
                err: ErrorCode::NoNode,
                body: vec![],
            },
        ])
        .encode();
        let mut cursor = &body[..];
        for expected_err in [ErrorCode::Ok.code(), ErrorCode::NoNode.code()] {
            assert_eq!(read_i32(&mut cursor).unwrap(), 0);
            assert!(!read_bool(&mut cursor).unwrap());
            assert_eq!(read_i32(&mut cursor).unwrap(), expected_err);
        }
        assert_eq!(read_i32(&mut cursor).unwrap(), 0);
        assert!(read_bool(&mut cursor).unwrap());
        assert_eq!(read_i32(&mut cursor).unwrap(), 0);
        assert!(cursor.is_empty());
    }

    #[test]
    fn watch_event_frame_uses_reserved_notification_xid() {
        let frame = watch_event_frame(&WatchEvent {
            event_type: WatchEventType::NodeDataChanged,
            path: "/foo".to_string(),
        });
        assert_eq!(frame.xid, XID_NOTIFICATION);
        assert_eq!(frame.zxid, -1);
        assert_eq!(frame.err, ErrorCode::Ok);

        let mut cursor = &frame.body[..];
        assert_eq!(read_i32(&mut cursor).unwrap(), WatchEventType::NodeDataChanged.code());
        assert_eq!(read_i32(&mut cursor).unwrap(), 3);
        assert_eq!(read_string(&mut cursor).unwrap(), "/foo");
    }
}
