//! Encoding for the payload carried inside a replicated log entry:
//! `[session_id:i64][xid:i64][opcode:i32][arrival_time_ms:i64][body]`.
//!
//! This is what gets handed to the Raft library's `append` and what comes back out of
//! `take_committed`/`get`; [`crate::log_store`] never interprets it.

use super::frame::{read_i32, read_i64, write_i32, write_i64, FrameError};

#[derive(Debug, Clone)]
pub struct LogPayload {
    pub session_id: i64,
    pub xid: i64,
    pub opcode: i32,
    pub arrival_time_ms: i64,
    pub body: Vec<u8>,
}

impl LogPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(28 + self.body.len());
        write_i64(&mut buf, self.session_id);
        write_i64(&mut buf, self.xid);
        write_i32(&mut buf, self.opcode);
        write_i64(&mut buf, self.arrival_time_ms);
        buf.extend_from_slice(&self.body);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut cursor = bytes;
        let session_id = read_i64(&mut cursor)?;
        let xid = read_i64(&mut cursor)?;
        let opcode = read_i32(&mut cursor)?;
        let arrival_time_ms = read_i64(&mut cursor)?;
        Ok(LogPayload {
            session_id,
            xid,
            opcode,
            arrival_time_ms,
            body: cursor.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let payload = LogPayload {
            session_id: 42,
            xid: 7,
            opcode: 1,
            arrival_time_ms: 123_456,
            body: vec![1, 2, 3, 4],
        };
        let encoded = payload.encode();
        let decoded = LogPayload::decode(&encoded).unwrap();
        assert_eq!(decoded.session_id, 42);
        assert_eq!(decoded.xid, 7);
        assert_eq!(decoded.opcode, 1);
        assert_eq!(decoded.arrival_time_ms, 123_456);
        assert_eq!(decoded.body, vec![1, 2, 3, 4]);
    }
}
