//! Outer frame envelope: `[len:i32][xid:i64][opcode:i32][body]` for requests and
//! `[len:i32][xid:i64][zxid:i64][err:i32][body]` for responses. All integers are big-endian.

use std::fmt;
use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::ErrorCode;

#[derive(Debug)]
pub enum FrameError {
    Io(io::Error),
    Truncated,
    TooLarge(usize),
    /// Distinct from [`FrameError::Truncated`]: the frame itself decoded fine, the opcode is just
    /// one this node doesn't know. Per the error handling table this keeps the connection open
    /// and answers `UNIMPLEMENTED` instead of closing the socket.
    UnknownOpcode(i32),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Io(e) => write!(f, "io error: {}", e),
            FrameError::Truncated => write!(f, "truncated frame"),
            FrameError::TooLarge(n) => write!(f, "frame too large: {} bytes", n),
            FrameError::UnknownOpcode(code) => write!(f, "unknown opcode: {}", code),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        FrameError::Io(e)
    }
}

/// Heartbeat/auth xids reserved by the protocol.
pub const XID_NOTIFICATION: i64 = -1;
pub const XID_PING: i64 = -2;
pub const XID_AUTH: i64 = -4;

/// A decoded request frame, before the body is interpreted against an opcode.
pub struct RequestFrame {
    pub xid: i64,
    pub opcode: i32,
    pub body: Vec<u8>,
}

/// Maximum accepted frame length; guards against a malformed length prefix exhausting memory.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

impl RequestFrame {
    pub fn read(stream: &mut impl Read) -> Result<Self, FrameError> {
        let len = stream.read_i32::<BigEndian>()? as usize;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(len));
        }
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf)?;
        let mut cursor = &buf[..];
        let xid = cursor.read_i64::<BigEndian>().map_err(|_| FrameError::Truncated)?;
        let opcode = cursor.read_i32::<BigEndian>().map_err(|_| FrameError::Truncated)?;
        Ok(RequestFrame {
            xid,
            opcode,
            body: cursor.to_vec(),
        })
    }
}

/// An encoded response frame ready to be written to the wire.
pub struct ResponseFrame {
    pub xid: i64,
    pub zxid: i64,
    pub err: ErrorCode,
    pub body: Vec<u8>,
}

impl ResponseFrame {
    pub fn write(&self, stream: &mut impl Write) -> Result<(), FrameError> {
        let payload_len = 8 + 8 + 4 + self.body.len();
        stream.write_i32::<BigEndian>(payload_len as i32)?;
        stream.write_i64::<BigEndian>(self.xid)?;
        stream.write_i64::<BigEndian>(self.zxid)?;
        stream.write_i32::<BigEndian>(self.err.code())?;
        stream.write_all(&self.body)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + 8 + 8 + 4 + self.body.len());
        let payload_len = 8 + 8 + 4 + self.body.len();
        buf.write_i32::<BigEndian>(payload_len as i32).unwrap();
        buf.write_i64::<BigEndian>(self.xid).unwrap();
        buf.write_i64::<BigEndian>(self.zxid).unwrap();
        buf.write_i32::<BigEndian>(self.err.code()).unwrap();
        buf.extend_from_slice(&self.body);
        buf
    }
}

/// Reads a length-prefixed UTF-8 string (`-1` length means absent; callers interpret that
/// per-field), matching `[len:i32][bytes]`.
pub fn read_string(cursor: &mut &[u8]) -> Result<String, FrameError> {
    let len = cursor.read_i32::<BigEndian>().map_err(|_| FrameError::Truncated)?;
    if len < 0 {
        return Ok(String::new());
    }
    let len = len as usize;
    if cursor.len() < len {
        return Err(FrameError::Truncated);
    }
    let (s, rest) = cursor.split_at(len);
    let s = std::str::from_utf8(s)
        .map_err(|_| FrameError::Truncated)?
        .to_string();
    *cursor = rest;
    Ok(s)
}

pub fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.write_i32::<BigEndian>(s.len() as i32).unwrap();
    buf.extend_from_slice(s.as_bytes());
}

/// Reads a length-prefixed byte buffer; `-1` length encodes "no value" (returned as `None`).
pub fn read_bytes(cursor: &mut &[u8]) -> Result<Option<Vec<u8>>, FrameError> {
    let len = cursor.read_i32::<BigEndian>().map_err(|_| FrameError::Truncated)?;
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    if cursor.len() < len {
        return Err(FrameError::Truncated);
    }
    let (data, rest) = cursor.split_at(len);
    let data = data.to_vec();
    *cursor = rest;
    Ok(Some(data))
}

pub fn write_bytes(buf: &mut Vec<u8>, data: Option<&[u8]>) {
    match data {
        Some(data) => {
            buf.write_i32::<BigEndian>(data.len() as i32).unwrap();
            buf.extend_from_slice(data);
        }
        None => {
            buf.write_i32::<BigEndian>(-1).unwrap();
        }
    }
}

pub fn read_bool(cursor: &mut &[u8]) -> Result<bool, FrameError> {
    let b = cursor.read_u8().map_err(|_| FrameError::Truncated)?;
    Ok(b != 0)
}

pub fn write_bool(buf: &mut Vec<u8>, b: bool) {
    buf.write_u8(b as u8).unwrap();
}

pub fn read_i32(cursor: &mut &[u8]) -> Result<i32, FrameError> {
    cursor.read_i32::<BigEndian>().map_err(|_| FrameError::Truncated)
}

pub fn write_i32(buf: &mut Vec<u8>, v: i32) {
    buf.write_i32::<BigEndian>(v).unwrap();
}

pub fn read_i64(cursor: &mut &[u8]) -> Result<i64, FrameError> {
    cursor.read_i64::<BigEndian>().map_err(|_| FrameError::Truncated)
}

pub fn write_i64(buf: &mut Vec<u8>, v: i64) {
    buf.write_i64::<BigEndian>(v).unwrap();
}

pub fn write_stat(buf: &mut Vec<u8>, stat: &super::Stat) {
    write_i64(buf, stat.czxid);
    write_i64(buf, stat.mzxid);
    write_i64(buf, stat.ctime);
    write_i64(buf, stat.mtime);
    write_i32(buf, stat.version);
    write_i32(buf, stat.cversion);
    write_i32(buf, stat.aversion);
    write_i64(buf, stat.ephemeral_owner);
    write_i32(buf, stat.data_length);
    write_i32(buf, stat.num_children);
    write_i64(buf, stat.pzxid);
}
