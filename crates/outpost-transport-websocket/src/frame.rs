//! Multiplexing frames carried in binary WebSocket messages
//!
//! Frame format:
//! - 4 bytes: channel or request ID (big-endian u32)
//! - 1 byte: frame type
//! - Rest: type-specific body
//!
//! Bodies:
//! - `HELLO`: 4 bytes protocol version, then the server fingerprint (UTF-8)
//! - `OPEN`: target string (UTF-8)
//! - `OPEN_FAIL`: reason (UTF-8)
//! - `DATA`: raw channel bytes
//! - `REQUEST`: 1 byte kind length, kind (UTF-8), payload
//! - `REPLY`: 1 byte success flag, payload
//! - `OPEN_OK`, `FIN`: empty

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub(crate) const TYPE_DATA: u8 = 0;
pub(crate) const TYPE_FIN: u8 = 1;
pub(crate) const TYPE_OPEN: u8 = 2;
pub(crate) const TYPE_OPEN_OK: u8 = 3;
pub(crate) const TYPE_OPEN_FAIL: u8 = 4;
pub(crate) const TYPE_REQUEST: u8 = 5;
pub(crate) const TYPE_REPLY: u8 = 6;
pub(crate) const TYPE_HELLO: u8 = 7;

const HEADER_LEN: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    #[error("unknown frame type {0}")]
    UnknownType(u8),

    #[error("invalid UTF-8 in frame body")]
    InvalidUtf8,

    #[error("request kind longer than 255 bytes")]
    KindTooLong,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Hello { version: u32, fingerprint: String },
    Open { id: u32, target: String },
    OpenOk { id: u32 },
    OpenFail { id: u32, reason: String },
    Data { id: u32, payload: Bytes },
    Fin { id: u32 },
    Request { id: u32, kind: String, payload: Bytes },
    Reply { id: u32, ok: bool, payload: Bytes },
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.body_len());
        match self {
            Frame::Hello {
                version,
                fingerprint,
            } => {
                header(&mut buf, 0, TYPE_HELLO);
                buf.put_u32(*version);
                buf.put_slice(fingerprint.as_bytes());
            }
            Frame::Open { id, target } => {
                header(&mut buf, *id, TYPE_OPEN);
                buf.put_slice(target.as_bytes());
            }
            Frame::OpenOk { id } => header(&mut buf, *id, TYPE_OPEN_OK),
            Frame::OpenFail { id, reason } => {
                header(&mut buf, *id, TYPE_OPEN_FAIL);
                buf.put_slice(reason.as_bytes());
            }
            Frame::Data { id, payload } => {
                header(&mut buf, *id, TYPE_DATA);
                buf.put_slice(payload);
            }
            Frame::Fin { id } => header(&mut buf, *id, TYPE_FIN),
            Frame::Request { id, kind, payload } => {
                let kind_len = u8::try_from(kind.len()).map_err(|_| FrameError::KindTooLong)?;
                header(&mut buf, *id, TYPE_REQUEST);
                buf.put_u8(kind_len);
                buf.put_slice(kind.as_bytes());
                buf.put_slice(payload);
            }
            Frame::Reply { id, ok, payload } => {
                header(&mut buf, *id, TYPE_REPLY);
                buf.put_u8(u8::from(*ok));
                buf.put_slice(payload);
            }
        }
        Ok(buf.to_vec())
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < HEADER_LEN {
            return Err(FrameError::TooShort(data.len()));
        }
        let id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let body = &data[HEADER_LEN..];

        let frame = match data[4] {
            TYPE_HELLO => {
                if body.len() < 4 {
                    return Err(FrameError::TooShort(data.len()));
                }
                Frame::Hello {
                    version: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
                    fingerprint: utf8(&body[4..])?,
                }
            }
            TYPE_OPEN => Frame::Open {
                id,
                target: utf8(body)?,
            },
            TYPE_OPEN_OK => Frame::OpenOk { id },
            TYPE_OPEN_FAIL => Frame::OpenFail {
                id,
                reason: utf8(body)?,
            },
            TYPE_DATA => Frame::Data {
                id,
                payload: Bytes::copy_from_slice(body),
            },
            TYPE_FIN => Frame::Fin { id },
            TYPE_REQUEST => {
                let kind_len = *body.first().ok_or(FrameError::TooShort(data.len()))? as usize;
                if body.len() < 1 + kind_len {
                    return Err(FrameError::TooShort(data.len()));
                }
                Frame::Request {
                    id,
                    kind: utf8(&body[1..1 + kind_len])?,
                    payload: Bytes::copy_from_slice(&body[1 + kind_len..]),
                }
            }
            TYPE_REPLY => {
                let ok = *body.first().ok_or(FrameError::TooShort(data.len()))? != 0;
                Frame::Reply {
                    id,
                    ok,
                    payload: Bytes::copy_from_slice(&body[1..]),
                }
            }
            other => return Err(FrameError::UnknownType(other)),
        };

        Ok(frame)
    }

    fn body_len(&self) -> usize {
        match self {
            Frame::Hello { fingerprint, .. } => 4 + fingerprint.len(),
            Frame::Open { target, .. } => target.len(),
            Frame::OpenFail { reason, .. } => reason.len(),
            Frame::Data { payload, .. } => payload.len(),
            Frame::Request { kind, payload, .. } => 1 + kind.len() + payload.len(),
            Frame::Reply { payload, .. } => 1 + payload.len(),
            Frame::OpenOk { .. } | Frame::Fin { .. } => 0,
        }
    }
}

fn header(buf: &mut BytesMut, id: u32, frame_type: u8) {
    buf.put_u32(id);
    buf.put_u8(frame_type);
}

fn utf8(body: &[u8]) -> Result<String, FrameError> {
    String::from_utf8(body.to_vec()).map_err(|_| FrameError::InvalidUtf8)
}
