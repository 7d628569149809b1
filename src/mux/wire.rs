//! Substrate frame codec.
//!
//! One substrate frame per transport message:
//!
//! ```text
//! ┌──────┬───────────────────┬──────────────────────┬──────────┐
//! │ kind │ id                │ protocol             │ body     │
//! │ u8   │ u32 LE len + data │ u16 LE len + UTF-8   │ rest     │
//! └──────┴───────────────────┴──────────────────────┴──────────┘
//! ```
//!
//! Kinds: `0` OPEN (body = handshake), `1` DATA (body = message),
//! `2` CLOSE (empty body).

use bytes::{BufMut, Bytes, BytesMut};

use super::ChannelKey;
use crate::error::{PlexError, Result};

const KIND_OPEN: u8 = 0;
const KIND_DATA: u8 = 1;
const KIND_CLOSE: u8 = 2;

/// A decoded substrate frame.
#[derive(Debug, Clone, PartialEq)]
pub enum MuxFrame {
    /// Channel open announcement with handshake payload.
    Open { key: ChannelKey, handshake: Bytes },
    /// One channel message.
    Data { key: ChannelKey, payload: Bytes },
    /// Channel close (either side).
    Close { key: ChannelKey },
}

impl MuxFrame {
    /// Encode this frame into a single transport message.
    pub fn encode(&self) -> Bytes {
        let (kind, key, body) = match self {
            MuxFrame::Open { key, handshake } => (KIND_OPEN, key, handshake.as_ref()),
            MuxFrame::Data { key, payload } => (KIND_DATA, key, payload.as_ref()),
            MuxFrame::Close { key } => (KIND_CLOSE, key, &[][..]),
        };

        let proto = key.protocol.as_bytes();
        let mut buf = BytesMut::with_capacity(1 + 4 + key.id.len() + 2 + proto.len() + body.len());
        buf.put_u8(kind);
        buf.put_u32_le(key.id.len() as u32);
        buf.put_slice(&key.id);
        buf.put_u16_le(proto.len() as u16);
        buf.put_slice(proto);
        buf.put_slice(body);
        buf.freeze()
    }

    /// Decode one transport message into a frame.
    pub fn decode(msg: Bytes) -> Result<MuxFrame> {
        let buf = msg.as_ref();
        if buf.is_empty() {
            return Err(PlexError::Protocol("empty substrate frame".into()));
        }
        let kind = buf[0];
        let mut pos = 1usize;

        let id_len = read_u32_le(buf, &mut pos)? as usize;
        let id = read_bytes(&msg, buf, &mut pos, id_len)?;
        let proto_len = read_u16_le(buf, &mut pos)? as usize;
        let proto_raw = read_bytes(&msg, buf, &mut pos, proto_len)?;
        let protocol = std::str::from_utf8(&proto_raw)
            .map_err(|_| PlexError::Protocol("non-UTF-8 protocol name".into()))?
            .to_string();
        let key = ChannelKey { id, protocol };
        let body = msg.slice(pos..);

        match kind {
            KIND_OPEN => Ok(MuxFrame::Open {
                key,
                handshake: body,
            }),
            KIND_DATA => Ok(MuxFrame::Data { key, payload: body }),
            KIND_CLOSE => Ok(MuxFrame::Close { key }),
            other => Err(PlexError::Protocol(format!(
                "unknown substrate frame kind {}",
                other
            ))),
        }
    }
}

fn read_u16_le(buf: &[u8], pos: &mut usize) -> Result<u16> {
    if buf.len() < *pos + 2 {
        return Err(PlexError::Protocol("truncated substrate frame".into()));
    }
    let v = u16::from_le_bytes([buf[*pos], buf[*pos + 1]]);
    *pos += 2;
    Ok(v)
}

fn read_u32_le(buf: &[u8], pos: &mut usize) -> Result<u32> {
    if buf.len() < *pos + 4 {
        return Err(PlexError::Protocol("truncated substrate frame".into()));
    }
    let v = u32::from_le_bytes([buf[*pos], buf[*pos + 1], buf[*pos + 2], buf[*pos + 3]]);
    *pos += 4;
    Ok(v)
}

fn read_bytes(msg: &Bytes, buf: &[u8], pos: &mut usize, len: usize) -> Result<Bytes> {
    if buf.len() < *pos + len {
        return Err(PlexError::Protocol("truncated substrate frame".into()));
    }
    let out = msg.slice(*pos..*pos + len);
    *pos += len;
    Ok(out)
}
