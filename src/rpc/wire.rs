//! RPC wire format.
//!
//! Frames are carried as channel messages, one logical frame per message.
//! All integers are little-endian.
//!
//! ```text
//! request:  type=0 u8 │ rid u32 │ method u8 │ payload…
//! response: type=1 u8 │ rid u32 │ method u8 │ more u8 │ payload…
//! cancel:   type=2 u8 │ rid u32 │ method u8
//! ```
//!
//! Sub-encoders: u16-length-prefixed UTF-8 strings, u32-length-prefixed
//! byte arrays, single-byte booleans (1 = true). Optional `caps` and scan
//! `prefix` fields encode as byte arrays where empty means absent; scan
//! range bounds carry a presence-flags byte so empty bounds stay exact.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ErrorCode, PlexError, Result};

const FRAME_REQUEST: u8 = 0;
const FRAME_RESPONSE: u8 = 1;
const FRAME_CANCEL: u8 = 2;

/// RPC method identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum Method {
    Get,
    Put,
    Del,
    Scan,
    Append,
}

impl Method {
    /// Wire id for this method.
    pub fn as_u8(&self) -> u8 {
        match self {
            Method::Get => 0,
            Method::Put => 1,
            Method::Del => 2,
            Method::Scan => 3,
            Method::Append => 4,
        }
    }

    /// Parse a wire id.
    pub fn from_u8(v: u8) -> Option<Method> {
        match v {
            0 => Some(Method::Get),
            1 => Some(Method::Put),
            2 => Some(Method::Del),
            3 => Some(Method::Scan),
            4 => Some(Method::Append),
            _ => None,
        }
    }

    /// Lowercase method name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Method::Get => "get",
            Method::Put => "put",
            Method::Del => "del",
            Method::Scan => "scan",
            Method::Append => "append",
        }
    }
}

/// One decoded RPC frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcFrame {
    /// Client → server call.
    Request { rid: u32, method: u8, payload: Bytes },
    /// Server → client result; `more` marks a continuing stream.
    Response {
        rid: u32,
        method: u8,
        more: bool,
        payload: Bytes,
    },
    /// Client → server cancellation, no payload.
    Cancel { rid: u32, method: u8 },
}

impl RpcFrame {
    /// Encode into one channel message.
    pub fn encode(&self) -> Bytes {
        match self {
            RpcFrame::Request {
                rid,
                method,
                payload,
            } => {
                let mut buf = BytesMut::with_capacity(6 + payload.len());
                buf.put_u8(FRAME_REQUEST);
                buf.put_u32_le(*rid);
                buf.put_u8(*method);
                buf.put_slice(payload);
                buf.freeze()
            }
            RpcFrame::Response {
                rid,
                method,
                more,
                payload,
            } => {
                let mut buf = BytesMut::with_capacity(7 + payload.len());
                buf.put_u8(FRAME_RESPONSE);
                buf.put_u32_le(*rid);
                buf.put_u8(*method);
                buf.put_u8(u8::from(*more));
                buf.put_slice(payload);
                buf.freeze()
            }
            RpcFrame::Cancel { rid, method } => {
                let mut buf = BytesMut::with_capacity(6);
                buf.put_u8(FRAME_CANCEL);
                buf.put_u32_le(*rid);
                buf.put_u8(*method);
                buf.freeze()
            }
        }
    }

    /// Decode one channel message.
    pub fn decode(msg: Bytes) -> Result<RpcFrame> {
        let mut r = Reader::new(msg.clone());
        let kind = r.u8()?;
        let rid = r.u32()?;
        let method = r.u8()?;
        match kind {
            FRAME_REQUEST => Ok(RpcFrame::Request {
                rid,
                method,
                payload: r.rest(),
            }),
            FRAME_RESPONSE => {
                let more = r.u8()? != 0;
                Ok(RpcFrame::Response {
                    rid,
                    method,
                    more,
                    payload: r.rest(),
                })
            }
            FRAME_CANCEL => Ok(RpcFrame::Cancel { rid, method }),
            other => Err(PlexError::Protocol(format!(
                "unknown rpc frame type {}",
                other
            ))),
        }
    }
}

/// The universal ok/err result container.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Success, with optional value bytes and optional meta-key bytes.
    Ok {
        value: Option<Bytes>,
        key: Option<Bytes>,
    },
    /// Failure with a code from the closed set and a message.
    Err { code: ErrorCode, message: String },
}

impl Envelope {
    /// Bare success.
    pub fn ok() -> Envelope {
        Envelope::Ok {
            value: None,
            key: None,
        }
    }

    /// Success carrying a value.
    pub fn ok_value(value: impl Into<Bytes>) -> Envelope {
        Envelope::Ok {
            value: Some(value.into()),
            key: None,
        }
    }

    /// Success carrying a value and the key it belongs to (scan rows).
    pub fn ok_entry(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Envelope {
        Envelope::Ok {
            value: Some(value.into()),
            key: Some(key.into()),
        }
    }

    /// Failure with code and message.
    pub fn err(code: ErrorCode, message: impl Into<String>) -> Envelope {
        Envelope::Err {
            code,
            message: message.into(),
        }
    }

    /// True for the success variant.
    pub fn is_ok(&self) -> bool {
        matches!(self, Envelope::Ok { .. })
    }

    /// Value bytes, if any.
    pub fn value(&self) -> Option<&Bytes> {
        match self {
            Envelope::Ok { value, .. } => value.as_ref(),
            Envelope::Err { .. } => None,
        }
    }

    /// Meta-key bytes, if any.
    pub fn key(&self) -> Option<&Bytes> {
        match self {
            Envelope::Ok { key, .. } => key.as_ref(),
            Envelope::Err { .. } => None,
        }
    }

    /// Error code for the failure variant.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Envelope::Err { code, .. } => Some(*code),
            Envelope::Ok { .. } => None,
        }
    }

    /// Error message for the failure variant.
    pub fn message(&self) -> Option<&str> {
        match self {
            Envelope::Err { message, .. } => Some(message),
            Envelope::Ok { .. } => None,
        }
    }

    /// Encode to payload bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Envelope::Ok { value, key } => {
                buf.put_u8(1);
                put_opt_bytes(&mut buf, value.as_ref());
                put_opt_bytes(&mut buf, key.as_ref());
            }
            Envelope::Err { code, message } => {
                buf.put_u8(0);
                put_str(&mut buf, code.as_str());
                put_str(&mut buf, message);
            }
        }
        buf.freeze()
    }

    /// Decode from payload bytes.
    pub fn decode(payload: Bytes) -> Result<Envelope> {
        let mut r = Reader::new(payload);
        match r.u8()? {
            1 => {
                let value = r.opt_bytes()?;
                let key = r.opt_bytes()?;
                Ok(Envelope::Ok { value, key })
            }
            0 => {
                let code = ErrorCode::parse(&r.str()?);
                let message = r.str()?;
                Ok(Envelope::Err { code, message })
            }
            other => Err(PlexError::Protocol(format!(
                "unknown envelope tag {}",
                other
            ))),
        }
    }
}

/// `get`/`del` payload: key plus optional capability token.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeyRequest {
    pub key: Bytes,
    pub caps: Option<Bytes>,
}

impl KeyRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_bytes(&mut buf, &self.key);
        put_caps(&mut buf, self.caps.as_ref());
        buf.freeze()
    }

    pub fn decode(payload: Bytes) -> Result<KeyRequest> {
        let mut r = Reader::new(payload);
        let key = r.bytes()?;
        let caps = r.caps()?;
        Ok(KeyRequest { key, caps })
    }
}

/// `put` payload: key, value, optional capability token.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PutRequest {
    pub key: Bytes,
    pub value: Bytes,
    pub caps: Option<Bytes>,
}

impl PutRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_bytes(&mut buf, &self.key);
        put_bytes(&mut buf, &self.value);
        put_caps(&mut buf, self.caps.as_ref());
        buf.freeze()
    }

    pub fn decode(payload: Bytes) -> Result<PutRequest> {
        let mut r = Reader::new(payload);
        let key = r.bytes()?;
        let value = r.bytes()?;
        let caps = r.caps()?;
        Ok(PutRequest { key, value, caps })
    }
}

/// `append` payload: value plus optional capability token.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AppendRequest {
    pub value: Bytes,
    pub caps: Option<Bytes>,
}

impl AppendRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_bytes(&mut buf, &self.value);
        put_caps(&mut buf, self.caps.as_ref());
        buf.freeze()
    }

    pub fn decode(payload: Bytes) -> Result<AppendRequest> {
        let mut r = Reader::new(payload);
        let value = r.bytes()?;
        let caps = r.caps()?;
        Ok(AppendRequest { value, caps })
    }
}

/// Key-range bounds for `scan`. Each bound is optional.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScanRange {
    pub gte: Option<Bytes>,
    pub gt: Option<Bytes>,
    pub lte: Option<Bytes>,
    pub lt: Option<Bytes>,
}

/// `scan` payload: optional prefix, direction, range, capability token.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScanRequest {
    pub prefix: Option<Bytes>,
    pub reverse: bool,
    pub range: ScanRange,
    pub caps: Option<Bytes>,
}

impl ScanRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_caps(&mut buf, self.prefix.as_ref());
        buf.put_u8(u8::from(self.reverse));

        let mut flags = 0u8;
        for (bit, bound) in [
            (0, &self.range.gte),
            (1, &self.range.gt),
            (2, &self.range.lte),
            (3, &self.range.lt),
        ] {
            if bound.is_some() {
                flags |= 1 << bit;
            }
        }
        buf.put_u8(flags);
        for bound in [
            &self.range.gte,
            &self.range.gt,
            &self.range.lte,
            &self.range.lt,
        ]
        .into_iter()
        .flatten()
        {
            put_bytes(&mut buf, bound);
        }

        put_caps(&mut buf, self.caps.as_ref());
        buf.freeze()
    }

    pub fn decode(payload: Bytes) -> Result<ScanRequest> {
        let mut r = Reader::new(payload);
        let prefix = r.caps()?;
        let reverse = r.u8()? != 0;
        let flags = r.u8()?;
        let mut bound = |bit: u8| -> Result<Option<Bytes>> {
            if flags & (1 << bit) != 0 {
                Ok(Some(r.bytes()?))
            } else {
                Ok(None)
            }
        };
        let range = ScanRange {
            gte: bound(0)?,
            gt: bound(1)?,
            lte: bound(2)?,
            lt: bound(3)?,
        };
        let caps = r.caps()?;
        Ok(ScanRequest {
            prefix,
            reverse,
            range,
            caps,
        })
    }
}

// ---------------------------------------------------------------------------
// Sub-encoders
// ---------------------------------------------------------------------------

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn put_bytes(buf: &mut BytesMut, b: &[u8]) {
    buf.put_u32_le(b.len() as u32);
    buf.put_slice(b);
}

/// Empty-means-absent optional byte array (`caps`, scan `prefix`).
fn put_caps(buf: &mut BytesMut, b: Option<&Bytes>) {
    match b {
        Some(b) => put_bytes(buf, b),
        None => buf.put_u32_le(0),
    }
}

/// Presence-byte optional byte array (envelope `value`/`key`).
fn put_opt_bytes(buf: &mut BytesMut, b: Option<&Bytes>) {
    match b {
        Some(b) => {
            buf.put_u8(1);
            put_bytes(buf, b);
        }
        None => buf.put_u8(0),
    }
}

struct Reader {
    msg: Bytes,
    pos: usize,
}

impl Reader {
    fn new(msg: Bytes) -> Self {
        Self { msg, pos: 0 }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.msg.len() < self.pos + n {
            Err(PlexError::Protocol("truncated rpc payload".into()))
        } else {
            Ok(())
        }
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        let v = self.msg[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        let v = u16::from_le_bytes([self.msg[self.pos], self.msg[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        let b = &self.msg[self.pos..self.pos + 4];
        self.pos += 4;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn bytes(&mut self) -> Result<Bytes> {
        let len = self.u32()? as usize;
        self.need(len)?;
        let out = self.msg.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(out)
    }

    /// Empty-means-absent byte array.
    fn caps(&mut self) -> Result<Option<Bytes>> {
        let b = self.bytes()?;
        Ok(if b.is_empty() { None } else { Some(b) })
    }

    fn opt_bytes(&mut self) -> Result<Option<Bytes>> {
        if self.u8()? == 1 {
            Ok(Some(self.bytes()?))
        } else {
            Ok(None)
        }
    }

    fn str(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        self.need(len)?;
        let s = std::str::from_utf8(&self.msg[self.pos..self.pos + len])
            .map_err(|_| PlexError::Protocol("non-UTF-8 string field".into()))?
            .to_string();
        self.pos += len;
        Ok(s)
    }

    fn rest(&mut self) -> Bytes {
        let out = self.msg.slice(self.pos..);
        self.pos = self.msg.len();
        out
    }
}
