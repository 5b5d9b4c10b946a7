//! Byte codec and message schema: big-endian primitives, C-strings, and
//! length-prefixed frames on one side; one encoder per wire message tagged
//! by its one-byte type on the other. [`Header`] frames incoming bytes
//! before [`BackendMessage::decode`] dispatches on the tag.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{ErrorFields, PgError, PgResult};

/// `{type:i8, length:i32}` read off the front of every typed backend
/// message. `body_len` excludes the four length bytes themselves, so a
/// message's total on-wire size is `Header::SIZE + body_len` (`length + 1`
/// on the wire).
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub tag: u8,
    pub body_len: usize,
}

impl Header {
    pub const SIZE: usize = 5;

    /// Non-destructive: returns `None` until a full 5-byte header is
    /// available in `buf`. Does not consume from `buf`.
    pub fn peek(buf: &BytesMut) -> Option<Header> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let tag = buf[0];
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let body_len = (len as i64 - 4).max(0) as usize;
        Some(Header { tag, body_len })
    }
}

/// Cursor over a decoded message body: i8/i16/i32 big-endian, length-prefixed
/// bytes, C-strings, fixed arrays.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf }
    }

    fn i8(&mut self) -> PgResult<i8> {
        if self.buf.is_empty() {
            return Err(PgError::Protocol("truncated message: expected i8".into()));
        }
        let v = self.buf[0] as i8;
        self.buf = &self.buf[1..];
        Ok(v)
    }

    fn i16(&mut self) -> PgResult<i16> {
        if self.buf.len() < 2 {
            return Err(PgError::Protocol("truncated message: expected i16".into()));
        }
        let v = i16::from_be_bytes([self.buf[0], self.buf[1]]);
        self.buf = &self.buf[2..];
        Ok(v)
    }

    fn i32(&mut self) -> PgResult<i32> {
        if self.buf.len() < 4 {
            return Err(PgError::Protocol("truncated message: expected i32".into()));
        }
        let v = i32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        self.buf = &self.buf[4..];
        Ok(v)
    }

    fn byten(&mut self, n: usize) -> PgResult<&'a [u8]> {
        if self.buf.len() < n {
            return Err(PgError::Protocol(format!("truncated message: expected {n} bytes")));
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    /// NUL-terminated UTF-8 string; lossily decoded, matching how servers
    /// in the wild occasionally emit non-UTF-8 identifiers in error text.
    fn cstring(&mut self) -> PgResult<String> {
        let end = self.buf.iter().position(|&b| b == 0).ok_or_else(|| PgError::Protocol("missing NUL terminator".into()))?;
        let s = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf = &self.buf[end + 1..];
        Ok(s)
    }

    fn bytes_lp(&mut self) -> PgResult<Option<Vec<u8>>> {
        let len = self.i32()?;
        if len < 0 {
            return Ok(None);
        }
        Ok(Some(self.byten(len as usize)?.to_vec()))
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// A message under construction: a tag byte (or none), a placeholder
/// length, a body, backfilled on [`MessageWriter::finish`].
struct MessageWriter {
    buf: BytesMut,
    length_at: usize,
}

impl MessageWriter {
    fn tagged(tag: u8) -> Self {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u8(tag);
        let length_at = buf.len();
        buf.put_i32(0);
        MessageWriter { buf, length_at }
    }

    fn untagged() -> Self {
        let mut buf = BytesMut::with_capacity(32);
        let length_at = buf.len();
        buf.put_i32(0);
        MessageWriter { buf, length_at }
    }

    fn i16(mut self, v: i16) -> Self {
        self.buf.put_i16(v);
        self
    }

    fn i32(mut self, v: i32) -> Self {
        self.buf.put_i32(v);
        self
    }

    fn u8(mut self, v: u8) -> Self {
        self.buf.put_u8(v);
        self
    }

    /// NUL-terminated string. Rejects embedded NULs, matching the wire's `cstring`
    /// codec rather than silently truncating at the server.
    fn cstring(mut self, s: &str) -> PgResult<Self> {
        if s.as_bytes().contains(&0) {
            return Err(PgError::Protocol(format!("value contains an embedded NUL byte: {s:?}")));
        }
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
        Ok(self)
    }

    fn bytes_lp(mut self, data: &Option<Vec<u8>>) -> Self {
        match data {
            Some(bytes) => {
                self.buf.put_i32(bytes.len() as i32);
                self.buf.put_slice(bytes);
            }
            None => self.buf.put_i32(-1),
        }
        self
    }

    fn raw(mut self, data: &[u8]) -> Self {
        self.buf.put_slice(data);
        self
    }

    fn finish(mut self) -> BytesMut {
        let total_len = (self.buf.len() - self.length_at) as i32;
        self.buf[self.length_at..self.length_at + 4].copy_from_slice(&total_len.to_be_bytes());
        self.buf
    }
}

/// Server challenge/response codes from `Authentication` (`'R'`).
#[derive(Debug, Clone)]
pub enum AuthRequest {
    Ok,
    SASL(Vec<String>),
    SASLContinue(Vec<u8>),
    SASLFinal(Vec<u8>),
    /// MD5 (5), Kerberos (2), GSS (7/8), SSPI (9) — all rejected per the
    /// Not otherwise acted on; carries the raw status code.
    Unsupported(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    Failed,
}

impl TransactionStatus {
    fn from_byte(b: u8) -> PgResult<Self> {
        match b {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            other => Err(PgError::Protocol(format!("unknown transaction status byte {other:#04x}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_id: i16,
    pub type_oid: u32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

/// Frontend (client -> server) messages, one variant per message type this
/// crate speaks.
#[derive(Debug, Clone)]
pub enum FrontendMessage {
    Startup { params: HashMap<String, String> },
    CancelRequest { process_id: i32, secret_key: i32 },
    PasswordMessage { password: String },
    SASLInitialResponse { mechanism: String, data: Vec<u8> },
    SASLResponse { data: Vec<u8> },
    Parse { statement: String, query: String, param_types: Vec<u32> },
    Bind { portal: String, statement: String, params: Vec<Option<Vec<u8>>> },
    Describe { which: u8, name: String },
    Execute { portal: String, row_limit: i32 },
    Close { which: u8, name: String },
    Flush,
    Sync,
    Query { query: String },
    CopyData { data: Vec<u8> },
    CopyDone,
    CopyFail { cause: String },
    Terminate,
}

const STARTUP_PROTOCOL_VERSION: i32 = 196_608;
const CANCEL_REQUEST_CODE: i32 = 80_877_102;

impl FrontendMessage {
    pub fn encode(&self) -> BytesMut {
        match self {
            FrontendMessage::Startup { params } => {
                let mut w = MessageWriter::untagged().i32(STARTUP_PROTOCOL_VERSION);
                // Deterministic order keeps encoding reproducible for tests.
                let mut entries: Vec<(&String, &String)> = params.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                for (k, v) in entries {
                    w = w.cstring(k).expect("startup parameter name is NUL-free").cstring(v).expect("startup parameter value is NUL-free");
                }
                w.u8(0).finish()
            }
            FrontendMessage::CancelRequest { process_id, secret_key } => {
                MessageWriter::untagged().i32(CANCEL_REQUEST_CODE).i32(*process_id).i32(*secret_key).finish()
            }
            FrontendMessage::PasswordMessage { password } => {
                MessageWriter::tagged(b'p').cstring(password).expect("password is NUL-free").finish()
            }
            FrontendMessage::SASLInitialResponse { mechanism, data } => MessageWriter::tagged(b'p')
                .cstring(mechanism)
                .expect("SASL mechanism name is NUL-free")
                .i32(data.len() as i32)
                .raw(data)
                .finish(),
            FrontendMessage::SASLResponse { data } => MessageWriter::tagged(b'p').raw(data).finish(),
            FrontendMessage::Parse { statement, query, param_types } => {
                let mut w = MessageWriter::tagged(b'P').cstring(statement).expect("statement name is NUL-free").cstring(query).expect("query text is NUL-free").i16(param_types.len() as i16);
                for oid in param_types {
                    w = w.i32(*oid as i32);
                }
                w.finish()
            }
            FrontendMessage::Bind { portal, statement, params } => {
                let mut w = MessageWriter::tagged(b'B')
                    .cstring(portal)
                    .expect("portal name is NUL-free")
                    .cstring(statement)
                    .expect("statement name is NUL-free")
                    .i16(0) // param_formats: all text
                    .i16(params.len() as i16);
                for p in params {
                    w = w.bytes_lp(p);
                }
                w.i16(0).finish() // column_formats: all text
            }
            FrontendMessage::Describe { which, name } => MessageWriter::tagged(b'D').u8(*which).cstring(name).expect("name is NUL-free").finish(),
            FrontendMessage::Execute { portal, row_limit } => {
                MessageWriter::tagged(b'E').cstring(portal).expect("portal name is NUL-free").i32(*row_limit).finish()
            }
            FrontendMessage::Close { which, name } => MessageWriter::tagged(b'C').u8(*which).cstring(name).expect("name is NUL-free").finish(),
            FrontendMessage::Flush => MessageWriter::tagged(b'H').finish(),
            FrontendMessage::Sync => MessageWriter::tagged(b'S').finish(),
            FrontendMessage::Query { query } => MessageWriter::tagged(b'Q').cstring(query).expect("query text is NUL-free").finish(),
            FrontendMessage::CopyData { data } => MessageWriter::tagged(b'd').raw(data).finish(),
            FrontendMessage::CopyDone => MessageWriter::tagged(b'c').finish(),
            FrontendMessage::CopyFail { cause } => MessageWriter::tagged(b'f').cstring(cause).expect("cause is NUL-free").finish(),
            FrontendMessage::Terminate => MessageWriter::tagged(b'X').finish(),
        }
    }
}

/// Backend (server -> client) messages, one variant per message type this
/// crate speaks.
#[derive(Debug, Clone)]
pub enum BackendMessage {
    Authentication(AuthRequest),
    BackendKeyData { process_id: i32, secret_key: i32 },
    BindComplete,
    CloseComplete,
    CommandComplete { tag: String },
    CopyData { data: Vec<u8> },
    CopyDone,
    CopyInResponse,
    CopyOutResponse,
    CopyBothResponse,
    DataRow { columns: Vec<Option<Vec<u8>>> },
    EmptyQueryResponse,
    ErrorResponse(ErrorFields),
    NegotiateProtocolVersion,
    NoData,
    NoticeResponse(ErrorFields),
    NotificationResponse { process_id: i32, channel: String, payload: String },
    ParameterDescription { param_types: Vec<u32> },
    ParameterStatus { name: String, value: String },
    ParseComplete,
    PortalSuspended,
    ReadyForQuery { status: TransactionStatus },
    RowDescription { fields: Vec<FieldDescription> },
}

impl BackendMessage {
    /// Dispatches on `header.tag`; `body` is exactly `header.body_len`
    /// bytes, already split off the inbound buffer by the reader task.
    pub fn decode(header: Header, body: &[u8]) -> PgResult<BackendMessage> {
        let mut r = Reader::new(body);
        Ok(match header.tag {
            b'R' => BackendMessage::Authentication(decode_auth(&mut r)?),
            b'K' => BackendMessage::BackendKeyData { process_id: r.i32()?, secret_key: r.i32()? },
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b'C' => BackendMessage::CommandComplete { tag: r.cstring()? },
            b'd' => BackendMessage::CopyData { data: r.rest().to_vec() },
            b'c' => BackendMessage::CopyDone,
            b'G' => BackendMessage::CopyInResponse,
            b'H' => BackendMessage::CopyOutResponse,
            b'W' => BackendMessage::CopyBothResponse,
            b'D' => BackendMessage::DataRow { columns: decode_data_row(&mut r)? },
            b'I' => BackendMessage::EmptyQueryResponse,
            b'E' => BackendMessage::ErrorResponse(decode_error_fields(&mut r)?),
            b'v' => BackendMessage::NegotiateProtocolVersion,
            b'n' => BackendMessage::NoData,
            b'N' => BackendMessage::NoticeResponse(decode_error_fields(&mut r)?),
            b'A' => BackendMessage::NotificationResponse { process_id: r.i32()?, channel: r.cstring()?, payload: r.cstring()? },
            b't' => BackendMessage::ParameterDescription { param_types: decode_param_types(&mut r)? },
            b'S' => BackendMessage::ParameterStatus { name: r.cstring()?, value: r.cstring()? },
            b'1' => BackendMessage::ParseComplete,
            b's' => BackendMessage::PortalSuspended,
            b'Z' => BackendMessage::ReadyForQuery { status: TransactionStatus::from_byte(r.i8()? as u8)? },
            b'T' => BackendMessage::RowDescription { fields: decode_row_description(&mut r)? },
            other => return Err(PgError::Protocol(format!("unknown backend message tag {:?} ({other:#04x})", other as char))),
        })
    }
}

fn decode_auth(r: &mut Reader<'_>) -> PgResult<AuthRequest> {
    match r.i32()? {
        0 => Ok(AuthRequest::Ok),
        10 => {
            let mut mechanisms = Vec::new();
            while !r.is_empty() {
                let m = r.cstring()?;
                if m.is_empty() {
                    break;
                }
                mechanisms.push(m);
            }
            Ok(AuthRequest::SASL(mechanisms))
        }
        11 => Ok(AuthRequest::SASLContinue(r.rest().to_vec())),
        12 => Ok(AuthRequest::SASLFinal(r.rest().to_vec())),
        other => Ok(AuthRequest::Unsupported(other)),
    }
}

fn decode_data_row(r: &mut Reader<'_>) -> PgResult<Vec<Option<Vec<u8>>>> {
    let n = r.i16()? as usize;
    (0..n).map(|_| r.bytes_lp()).collect()
}

fn decode_param_types(r: &mut Reader<'_>) -> PgResult<Vec<u32>> {
    let n = r.i16()? as usize;
    (0..n).map(|_| r.i32().map(|v| v as u32)).collect()
}

fn decode_row_description(r: &mut Reader<'_>) -> PgResult<Vec<FieldDescription>> {
    let n = r.i16()? as usize;
    (0..n)
        .map(|_| {
            Ok(FieldDescription {
                name: r.cstring()?,
                table_oid: r.i32()? as u32,
                column_id: r.i16()?,
                type_oid: r.i32()? as u32,
                type_size: r.i16()?,
                type_modifier: r.i32()?,
                format: r.i16()?,
            })
        })
        .collect()
}

fn decode_error_fields(r: &mut Reader<'_>) -> PgResult<ErrorFields> {
    let mut raw = HashMap::new();
    loop {
        let tag = r.i8()? as u8;
        if tag == 0 {
            break;
        }
        raw.insert(tag, r.cstring()?);
    }
    Ok(ErrorFields::from_raw(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: &FrontendMessage) -> (Header, BytesMut) {
        let encoded = msg.encode();
        let header = Header::peek(&BytesMut::from(&encoded[..])).expect("full header present");
        (header, encoded)
    }

    #[test]
    fn bind_encodes_text_formats_and_length_prefixed_params() {
        let (header, encoded) = roundtrip(&FrontendMessage::Bind {
            portal: "p1".into(),
            statement: "__st1".into(),
            params: vec![Some(b"42".to_vec()), None],
        });
        assert_eq!(header.tag, b'B');
        assert_eq!(Header::SIZE + header.body_len, encoded.len());
    }

    #[test]
    fn cstring_rejects_embedded_nul() {
        let err = FrontendMessage::Query { query: "bad\0query".into() };
        // encode() would panic via expect(); exercise the fallible path directly.
        let result = MessageWriter::tagged(b'Q').cstring("bad\0query");
        assert!(result.is_err());
        let _ = err; // keep the constructed value to document intent
    }

    #[test]
    fn ready_for_query_decodes_transaction_status() {
        let body = [b'I'];
        let header = Header { tag: b'Z', body_len: body.len() };
        let msg = BackendMessage::decode(header, &body).unwrap();
        assert!(matches!(msg, BackendMessage::ReadyForQuery { status: TransactionStatus::Idle }));
    }

    #[test]
    fn error_response_defaults_missing_severity_and_code() {
        let mut body = Vec::new();
        body.push(b'M');
        body.extend_from_slice(b"oops\0");
        body.push(0);
        let header = Header { tag: b'E', body_len: body.len() };
        let msg = BackendMessage::decode(header, &body).unwrap();
        match msg {
            BackendMessage::ErrorResponse(fields) => {
                assert_eq!(fields.severity, "ERROR");
                assert_eq!(fields.code, "XX000");
                assert_eq!(fields.message, "oops");
            }
            other => panic!("expected ErrorResponse, got {other:?}"),
        }
    }

    #[test]
    fn row_description_roundtrips_field_metadata() {
        let mut body = Vec::new();
        body.extend_from_slice(&1i16.to_be_bytes());
        body.extend_from_slice(b"id\0");
        body.extend_from_slice(&0i32.to_be_bytes());
        body.extend_from_slice(&1i16.to_be_bytes());
        body.extend_from_slice(&23i32.to_be_bytes()); // int4
        body.extend_from_slice(&4i16.to_be_bytes());
        body.extend_from_slice(&(-1i32).to_be_bytes());
        body.extend_from_slice(&0i16.to_be_bytes());
        let header = Header { tag: b'T', body_len: body.len() };
        let msg = BackendMessage::decode(header, &body).unwrap();
        match msg {
            BackendMessage::RowDescription { fields } => {
                assert_eq!(fields.len(), 1);
                assert_eq!(fields[0].name, "id");
                assert_eq!(fields[0].type_oid, 23);
            }
            other => panic!("expected RowDescription, got {other:?}"),
        }
    }

    #[test]
    fn notification_response_decodes_channel_and_payload() {
        let mut body = Vec::new();
        body.extend_from_slice(&4321i32.to_be_bytes());
        body.extend_from_slice(b"my_channel\0");
        body.extend_from_slice(b"hello\0");
        let header = Header { tag: b'A', body_len: body.len() };
        let msg = BackendMessage::decode(header, &body).unwrap();
        match msg {
            BackendMessage::NotificationResponse { process_id, channel, payload } => {
                assert_eq!(process_id, 4321);
                assert_eq!(channel, "my_channel");
                assert_eq!(payload, "hello");
            }
            other => panic!("expected NotificationResponse, got {other:?}"),
        }
    }

    #[test]
    fn header_peek_returns_none_until_full_header_buffered() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[b'Z', 0, 0]);
        assert!(Header::peek(&buf).is_none());
        buf.extend_from_slice(&[0, 5]);
        let header = Header::peek(&buf).unwrap();
        assert_eq!(header.tag, b'Z');
        assert_eq!(header.body_len, 1);
    }
}
