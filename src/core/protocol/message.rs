// src/core/protocol/message.rs

//! Implements the typed PostgreSQL v3 message (`[type:1][length:4][body]`)
//! and the corresponding `Encoder` and `Decoder` for network communication.
//!
//! The pooler forwards most messages verbatim, so the decoded form keeps the
//! raw body and offers parsed views only for the handful of message types the
//! router and session need to inspect.

use crate::core::RelayError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

// Protocol-level limit to prevent denial-of-service from malformed frames.
// PostgreSQL itself rejects messages larger than 1GB; we cap lower.
const MAX_MESSAGE_SIZE: usize = 512 * 1024 * 1024;

/// Message type bytes for both directions of the v3 protocol.
pub mod tags {
    // Frontend -> backend
    pub const QUERY: u8 = b'Q';
    pub const PARSE: u8 = b'P';
    pub const BIND: u8 = b'B';
    pub const EXECUTE: u8 = b'E';
    pub const DESCRIBE: u8 = b'D';
    pub const CLOSE: u8 = b'C';
    pub const SYNC: u8 = b'S';
    pub const FLUSH: u8 = b'H';
    pub const TERMINATE: u8 = b'X';
    pub const COPY_DATA: u8 = b'd';
    pub const COPY_DONE: u8 = b'c';
    pub const COPY_FAIL: u8 = b'f';
    pub const PASSWORD_MESSAGE: u8 = b'p';
    pub const FUNCTION_CALL: u8 = b'F';

    // Backend -> frontend
    pub const AUTHENTICATION: u8 = b'R';
    pub const BACKEND_KEY_DATA: u8 = b'K';
    pub const PARAMETER_STATUS: u8 = b'S';
    pub const READY_FOR_QUERY: u8 = b'Z';
    pub const COMMAND_COMPLETE: u8 = b'C';
    pub const DATA_ROW: u8 = b'D';
    pub const ROW_DESCRIPTION: u8 = b'T';
    pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
    pub const ERROR_RESPONSE: u8 = b'E';
    pub const NOTICE_RESPONSE: u8 = b'N';
    pub const NOTIFICATION_RESPONSE: u8 = b'A';
    pub const PARSE_COMPLETE: u8 = b'1';
    pub const BIND_COMPLETE: u8 = b'2';
    pub const CLOSE_COMPLETE: u8 = b'3';
    pub const NO_DATA: u8 = b'n';
    pub const PARAMETER_DESCRIPTION: u8 = b't';
    pub const PORTAL_SUSPENDED: u8 = b's';
    pub const COPY_IN_RESPONSE: u8 = b'G';
    pub const COPY_OUT_RESPONSE: u8 = b'H';
}

/// Authentication request codes carried in an `'R'` message.
pub mod auth_codes {
    pub const OK: i32 = 0;
    pub const CLEARTEXT_PASSWORD: i32 = 3;
    pub const MD5_PASSWORD: i32 = 5;
    pub const SASL: i32 = 10;
    pub const SASL_CONTINUE: i32 = 11;
    pub const SASL_FINAL: i32 = 12;
}

/// A single typed protocol message: the tag byte plus the body that follows
/// the length word. The length word itself is reconstructed on encode.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub tag: u8,
    pub body: Bytes,
}

impl Message {
    pub fn new(tag: u8, body: Bytes) -> Self {
        Self { tag, body }
    }

    /// Total size on the wire, including tag and length word.
    pub fn wire_len(&self) -> usize {
        1 + 4 + self.body.len()
    }

    /// Serializes the message into a standalone byte vector.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        buf.put_u8(self.tag);
        buf.put_i32(4 + self.body.len() as i32);
        buf.extend_from_slice(&self.body);
        buf.freeze()
    }

    // --- Builders for the messages the pooler originates itself ---

    pub fn query(sql: &str) -> Self {
        let mut body = BytesMut::with_capacity(sql.len() + 1);
        body.extend_from_slice(sql.as_bytes());
        body.put_u8(0);
        Self::new(tags::QUERY, body.freeze())
    }

    pub fn terminate() -> Self {
        Self::new(tags::TERMINATE, Bytes::new())
    }

    pub fn sync() -> Self {
        Self::new(tags::SYNC, Bytes::new())
    }

    pub fn password(data: &[u8]) -> Self {
        let mut body = BytesMut::with_capacity(data.len() + 1);
        body.extend_from_slice(data);
        body.put_u8(0);
        Self::new(tags::PASSWORD_MESSAGE, body.freeze())
    }

    /// SASLInitialResponse: mechanism name plus the initial client message.
    pub fn sasl_initial_response(mechanism: &str, response: &[u8]) -> Self {
        let mut body = BytesMut::new();
        body.extend_from_slice(mechanism.as_bytes());
        body.put_u8(0);
        body.put_i32(response.len() as i32);
        body.extend_from_slice(response);
        Self::new(tags::PASSWORD_MESSAGE, body.freeze())
    }

    /// SASLResponse: continuation data only.
    pub fn sasl_response(response: &[u8]) -> Self {
        Self::new(tags::PASSWORD_MESSAGE, Bytes::copy_from_slice(response))
    }

    pub fn authentication(code: i32, payload: &[u8]) -> Self {
        let mut body = BytesMut::with_capacity(4 + payload.len());
        body.put_i32(code);
        body.extend_from_slice(payload);
        Self::new(tags::AUTHENTICATION, body.freeze())
    }

    pub fn auth_ok() -> Self {
        Self::authentication(auth_codes::OK, &[])
    }

    pub fn auth_cleartext() -> Self {
        Self::authentication(auth_codes::CLEARTEXT_PASSWORD, &[])
    }

    pub fn auth_md5(salt: [u8; 4]) -> Self {
        Self::authentication(auth_codes::MD5_PASSWORD, &salt)
    }

    pub fn auth_sasl(mechanism: &str) -> Self {
        let mut payload = BytesMut::new();
        payload.extend_from_slice(mechanism.as_bytes());
        payload.put_u8(0);
        payload.put_u8(0); // end of mechanism list
        Self::authentication(auth_codes::SASL, &payload)
    }

    pub fn auth_sasl_continue(data: &[u8]) -> Self {
        Self::authentication(auth_codes::SASL_CONTINUE, data)
    }

    pub fn auth_sasl_final(data: &[u8]) -> Self {
        Self::authentication(auth_codes::SASL_FINAL, data)
    }

    pub fn backend_key_data(pid: i32, key: i32) -> Self {
        let mut body = BytesMut::with_capacity(8);
        body.put_i32(pid);
        body.put_i32(key);
        Self::new(tags::BACKEND_KEY_DATA, body.freeze())
    }

    pub fn parameter_status(key: &str, value: &str) -> Self {
        let mut body = BytesMut::with_capacity(key.len() + value.len() + 2);
        body.extend_from_slice(key.as_bytes());
        body.put_u8(0);
        body.extend_from_slice(value.as_bytes());
        body.put_u8(0);
        Self::new(tags::PARAMETER_STATUS, body.freeze())
    }

    pub fn ready_for_query(status: u8) -> Self {
        Self::new(tags::READY_FOR_QUERY, Bytes::copy_from_slice(&[status]))
    }

    pub fn command_complete(tag: &str) -> Self {
        let mut body = BytesMut::with_capacity(tag.len() + 1);
        body.extend_from_slice(tag.as_bytes());
        body.put_u8(0);
        Self::new(tags::COMMAND_COMPLETE, body.freeze())
    }

    /// Builds an `ErrorResponse` with the severity, SQLSTATE and message fields.
    pub fn error_response(severity: &str, code: &str, message: &str) -> Self {
        let mut body = BytesMut::new();
        for (field, value) in [(b'S', severity), (b'V', severity), (b'C', code), (b'M', message)] {
            body.put_u8(field);
            body.extend_from_slice(value.as_bytes());
            body.put_u8(0);
        }
        body.put_u8(0);
        Self::new(tags::ERROR_RESPONSE, body.freeze())
    }

    // --- Parsed views over received messages ---

    /// The SQL text of a `Query` message.
    pub fn as_query(&self) -> Result<&str, RelayError> {
        if self.tag != tags::QUERY {
            return Err(RelayError::ProtocolViolation("not a Query message".into()));
        }
        read_cstr(&self.body, 0).map(|(s, _)| s)
    }

    /// `(statement_name, query_text)` of a `Parse` message.
    pub fn as_parse(&self) -> Result<(&str, &str), RelayError> {
        let (name, off) = read_cstr(&self.body, 0)?;
        let (query, _) = read_cstr(&self.body, off)?;
        Ok((name, query))
    }

    /// `(portal_name, statement_name)` of a `Bind` message.
    pub fn as_bind(&self) -> Result<(&str, &str), RelayError> {
        let (portal, off) = read_cstr(&self.body, 0)?;
        let (statement, _) = read_cstr(&self.body, off)?;
        Ok((portal, statement))
    }

    /// `(portal_name, max_rows)` of an `Execute` message.
    pub fn as_execute(&self) -> Result<(&str, i32), RelayError> {
        let (portal, off) = read_cstr(&self.body, 0)?;
        let max_rows = self
            .body
            .get(off..off + 4)
            .map(|b| i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .unwrap_or(0);
        Ok((portal, max_rows))
    }

    /// `(kind, name)` of a `Close` or `Describe` message; kind is `'S'` or `'P'`.
    pub fn as_close_or_describe(&self) -> Result<(u8, &str), RelayError> {
        if self.body.is_empty() {
            return Err(RelayError::ProtocolViolation("empty Close/Describe".into()));
        }
        let kind = self.body[0];
        let (name, _) = read_cstr(&self.body, 1)?;
        Ok((kind, name))
    }

    /// The transaction status byte of a `ReadyForQuery`: `I`, `T` or `E`.
    pub fn ready_status(&self) -> Result<u8, RelayError> {
        self.body
            .first()
            .copied()
            .ok_or_else(|| RelayError::ProtocolViolation("empty ReadyForQuery".into()))
    }

    /// The command tag of a `CommandComplete` (e.g. `SELECT 1`, `SET`).
    pub fn command_tag(&self) -> Result<&str, RelayError> {
        read_cstr(&self.body, 0).map(|(s, _)| s)
    }

    /// `(key, value)` of a `ParameterStatus`.
    pub fn as_parameter_status(&self) -> Result<(&str, &str), RelayError> {
        let (key, off) = read_cstr(&self.body, 0)?;
        let (value, _) = read_cstr(&self.body, off)?;
        Ok((key, value))
    }

    /// `(pid, secret_key)` of a `BackendKeyData`.
    pub fn as_backend_key_data(&self) -> Result<(i32, i32), RelayError> {
        if self.body.len() < 8 {
            return Err(RelayError::ProtocolViolation("short BackendKeyData".into()));
        }
        let mut buf = self.body.clone();
        Ok((buf.get_i32(), buf.get_i32()))
    }

    /// The authentication request code of an `'R'` message, plus its payload.
    pub fn as_authentication(&self) -> Result<(i32, Bytes), RelayError> {
        if self.body.len() < 4 {
            return Err(RelayError::ProtocolViolation("short Authentication".into()));
        }
        let mut buf = self.body.clone();
        let code = buf.get_i32();
        Ok((code, buf))
    }

    /// Extracts the field map of an `ErrorResponse` or `NoticeResponse`,
    /// returning `(severity, sqlstate, message)`.
    pub fn error_fields(&self) -> Result<(String, String, String), RelayError> {
        let mut severity = String::new();
        let mut code = String::new();
        let mut message = String::new();
        let mut off = 0usize;
        while off < self.body.len() {
            let field = self.body[off];
            if field == 0 {
                break;
            }
            let (value, next) = read_cstr(&self.body, off + 1)?;
            match field {
                b'S' => severity = value.to_string(),
                b'C' => code = value.to_string(),
                b'M' => message = value.to_string(),
                _ => {}
            }
            off = next;
        }
        Ok((severity, code, message))
    }

    /// True for backend messages that terminate one step of the extended
    /// protocol, which is what the reply merger synchronizes on.
    pub fn is_command_boundary(&self) -> bool {
        matches!(
            self.tag,
            tags::COMMAND_COMPLETE | tags::ERROR_RESPONSE | tags::EMPTY_QUERY_RESPONSE
        )
    }
}

/// Reads a NUL-terminated string starting at `offset`, returning the string
/// and the offset just past the terminator.
fn read_cstr(body: &Bytes, offset: usize) -> Result<(&str, usize), RelayError> {
    let rest = body
        .get(offset..)
        .ok_or_else(|| RelayError::ProtocolViolation("truncated message body".into()))?;
    let nul = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| RelayError::ProtocolViolation("unterminated string in message".into()))?;
    let s = std::str::from_utf8(&rest[..nul])?;
    Ok((s, offset + nul + 1))
}

/// A `tokio_util::codec` implementation for typed v3 messages. Used on both
/// the frontend socket (after startup) and every backend socket.
#[derive(Debug, Default)]
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = RelayError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.wire_len());
        dst.put_u8(item.tag);
        dst.put_i32(4 + item.body.len() as i32);
        dst.extend_from_slice(&item.body);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = RelayError;

    /// Decodes one typed message. Returns `Ok(None)` until a full frame is
    /// buffered, letting the `Framed` stream wait for more data.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 5 {
            return Ok(None);
        }
        let tag = src[0];
        let len = i32::from_be_bytes([src[1], src[2], src[3], src[4]]);
        if len < 4 {
            return Err(RelayError::ProtocolViolation(format!(
                "message length {len} below minimum"
            )));
        }
        let body_len = (len - 4) as usize;
        if body_len > MAX_MESSAGE_SIZE {
            return Err(RelayError::ProtocolViolation(format!(
                "message of {body_len} bytes exceeds limit"
            )));
        }
        if src.len() < 5 + body_len {
            // Reserve to avoid repeated reallocation while the body streams in.
            src.reserve(5 + body_len - src.len());
            return Ok(None);
        }
        src.advance(5);
        let body = src.split_to(body_len).freeze();
        Ok(Some(Message { tag, body }))
    }
}
