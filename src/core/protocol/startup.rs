// src/core/protocol/startup.rs

//! The untyped packets exchanged before the typed protocol begins: the
//! startup packet with its key/value parameter pairs, the TLS negotiation
//! sentinel, and the cancel-request packet.

use crate::core::RelayError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version 3.0 as carried in the startup packet.
pub const PROTOCOL_VERSION: i32 = 196608;
/// Magic "version" selecting a cancel request instead of a startup.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;
/// Magic "version" requesting TLS before the real startup packet.
pub const SSL_REQUEST_CODE: i32 = 80877103;

// Startup packets are small; anything larger is a protocol error.
const MAX_STARTUP_PACKET_SIZE: usize = 10_000;

/// A parsed startup packet: protocol version plus parameter pairs.
/// `user` is mandatory; `database` defaults to the user name per protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct StartupPacket {
    pub version: i32,
    pub params: BTreeMap<String, String>,
}

impl StartupPacket {
    pub fn new(user: &str, database: &str) -> Self {
        let mut params = BTreeMap::new();
        params.insert("user".to_string(), user.to_string());
        params.insert("database".to_string(), database.to_string());
        Self {
            version: PROTOCOL_VERSION,
            params,
        }
    }

    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn user(&self) -> &str {
        self.params.get("user").map(String::as_str).unwrap_or("")
    }

    pub fn database(&self) -> &str {
        self.params
            .get("database")
            .map(String::as_str)
            .unwrap_or_else(|| self.user())
    }

    pub fn options(&self) -> Option<&str> {
        self.params.get("options").map(String::as_str)
    }

    /// The major half of the protocol version word.
    pub fn protocol_major(&self) -> i32 {
        self.version >> 16
    }

    /// Serializes the packet, length word included.
    pub fn to_bytes(&self) -> Bytes {
        let mut body = BytesMut::new();
        body.put_i32(self.version);
        for (key, value) in &self.params {
            body.extend_from_slice(key.as_bytes());
            body.put_u8(0);
            body.extend_from_slice(value.as_bytes());
            body.put_u8(0);
        }
        body.put_u8(0);

        let mut packet = BytesMut::with_capacity(4 + body.len());
        packet.put_i32(4 + body.len() as i32);
        packet.extend_from_slice(&body);
        packet.freeze()
    }

    /// Parses the payload that follows the length word and version.
    fn parse_params(mut payload: Bytes) -> Result<BTreeMap<String, String>, RelayError> {
        let mut params = BTreeMap::new();
        loop {
            let key = take_cstr(&mut payload)?;
            if key.is_empty() {
                break;
            }
            let value = take_cstr(&mut payload)?;
            params.insert(key, value);
        }
        Ok(params)
    }
}

/// The first packet on a fresh frontend connection.
#[derive(Debug, Clone, PartialEq)]
pub enum FirstPacket {
    Startup(StartupPacket),
    SslRequest,
    Cancel { pid: i32, key: i32 },
}

/// Reads and classifies the first packet from a frontend socket.
pub async fn read_first_packet<S>(stream: &mut S) -> Result<FirstPacket, RelayError>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_i32().await? as usize;
    if !(8..=MAX_STARTUP_PACKET_SIZE).contains(&len) {
        return Err(RelayError::ProtocolViolation(format!(
            "startup packet length {len} out of range"
        )));
    }
    let mut payload = vec![0u8; len - 4];
    stream.read_exact(&mut payload).await?;
    let mut payload = Bytes::from(payload);
    let version = payload.get_i32();

    match version {
        SSL_REQUEST_CODE => Ok(FirstPacket::SslRequest),
        CANCEL_REQUEST_CODE => {
            if payload.len() < 8 {
                return Err(RelayError::ProtocolViolation("short cancel request".into()));
            }
            Ok(FirstPacket::Cancel {
                pid: payload.get_i32(),
                key: payload.get_i32(),
            })
        }
        v if v >> 16 == 3 => {
            let params = StartupPacket::parse_params(payload)?;
            if !params.contains_key("user") {
                return Err(RelayError::ProtocolViolation(
                    "startup packet missing user parameter".into(),
                ));
            }
            Ok(FirstPacket::Startup(StartupPacket { version, params }))
        }
        v => Err(RelayError::ProtocolMismatch(v)),
    }
}

/// Writes a cancel-request packet (used towards backends).
pub async fn write_cancel_request<S>(stream: &mut S, pid: i32, key: i32) -> Result<(), RelayError>
where
    S: AsyncWrite + Unpin,
{
    let mut packet = BytesMut::with_capacity(16);
    packet.put_i32(16);
    packet.put_i32(CANCEL_REQUEST_CODE);
    packet.put_i32(pid);
    packet.put_i32(key);
    stream.write_all(&packet).await?;
    stream.flush().await?;
    Ok(())
}

fn take_cstr(payload: &mut Bytes) -> Result<String, RelayError> {
    let nul = payload
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| RelayError::ProtocolViolation("unterminated startup parameter".into()))?;
    let s = String::from_utf8(payload.split_to(nul).to_vec())?;
    payload.advance(1);
    Ok(s)
}
