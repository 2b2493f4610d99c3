// src/core/protocol/mod.rs

//! PostgreSQL v3 wire protocol: typed-message codec, startup-phase packets,
//! and the authentication exchanges built on top of them.

pub mod auth;
pub mod message;
pub mod scram;
pub mod startup;

pub use message::{Message, MessageCodec, tags};
pub use startup::{CANCEL_REQUEST_CODE, PROTOCOL_VERSION, SSL_REQUEST_CODE};
pub use startup::{FirstPacket, StartupPacket};
