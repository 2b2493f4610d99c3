// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the pooler.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Connection refused by backend {0}")]
    ConnectRefused(usize),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Unsupported protocol version {0}")]
    ProtocolMismatch(i32),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Backend {0} is not available")]
    BackendUnavailable(usize),

    #[error("No backend eligible for routing")]
    NoEligibleBackend,

    #[error("Backend health check failed for node {0}")]
    BackendHealthFail(usize),

    #[error("Cluster is processing another failover request")]
    ClusterInTransaction,

    #[error("Watchdog is not in a quorum-holding state")]
    NoQuorum,

    #[error("Command script failed with exit code {0:?}")]
    ScriptFailed(Option<i32>),

    #[error("Admin request rejected: {0}")]
    AdminRejected(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for RelayError {
    fn clone(&self) -> Self {
        match self {
            RelayError::Io(e) => RelayError::Io(Arc::clone(e)),
            RelayError::IncompleteData => RelayError::IncompleteData,
            RelayError::ConfigInvalid(s) => RelayError::ConfigInvalid(s.clone()),
            RelayError::ConnectRefused(id) => RelayError::ConnectRefused(*id),
            RelayError::AuthFailed(s) => RelayError::AuthFailed(s.clone()),
            RelayError::ProtocolMismatch(v) => RelayError::ProtocolMismatch(*v),
            RelayError::ProtocolViolation(s) => RelayError::ProtocolViolation(s.clone()),
            RelayError::Timeout(s) => RelayError::Timeout(s.clone()),
            RelayError::BackendUnavailable(id) => RelayError::BackendUnavailable(*id),
            RelayError::NoEligibleBackend => RelayError::NoEligibleBackend,
            RelayError::BackendHealthFail(id) => RelayError::BackendHealthFail(*id),
            RelayError::ClusterInTransaction => RelayError::ClusterInTransaction,
            RelayError::NoQuorum => RelayError::NoQuorum,
            RelayError::ScriptFailed(code) => RelayError::ScriptFailed(*code),
            RelayError::AdminRejected(s) => RelayError::AdminRejected(s.clone()),
            RelayError::Internal(s) => RelayError::Internal(s.clone()),
        }
    }
}

impl RelayError {
    /// True for errors that the session loop should retry rather than
    /// surface (interrupted or would-block reads).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::Io(e) if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
            )
        )
    }

    /// True for transport errors that indicate the peer is simply gone,
    /// as opposed to a corrupted stream.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            RelayError::Io(e) if matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionAborted
            )
        )
    }
}

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        RelayError::Io(Arc::new(e))
    }
}

impl From<std::str::Utf8Error> for RelayError {
    fn from(e: std::str::Utf8Error) -> Self {
        RelayError::ProtocolViolation(format!("invalid UTF-8 in message: {e}"))
    }
}

impl From<std::string::FromUtf8Error> for RelayError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        RelayError::ProtocolViolation(format!("invalid UTF-8 in message: {e}"))
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Internal(format!("JSON serialization error: {e}"))
    }
}
