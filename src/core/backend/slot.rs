// src/core/backend/slot.rs

//! A single live connection to one backend: socket, startup state, backend
//! pid and cancel key. Owned exclusively by the pool slot that contains it.

use crate::core::RelayError;
use crate::core::credentials::Secret;
use crate::core::protocol::auth::BackendAuthenticator;
use crate::core::protocol::message::{Message, MessageCodec, tags};
use crate::core::protocol::startup::{self, StartupPacket};
use futures::{SinkExt, StreamExt};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A backend connection over TCP or a Unix-domain socket. Hosts beginning
/// with `/` are treated as socket directories, PostgreSQL-style.
pub enum BackendStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl BackendStream {
    async fn connect(host: &str, port: u16) -> Result<Self, RelayError> {
        if host.starts_with('/') {
            let path = format!("{host}/.s.PGSQL.{port}");
            Ok(BackendStream::Unix(UnixStream::connect(path).await?))
        } else {
            let stream = TcpStream::connect((host, port)).await?;
            stream.set_nodelay(true)?;
            Ok(BackendStream::Tcp(stream))
        }
    }

    /// Non-blocking liveness probe for an idle pooled connection: alive only
    /// if a read would block. Readable EOF or unsolicited data both mean the
    /// slot must be discarded.
    fn socket_alive(&self) -> bool {
        let mut buf = [0u8; 1];
        let res = match self {
            BackendStream::Tcp(s) => s.try_read(&mut buf),
            BackendStream::Unix(s) => s.try_read(&mut buf),
        };
        matches!(res, Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock)
    }
}

impl AsyncRead for BackendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            BackendStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            BackendStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            BackendStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            BackendStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// One live, authenticated backend connection.
pub struct BackendSlot {
    pub node_id: usize,
    pub host: String,
    pub port: u16,
    framed: Framed<BackendStream, MessageCodec>,
    startup: StartupPacket,
    pid: i32,
    cancel_key: i32,
    use_count: u64,
    closed: bool,
}

impl std::fmt::Debug for BackendSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSlot")
            .field("node_id", &self.node_id)
            .field("user", &self.startup.user())
            .field("database", &self.startup.database())
            .field("pid", &self.pid)
            .field("use_count", &self.use_count)
            .finish()
    }
}

impl BackendSlot {
    /// Opens the socket, sends the startup packet, completes authentication
    /// with the resolved secret, and records the backend pid and cancel key.
    /// Parameter-status messages seen during startup are reported to
    /// `on_parameter` so the pool slot can mirror them.
    pub async fn open(
        node_id: usize,
        host: &str,
        port: u16,
        user: &str,
        database: &str,
        secret: &Secret,
        params: &mut BTreeMap<String, String>,
    ) -> Result<Self, RelayError> {
        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, BackendStream::connect(host, port))
            .await
            .map_err(|_| RelayError::Timeout(format!("connecting to backend {node_id}")))?
            .map_err(|e| match &e {
                RelayError::Io(io) if io.kind() == std::io::ErrorKind::ConnectionRefused => {
                    RelayError::ConnectRefused(node_id)
                }
                _ => e,
            })?;

        let packet = StartupPacket::new(user, database);
        {
            use tokio::io::AsyncWriteExt;
            stream.write_all(&packet.to_bytes()).await?;
            stream.flush().await?;
        }

        let mut framed = Framed::new(stream, MessageCodec);
        let mut authenticator = BackendAuthenticator::new(user, secret);
        let mut pid = 0;
        let mut cancel_key = 0;

        loop {
            let msg = match framed.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(RelayError::Io(std::sync::Arc::new(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "backend closed during startup",
                    ))));
                }
            };

            match msg.tag {
                tags::AUTHENTICATION => {
                    if let Some(reply) = authenticator.respond(&msg)? {
                        framed.send(reply).await?;
                    }
                }
                tags::ERROR_RESPONSE => {
                    let (severity, code, message) = msg.error_fields()?;
                    // 28xxx is the invalid-authorization SQLSTATE class.
                    return if code.starts_with("28") {
                        Err(RelayError::AuthFailed(message))
                    } else {
                        Err(RelayError::ProtocolViolation(format!(
                            "{severity} during backend startup: {message} ({code})"
                        )))
                    };
                }
                tags::NOTICE_RESPONSE => {
                    let (_, _, message) = msg.error_fields()?;
                    debug!("Backend {node_id} startup notice: {message}");
                }
                tags::PARAMETER_STATUS => {
                    let (key, value) = msg.as_parameter_status()?;
                    params.insert(key.to_string(), value.to_string());
                }
                tags::BACKEND_KEY_DATA => {
                    (pid, cancel_key) = msg.as_backend_key_data()?;
                }
                tags::READY_FOR_QUERY => {
                    debug!(
                        "Backend {node_id} connection ready (pid {pid}) for {user}@{database}"
                    );
                    return Ok(Self {
                        node_id,
                        host: host.to_string(),
                        port,
                        framed,
                        startup: packet,
                        pid,
                        cancel_key,
                        use_count: 0,
                        closed: false,
                    });
                }
                other => {
                    return Err(RelayError::ProtocolViolation(format!(
                        "unexpected '{}' message during backend startup",
                        other as char
                    )));
                }
            }
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn cancel_key(&self) -> i32 {
        self.cancel_key
    }

    pub fn startup(&self) -> &StartupPacket {
        &self.startup
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    /// Marks the slot as checked out by one more logical session.
    pub fn mark_reused(&mut self) {
        self.use_count += 1;
    }

    /// Non-blocking check that the idle socket is still connected.
    pub fn is_alive(&self) -> bool {
        !self.closed && self.framed.get_ref().socket_alive()
    }

    pub async fn send(&mut self, msg: Message) -> Result<(), RelayError> {
        self.framed.send(msg).await
    }

    /// Queues a message without flushing; used when multicasting so all
    /// targets receive their copy before any reply is awaited.
    pub async fn feed(&mut self, msg: Message) -> Result<(), RelayError> {
        self.framed.feed(msg).await
    }

    pub async fn flush(&mut self) -> Result<(), RelayError> {
        <Framed<BackendStream, MessageCodec> as SinkExt<Message>>::flush(&mut self.framed).await
    }

    pub async fn recv(&mut self) -> Result<Message, RelayError> {
        match self.framed.next().await {
            Some(result) => result,
            None => Err(RelayError::Io(std::sync::Arc::new(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend closed connection",
            )))),
        }
    }

    /// Drains messages until `ReadyForQuery`, discarding them. Used to
    /// resynchronize a slot before returning it to the cache.
    pub async fn drain_until_ready(&mut self) -> Result<u8, RelayError> {
        loop {
            let msg = self.recv().await?;
            if msg.tag == tags::READY_FOR_QUERY {
                return msg.ready_status();
            }
        }
    }

    /// Runs a fire-and-forget simple query, discarding its results.
    pub async fn simple_query(&mut self, sql: &str) -> Result<(), RelayError> {
        self.send(Message::query(sql)).await?;
        self.drain_until_ready().await?;
        Ok(())
    }

    /// Sends the termination byte and closes the socket. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.framed.send(Message::terminate()).await {
            debug!("Backend {} dirty shutdown: {e}", self.node_id);
        }
        let _ = <Framed<BackendStream, MessageCodec> as SinkExt<Message>>::close(&mut self.framed)
            .await;
    }

    /// Opens a dedicated connection to the backend and issues a cancel
    /// request for the given pid/key pair. Best effort.
    pub async fn cancel_request(host: &str, port: u16, pid: i32, key: i32) {
        match BackendStream::connect(host, port).await {
            Ok(mut stream) => {
                if let Err(e) = startup::write_cancel_request(&mut stream, pid, key).await {
                    warn!("Failed to send cancel request to {host}:{port}: {e}");
                }
            }
            Err(e) => warn!("Failed to open cancel connection to {host}:{port}: {e}"),
        }
    }
}
