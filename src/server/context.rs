// src/server/context.rs

use crate::core::failover::FailoverRequest;
use crate::core::state::Runtime;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

/// Holds all shared state for the running server.
pub struct ServerContext {
    pub runtime: Arc<Runtime>,
    pub listener: TcpListener,
    pub acceptor: Option<TlsAcceptor>,
    /// Consumed by the failover executor at spawn time.
    pub request_rx: Option<mpsc::UnboundedReceiver<FailoverRequest>>,
    pub background_tasks: JoinSet<anyhow::Result<()>>,
}
