// src/core/state.rs

//! The shared runtime: the status table, health statistics, pending-request
//! queue, credential store, and the control channels, built once at
//! supervisor startup and passed explicitly to every component.

use crate::config::Config;
use crate::core::RelayError;
use crate::core::credentials::CredentialStore;
use crate::core::failover::FailoverRequest;
use crate::core::health::stats::HealthStats;
use crate::core::status::StatusTable;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

/// How hard to shut down: the smart/fast/immediate ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Finish current sessions, then exit.
    Smart,
    /// Terminate backends cleanly and exit.
    Fast,
    /// Close sockets and exit.
    Immediate,
}

/// Events fanned out to workers; workers act on them at idle boundaries
/// (except immediate shutdown).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Re-read configuration; sessions recycle at their next idle point.
    Reload,
    /// Backend statuses changed: invalidate pool-slot caches and restart
    /// sessions at the next idle point.
    BackendStateSync,
    Shutdown(ShutdownMode),
}

/// What a worker is doing right now, for process reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    WaitForConnect,
    CommandExecute,
    Idle,
    IdleInTransaction,
}

/// Per-worker bookkeeping published for `GET /processes`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub worker_id: usize,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    pub session_count: u64,
    pub pool_entries: usize,
    pub client_addr: Option<String>,
}

/// A frontend cancel key mapped to the backend pid/key pairs of its pool
/// slot, plus the backend currently executing.
#[derive(Debug, Clone)]
pub struct CancelEntry {
    /// `(node_id, host, port, backend_pid, backend_key)` per backend slot.
    pub targets: Vec<(usize, String, u16, i32, i32)>,
    /// Node currently executing a statement for this session.
    pub current: Option<usize>,
}

/// The shared runtime value. No ambient singletons: every component
/// receives the subset it needs from here.
pub struct Runtime {
    pub config: RwLock<Arc<Config>>,
    pub status: StatusTable,
    pub health: HealthStats,
    pub credentials: CredentialStore,
    /// Frontend-advertised `(pid, key)` -> cancel routing info.
    pub cancel_map: DashMap<(i32, i32), CancelEntry>,
    /// Worker table for process reporting.
    pub workers: DashMap<usize, WorkerInfo>,
    /// Producer side of the pending failover-request queue.
    request_tx: mpsc::UnboundedSender<FailoverRequest>,
    /// Control-event fan-out to workers.
    pub control_tx: broadcast::Sender<ControlEvent>,
    /// This instance's 40-hex run id, also the watchdog node identity.
    pub run_id: String,
    /// Path the active configuration was loaded from, for reloads.
    pub config_path: String,
    pub started_at: DateTime<Utc>,
    session_counter: AtomicU64,
    frontend_key_counter: AtomicU64,
}

impl Runtime {
    /// Builds the runtime from a validated configuration. Returns the
    /// receiving end of the failover-request queue for the executor.
    pub fn new(
        config: Config,
        status_file: Option<&Path>,
        config_path: &str,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<FailoverRequest>), RelayError> {
        let status = StatusTable::new(&config.backends, status_file)?;
        let health = HealthStats::new(config.backends.len());
        let credentials = if config.pool_passwd.trim().is_empty() {
            CredentialStore::empty()
        } else {
            CredentialStore::load(Path::new(&config.pool_passwd))?
        };

        let mut runid_bytes = [0u8; 20];
        getrandom::fill(&mut runid_bytes)
            .map_err(|e| RelayError::Internal(format!("failed to generate run id: {e}")))?;
        let run_id = hex::encode(runid_bytes);

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (control_tx, _) = broadcast::channel(64);

        let runtime = Arc::new(Self {
            config: RwLock::new(Arc::new(config)),
            status,
            health,
            credentials,
            cancel_map: DashMap::new(),
            workers: DashMap::new(),
            request_tx,
            control_tx,
            run_id,
            config_path: config_path.to_string(),
            started_at: Utc::now(),
            session_counter: AtomicU64::new(0),
            frontend_key_counter: AtomicU64::new(1),
        });
        Ok((runtime, request_rx))
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    /// Swaps in a new validated configuration and tells workers to observe
    /// it at their next idle boundary.
    pub fn install_config(&self, config: Config) {
        *self.config.write() = Arc::new(config);
        self.broadcast(ControlEvent::Reload);
    }

    /// Re-parses the configuration file; a failure keeps the active one.
    pub fn reload_from_disk(&self) -> Result<(), RelayError> {
        let new_config = Config::from_file(&self.config_path)
            .map_err(|e| RelayError::ConfigInvalid(format!("{e:#}")))?;
        if self.status.status_file_dirty() {
            warn!("Status file had unpersisted transitions before this reload");
        }
        if let Err(e) = self.credentials.reload() {
            warn!("Credential reload failed: {e}");
        }
        self.install_config(new_config);
        Ok(())
    }

    /// Queues a failover request for the executor. The queue is unbounded
    /// because requests may arrive while the executor is busy.
    pub fn post_request(&self, request: FailoverRequest) {
        if self.request_tx.send(request).is_err() {
            warn!("Failover executor is gone; dropping request");
        }
    }

    pub fn broadcast(&self, event: ControlEvent) {
        // Send fails only when no worker is subscribed, which is fine
        // during startup and shutdown.
        let _ = self.control_tx.send(event);
    }

    pub fn subscribe_control(&self) -> broadcast::Receiver<ControlEvent> {
        self.control_tx.subscribe()
    }

    pub fn next_session_id(&self) -> u64 {
        self.session_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Synthesizes the `(pid, key)` pair advertised to one frontend in
    /// `BackendKeyData`. The pid space is disjoint from real backend pids.
    pub fn next_frontend_key(&self) -> (i32, i32) {
        let pid = self.frontend_key_counter.fetch_add(1, Ordering::Relaxed) as i32;
        let mut key_bytes = [0u8; 4];
        // Best effort; a zero key still cancels correctly, it is just guessable.
        let _ = getrandom::fill(&mut key_bytes);
        (pid, i32::from_be_bytes(key_bytes))
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("run_id", &self.run_id)
            .field("status", &self.status)
            .finish()
    }
}
