// src/core/status.rs

//! The authoritative per-backend status table shared by every component.
//!
//! Single-writer discipline: only the failover executor applies status
//! transitions. Readers take copy snapshots under the mutex and detect
//! change cheaply through the generation counter. Every transition is
//! appended to the on-disk status record file so a restart preserves the
//! cluster picture; a compacted snapshot is rewritten at startup.

use crate::config::BackendConfig;
use crate::core::RelayError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use strum_macros::{Display, EnumString};
use tracing::{info, warn};

/// Connection-level status of a backend node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    /// Slot configured but never brought up.
    Unused,
    /// Waiting for the first connection attempt.
    #[default]
    Waiting,
    Up,
    Down,
}

/// Replication role of a backend node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BackendRole {
    #[default]
    Main,
    Replica,
    Primary,
    Standby,
}

/// Why a status transition happened; recorded in the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    HealthFail,
    AdminDetach,
    AdminAttach,
    PeerLost,
    Quarantine,
    Failback,
    Promote,
    Demote,
    ConfigReload,
    Restore,
}

/// One backend's entry in the table. Identity is the index in the table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendEntry {
    pub node_id: usize,
    pub host: String,
    pub port: u16,
    /// Normalized load-balance weight (all selectable weights sum to 1.0).
    pub weight: f64,
    /// The configured, unnormalized weight.
    pub raw_weight: f64,
    pub role: BackendRole,
    pub status: BackendStatus,
    pub quarantined: bool,
    /// Measured replication lag of a standby, in bytes behind the primary.
    pub replication_lag: u64,
    pub status_changed_at: DateTime<Utc>,
    pub data_directory: String,
    pub application_name: String,
}

impl BackendEntry {
    fn from_config(node_id: usize, cfg: &BackendConfig) -> Self {
        Self {
            node_id,
            host: cfg.host.clone(),
            port: cfg.port,
            weight: 0.0,
            raw_weight: cfg.weight,
            role: cfg.role.unwrap_or_default(),
            status: BackendStatus::Waiting,
            quarantined: false,
            replication_lag: 0,
            status_changed_at: Utc::now(),
            data_directory: cfg.data_directory.clone(),
            application_name: cfg.application_name.clone(),
        }
    }

    /// True if the router may send traffic to this backend.
    pub fn selectable(&self) -> bool {
        self.status == BackendStatus::Up && !self.quarantined
    }

    pub fn is_primary(&self) -> bool {
        matches!(self.role, BackendRole::Primary | BackendRole::Main)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A status change to apply through [`StatusTable::apply`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub node_id: usize,
    pub new_status: BackendStatus,
    pub quarantine: bool,
    pub new_role: Option<BackendRole>,
    pub reason: TransitionReason,
}

/// An appended record in the status file.
#[derive(Debug, Serialize, Deserialize)]
struct StatusRecord {
    timestamp: DateTime<Utc>,
    node_id: usize,
    old_status: BackendStatus,
    new_status: BackendStatus,
    reason: TransitionReason,
}

/// The compacted snapshot written at the head of the status file.
#[derive(Debug, Serialize, Deserialize)]
struct StatusSnapshotRecord {
    timestamp: DateTime<Utc>,
    snapshot: Vec<(BackendStatus, BackendRole, bool)>,
}

/// A point-in-time copy of the table, safe to hold across I/O.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub generation: u64,
    pub entries: Vec<BackendEntry>,
}

impl StatusSnapshot {
    pub fn primary(&self) -> Option<&BackendEntry> {
        self.entries.iter().find(|e| e.selectable() && e.is_primary())
    }

    pub fn selectable_replicas(&self) -> impl Iterator<Item = &BackendEntry> {
        self.entries.iter().filter(|e| e.selectable() && !e.is_primary())
    }
}

/// The shared table. Construction normalizes weights; transitions renormalize
/// over the currently selectable set.
pub struct StatusTable {
    entries: Mutex<Vec<BackendEntry>>,
    generation: AtomicU64,
    file_path: Option<PathBuf>,
    file: Mutex<Option<std::fs::File>>,
    /// Set when a record could not be persisted; surfaced at the next reload.
    dirty_status_file: AtomicBool,
}

impl fmt::Debug for StatusTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusTable")
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

impl StatusTable {
    /// Builds the table from configuration, restoring persisted statuses when
    /// a status file exists, then rewriting it compacted.
    pub fn new(backends: &[BackendConfig], file_path: Option<&Path>) -> Result<Self, RelayError> {
        let mut entries: Vec<BackendEntry> = backends
            .iter()
            .enumerate()
            .map(|(id, cfg)| BackendEntry::from_config(id, cfg))
            .collect();

        if let Some(path) = file_path {
            if let Some(restored) = load_status_file(path, entries.len()) {
                for (entry, (status, role, quarantined)) in entries.iter_mut().zip(restored) {
                    entry.status = status;
                    entry.role = role;
                    entry.quarantined = quarantined;
                }
                info!("Restored backend statuses from {}", path.display());
            }
        }

        normalize_weights(&mut entries);

        let table = Self {
            entries: Mutex::new(entries),
            generation: AtomicU64::new(1),
            file_path: file_path.map(Path::to_path_buf),
            file: Mutex::new(None),
            dirty_status_file: AtomicBool::new(false),
        };
        table.compact_status_file()?;
        Ok(table)
    }

    /// Current generation; bumped on every applied transition.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Copies the table under the mutex. Never holds the lock across I/O.
    pub fn snapshot(&self) -> StatusSnapshot {
        let entries = self.entries.lock().clone();
        StatusSnapshot {
            generation: self.generation(),
            entries,
        }
    }

    /// Applies one transition atomically: mutate in memory, append the record,
    /// bump the generation. Only the failover executor calls this. If the
    /// record cannot be written the in-memory transition still proceeds and
    /// the table is flagged dirty.
    pub fn apply(&self, transition: &Transition) -> Result<(), RelayError> {
        let record = {
            let mut entries = self.entries.lock();
            let entry = entries.get_mut(transition.node_id).ok_or_else(|| {
                RelayError::Internal(format!("unknown backend node {}", transition.node_id))
            })?;

            let old_status = entry.status;
            entry.status = transition.new_status;
            entry.quarantined = transition.quarantine;
            if let Some(role) = transition.new_role {
                entry.role = role;
            }
            entry.status_changed_at = Utc::now();

            normalize_weights(&mut entries);

            StatusRecord {
                timestamp: Utc::now(),
                node_id: transition.node_id,
                old_status,
                new_status: transition.new_status,
                reason: transition.reason,
            }
        };

        if let Err(e) = self.append_record(&record) {
            self.dirty_status_file.store(true, Ordering::Release);
            warn!("Failed to persist status record: {e}");
        }

        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Records a standby's measured replication lag. Does not bump the
    /// generation: lag is advisory routing input, not a status change.
    pub fn record_replication_lag(&self, node_id: usize, lag: u64) {
        if let Some(entry) = self.entries.lock().get_mut(node_id) {
            entry.replication_lag = lag;
        }
    }

    /// True once a status record failed to persist since the last compaction.
    pub fn status_file_dirty(&self) -> bool {
        self.dirty_status_file.load(Ordering::Acquire)
    }

    /// Rewrites the status file as a single compacted snapshot.
    pub fn compact_status_file(&self) -> Result<(), RelayError> {
        let Some(path) = &self.file_path else {
            return Ok(());
        };
        if self.status_file_dirty() {
            warn!("Status file had unpersisted transitions; compacting from memory");
        }

        let snapshot = {
            let entries = self.entries.lock();
            StatusSnapshotRecord {
                timestamp: Utc::now(),
                snapshot: entries
                    .iter()
                    .map(|e| (e.status, e.role, e.quarantined))
                    .collect(),
            }
        };

        let mut file = std::fs::File::create(path)?;
        serde_json::to_writer(&mut file, &snapshot)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        *self.file.lock() = Some(std::fs::OpenOptions::new().append(true).open(path)?);
        self.dirty_status_file.store(false, Ordering::Release);
        Ok(())
    }

    fn append_record(&self, record: &StatusRecord) -> Result<(), RelayError> {
        let mut guard = self.file.lock();
        let Some(file) = guard.as_mut() else {
            return Ok(());
        };
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }
}

/// Renormalizes weights so the selectable backends' weights sum to 1.0.
fn normalize_weights(entries: &mut [BackendEntry]) {
    let total: f64 = entries
        .iter()
        .filter(|e| e.selectable())
        .map(|e| e.raw_weight)
        .sum();
    for entry in entries.iter_mut() {
        entry.weight = if entry.selectable() && total > 0.0 {
            entry.raw_weight / total
        } else {
            0.0
        };
    }
}

/// Reads the snapshot plus any trailing records from a status file, folding
/// records over the snapshot in order.
fn load_status_file(
    path: &Path,
    num_backends: usize,
) -> Option<Vec<(BackendStatus, BackendRole, bool)>> {
    let contents = std::fs::read_to_string(path).ok()?;
    let mut lines = contents.lines().filter(|l| !l.trim().is_empty());

    let head: StatusSnapshotRecord = serde_json::from_str(lines.next()?).ok()?;
    if head.snapshot.len() != num_backends {
        warn!(
            "Status file snapshot has {} entries but {} backends are configured; ignoring it",
            head.snapshot.len(),
            num_backends
        );
        return None;
    }
    let mut statuses = head.snapshot;

    for line in lines {
        match serde_json::from_str::<StatusRecord>(line) {
            Ok(record) if record.node_id < statuses.len() => {
                statuses[record.node_id].0 = record.new_status;
            }
            Ok(record) => {
                warn!("Status record references unknown node {}", record.node_id);
            }
            Err(e) => {
                warn!("Skipping corrupt status record: {e}");
            }
        }
    }
    Some(statuses)
}
