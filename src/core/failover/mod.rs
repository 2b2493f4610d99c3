// src/core/failover/mod.rs

//! The pending-request queue and its single-threaded consumer, the failover
//! executor. All status-table writes in the process go through here.
//!
//! Per request: acquire the cluster-wide interlock through the watchdog,
//! re-validate against current status, apply the transitions atomically,
//! run the configured scripts, and tell every worker to resynchronize.
//! Requests are FIFO, but a request that cannot take the interlock is
//! dropped with a warning rather than blocking the queue, so a later
//! request may overtake it.

use crate::core::RelayError;
use crate::core::state::{ControlEvent, Runtime};
use crate::core::status::{
    BackendEntry, BackendRole, BackendStatus, StatusSnapshot, Transition, TransitionReason,
};
use crate::core::watchdog::{WatchdogHandle, interlock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Who raised a request; peers' requests have already been adjudicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOrigin {
    Health,
    Admin,
    Peer,
}

/// What should happen to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRequestKind {
    /// Transition the node to `down`, promoting a standby if it was primary.
    Detach,
    /// Bring a `down` or quarantined node back to `up`.
    Failback,
    /// Promote a standby to primary; the old primary goes down first.
    Promote,
    /// Set the quarantine flag; applied locally without the interlock.
    Quarantine,
}

/// An entry in the pending-request queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum FailoverRequest {
    Node {
        node_id: usize,
        kind: NodeRequestKind,
        reason: TransitionReason,
        origin: RequestOrigin,
        /// Status generation observed when the request was raised; a stale
        /// generation marks a duplicate of an already-applied change.
        generation: u64,
    },
    /// Transitions replicated from the watchdog leader; applied verbatim.
    ApplyDelta {
        leader: String,
        epoch: u64,
        generation: u64,
        transitions: Vec<Transition>,
    },
}

impl FailoverRequest {
    pub fn node(
        node_id: usize,
        kind: NodeRequestKind,
        reason: TransitionReason,
        origin: RequestOrigin,
        generation: u64,
    ) -> Self {
        Self::Node {
            node_id,
            kind,
            reason,
            origin,
            generation,
        }
    }

    pub fn apply_delta(
        leader: String,
        epoch: u64,
        generation: u64,
        transitions: Vec<Transition>,
    ) -> Self {
        Self::ApplyDelta {
            leader,
            epoch,
            generation,
            transitions,
        }
    }
}

/// The single consumer of the pending-request queue.
pub struct FailoverExecutor {
    runtime: Arc<Runtime>,
    watchdog: Option<Arc<WatchdogHandle>>,
    rx: mpsc::UnboundedReceiver<FailoverRequest>,
}

impl FailoverExecutor {
    pub fn new(
        runtime: Arc<Runtime>,
        watchdog: Option<Arc<WatchdogHandle>>,
        rx: mpsc::UnboundedReceiver<FailoverRequest>,
    ) -> Self {
        Self {
            runtime,
            watchdog,
            rx,
        }
    }

    pub async fn run(mut self) {
        info!("Failover executor started");
        while let Some(request) = self.rx.recv().await {
            if let Err(e) = self.handle(request).await {
                match e {
                    RelayError::ClusterInTransaction => {
                        warn!("Failover request skipped: another request holds the interlock");
                    }
                    e => warn!("Failover request failed: {e}"),
                }
            }
        }
        info!("Failover executor stopped: request queue closed");
    }

    async fn handle(&self, request: FailoverRequest) -> Result<(), RelayError> {
        match request {
            FailoverRequest::ApplyDelta {
                leader,
                epoch,
                generation,
                transitions,
            } => self.apply_delta(leader, epoch, generation, transitions),
            FailoverRequest::Node {
                node_id,
                kind,
                reason,
                origin,
                generation,
            } => self.handle_node_request(node_id, kind, reason, origin, generation).await,
        }
    }

    /// Applies transitions replicated by the leader and acks them.
    fn apply_delta(
        &self,
        leader: String,
        epoch: u64,
        generation: u64,
        transitions: Vec<Transition>,
    ) -> Result<(), RelayError> {
        // Our own broadcast loops back through the peer mesh only on other
        // nodes; a leader never receives its own delta.
        for transition in &transitions {
            self.runtime.status.apply(transition)?;
        }
        if let Some(watchdog) = &self.watchdog {
            watchdog.ack_delta(&leader, epoch, generation);
        }
        self.runtime.broadcast(ControlEvent::BackendStateSync);
        info!(
            "Applied {} replicated transition(s) from leader {leader}",
            transitions.len()
        );
        Ok(())
    }

    async fn handle_node_request(
        &self,
        node_id: usize,
        kind: NodeRequestKind,
        reason: TransitionReason,
        origin: RequestOrigin,
        generation: u64,
    ) -> Result<(), RelayError> {
        // Quarantine never needs cluster agreement: any node may stop
        // selecting a backend it distrusts.
        if kind == NodeRequestKind::Quarantine {
            return self.apply_quarantine(node_id, reason);
        }

        if let Some(watchdog) = &self.watchdog {
            if !watchdog.is_leader() {
                // Split-brain avoidance: only the leader takes backends down.
                debug!("Forwarding {kind:?} for node {node_id} to the watchdog leader");
                return watchdog.forward_to_leader(FailoverRequest::node(
                    node_id, kind, reason, origin, generation,
                ));
            }
            if !watchdog.has_quorum() {
                warn!(
                    "No quorum: keeping node {node_id} quarantined instead of applying {kind:?}"
                );
                return self.apply_quarantine(node_id, reason);
            }

            let _interlock = watchdog.try_interlock()?;
            let transitions = self.plan(node_id, kind, reason, generation)?;
            let applied = self.apply_and_script(node_id, kind, reason, &transitions).await?;
            interlock::replicate_delta(watchdog, applied, self.runtime.status.generation())
                .await?;
        } else {
            // Single-instance mode: the queue itself is the interlock.
            let transitions = self.plan(node_id, kind, reason, generation)?;
            self.apply_and_script(node_id, kind, reason, &transitions).await?;
        }

        self.runtime.broadcast(ControlEvent::BackendStateSync);
        Ok(())
    }

    fn apply_quarantine(&self, node_id: usize, reason: TransitionReason) -> Result<(), RelayError> {
        let snapshot = self.runtime.status.snapshot();
        let entry = node_entry(&snapshot, node_id)?;
        if entry.quarantined {
            debug!("Node {node_id} is already quarantined");
            return Ok(());
        }
        self.runtime.status.apply(&Transition {
            node_id,
            new_status: entry.status,
            quarantine: true,
            new_role: None,
            reason,
        })?;
        warn!("Node {node_id} quarantined ({reason})");
        self.runtime.broadcast(ControlEvent::BackendStateSync);
        Ok(())
    }

    /// Re-validates the request and produces the transition list. A stale or
    /// already-satisfied request plans to nothing and is dropped, which is
    /// how duplicate detections from several instances deduplicate.
    fn plan(
        &self,
        node_id: usize,
        kind: NodeRequestKind,
        reason: TransitionReason,
        request_generation: u64,
    ) -> Result<Vec<Transition>, RelayError> {
        let snapshot = self.runtime.status.snapshot();
        let entry = node_entry(&snapshot, node_id)?;

        let mut transitions = Vec::new();
        match kind {
            NodeRequestKind::Detach => {
                if entry.status == BackendStatus::Down {
                    debug!(
                        "Dropping duplicate detach for node {node_id} (generation {request_generation} vs {})",
                        snapshot.generation
                    );
                    return Ok(transitions);
                }
                // Losing the primary triggers automatic promotion; the failed
                // node is demoted so only one backend ever holds the primary
                // role.
                let promotion = if entry.is_primary() {
                    promotion_candidate(&snapshot, node_id)
                } else {
                    None
                };
                transitions.push(Transition {
                    node_id,
                    new_status: BackendStatus::Down,
                    quarantine: false,
                    new_role: promotion.map(|_| BackendRole::Standby),
                    reason,
                });
                if let Some(candidate) = promotion {
                    transitions.push(Transition {
                        node_id: candidate,
                        new_status: BackendStatus::Up,
                        quarantine: false,
                        new_role: Some(BackendRole::Primary),
                        reason: TransitionReason::Promote,
                    });
                }
            }
            NodeRequestKind::Failback => {
                if entry.status == BackendStatus::Up && !entry.quarantined {
                    debug!("Dropping duplicate failback for node {node_id}");
                    return Ok(transitions);
                }
                transitions.push(Transition {
                    node_id,
                    new_status: BackendStatus::Up,
                    quarantine: false,
                    new_role: None,
                    reason: TransitionReason::Failback,
                });
            }
            NodeRequestKind::Promote => {
                if entry.is_primary() {
                    return Err(RelayError::AdminRejected(format!(
                        "node {node_id} is already the primary"
                    )));
                }
                if !entry.selectable() {
                    return Err(RelayError::AdminRejected(format!(
                        "node {node_id} is not up; cannot promote"
                    )));
                }
                // The old primary transitions to down first.
                if let Some(old) = snapshot.entries.iter().find(|e| e.is_primary()) {
                    transitions.push(Transition {
                        node_id: old.node_id,
                        new_status: BackendStatus::Down,
                        quarantine: false,
                        new_role: Some(BackendRole::Standby),
                        reason: TransitionReason::Demote,
                    });
                }
                transitions.push(Transition {
                    node_id,
                    new_status: BackendStatus::Up,
                    quarantine: false,
                    new_role: Some(BackendRole::Primary),
                    reason: TransitionReason::Promote,
                });
            }
            NodeRequestKind::Quarantine => unreachable!("handled before planning"),
        }
        Ok(transitions)
    }

    /// Applies the planned transitions and runs the matching scripts.
    /// Script failure is logged; the transitions stay applied.
    async fn apply_and_script(
        &self,
        node_id: usize,
        kind: NodeRequestKind,
        reason: TransitionReason,
        transitions: &[Transition],
    ) -> Result<Vec<Transition>, RelayError> {
        if transitions.is_empty() {
            return Ok(Vec::new());
        }
        let before = self.runtime.status.snapshot();
        for transition in transitions {
            self.runtime.status.apply(transition)?;
        }
        let after = self.runtime.status.snapshot();
        info!(
            "Applied {} transition(s) for node {node_id} ({kind:?}, {reason})",
            transitions.len()
        );

        let config = self.runtime.config();
        let promoted = transitions
            .iter()
            .find(|t| t.new_role == Some(BackendRole::Primary))
            .map(|t| t.node_id);

        let script = match kind {
            NodeRequestKind::Detach => config.failover_command.clone(),
            NodeRequestKind::Failback => config.failback_command.clone(),
            NodeRequestKind::Promote => config.failover_command.clone(),
            NodeRequestKind::Quarantine => String::new(),
        };
        if !script.is_empty() {
            self.run_script(&script, node_id, promoted, &before, &after).await;
        }

        // Remaining standbys are re-pointed at the new primary.
        if let Some(new_primary) = promoted
            && !config.follow_primary_command.is_empty()
        {
            for entry in after.entries.iter().filter(|e| {
                e.node_id != new_primary && e.node_id != node_id && e.selectable() && !e.is_primary()
            }) {
                self.run_script(
                    &config.follow_primary_command,
                    entry.node_id,
                    promoted,
                    &before,
                    &after,
                )
                .await;
            }
        }

        Ok(transitions.to_vec())
    }

    /// Substitutes the pgpool-style placeholders and runs the script as a
    /// child process, capturing its exit code.
    async fn run_script(
        &self,
        template: &str,
        failed_node: usize,
        new_primary: Option<usize>,
        before: &StatusSnapshot,
        after: &StatusSnapshot,
    ) {
        let command = substitute_placeholders(template, failed_node, new_primary, before, after);
        info!("Running command: {command}");
        match tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .status()
            .await
        {
            Ok(status) if status.success() => {
                info!("Command succeeded: {command}");
            }
            Ok(status) => {
                error!("Command failed with {status}: {command}");
            }
            Err(e) => {
                error!("Command could not be spawned: {command}: {e}");
            }
        }
    }
}

fn node_entry(snapshot: &StatusSnapshot, node_id: usize) -> Result<&BackendEntry, RelayError> {
    snapshot
        .entries
        .get(node_id)
        .ok_or_else(|| RelayError::AdminRejected(format!("unknown backend node {node_id}")))
}

/// Picks the standby to promote: heaviest weight first, lowest node id as
/// the tiebreak.
pub fn promotion_candidate(snapshot: &StatusSnapshot, failed_node: usize) -> Option<usize> {
    snapshot
        .entries
        .iter()
        .filter(|e| e.node_id != failed_node && e.selectable() && !e.is_primary())
        .max_by(|a, b| {
            a.raw_weight
                .partial_cmp(&b.raw_weight)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.node_id.cmp(&a.node_id))
        })
        .map(|e| e.node_id)
}

/// Expands `%d` (failed node id), `%h`/`%p`/`%D` (failed host/port/datadir),
/// `%m`/`%H`/`%R` (new primary id/host/datadir), `%M`/`%P` (old main/primary
/// id) and `%%`.
fn substitute_placeholders(
    template: &str,
    failed_node: usize,
    new_primary: Option<usize>,
    before: &StatusSnapshot,
    after: &StatusSnapshot,
) -> String {
    let failed = before.entries.get(failed_node);
    let promoted = new_primary.and_then(|id| after.entries.get(id));
    let old_primary = before.entries.iter().find(|e| e.is_primary());

    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('d') => out.push_str(&failed_node.to_string()),
            Some('h') => out.push_str(failed.map(|e| e.host.as_str()).unwrap_or("")),
            Some('p') => out.push_str(&failed.map(|e| e.port).unwrap_or(0).to_string()),
            Some('D') => out.push_str(failed.map(|e| e.data_directory.as_str()).unwrap_or("")),
            Some('m') => {
                out.push_str(&new_primary.map(|id| id.to_string()).unwrap_or_default());
            }
            Some('H') => out.push_str(promoted.map(|e| e.host.as_str()).unwrap_or("")),
            Some('R') => out.push_str(promoted.map(|e| e.data_directory.as_str()).unwrap_or("")),
            Some('M') | Some('P') => {
                out.push_str(
                    &old_primary
                        .map(|e| e.node_id.to_string())
                        .unwrap_or_default(),
                );
            }
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}
