// src/core/watchdog/mod.rs

//! The cluster coordinator: replicates the backend status table across peer
//! instances, elects a leader, and interlocks failover so no two nodes
//! execute it concurrently.
//!
//! Peers are configured statically. Each peer gets an outbound link task
//! that reconnects with exponential backoff; an inbound listener accepts
//! links from peers. Heartbeats flow in both directions; a peer is lost
//! after `wd_heartbeat_deadtime` without one.

pub mod election;
pub mod heartbeat;
pub mod interlock;
pub mod messages;
pub mod state;

use crate::config::Config;
use crate::core::RelayError;
use crate::core::failover::FailoverRequest;
use crate::core::state::Runtime;
use crate::core::status::Transition;
use futures::StreamExt;
use messages::{WdMessage, wire_codec};
use parking_lot::Mutex;
use state::{Membership, PeerState, WatchdogState};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Shared watchdog handle used by the failover executor and admin surface.
pub struct WatchdogHandle {
    pub state: Mutex<WatchdogState>,
    pub quorum: usize,
    pub my_priority: u32,
    pub run_id: String,
    pub pgrelay_port: u16,
    /// Outbound message queue per configured peer.
    peer_txs: Vec<mpsc::UnboundedSender<WdMessage>>,
    /// Leader-local serialization of failover execution.
    interlock: tokio::sync::Mutex<()>,
    /// Signaled when a delta ack arrives.
    pub(crate) delta_notify: Notify,
    /// Cleared by the admin surface to withdraw from the cluster without a
    /// restart; heartbeats stop and leadership is relinquished.
    active: std::sync::atomic::AtomicBool,
}

impl WatchdogHandle {
    pub fn new(config: &Config, run_id: &str) -> (Arc<Self>, Vec<mpsc::UnboundedReceiver<WdMessage>>) {
        let peers: Vec<PeerState> = config
            .watchdog_peers
            .iter()
            .enumerate()
            .map(|(i, p)| PeerState::new(i, &p.host, p.wd_port, p.pgrelay_port))
            .collect();

        let mut peer_txs = Vec::with_capacity(peers.len());
        let mut peer_rxs = Vec::with_capacity(peers.len());
        for _ in &peers {
            let (tx, rx) = mpsc::unbounded_channel();
            peer_txs.push(tx);
            peer_rxs.push(rx);
        }

        let handle = Arc::new(Self {
            state: Mutex::new(WatchdogState::new(peers)),
            quorum: config.watchdog_quorum(),
            my_priority: config.wd_priority,
            run_id: run_id.to_string(),
            pgrelay_port: config.port,
            peer_txs,
            interlock: tokio::sync::Mutex::new(()),
            delta_notify: Notify::new(),
            active: std::sync::atomic::AtomicBool::new(true),
        });
        (handle, peer_rxs)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Withdraws from or rejoins the cluster at runtime.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, std::sync::atomic::Ordering::Release);
        if !active {
            let mut state = self.state.lock();
            state.membership = Membership::Lost;
            state.leader = None;
            state.votes.clear();
        }
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().membership == Membership::Leader
    }

    pub fn has_quorum(&self) -> bool {
        self.state.lock().reachable_nodes() >= self.quorum
    }

    pub fn current_epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    pub fn leader(&self) -> Option<String> {
        self.state.lock().leader.clone()
    }

    /// Sends a message to every configured peer.
    pub fn broadcast(&self, msg: &WdMessage) {
        for tx in &self.peer_txs {
            let _ = tx.send(msg.clone());
        }
    }

    /// Sends a message to one peer by run id, when it has identified itself.
    pub fn send_to(&self, run_id: &str, msg: WdMessage) {
        let index = {
            let state = self.state.lock();
            state.peers.iter().find(|p| p.run_id == run_id).map(|p| p.peer_index)
        };
        if let Some(index) = index {
            let _ = self.peer_txs[index].send(msg);
        } else {
            debug!("No link to peer {run_id}; dropping message");
        }
    }

    /// Forwards a failover request to the current leader.
    pub fn forward_to_leader(&self, request: FailoverRequest) -> Result<(), RelayError> {
        let leader = self.leader().ok_or(RelayError::NoQuorum)?;
        self.send_to(
            &leader,
            WdMessage::ForwardRequest {
                origin: self.run_id.clone(),
                request,
            },
        );
        Ok(())
    }

    /// Confirms an applied delta back to the leader.
    pub fn ack_delta(&self, leader: &str, epoch: u64, generation: u64) {
        self.send_to(
            leader,
            WdMessage::DeltaAck {
                follower: self.run_id.clone(),
                epoch,
                generation,
            },
        );
    }

    /// Handles one inbound message from a peer.
    pub fn process_message(self: &Arc<Self>, msg: WdMessage, runtime: &Arc<Runtime>) {
        match msg {
            WdMessage::Hello {
                run_id,
                priority,
                pgrelay_port: _,
            } => {
                let mut state = self.state.lock();
                // Match the hello to a configured peer slot that has not
                // identified itself yet, or refresh the known one.
                if let Some(peer) = state.peer_by_run_id_mut(&run_id) {
                    peer.priority = priority;
                    peer.reachable = true;
                    peer.last_heartbeat_received = Some(Instant::now());
                } else if let Some(peer) = state.peers.iter_mut().find(|p| p.run_id.is_empty()) {
                    info!("Watchdog peer {} identified as {run_id}", peer.host);
                    peer.run_id = run_id;
                    peer.priority = priority;
                    peer.reachable = true;
                    peer.last_heartbeat_received = Some(Instant::now());
                }
            }
            WdMessage::Heartbeat {
                run_id,
                epoch,
                leader,
                status_generation: _,
            } => {
                election::observe_heartbeat(self, &run_id, epoch, leader);
            }
            WdMessage::VoteRequest {
                candidate,
                epoch,
                priority,
            } => {
                election::handle_vote_request(self, &candidate, epoch, priority);
            }
            WdMessage::VoteAck {
                voter,
                candidate,
                epoch,
            } => {
                election::handle_vote_ack(self, &voter, &candidate, epoch);
            }
            WdMessage::ForwardRequest { origin, request } => {
                if self.is_leader() {
                    debug!("Leader accepted forwarded request from {origin}: {request:?}");
                    runtime.post_request(request);
                } else {
                    debug!("Ignoring forwarded request from {origin}: not the leader");
                }
            }
            WdMessage::StatusDelta {
                leader,
                epoch,
                generation,
                transitions,
            } => {
                self.handle_status_delta(runtime, leader, epoch, generation, transitions);
            }
            WdMessage::DeltaAck {
                follower,
                epoch,
                generation,
            } => {
                let mut state = self.state.lock();
                if epoch == state.epoch {
                    state.delta_acks.insert(follower, generation);
                    drop(state);
                    self.delta_notify.notify_waiters();
                }
            }
        }
    }

    fn handle_status_delta(
        self: &Arc<Self>,
        runtime: &Arc<Runtime>,
        leader: String,
        epoch: u64,
        generation: u64,
        transitions: Vec<Transition>,
    ) {
        {
            let mut state = self.state.lock();
            if epoch < state.epoch {
                warn!(
                    "Rejecting status delta from stale leader {leader} (epoch {epoch} < {})",
                    state.epoch
                );
                return;
            }
            // A delta proves an acting leader; adopt it.
            state.epoch = epoch;
            if state.leader.as_deref() != Some(leader.as_str()) {
                state.leader = Some(leader.clone());
                if state.membership != Membership::Leader {
                    state.membership = Membership::Follower;
                }
            }
        }
        // The failover executor is the single status-table writer; the delta
        // is applied there and acked afterwards.
        runtime.post_request(FailoverRequest::apply_delta(leader, epoch, generation, transitions));
    }
}

impl std::fmt::Debug for WatchdogHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchdogHandle")
            .field("run_id", &self.run_id)
            .field("quorum", &self.quorum)
            .finish()
    }
}

/// Runs the watchdog: inbound listener, one outbound link per peer, the
/// heartbeat/election tick, all supervised in a `JoinSet`.
pub async fn run(
    runtime: Arc<Runtime>,
    handle: Arc<WatchdogHandle>,
    peer_rxs: Vec<mpsc::UnboundedReceiver<WdMessage>>,
) -> Result<(), RelayError> {
    let config = runtime.config();
    let mut tasks: JoinSet<()> = JoinSet::new();

    // Inbound listener for peer-initiated links.
    let listener = TcpListener::bind((config.listen_addresses.as_str(), config.wd_port))
        .await
        .map_err(|e| {
            RelayError::Internal(format!("watchdog cannot bind port {}: {e}", config.wd_port))
        })?;
    info!(
        "Watchdog listening on {}:{} (priority {}, quorum {})",
        config.listen_addresses, config.wd_port, handle.my_priority, handle.quorum
    );

    {
        let handle = handle.clone();
        let runtime = runtime.clone();
        tasks.spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, addr)) => {
                        debug!("Accepted watchdog link from {addr}");
                        let handle = handle.clone();
                        let runtime = runtime.clone();
                        tokio::spawn(async move {
                            let mut framed = Framed::new(socket, wire_codec());
                            while let Some(Ok(frame)) = framed.next().await {
                                match WdMessage::decode(&frame) {
                                    Ok(msg) => handle.process_message(msg, &runtime),
                                    Err(e) => {
                                        warn!("Bad watchdog message from {addr}: {e}");
                                        break;
                                    }
                                }
                            }
                            debug!("Watchdog link from {addr} closed");
                        });
                    }
                    Err(e) => warn!("Watchdog accept failed: {e}"),
                }
            }
        });
    }

    // One outbound link task per configured peer.
    for (index, rx) in peer_rxs.into_iter().enumerate() {
        let peer = config.watchdog_peers[index].clone();
        let handle = handle.clone();
        let runtime = runtime.clone();
        tasks.spawn(heartbeat::run_peer_link(handle, runtime, index, peer, rx));
    }

    // Heartbeat + election tick.
    {
        let handle = handle.clone();
        let interval = config.wd_heartbeat_interval;
        let deadtime = config.wd_heartbeat_deadtime;
        let generation_source = runtime.clone();
        tasks.spawn(async move {
            heartbeat::run_tick(handle, generation_source, interval, deadtime).await;
        });
    }

    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            warn!("A watchdog task terminated: {e}");
        }
    }
    Err(RelayError::Internal("all watchdog tasks terminated".into()))
}

/// RAII guard over the leader-local failover interlock.
pub struct InterlockGuard<'a> {
    _guard: tokio::sync::MutexGuard<'a, ()>,
}

impl WatchdogHandle {
    /// Tries to take the cluster-wide failover interlock. Only meaningful on
    /// the leader; fails with `cluster_in_transaction` when already held.
    pub fn try_interlock(&self) -> Result<InterlockGuard<'_>, RelayError> {
        match self.interlock.try_lock() {
            Ok(guard) => Ok(InterlockGuard { _guard: guard }),
            Err(_) => Err(RelayError::ClusterInTransaction),
        }
    }
}

/// Formats watchdog info for the admin surface.
pub fn describe(handle: &WatchdogHandle) -> serde_json::Value {
    let state = handle.state.lock();
    serde_json::json!({
        "run_id": handle.run_id,
        "membership": state.membership.to_string(),
        "epoch": state.epoch,
        "leader": state.leader,
        "quorum": handle.quorum,
        "reachable_nodes": state.reachable_nodes(),
        "priority": handle.my_priority,
        "peers": state.peers.iter().map(|p| serde_json::json!({
            "host": p.host,
            "wd_port": p.wd_port,
            "pgrelay_port": p.pgrelay_port,
            "run_id": p.run_id,
            "priority": p.priority,
            "reachable": p.reachable,
        })).collect::<Vec<_>>(),
    })
}
