// src/core/watchdog/state.rs

//! Membership state for this watchdog node and its configured peers.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;
use strum_macros::Display;

/// The membership state machine: `joining -> candidate -> (leader | follower)
/// -> lost`, re-entering `candidate` when the leader disappears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Membership {
    Joining,
    Candidate,
    Leader,
    Follower,
    Lost,
}

/// Advisory view of one remote peer. This node owns these entries; the
/// peers' own views of themselves are authoritative.
#[derive(Debug, Clone)]
pub struct PeerState {
    /// Configured index in the peer list.
    pub peer_index: usize,
    pub host: String,
    pub wd_port: u16,
    pub pgrelay_port: u16,
    /// Learned from the peer's hello; empty until first contact.
    pub run_id: String,
    pub priority: u32,
    pub last_heartbeat_sent: Option<Instant>,
    pub last_heartbeat_received: Option<Instant>,
    /// True while the peer counts towards quorum.
    pub reachable: bool,
}

impl PeerState {
    pub fn new(peer_index: usize, host: &str, wd_port: u16, pgrelay_port: u16) -> Self {
        Self {
            peer_index,
            host: host.to_string(),
            wd_port,
            pgrelay_port,
            run_id: String::new(),
            priority: 0,
            last_heartbeat_sent: None,
            last_heartbeat_received: None,
            reachable: false,
        }
    }
}

/// Mutable election and membership state, guarded by one mutex in the
/// watchdog handle.
#[derive(Debug)]
pub struct WatchdogState {
    pub membership: Membership,
    /// Current election/config epoch; increases monotonically.
    pub epoch: u64,
    /// Run id of the current leader, when known.
    pub leader: Option<String>,
    /// The last epoch this node voted in, preventing double votes.
    pub last_voted_epoch: u64,
    /// Votes received while campaigning in `epoch`, by voter run id.
    pub votes: HashMap<String, Instant>,
    pub peers: Vec<PeerState>,
    /// Acks collected for the in-flight status delta, by follower run id.
    pub delta_acks: HashMap<String, u64>,
}

impl WatchdogState {
    pub fn new(peers: Vec<PeerState>) -> Self {
        Self {
            membership: Membership::Joining,
            epoch: 0,
            leader: None,
            last_voted_epoch: 0,
            votes: HashMap::new(),
            peers,
            delta_acks: HashMap::new(),
        }
    }

    /// Number of nodes currently reachable, this node included.
    pub fn reachable_nodes(&self) -> usize {
        1 + self.peers.iter().filter(|p| p.reachable).count()
    }

    pub fn peer_by_run_id_mut(&mut self, run_id: &str) -> Option<&mut PeerState> {
        self.peers.iter_mut().find(|p| p.run_id == run_id)
    }
}
