// src/core/watchdog/election.rs

//! Priority-based leader election with a node-id tiebreak, run under
//! strict-majority quorum.

use super::WatchdogHandle;
use super::messages::WdMessage;
use super::state::Membership;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Compares two candidates: higher priority wins, ties broken by the
/// lexically greater run id.
fn outranks(a_priority: u32, a_run_id: &str, b_priority: u32, b_run_id: &str) -> bool {
    (a_priority, a_run_id) > (b_priority, b_run_id)
}

/// Folds a peer heartbeat into membership state: refresh liveness and adopt
/// any legitimately advertised leader.
pub fn observe_heartbeat(
    handle: &Arc<WatchdogHandle>,
    run_id: &str,
    epoch: u64,
    leader: Option<String>,
) {
    let mut state = handle.state.lock();
    if let Some(peer) = state.peer_by_run_id_mut(run_id) {
        peer.last_heartbeat_received = Some(Instant::now());
        peer.reachable = true;
    }

    if epoch > state.epoch {
        // A newer epoch always wins; step down if we thought we led.
        if state.membership == Membership::Leader {
            warn!("Stepping down: observed epoch {epoch} > our {}", state.epoch);
        }
        state.epoch = epoch;
        state.leader = leader;
        state.membership = match &state.leader {
            Some(l) if l == &handle.run_id => Membership::Leader,
            Some(_) => Membership::Follower,
            None => Membership::Candidate,
        };
        state.votes.clear();
    } else if epoch == state.epoch
        && state.leader.is_none()
        && let Some(l) = leader
    {
        info!("Adopting leader {l} for epoch {epoch}");
        state.membership = if l == handle.run_id {
            Membership::Leader
        } else {
            Membership::Follower
        };
        state.leader = Some(l);
        state.votes.clear();
    }
}

/// Grants a vote when the epoch is new to us and the candidate outranks us
/// (a node never votes for a lower-priority candidate while it could run
/// itself).
pub fn handle_vote_request(
    handle: &Arc<WatchdogHandle>,
    candidate: &str,
    epoch: u64,
    priority: u32,
) {
    let grant = {
        let mut state = handle.state.lock();
        if epoch <= state.last_voted_epoch {
            false
        } else if outranks(handle.my_priority, &handle.run_id, priority, candidate)
            && state.reachable_nodes() >= handle.quorum
        {
            // We outrank the candidate and can campaign ourselves.
            false
        } else {
            state.last_voted_epoch = epoch;
            true
        }
    };

    if grant {
        info!("Voting for {candidate} in epoch {epoch}");
        handle.send_to(
            candidate,
            WdMessage::VoteAck {
                voter: handle.run_id.clone(),
                candidate: candidate.to_string(),
                epoch,
            },
        );
    }
}

/// Counts a vote towards our own candidacy and assumes leadership once a
/// quorum of the configured cluster has voted.
pub fn handle_vote_ack(handle: &Arc<WatchdogHandle>, voter: &str, candidate: &str, epoch: u64) {
    if candidate != handle.run_id {
        return;
    }
    let won = {
        let mut state = handle.state.lock();
        if state.membership != Membership::Candidate || epoch != state.epoch {
            return;
        }
        state.votes.insert(voter.to_string(), Instant::now());
        // Our own vote counts towards quorum.
        state.votes.len() + 1 >= handle.quorum
    };

    if won {
        let mut state = handle.state.lock();
        if state.membership == Membership::Candidate && epoch == state.epoch {
            info!(
                "Won watchdog election for epoch {epoch} with {} vote(s) (quorum {})",
                state.votes.len() + 1,
                handle.quorum
            );
            state.membership = Membership::Leader;
            state.leader = Some(handle.run_id.clone());
            state.votes.clear();
        }
    }
}

/// The election portion of the periodic tick: with quorum and no leader,
/// campaign; without quorum, declare ourselves lost.
pub fn tick(handle: &Arc<WatchdogHandle>) {
    let campaign = {
        let mut state = handle.state.lock();
        let have_quorum = state.reachable_nodes() >= handle.quorum;

        if !have_quorum {
            if state.membership != Membership::Lost {
                warn!(
                    "Watchdog lost quorum ({}/{} nodes reachable)",
                    state.reachable_nodes(),
                    handle.quorum
                );
                state.membership = Membership::Lost;
                state.leader = None;
            }
            return;
        }

        if state.membership == Membership::Lost {
            info!("Watchdog regained quorum");
            state.membership = Membership::Candidate;
        }

        match (&state.membership, &state.leader) {
            (Membership::Leader, _) => false,
            (_, Some(_)) => false,
            // No leader: campaign only if no reachable peer outranks us, so
            // the highest-priority node converges first.
            _ => {
                let outranked = state.peers.iter().any(|p| {
                    p.reachable && outranks(p.priority, &p.run_id, handle.my_priority, &handle.run_id)
                });
                if outranked {
                    false
                } else {
                    state.membership = Membership::Candidate;
                    state.epoch += 1;
                    state.last_voted_epoch = state.epoch;
                    state.votes.clear();
                    true
                }
            }
        }
    };

    if campaign {
        let epoch = handle.current_epoch();
        info!("Starting watchdog election for epoch {epoch}");
        handle.broadcast(&WdMessage::VoteRequest {
            candidate: handle.run_id.clone(),
            epoch,
            priority: handle.my_priority,
        });
        // A single-node quorum elects immediately.
        if handle.quorum == 1 {
            let mut state = handle.state.lock();
            state.membership = Membership::Leader;
            state.leader = Some(handle.run_id.clone());
        }
    }
}
