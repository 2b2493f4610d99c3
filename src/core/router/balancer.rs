// src/core/router/balancer.rs

//! Weighted-random replica selection for balanced reads.

use crate::core::status::StatusSnapshot;
use rand::Rng;

/// Picks a replica among the selectable, lag-eligible candidates with
/// probability proportional to configured weight. Returns `None` when no
/// replica qualifies, in which case the caller falls back to the primary.
pub fn select_replica(snapshot: &StatusSnapshot, delay_threshold: u64) -> Option<usize> {
    select_replica_with(snapshot, delay_threshold, &mut rand::thread_rng())
}

/// Selection with an injected RNG, for deterministic tests.
pub fn select_replica_with<R: Rng>(
    snapshot: &StatusSnapshot,
    delay_threshold: u64,
    rng: &mut R,
) -> Option<usize> {
    let candidates: Vec<(usize, f64)> = snapshot
        .selectable_replicas()
        .filter(|e| delay_threshold == 0 || e.replication_lag <= delay_threshold)
        .filter(|e| e.raw_weight > 0.0)
        .map(|e| (e.node_id, e.raw_weight))
        .collect();

    if candidates.is_empty() {
        return None;
    }

    // Re-normalize over the eligible replicas only; quarantined or lagging
    // nodes must not leave probability mass unassigned.
    let total: f64 = candidates.iter().map(|(_, w)| w).sum();
    let mut point = rng.gen_range(0.0..total);
    for (node_id, weight) in &candidates {
        if point < *weight {
            return Some(*node_id);
        }
        point -= weight;
    }
    // Floating-point edge: the draw landed exactly on the upper bound.
    candidates.last().map(|(node_id, _)| *node_id)
}
