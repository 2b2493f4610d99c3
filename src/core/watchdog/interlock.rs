// src/core/watchdog/interlock.rs

//! Delta replication under the failover interlock: the leader broadcasts
//! applied status transitions and a request commits once a quorum of
//! followers has acked it.

use super::WatchdogHandle;
use super::messages::WdMessage;
use crate::core::RelayError;
use crate::core::status::Transition;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const REPLICATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Broadcasts a status delta and waits for quorum acknowledgement. The
/// leader's own application counts towards quorum. Called only while the
/// interlock is held.
pub async fn replicate_delta(
    handle: &Arc<WatchdogHandle>,
    transitions: Vec<Transition>,
    generation: u64,
) -> Result<(), RelayError> {
    let epoch = {
        let mut state = handle.state.lock();
        state.delta_acks.clear();
        state.epoch
    };

    handle.broadcast(&WdMessage::StatusDelta {
        leader: handle.run_id.clone(),
        epoch,
        generation,
        transitions,
    });

    let needed_acks = handle.quorum.saturating_sub(1);
    if needed_acks == 0 {
        return Ok(());
    }

    let wait = async {
        loop {
            {
                let state = handle.state.lock();
                let acked = state
                    .delta_acks
                    .values()
                    .filter(|g| **g >= generation)
                    .count();
                if acked >= needed_acks {
                    return;
                }
            }
            handle.delta_notify.notified().await;
        }
    };

    match tokio::time::timeout(REPLICATION_TIMEOUT, wait).await {
        Ok(()) => Ok(()),
        Err(_) => {
            warn!(
                "Status delta for generation {generation} was not acked by quorum within {REPLICATION_TIMEOUT:?}"
            );
            Err(RelayError::NoQuorum)
        }
    }
}
