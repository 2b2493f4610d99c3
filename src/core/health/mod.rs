// src/core/health/mod.rs

//! The health-check controller: one probe loop per configured backend,
//! statistics on every probe, and quarantine/failover/failback requests
//! raised towards the executor when observed health changes.

pub mod stats;

use crate::core::RelayError;
use crate::core::backend::slot::BackendSlot;
use crate::core::credentials::Secret;
use crate::core::failover::{FailoverRequest, NodeRequestKind, RequestOrigin};
use crate::core::protocol::message::tags;
use crate::core::state::Runtime;
use crate::core::status::{BackendStatus, TransitionReason};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, info, warn};

/// Observed health of one backend, as seen by this instance's prober.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObservedHealth {
    Healthy,
    /// `max_retries` consecutive failures; a quarantine request is posted
    /// and probing continues.
    Suspected,
}

/// Spawns one probe loop per backend and supervises them.
pub async fn run(runtime: Arc<Runtime>) {
    let num_backends = runtime.config().backends.len();
    info!("Health controller starting for {num_backends} backend(s)");

    let mut tasks: JoinSet<()> = JoinSet::new();
    for node_id in 0..num_backends {
        let runtime = runtime.clone();
        tasks.spawn(probe_loop(runtime, node_id));
    }

    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            warn!("A health probe task terminated: {e}");
        }
    }
}

/// The per-backend schedule: probe every `health_check_period`, retrying up
/// to `health_check_max_retries` with `health_check_retry_delay` between
/// attempts before declaring the probe session failed.
async fn probe_loop(runtime: Arc<Runtime>, node_id: usize) {
    let mut observed = ObservedHealth::Healthy;
    let mut ticker = {
        let config = runtime.config();
        time::interval(config.health_check_period)
    };
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let config = runtime.config();

        let snapshot = runtime.status.snapshot();
        let Some(entry) = snapshot.entries.get(node_id) else {
            return;
        };
        if entry.status == BackendStatus::Unused {
            runtime.health.record_skip(node_id);
            continue;
        }

        let secret = runtime
            .credentials
            .resolve(&config.health_check_user)
            .unwrap_or_else(|_| Secret::Plain(String::new()));

        let session_start = Instant::now();
        let mut retries_used = 0u32;
        let mut success = false;

        for attempt in 0..=config.health_check_max_retries {
            if attempt > 0 {
                retries_used += 1;
                time::sleep(config.health_check_retry_delay).await;
            }
            let probe = probe_once(
                &entry.host,
                entry.port,
                &config.health_check_user,
                &config.health_check_database,
                &secret,
            );
            match time::timeout(config.health_check_timeout, probe).await {
                Ok(Ok(())) => {
                    success = true;
                    break;
                }
                Ok(Err(e)) => {
                    debug!("Health probe {attempt} for node {node_id} failed: {e}");
                }
                Err(_) => {
                    debug!("Health probe {attempt} for node {node_id} timed out");
                }
            }
        }

        let elapsed = session_start.elapsed();
        if success {
            runtime.health.record_success(node_id, elapsed);
            if observed == ObservedHealth::Suspected
                || entry.status == BackendStatus::Down
                || entry.quarantined
            {
                info!("Node {node_id} health returned; posting failback request");
                runtime.post_request(FailoverRequest::node(
                    node_id,
                    NodeRequestKind::Failback,
                    TransitionReason::Failback,
                    RequestOrigin::Health,
                    snapshot.generation,
                ));
            }
            observed = ObservedHealth::Healthy;

            // Supplementary streaming-replication check feeding the router's
            // lag threshold.
            if !entry.is_primary()
                && let Some(primary) = snapshot.primary()
            {
                measure_replication_lag(&runtime, node_id, entry, primary, &config, &secret).await;
            }
        } else {
            runtime.health.record_failure(node_id, elapsed, retries_used);
            if observed != ObservedHealth::Suspected && entry.status != BackendStatus::Down {
                warn!(
                    "Node {node_id} failed {} consecutive probe attempt(s); raising suspected failure",
                    retries_used + 1
                );
                // Quarantine takes the node out of routing immediately; the
                // detach is adjudicated cluster-wide by the leader.
                runtime.post_request(FailoverRequest::node(
                    node_id,
                    NodeRequestKind::Quarantine,
                    TransitionReason::Quarantine,
                    RequestOrigin::Health,
                    snapshot.generation,
                ));
                runtime.post_request(FailoverRequest::node(
                    node_id,
                    NodeRequestKind::Detach,
                    TransitionReason::HealthFail,
                    RequestOrigin::Health,
                    snapshot.generation,
                ));
            }
            observed = ObservedHealth::Suspected;
        }
    }
}

/// One probe: open a connection with the health-check user and database,
/// complete startup, await `ReadyForQuery`, close cleanly.
async fn probe_once(
    host: &str,
    port: u16,
    user: &str,
    database: &str,
    secret: &Secret,
) -> Result<(), RelayError> {
    let mut params = BTreeMap::new();
    let mut slot = BackendSlot::open(usize::MAX, host, port, user, database, secret, &mut params)
        .await?;
    slot.close().await;
    Ok(())
}

/// Measures how far a standby's replay position trails the primary's write
/// position, recording the difference in bytes in the status table.
async fn measure_replication_lag(
    runtime: &Arc<Runtime>,
    node_id: usize,
    entry: &crate::core::status::BackendEntry,
    primary: &crate::core::status::BackendEntry,
    config: &crate::config::Config,
    secret: &Secret,
) {
    let primary_lsn = query_lsn(
        &primary.host,
        primary.port,
        &config.health_check_user,
        &config.health_check_database,
        secret,
        "SELECT pg_current_wal_lsn()",
    )
    .await;
    let standby_lsn = query_lsn(
        &entry.host,
        entry.port,
        &config.health_check_user,
        &config.health_check_database,
        secret,
        "SELECT pg_last_wal_replay_lsn()",
    )
    .await;

    if let (Some(primary_lsn), Some(standby_lsn)) = (primary_lsn, standby_lsn) {
        let lag = primary_lsn.saturating_sub(standby_lsn);
        runtime.status.record_replication_lag(node_id, lag);
        debug!("Node {node_id} replication lag: {lag} bytes");
    }
}

/// Runs a single-value query on a throwaway connection and parses the
/// result as a WAL position.
async fn query_lsn(
    host: &str,
    port: u16,
    user: &str,
    database: &str,
    secret: &Secret,
    sql: &str,
) -> Option<u64> {
    let mut params = BTreeMap::new();
    let mut slot = BackendSlot::open(usize::MAX, host, port, user, database, secret, &mut params)
        .await
        .ok()?;

    let value = single_value_query(&mut slot, sql).await;
    slot.close().await;
    parse_lsn(&value?)
}

async fn single_value_query(slot: &mut BackendSlot, sql: &str) -> Option<String> {
    use crate::core::protocol::message::Message;
    slot.send(Message::query(sql)).await.ok()?;
    let mut value = None;
    loop {
        let msg = slot.recv().await.ok()?;
        match msg.tag {
            tags::DATA_ROW => {
                value = parse_first_column(&msg.body);
            }
            tags::READY_FOR_QUERY => return value,
            _ => {}
        }
    }
}

/// Extracts the first column of a `DataRow` as text.
fn parse_first_column(body: &[u8]) -> Option<String> {
    if body.len() < 6 {
        return None;
    }
    let ncols = i16::from_be_bytes([body[0], body[1]]);
    if ncols < 1 {
        return None;
    }
    let len = i32::from_be_bytes([body[2], body[3], body[4], body[5]]);
    if len < 0 {
        return None;
    }
    let end = 6 + len as usize;
    body.get(6..end)
        .and_then(|b| std::str::from_utf8(b).ok())
        .map(str::to_string)
}

/// Parses a PostgreSQL WAL position of the form `XXXXXXXX/YYYYYYYY`.
fn parse_lsn(text: &str) -> Option<u64> {
    let (high, low) = text.trim().split_once('/')?;
    let high = u64::from_str_radix(high, 16).ok()?;
    let low = u64::from_str_radix(low, 16).ok()?;
    Some((high << 32) | low)
}
