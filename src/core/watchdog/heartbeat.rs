// src/core/watchdog/heartbeat.rs

//! Outbound peer links and the periodic heartbeat/deadcount tick.

use super::WatchdogHandle;
use super::election;
use super::messages::{WdMessage, wire_codec};
use crate::config::WatchdogPeer;
use crate::core::state::Runtime;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Maintains the outbound link to one peer: connect with exponential
/// backoff, introduce ourselves, then pump queued messages out and inbound
/// messages into the handle.
pub async fn run_peer_link(
    handle: Arc<WatchdogHandle>,
    runtime: Arc<Runtime>,
    peer_index: usize,
    peer: WatchdogPeer,
    mut outbox: mpsc::UnboundedReceiver<WdMessage>,
) {
    let mut reconnect_delay = INITIAL_RECONNECT_DELAY;
    let addr = format!("{}:{}", peer.host, peer.wd_port);

    loop {
        let socket = match TcpStream::connect(&addr).await {
            Ok(socket) => {
                info!("Watchdog link to {addr} established");
                reconnect_delay = INITIAL_RECONNECT_DELAY;
                socket
            }
            Err(e) => {
                debug!("Watchdog link to {addr} failed: {e}. Retrying in {reconnect_delay:?}");
                time::sleep(reconnect_delay).await;
                // Exponential backoff to a cap for subsequent attempts.
                reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
                continue;
            }
        };

        let mut framed = Framed::new(socket, wire_codec());
        let hello = WdMessage::Hello {
            run_id: handle.run_id.clone(),
            priority: handle.my_priority,
            pgrelay_port: handle.pgrelay_port,
        };
        if let Err(e) = send_message(&mut framed, &hello).await {
            warn!("Failed to introduce ourselves to {addr}: {e}");
            continue;
        }

        loop {
            tokio::select! {
                queued = outbox.recv() => {
                    match queued {
                        Some(msg) => {
                            if let Err(e) = send_message(&mut framed, &msg).await {
                                warn!("Watchdog link to {addr} lost while sending: {e}");
                                break;
                            }
                            if let Some(peer_state) = handle.state.lock().peers.get_mut(peer_index) {
                                peer_state.last_heartbeat_sent = Some(Instant::now());
                            }
                        }
                        None => return,
                    }
                }
                inbound = framed.next() => {
                    match inbound {
                        Some(Ok(frame)) => match WdMessage::decode(&frame) {
                            Ok(msg) => handle.process_message(msg, &runtime),
                            Err(e) => {
                                warn!("Bad watchdog message on link to {addr}: {e}");
                                break;
                            }
                        },
                        Some(Err(e)) => {
                            warn!("Watchdog link to {addr} errored: {e}");
                            break;
                        }
                        None => {
                            debug!("Watchdog link to {addr} closed by peer");
                            break;
                        }
                    }
                }
            }
        }

        time::sleep(reconnect_delay).await;
        reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
    }
}

async fn send_message(
    framed: &mut Framed<TcpStream, tokio_util::codec::LengthDelimitedCodec>,
    msg: &WdMessage,
) -> Result<(), std::io::Error> {
    let payload = msg
        .encode()
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    framed.send(payload).await
}

/// The periodic tick: send heartbeats, expire dead peers, and drive the
/// election state machine.
pub async fn run_tick(
    handle: Arc<WatchdogHandle>,
    runtime: Arc<Runtime>,
    interval: Duration,
    deadtime: Duration,
) {
    let mut ticker = time::interval(interval);
    loop {
        ticker.tick().await;

        if !handle.is_active() {
            continue;
        }

        let heartbeat = {
            let state = handle.state.lock();
            WdMessage::Heartbeat {
                run_id: handle.run_id.clone(),
                epoch: state.epoch,
                leader: state.leader.clone(),
                status_generation: runtime.status.generation(),
            }
        };
        handle.broadcast(&heartbeat);

        expire_dead_peers(&handle, deadtime);
        election::tick(&handle);
    }
}

/// Marks peers unreachable after `deadtime` without a heartbeat, and clears
/// a lost leader so the election tick can react.
fn expire_dead_peers(handle: &Arc<WatchdogHandle>, deadtime: Duration) {
    let mut guard = handle.state.lock();
    let state = &mut *guard;
    let mut lost_leader = false;
    for peer in &mut state.peers {
        if !peer.reachable {
            continue;
        }
        let expired = peer
            .last_heartbeat_received
            .is_none_or(|t| t.elapsed() > deadtime);
        if expired {
            warn!(
                "Watchdog peer {} ({}) is lost: no heartbeat for {deadtime:?}",
                peer.host, peer.run_id
            );
            peer.reachable = false;
            if state.leader.as_deref() == Some(peer.run_id.as_str()) {
                lost_leader = true;
            }
        }
    }
    if lost_leader {
        // Reborrow after the loop; the leader entry itself stays recorded in
        // peers, only the leadership is vacated.
        info!("Current watchdog leader is lost; clearing leadership");
        state.leader = None;
    }
}
