// src/server/supervisor.rs

//! The frontend supervisor: accepts connections, hands them to a fixed pool
//! of session workers, translates OS signals into control events, and
//! recycles workers per `child_max_connections` / `child_life_time`.

use super::context::ServerContext;
use super::initialization;
use super::stream::AnyStream;
use crate::core::backend::pool::PoolCache;
use crate::core::backend::slot::BackendSlot;
use crate::core::protocol::startup::{self, FirstPacket};
use crate::core::session::{self, SessionEnd};
use crate::core::state::{ControlEvent, Runtime, ShutdownMode, WorkerInfo, WorkerStatus};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

type ConnReceiver = Arc<Mutex<mpsc::Receiver<(TcpStream, SocketAddr)>>>;

/// Runs the accept loop and the worker pool until shutdown. Returns the
/// process exit code.
pub async fn run(mut ctx: ServerContext) -> i32 {
    let config = ctx.runtime.config();
    let (conn_tx, conn_rx) = mpsc::channel::<(TcpStream, SocketAddr)>(1024);
    let conn_rx: ConnReceiver = Arc::new(Mutex::new(conn_rx));

    let mut workers = JoinSet::new();
    for worker_id in 0..config.num_workers {
        workers.spawn(worker_main(
            worker_id,
            ctx.runtime.clone(),
            conn_rx.clone(),
            ctx.acceptor.clone(),
        ));
    }

    let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM stream");
    let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT stream");
    let mut sigquit = signal(SignalKind::quit()).expect("SIGQUIT stream");
    let mut sighup = signal(SignalKind::hangup()).expect("SIGHUP stream");
    let mut control = ctx.runtime.subscribe_control();

    let shutdown_mode;
    loop {
        tokio::select! {
            biased;

            _ = sigterm.recv() => {
                info!("SIGTERM received: smart shutdown");
                shutdown_mode = ShutdownMode::Smart;
                break;
            }
            _ = sigint.recv() => {
                info!("SIGINT received: fast shutdown");
                shutdown_mode = ShutdownMode::Fast;
                break;
            }
            _ = sigquit.recv() => {
                info!("SIGQUIT received: immediate shutdown");
                shutdown_mode = ShutdownMode::Immediate;
                break;
            }
            _ = sighup.recv() => {
                if let Err(e) = ctx.runtime.reload_from_disk() {
                    warn!("Reload rejected, keeping the previous configuration: {e}");
                } else {
                    info!("Configuration reloaded");
                }
            }

            // Admin-initiated shutdown arrives as a control event.
            event = control.recv() => {
                if let Ok(ControlEvent::Shutdown(mode)) = event {
                    info!("Shutdown requested over the control channel: {mode:?}");
                    shutdown_mode = mode;
                    break;
                }
            }

            Some(res) = ctx.background_tasks.join_next() => {
                match res {
                    Ok(Ok(())) => info!("A background task completed."),
                    Ok(Err(e)) => {
                        error!("CRITICAL: background task failed: {e}. Shutting down.");
                        shutdown_mode = ShutdownMode::Fast;
                        break;
                    }
                    Err(e) => {
                        error!("CRITICAL: background task panicked: {e:?}. Shutting down.");
                        shutdown_mode = ShutdownMode::Fast;
                        break;
                    }
                }
            }

            // Respawn workers that died; sessions they served are gone but
            // the pool must stay at strength.
            Some(res) = workers.join_next() => {
                if let Err(e) = res
                    && e.is_panic()
                {
                    error!("A worker panicked: {e:?}. Respawning.");
                    let next_id = ctx
                        .runtime
                        .workers
                        .iter()
                        .map(|entry| *entry.key())
                        .max()
                        .map_or(0, |max| max + 1);
                    workers.spawn(worker_main(
                        next_id,
                        ctx.runtime.clone(),
                        conn_rx.clone(),
                        ctx.acceptor.clone(),
                    ));
                }
            }

            accepted = ctx.listener.accept() => {
                match accepted {
                    Ok((socket, addr)) => {
                        debug!("Accepted frontend connection from {addr}");
                        if conn_tx.try_send((socket, addr)).is_err() {
                            warn!("All workers busy and backlog full; rejecting {addr}");
                        }
                    }
                    Err(e) => warn!("Failed to accept connection: {e}"),
                }
            }
        }
    }

    // --- Shutdown sequence ---
    ctx.runtime.broadcast(ControlEvent::Shutdown(shutdown_mode));
    drop(conn_tx);

    let drain = async {
        while workers.join_next().await.is_some() {}
    };
    let grace = match shutdown_mode {
        ShutdownMode::Smart => std::time::Duration::from_secs(3600),
        ShutdownMode::Fast => std::time::Duration::from_secs(10),
        ShutdownMode::Immediate => std::time::Duration::from_secs(1),
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        warn!("Timed out waiting for workers; aborting the rest");
        workers.shutdown().await;
    }

    ctx.background_tasks.shutdown().await;
    initialization::remove_pid_file(&ctx.runtime.config().pid_file_name);
    info!("Shutdown complete.");
    0
}

/// One session worker: owns a pool-slot cache and serves one frontend
/// session at a time, recycling per the child lifecycle settings.
async fn worker_main(
    worker_id: usize,
    runtime: Arc<Runtime>,
    conn_rx: ConnReceiver,
    acceptor: Option<TlsAcceptor>,
) {
    let config = runtime.config();
    let mut cache = PoolCache::new(config.max_pool);
    let mut control = runtime.subscribe_control();
    let mut sessions_served: u64 = 0;
    let mut spawned_at = Instant::now();

    runtime.workers.insert(
        worker_id,
        WorkerInfo {
            worker_id,
            status: WorkerStatus::WaitForConnect,
            started_at: Utc::now(),
            session_count: 0,
            pool_entries: 0,
            client_addr: None,
        },
    );

    loop {
        set_worker_status(&runtime, worker_id, WorkerStatus::WaitForConnect, None);

        let accepted = {
            let mut rx = conn_rx.lock().await;
            tokio::select! {
                biased;
                event = control.recv() => {
                    drop(rx);
                    match event {
                        Ok(ControlEvent::Shutdown(_)) => break,
                        Ok(ControlEvent::Reload) | Ok(ControlEvent::BackendStateSync) => {
                            // Idle worker: resynchronize immediately.
                            cache.invalidate_all().await;
                            continue;
                        }
                        Err(_) => continue,
                    }
                }
                conn = rx.recv() => conn,
            }
        };

        let Some((socket, addr)) = accepted else {
            break; // supervisor hung up
        };

        set_worker_status(&runtime, worker_id, WorkerStatus::CommandExecute, Some(addr));
        sessions_served += 1;
        if let Some(mut info) = runtime.workers.get_mut(&worker_id) {
            info.session_count = sessions_served;
        }

        match negotiate(socket, addr, &runtime, worker_id, &mut cache, &mut control, &acceptor)
            .await
        {
            Ok(Some(SessionEnd::Shutdown(_))) => break,
            Ok(Some(SessionEnd::Recycle)) => {
                cache.invalidate_all().await;
            }
            Ok(_) => {}
            Err(e) => {
                if !e.is_disconnect() {
                    warn!("Worker {worker_id}: session from {addr} failed: {e}");
                }
            }
        }

        if let Some(mut info) = runtime.workers.get_mut(&worker_id) {
            info.pool_entries = cache.len();
        }

        // Child lifecycle: recycle the worker's cached state after enough
        // sessions or enough wall time, the way a forked child would exit.
        let config = runtime.config();
        let over_connections =
            config.child_max_connections > 0 && sessions_served >= config.child_max_connections as u64;
        let over_lifetime = !config.child_life_time.is_zero()
            && spawned_at.elapsed() >= config.child_life_time;
        if over_connections || over_lifetime {
            debug!(
                "Worker {worker_id} recycling after {sessions_served} session(s), {:?} alive",
                spawned_at.elapsed()
            );
            cache.invalidate_all().await;
            sessions_served = 0;
            spawned_at = Instant::now();
            if let Some(mut info) = runtime.workers.get_mut(&worker_id) {
                info.started_at = Utc::now();
                info.session_count = 0;
            }
        }
    }

    cache.invalidate_all().await;
    runtime.workers.remove(&worker_id);
    debug!("Worker {worker_id} exited");
}

fn set_worker_status(
    runtime: &Arc<Runtime>,
    worker_id: usize,
    status: WorkerStatus,
    addr: Option<SocketAddr>,
) {
    if let Some(mut info) = runtime.workers.get_mut(&worker_id) {
        info.status = status;
        info.client_addr = addr.map(|a| a.to_string());
    }
}

/// Startup-phase negotiation: TLS sentinel, cancel requests, then the real
/// startup packet and the session proper.
async fn negotiate(
    socket: TcpStream,
    addr: SocketAddr,
    runtime: &Arc<Runtime>,
    worker_id: usize,
    cache: &mut PoolCache,
    control: &mut tokio::sync::broadcast::Receiver<ControlEvent>,
    acceptor: &Option<TlsAcceptor>,
) -> Result<Option<SessionEnd>, crate::core::RelayError> {
    socket.set_nodelay(true).ok();
    let mut stream = AnyStream::Tcp(socket);

    loop {
        match startup::read_first_packet(&mut stream).await? {
            FirstPacket::SslRequest => {
                match (acceptor, stream) {
                    (Some(acceptor), AnyStream::Tcp(mut socket)) => {
                        socket.write_all(b"S").await?;
                        let tls = acceptor.accept(socket).await.map_err(|e| {
                            crate::core::RelayError::Io(std::sync::Arc::new(e))
                        })?;
                        debug!("TLS handshake successful for {addr}");
                        stream = AnyStream::Tls(Box::new(tls));
                    }
                    (_, mut plain) => {
                        plain.write_all(b"N").await?;
                        stream = plain;
                    }
                }
            }
            FirstPacket::Cancel { pid, key } => {
                handle_cancel(runtime, pid, key).await;
                return Ok(None);
            }
            FirstPacket::Startup(packet) => {
                let end =
                    session::serve(stream, packet, runtime.clone(), worker_id, cache, control)
                        .await?;
                return Ok(Some(end));
            }
        }
    }
}

/// Resolves a frontend cancel request against the recorded backend pid/key
/// pairs and cancels the backend currently executing.
async fn handle_cancel(runtime: &Arc<Runtime>, pid: i32, key: i32) {
    let Some(entry) = runtime.cancel_map.get(&(pid, key)).map(|e| e.clone()) else {
        debug!("Cancel request for unknown key ({pid}, {key})");
        return;
    };

    let targets: Vec<_> = match entry.current {
        Some(current) => entry
            .targets
            .iter()
            .filter(|(node, ..)| *node == current)
            .cloned()
            .collect(),
        None => entry.targets.clone(),
    };

    for (node, host, port, backend_pid, backend_key) in targets {
        debug!("Forwarding cancel to node {node} (pid {backend_pid})");
        BackendSlot::cancel_request(&host, port, backend_pid, backend_key).await;
    }
}
