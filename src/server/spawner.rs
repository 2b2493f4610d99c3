// src/server/spawner.rs

//! Spawns the long-running background workers: the health controller, the
//! failover executor, the watchdog, and the admin surface.

use super::context::ServerContext;
use crate::core::failover::FailoverExecutor;
use crate::core::health;
use crate::core::watchdog::{self, WatchdogHandle};
use anyhow::{Result, anyhow};
use std::sync::Arc;
use tracing::info;

/// Spawns all background tasks into the context's JoinSet. Returns the
/// watchdog handle when one was started, for the admin surface.
pub fn spawn_all(ctx: &mut ServerContext) -> Result<Option<Arc<WatchdogHandle>>> {
    let runtime = ctx.runtime.clone();
    let config = runtime.config();

    // --- Watchdog ---
    let watchdog_handle = if config.use_watchdog {
        let (handle, peer_rxs) = WatchdogHandle::new(&config, &runtime.run_id);
        let wd_runtime = runtime.clone();
        let wd_handle = handle.clone();
        ctx.background_tasks.spawn(async move {
            watchdog::run(wd_runtime, wd_handle, peer_rxs)
                .await
                .map_err(|e| anyhow!("watchdog terminated: {e}"))
        });
        Some(handle)
    } else {
        info!("Watchdog is disabled; failover runs under a local interlock.");
        None
    };

    // --- Failover executor: the single consumer of the request queue ---
    let request_rx = ctx
        .request_rx
        .take()
        .ok_or_else(|| anyhow!("failover request queue already consumed"))?;
    let executor = FailoverExecutor::new(runtime.clone(), watchdog_handle.clone(), request_rx);
    ctx.background_tasks.spawn(async move {
        executor.run().await;
        Err(anyhow!("failover executor exited"))
    });

    // --- Health controller ---
    let health_runtime = runtime.clone();
    ctx.background_tasks.spawn(async move {
        health::run(health_runtime).await;
        Err(anyhow!("health controller exited"))
    });

    // --- Admin surface ---
    if config.admin.enabled {
        let admin_runtime = runtime.clone();
        let admin_watchdog = watchdog_handle.clone();
        ctx.background_tasks.spawn(async move {
            super::admin::run(admin_runtime, admin_watchdog).await;
            Ok(())
        });
    } else {
        info!("Admin surface is disabled in the configuration.");
    }

    info!("All background tasks have been spawned.");
    Ok(watchdog_handle)
}
