// src/server/run_loop.rs

//! Drives the process from "fully spawned" to exit. Waits for the shutdown
//! broadcast fired by the signal handler (which has already told the
//! failover manager to withdraw every advertised prefix and close its BGP
//! sessions with Cease), then gives every background task a bounded window
//! to wind down before returning.

use super::context::ServerContext;
use anyhow::Result;
use std::time::Duration;
use tracing::{info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub async fn run(mut ctx: ServerContext) -> Result<()> {
    let mut shutdown_rx = ctx.shutdown_tx.subscribe();
    let _ = shutdown_rx.recv().await;

    info!("shutdown signal received, draining background tasks");
    ctx.background_tasks.abort_all();

    let drain = async {
        while ctx.background_tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("background tasks did not drain within the shutdown grace period");
    }

    info!("shutdown complete");
    Ok(())
}
