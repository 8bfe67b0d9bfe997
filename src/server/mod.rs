// src/server/mod.rs

use crate::config::DaemonConfig;
use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{filter::EnvFilter, reload};

mod context;
mod initialization;
mod run_loop;
mod spawner;

/// Builds process state, spawns every background task, then blocks until a
/// shutdown signal drives the process to a clean exit.
pub async fn run(
    config: DaemonConfig,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<()> {
    let mut server_context = initialization::setup(config, log_reload_handle).await?;
    spawner::spawn_all(&mut server_context)?;
    run_loop::run(server_context).await
}
