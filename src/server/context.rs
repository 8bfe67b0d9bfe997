// src/server/context.rs

use crate::core::state::GlobalState;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing_subscriber::{filter::EnvFilter, reload};

/// Holds everything the running process needs: the shared state registry,
/// the shutdown broadcast used to fan a single signal out to every task, the
/// set of spawned background tasks, and the log-level reload handle SIGHUP
/// drives.
pub struct ServerContext {
    pub global: GlobalState,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<()>,
    pub log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
    pub instrumentation_enabled: bool,
    pub instrumentation_bind: String,
}
