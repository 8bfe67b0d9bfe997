// src/server/spawner.rs

//! Spawns the two process-lifetime tasks that sit outside the per-service
//! pipeline built in `initialization::setup`: the instrumentation HTTP
//! listener and the signal-handling task that drives graceful shutdown.

use super::context::ServerContext;
use crate::core::instrumentation::{self, InstrumentationState};
use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::filter::EnvFilter;

pub fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    if ctx.instrumentation_enabled {
        spawn_instrumentation(ctx);
    }
    spawn_signal_handler(ctx);
    Ok(())
}

fn spawn_instrumentation(ctx: &mut ServerContext) {
    let state = InstrumentationState { coordinators: ctx.global.coordinators.clone() };
    let router = instrumentation::router(state);
    let bind = ctx.instrumentation_bind.clone();

    ctx.background_tasks.spawn(async move {
        let listener = match TcpListener::bind(&bind).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(bind = %bind, error = %e, "failed to bind instrumentation listener");
                return;
            }
        };
        info!(bind = %bind, "instrumentation listener ready");
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = %e, "instrumentation listener exited");
        }
    });
}

fn spawn_signal_handler(ctx: &mut ServerContext) {
    let shutdown_tx = ctx.shutdown_tx.clone();
    let failover = ctx.global.failover.clone();
    let log_reload_handle = ctx.log_reload_handle.clone();

    ctx.background_tasks.spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGINT handler");
                return;
            }
        };
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGHUP handler");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down gracefully");
                    break;
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, shutting down gracefully");
                    break;
                }
                _ = sighup.recv() => {
                    reload_log_level(&log_reload_handle);
                }
            }
        }

        if let Some(manager) = &failover {
            manager.shutdown().await;
        }
        let _ = shutdown_tx.send(());
    });
}

fn reload_log_level(handle: &tracing_subscriber::reload::Handle<EnvFilter, tracing_subscriber::Registry>) {
    let directive = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    match EnvFilter::try_new(&directive) {
        Ok(filter) => {
            if handle.reload(filter).is_err() {
                warn!("log filter reload failed: subscriber already dropped");
            } else {
                info!(directive = %directive, "log level reloaded via SIGHUP");
            }
        }
        Err(e) => warn!(error = %e, "invalid RUST_LOG directive, log level unchanged"),
    }
}
