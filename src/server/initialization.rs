// src/server/initialization.rs

//! Builds the shared state every other task runs against: the kernel table
//! driver, one coordinator actor per configured service, the config-ingress
//! task that feeds each coordinator, and (if any service enables BGP) the
//! failover manager.

use super::context::ServerContext;
use crate::config::DaemonConfig;
use crate::core::configsource;
use crate::core::coordinator::{Coordinator, CoordinatorCommand};
use crate::core::failover::{FailoverConfig, FailoverManager};
use crate::core::kernel::{KernelTableDriver, ServiceDescriptor};
use crate::core::state::GlobalState;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, reload};

pub async fn setup(
    config: DaemonConfig,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<ServerContext> {
    info!(services = config.services.len(), "starting control plane");

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut background_tasks = tokio::task::JoinSet::new();

    let failover = match &config.bgp {
        Some(bgp_cfg) => {
            let manager = FailoverManager::start(FailoverConfig {
                local_asn: bgp_cfg.local_asn as u16,
                local_bgp_id: bgp_cfg.local_bgp_id,
                peer_addresses: bgp_cfg.peer_addresses.clone(),
                as_path: bgp_cfg.as_path.clone(),
                med: bgp_cfg.med,
            });
            Some(manager)
        }
        None => None,
    };

    let mut coordinators = HashMap::new();
    let mut drivers = HashMap::new();
    for service in &config.services {
        let driver = Arc::new(KernelTableDriver::new(config.kernel_tool_path.clone(), service.dry_run));
        drivers.insert(service.name.clone(), driver.clone());
        let descriptor = ServiceDescriptor {
            name: service.name.clone(),
            protocol: service.protocol,
            vip: service.vip,
            port: service.port,
            scheduler: service.scheduler,
        };

        let (events_tx, mut events_rx) = mpsc::channel(256);
        let coordinator = Coordinator::new(
            descriptor,
            service.depool_threshold,
            service.stop_monitors_when_disabled,
            service.monitors.clone(),
            Arc::new(service.monitor_config.clone()),
            driver,
            events_tx,
        );
        let coordinator_tx = crate::core::coordinator::spawn(coordinator);

        let bridge_tx = coordinator_tx.clone();
        background_tasks.spawn(async move {
            while let Some(ev) = events_rx.recv().await {
                if bridge_tx.send(CoordinatorCommand::MonitorEvent(ev)).await.is_err() {
                    break;
                }
            }
        });

        if service.bgp {
            if let Some(manager) = &failover {
                let prefix_len = if service.vip.is_ipv4() { 32 } else { 128 };
                manager.add_prefix(service.vip, prefix_len).await;
            } else {
                warn!(service = %service.name, "bgp requested but no failover manager configured");
            }
        }

        spawn_config_ingress(&service.pool_source_url, coordinator_tx.clone(), &mut background_tasks);

        coordinators.insert(service.name.clone(), coordinator_tx);
    }

    let global = GlobalState::new(coordinators, failover, drivers);

    Ok(ServerContext {
        global,
        shutdown_tx,
        background_tasks,
        log_reload_handle,
        instrumentation_enabled: config.instrumentation_enabled,
        instrumentation_bind: config.instrumentation_bind,
    })
}

fn spawn_config_ingress(
    url: &str,
    coordinator_tx: mpsc::Sender<CoordinatorCommand>,
    background_tasks: &mut tokio::task::JoinSet<()>,
) {
    let url = url.to_string();
    background_tasks.spawn(async move {
        let mut source = match configsource::from_url(&url) {
            Ok(source) => source,
            Err(e) => {
                warn!(url, error = %e, "failed to construct config source, ingress task exiting");
                return;
            }
        };
        loop {
            match source.next().await {
                Ok(desired) => {
                    if coordinator_tx.send(CoordinatorCommand::ConfigUpdate { desired }).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(url, error = %e, "config source error");
                }
            }
        }
    });
}
