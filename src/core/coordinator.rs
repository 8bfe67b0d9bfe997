// src/core/coordinator.rs

//! Per-service controller. Owns every [`Server`] for its service, applies
//! depool/repool policy under a safety threshold, and drives the kernel
//! table through reconciliation batches.
//!
//! Each coordinator is a single-writer actor: every mutation -- config
//! updates, monitor callbacks, periodic reconciliation -- flows through one
//! task's message loop, which is this tree's substitute for the serialized,
//! single-threaded reactor the legacy pool manager relied on.

use crate::core::kernel::{KernelTableDriver, ReconciliationBatch, ServiceDescriptor, ServerTarget};
use crate::core::monitor::{MonitorConfig, MonitorEvent, MonitorOutcome};
use crate::core::server_entity::{Server, ServerPartial};
use indexmap::IndexMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// A caller-visible snapshot of one server, used by the instrumentation surface.
#[derive(Debug, Clone)]
pub struct ServerSnapshot {
    pub host: String,
    pub ip: Option<std::net::IpAddr>,
    pub weight: u32,
    pub enabled: bool,
    pub ready: bool,
    pub up: bool,
    pub pooled: bool,
}

/// Desired per-host config, as delivered by the config-ingress layer.
#[derive(Debug, Clone)]
pub struct DesiredServer {
    pub host: String,
    pub weight: u32,
    pub enabled: bool,
    pub fwmethod: crate::core::kernel::FwMethod,
}

pub enum CoordinatorCommand {
    ConfigUpdate {
        desired: Vec<DesiredServer>,
    },
    MonitorEvent(MonitorEvent),
    Snapshot {
        reply: oneshot::Sender<Vec<ServerSnapshot>>,
    },
}

pub struct Coordinator {
    service: ServiceDescriptor,
    servers: IndexMap<String, Server>,
    pooled_down: HashSet<String>,
    depool_threshold: f64,
    stop_monitors_when_disabled: bool,
    monitor_names: Vec<String>,
    monitor_config: Arc<MonitorConfig>,
    driver: Arc<KernelTableDriver>,
    events_tx: mpsc::Sender<MonitorEvent>,
}

impl Coordinator {
    pub fn new(
        service: ServiceDescriptor,
        depool_threshold: f64,
        stop_monitors_when_disabled: bool,
        monitor_names: Vec<String>,
        monitor_config: Arc<MonitorConfig>,
        driver: Arc<KernelTableDriver>,
        events_tx: mpsc::Sender<MonitorEvent>,
    ) -> Self {
        Self {
            service,
            servers: IndexMap::new(),
            pooled_down: HashSet::new(),
            depool_threshold,
            stop_monitors_when_disabled,
            monitor_names,
            monitor_config,
            driver,
            events_tx,
        }
    }

    /// Runs the actor loop until the command channel closes.
    pub async fn run(mut self, mut rx: mpsc::Receiver<CoordinatorCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                CoordinatorCommand::ConfigUpdate { desired } => {
                    self.on_config_update(desired).await;
                }
                CoordinatorCommand::MonitorEvent(ev) => {
                    self.on_monitor_event(ev).await;
                }
                CoordinatorCommand::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
            }
        }
        debug!(service = %self.service.name, "coordinator command channel closed, exiting");
    }

    fn snapshot(&self) -> Vec<ServerSnapshot> {
        self.servers
            .values()
            .map(|s| ServerSnapshot {
                host: s.host.clone(),
                ip: s.ip,
                weight: s.weight,
                enabled: s.enabled,
                ready: s.ready,
                up: s.up,
                pooled: s.pooled,
            })
            .collect()
    }

    async fn on_config_update(&mut self, desired: Vec<DesiredServer>) {
        let desired_hosts: HashSet<String> = desired.iter().map(|d| d.host.clone()).collect();

        let removed: Vec<String> = self
            .servers
            .keys()
            .filter(|h| !desired_hosts.contains(*h))
            .cloned()
            .collect();
        for host in removed {
            if let Some(mut server) = self.servers.shift_remove(&host) {
                server.destroy();
            }
            self.pooled_down.remove(&host);
        }

        let mut newly_created = Vec::new();
        for d in &desired {
            match self.servers.get_mut(&d.host) {
                Some(server) => {
                    server.merge(ServerPartial {
                        host: None,
                        weight: Some(d.weight),
                        enabled: Some(d.enabled),
                        fwmethod: Some(d.fwmethod),
                    });
                }
                None => {
                    let server = Server::new(d.host.clone(), self.service.port, d.weight, d.fwmethod);
                    self.servers.insert(d.host.clone(), server);
                    newly_created.push(d.host.clone());
                }
            }
        }

        if self.stop_monitors_when_disabled {
            for server in self.servers.values_mut() {
                if !server.enabled && server.monitor_count() > 0 {
                    server.stop_monitors();
                }
            }
        }

        let vip_is_v4 = self.service.vip.is_ipv4();
        for host in &newly_created {
            if let Some(server) = self.servers.get_mut(host) {
                if server.resolve(vip_is_v4).await {
                    server.activate(&self.monitor_names, &self.monitor_config, &self.events_tx);
                } else {
                    warn!(host = %host, service = %self.service.name, "server initialization failed: no resolvable address");
                }
            }
        }

        for server in self.servers.values_mut() {
            if server.modified && !newly_created.contains(&server.host) {
                // `up` is only ever mutated by monitor callbacks; a config
                // merge just re-derives `pooled` from whatever `up` already is.
                server.pooled = server.enabled && server.up;
                server.modified = false;
            }
        }

        self.assign_servers().await;
    }

    async fn on_monitor_event(&mut self, ev: MonitorEvent) {
        match ev.outcome {
            MonitorOutcome::Down { reason } => self.result_down(&ev.server_host, ev.monitor_name, &reason).await,
            MonitorOutcome::Up => self.result_up(&ev.server_host, ev.monitor_name).await,
        }
    }

    async fn result_down(&mut self, host: &str, monitor: &'static str, reason: &str) {
        let was_pooled = {
            let Some(server) = self.servers.get_mut(host) else { return };
            server.up = server.record_monitor_result(monitor, false);
            warn!(host, monitor, reason, "monitor reported down");
            server.pooled
        };
        if was_pooled {
            self.depool(host).await;
        }
    }

    async fn result_up(&mut self, host: &str, monitor: &'static str) {
        let should_repool = {
            let Some(server) = self.servers.get_mut(host) else { return };
            let was_up = server.up;
            // Recompute the AND-aggregate across every monitor attached to
            // this server rather than trusting this one callback alone --
            // with more than one monitor, a single `Up` report must not
            // repool a server another monitor still reports down.
            server.up = server.record_monitor_result(monitor, true);
            if server.up && !was_up {
                info!(host, monitor, "server recovered");
            }
            server.up && server.enabled && server.ready
        };
        if should_repool {
            self.repool(host).await;
        }
    }

    /// `(total - down) / total >= threshold`, where `excluding` is counted
    /// as down regardless of its current flag -- it is either already down
    /// (the `result_down` caller) or about to be treated as such (the
    /// `repool` drain loop), which is what "post-action state" means here:
    /// pooling never changes a server's health, only its kernel-table
    /// membership, so the ratio is evaluated as of the state right after
    /// the candidate leaves the pool.
    fn can_depool(&self, excluding: &str) -> bool {
        let total = self.servers.len();
        if total == 0 {
            return true;
        }
        let down: usize = self
            .servers
            .values()
            .filter(|s| s.host == excluding || !s.up)
            .count();
        let pooled_after = total.saturating_sub(down);
        (pooled_after as f64 / total as f64) >= self.depool_threshold
    }

    async fn depool(&mut self, host: &str) {
        if self.can_depool(host) {
            if let Some(server) = self.servers.get_mut(host) {
                server.pooled = false;
            }
            self.pooled_down.remove(host);
            self.assign_servers().await;
        } else {
            warn!(host, service = %self.service.name, "depool blocked by safety threshold, queued");
            self.pooled_down.insert(host.to_string());
        }
    }

    async fn repool(&mut self, host: &str) {
        let needs_pool = matches!(self.servers.get(host), Some(s) if !s.pooled);
        if needs_pool {
            if let Some(server) = self.servers.get_mut(host) {
                server.pooled = true;
            }
        }
        self.pooled_down.remove(host);

        while let Some(candidate) = self.pooled_down.iter().next().cloned() {
            if self.can_depool(&candidate) {
                if let Some(server) = self.servers.get_mut(&candidate) {
                    server.pooled = false;
                }
                self.pooled_down.remove(&candidate);
            } else {
                break;
            }
        }
        self.assign_servers().await;
    }

    /// Recomputes the pooled set and issues one reconciliation batch:
    /// adds, then edits, then removes, matching the kernel driver's
    /// documented apply order.
    async fn assign_servers(&mut self) {
        let mut adds = Vec::new();
        let mut edits = Vec::new();
        let mut removes = Vec::new();

        for server in self.servers.values() {
            let Some(ip) = server.ip else { continue };
            let target = ServerTarget {
                ip,
                port: server.port,
                weight: server.weight,
                fwmethod: server.fwmethod,
            };
            if server.pooled {
                if server.modified {
                    edits.push(target);
                } else {
                    adds.push(target);
                }
            } else {
                removes.push(target);
            }
        }

        let mut batch = ReconciliationBatch::default();
        for t in &adds {
            batch.commands.push(crate::core::kernel::build_add_server(&self.service, t));
        }
        for t in &edits {
            batch.commands.push(crate::core::kernel::build_edit_server(&self.service, t));
        }
        for t in &removes {
            batch.commands.push(crate::core::kernel::build_remove_server(&self.service, t));
        }

        if let Err(e) = self.driver.apply(&batch).await {
            warn!(service = %self.service.name, error = %e, "kernel table reconciliation failed, will retry next cycle");
        }
    }
}

/// Spawns a coordinator as its own task, returning the command channel used
/// to drive it.
pub fn spawn(coordinator: Coordinator) -> mpsc::Sender<CoordinatorCommand> {
    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(coordinator.run(rx));
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::kernel::{FwMethod, Protocol, Scheduler};

    fn coordinator(threshold: f64) -> (Coordinator, mpsc::Receiver<MonitorEvent>) {
        let service = ServiceDescriptor {
            name: "web".into(),
            protocol: Protocol::Tcp,
            vip: "10.0.0.1".parse().unwrap(),
            port: 80,
            scheduler: Scheduler::Wrr,
        };
        let (events_tx, events_rx) = mpsc::channel(16);
        let driver = Arc::new(KernelTableDriver::new("/bin/true", true));
        let c = Coordinator::new(
            service,
            threshold,
            true,
            vec![],
            Arc::new(MonitorConfig::default()),
            driver,
            events_tx,
        );
        (c, events_rx)
    }

    fn add_server(c: &mut Coordinator, host: &str, up: bool) {
        let mut s = Server::new(host.into(), 80, 10, FwMethod::Gate);
        s.ip = Some(host.parse().unwrap_or("10.0.0.9".parse().unwrap()));
        s.ready = true;
        s.enabled = true;
        s.up = up;
        s.pooled = true;
        c.servers.insert(host.into(), s);
    }

    #[test]
    fn can_depool_respects_threshold() {
        let (mut c, _rx) = coordinator(0.5);
        add_server(&mut c, "10.0.0.1", true);
        add_server(&mut c, "10.0.0.2", true);
        // Depooling one of two up servers leaves 1/2 = 0.5 >= 0.5: allowed.
        assert!(c.can_depool("10.0.0.1"));
    }

    #[test]
    fn can_depool_blocks_when_it_would_breach_threshold() {
        let (mut c, _rx) = coordinator(0.75);
        add_server(&mut c, "10.0.0.1", true);
        add_server(&mut c, "10.0.0.2", true);
        // 1/2 = 0.5 < 0.75: blocked.
        assert!(!c.can_depool("10.0.0.1"));
    }

    #[tokio::test]
    async fn result_down_depools_when_threshold_allows() {
        let (mut c, _rx) = coordinator(0.0);
        add_server(&mut c, "10.0.0.1", true);
        c.result_down("10.0.0.1", "IdleConnection", "reset").await;
        assert!(!c.servers["10.0.0.1"].up);
        assert!(!c.servers["10.0.0.1"].pooled);
    }

    #[tokio::test]
    async fn result_down_queues_when_threshold_blocks() {
        let (mut c, _rx) = coordinator(1.0);
        add_server(&mut c, "10.0.0.1", true);
        add_server(&mut c, "10.0.0.2", true);
        c.result_down("10.0.0.1", "IdleConnection", "reset").await;
        assert!(c.servers["10.0.0.1"].pooled);
        assert!(c.pooled_down.contains("10.0.0.1"));
    }

    #[tokio::test]
    async fn result_up_does_not_repool_until_every_monitor_is_up() {
        let (mut c, _rx) = coordinator(0.0);
        add_server(&mut c, "10.0.0.1", true);
        c.result_down("10.0.0.1", "IdleConnection", "reset").await;
        c.result_down("10.0.0.1", "ProxyFetch", "500").await;
        assert!(!c.servers["10.0.0.1"].pooled);

        c.result_up("10.0.0.1", "IdleConnection").await;
        assert!(!c.servers["10.0.0.1"].up);
        assert!(!c.servers["10.0.0.1"].pooled);

        c.result_up("10.0.0.1", "ProxyFetch").await;
        assert!(c.servers["10.0.0.1"].up);
        assert!(c.servers["10.0.0.1"].pooled);
    }

    #[tokio::test]
    async fn repool_drains_queued_depools_when_threshold_permits() {
        let (mut c, _rx) = coordinator(0.5);
        add_server(&mut c, "10.0.0.1", true);
        add_server(&mut c, "10.0.0.2", false);
        c.pooled_down.insert("10.0.0.2".into());
        c.servers.get_mut("10.0.0.1").unwrap().up = false;
        c.repool("10.0.0.1").await;
        assert!(c.servers["10.0.0.1"].up || c.servers["10.0.0.1"].pooled);
    }
}
