// src/core/monitor/mod.rs

//! Base contract for health probes: lifecycle, tri-state result aggregation,
//! and first-check latching. Concrete probes live in sibling modules and
//! register themselves in [`registry`].

pub mod dns_query;
pub mod idle_connection;
pub mod proxy_fetch;
pub mod run_command;

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// The monitor's aggregated health reading. `Unknown` only ever precedes the
/// first completed check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Unknown,
    Up,
    Down,
}

/// What a monitor reports back to its owning coordinator.
#[derive(Debug, Clone)]
pub enum MonitorOutcome {
    Up,
    Down { reason: String },
}

/// One callback from a monitor, addressed to the server/coordinator that owns it.
#[derive(Debug, Clone)]
pub struct MonitorEvent {
    pub server_host: String,
    pub monitor_name: &'static str,
    pub outcome: MonitorOutcome,
}

/// Flat, per-service configuration map shared by every monitor attached to
/// servers in that service. Keys are `<lowercased-monitor-name>.<option>`,
/// matching the legacy `<name>.<option>` convention so a single table can
/// carry settings for several monitor types at once.
#[derive(Debug, Clone, Default)]
pub struct MonitorConfig(pub HashMap<String, String>);

impl MonitorConfig {
    fn key(monitor_name: &str, option: &str) -> String {
        format!("{}.{}", monitor_name.to_ascii_lowercase(), option)
    }

    pub fn get_int(&self, monitor_name: &str, option: &str, default: u64) -> u64 {
        self.0
            .get(&Self::key(monitor_name, option))
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_bool(&self, monitor_name: &str, option: &str, default: bool) -> bool {
        self.0
            .get(&Self::key(monitor_name, option))
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "t" | "true" | "y" | "yes" | "on" | "1"))
            .unwrap_or(default)
    }

    pub fn get_string(&self, monitor_name: &str, option: &str) -> Option<String> {
        self.0.get(&Self::key(monitor_name, option)).cloned()
    }

    pub fn get_string_list(&self, monitor_name: &str, option: &str) -> Vec<String> {
        self.0
            .get(&Self::key(monitor_name, option))
            .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }
}

/// What a probe needs to run: the backend it's checking and the channel back
/// to the coordinator. Probes never hold a strong reference to the
/// coordinator itself -- only this sender, which is the "weak reference"
/// called for by the cyclic-ownership design note.
#[derive(Clone)]
pub struct MonitorContext {
    pub server_host: String,
    pub server_ip: IpAddr,
    pub server_port: u16,
    pub config: Arc<MonitorConfig>,
    pub events_tx: mpsc::Sender<MonitorEvent>,
}

/// A running monitor. Dropping or calling `stop` aborts the task immediately,
/// so any in-flight I/O is cancelled and no stale callback can be delivered.
pub struct MonitorHandle {
    join: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn stop(self) {
        self.join.abort();
    }
}

/// Tracks a monitor's tri-state health and implements the first-check latch:
/// a result is only forwarded to the coordinator when it represents a state
/// change, or when it is the very first result this monitor has ever produced.
#[derive(Debug, Default)]
pub struct ResultLatch {
    health: Option<bool>,
}

impl ResultLatch {
    pub fn new() -> Self {
        Self { health: None }
    }

    /// Returns `true` if this result should be forwarded to the coordinator.
    pub fn observe_up(&mut self) -> bool {
        let should_notify = self.health != Some(true);
        self.health = Some(true);
        should_notify
    }

    /// Returns `true` if this result should be forwarded to the coordinator.
    pub fn observe_down(&mut self) -> bool {
        let should_notify = self.health != Some(false);
        self.health = Some(false);
        should_notify
    }

    pub fn current(&self) -> Health {
        match self.health {
            None => Health::Unknown,
            Some(true) => Health::Up,
            Some(false) => Health::Down,
        }
    }
}

pub type MonitorFactory = fn(MonitorContext) -> MonitorHandle;

/// Process-wide, append-only-at-startup registry mapping lowercase monitor
/// names to their constructors. This is the "dynamic dispatch on monitor
/// names" design note realized without any runtime code loading.
pub static MONITOR_REGISTRY: Lazy<HashMap<&'static str, MonitorFactory>> = Lazy::new(|| {
    let mut m: HashMap<&'static str, MonitorFactory> = HashMap::new();
    m.insert("idleconnection", idle_connection::spawn as MonitorFactory);
    m.insert("proxyfetch", proxy_fetch::spawn as MonitorFactory);
    m.insert("dnsquery", dns_query::spawn as MonitorFactory);
    m.insert("runcommand", run_command::spawn as MonitorFactory);
    m
});

/// Looks a monitor name up in the registry and spawns it, logging and
/// returning `None` for unrecognized names rather than failing the server's
/// whole initialization.
pub fn spawn_by_name(name: &str, ctx: MonitorContext) -> Option<(&'static str, MonitorHandle)> {
    let lname = name.to_ascii_lowercase();
    match MONITOR_REGISTRY.get_key_value(lname.as_str()) {
        Some((canonical, factory)) => Some((*canonical, factory(ctx))),
        None => {
            warn!(monitor = %name, "unknown monitor name, skipping");
            None
        }
    }
}

pub(crate) async fn send_outcome(ctx: &MonitorContext, name: &'static str, outcome: MonitorOutcome) {
    let _ = ctx
        .events_tx
        .send(MonitorEvent {
            server_host: ctx.server_host.clone(),
            monitor_name: name,
            outcome,
        })
        .await;
}

pub(crate) use send_outcome as emit;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_check_always_latches_regardless_of_default() {
        let mut latch = ResultLatch::new();
        assert!(latch.observe_up());
        assert_eq!(latch.current(), Health::Up);
    }

    #[test]
    fn repeated_same_result_does_not_renotify() {
        let mut latch = ResultLatch::new();
        assert!(latch.observe_down());
        assert!(!latch.observe_down());
    }

    #[test]
    fn state_change_renotifies() {
        let mut latch = ResultLatch::new();
        assert!(latch.observe_up());
        assert!(latch.observe_down());
        assert!(latch.observe_up());
    }

    #[test]
    fn config_accessors_prefix_by_lowercased_monitor_name() {
        let mut raw = HashMap::new();
        raw.insert("idleconnection.interval".to_string(), "15".to_string());
        raw.insert("idleconnection.active".to_string(), "yes".to_string());
        let cfg = MonitorConfig(raw);
        assert_eq!(cfg.get_int("IdleConnection", "interval", 10), 15);
        assert!(cfg.get_bool("IdleConnection", "active", false));
        assert_eq!(cfg.get_int("IdleConnection", "missing", 42), 42);
    }
}
