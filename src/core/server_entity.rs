// src/core/server_entity.rs

//! A single backend attached to a service: its address, admin/health state,
//! and the monitors watching it. Owned exclusively by its coordinator --
//! nothing outside `coordinator.rs` ever touches a `Server` directly.

use crate::core::kernel::FwMethod;
use crate::core::monitor::{MonitorConfig, MonitorContext, MonitorHandle, MonitorEvent};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Resolution deadlines tried in order; the first to return a non-empty
/// result set wins, matching the tiered "don't wait the full timeout just
/// because of one slow nameserver" behavior of the resolver this replaces.
const RESOLUTION_TIMEOUTS_SECS: [u64; 3] = [1, 2, 5];

/// A server's whitelisted mutable fields, as delivered by a config merge.
#[derive(Debug, Clone, Default)]
pub struct ServerPartial {
    pub host: Option<String>,
    pub weight: Option<u32>,
    pub enabled: Option<bool>,
    pub fwmethod: Option<FwMethod>,
}

/// One backend behind a service's VIP.
pub struct Server {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub fwmethod: FwMethod,

    pub enabled: bool,
    pub ready: bool,
    pub up: bool,
    pub pooled: bool,
    pub modified: bool,

    pub ip: Option<IpAddr>,
    pub ip4_addresses: Vec<IpAddr>,
    pub ip6_addresses: Vec<IpAddr>,

    monitors: Vec<(&'static str, MonitorHandle)>,
    /// Latest reported state of every monitor that has checked in at least
    /// once, keyed by canonical monitor name. Drives `aggregate_monitor_status`;
    /// a monitor absent from this map simply hasn't reported yet.
    monitor_health: HashMap<&'static str, bool>,
}

impl Server {
    pub fn new(host: String, port: u16, weight: u32, fwmethod: FwMethod) -> Self {
        Self {
            host,
            port,
            weight,
            fwmethod,
            enabled: true,
            ready: false,
            up: false,
            pooled: false,
            modified: false,
            ip: None,
            ip4_addresses: Vec::new(),
            ip6_addresses: Vec::new(),
            monitors: Vec::new(),
            monitor_health: HashMap::new(),
        }
    }

    /// Resolves `host` to an IP address, preferring the address family that
    /// matches `vip_is_v4`. A literal IP address skips DNS entirely. Returns
    /// `false` if resolution yielded no usable address.
    pub async fn resolve(&mut self, vip_is_v4: bool) -> bool {
        if let Ok(literal) = self.host.parse::<IpAddr>() {
            self.ip = Some(literal);
            match literal {
                IpAddr::V4(_) => self.ip4_addresses = vec![literal],
                IpAddr::V6(_) => self.ip6_addresses = vec![literal],
            }
            return true;
        }

        let mut addrs = Vec::new();
        for &timeout_secs in &RESOLUTION_TIMEOUTS_SECS {
            let deadline = std::time::Duration::from_secs(timeout_secs);
            match tokio::time::timeout(deadline, tokio::net::lookup_host((self.host.as_str(), self.port))).await {
                Ok(Ok(resolved)) => {
                    addrs = resolved.map(|sa| sa.ip()).collect();
                    if !addrs.is_empty() {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    warn!(host = %self.host, error = %e, "DNS resolution error, retrying with longer timeout");
                }
                Err(_) => {
                    warn!(host = %self.host, timeout_secs, "DNS resolution timed out, retrying with longer timeout");
                }
            }
        }

        self.ip4_addresses = addrs.iter().copied().filter(|a| a.is_ipv4()).collect();
        self.ip6_addresses = addrs.iter().copied().filter(|a| a.is_ipv6()).collect();

        if addrs.is_empty() {
            return false;
        }

        // Keep the previously chosen address if it is still present, so a
        // re-resolve after a TTL expiry doesn't needlessly churn connections.
        if let Some(prev) = self.ip {
            if addrs.contains(&prev) {
                return true;
            }
        }

        let preferred: Vec<IpAddr> = if vip_is_v4 {
            self.ip4_addresses.clone()
        } else {
            self.ip6_addresses.clone()
        };
        let pool = if preferred.is_empty() { &addrs } else { &preferred };
        self.ip = pool.choose(&mut rand::thread_rng()).copied();
        self.ip.is_some()
    }

    /// Marks the server initialized: optimistically up and pooled, then
    /// spawns every configured monitor. Unknown monitor names are skipped
    /// with a warning, never fail the server as a whole.
    pub fn activate(
        &mut self,
        monitor_names: &[String],
        config: &Arc<MonitorConfig>,
        events_tx: &mpsc::Sender<MonitorEvent>,
    ) {
        self.ready = true;
        self.up = true;
        self.pooled = true;
        self.enforce_invariants();

        let Some(ip) = self.ip else {
            warn!(host = %self.host, "activating server with no resolved address");
            return;
        };

        for name in monitor_names {
            let ctx = MonitorContext {
                server_host: self.host.clone(),
                server_ip: ip,
                server_port: self.port,
                config: config.clone(),
                events_tx: events_tx.clone(),
            };
            if let Some((canonical, handle)) = crate::core::monitor::spawn_by_name(name, ctx) {
                self.monitors.push((canonical, handle));
            }
        }
        info!(host = %self.host, monitors = self.monitors.len(), "server activated");
    }

    /// Disables the server and tears down every attached monitor.
    pub fn destroy(&mut self) {
        self.enabled = false;
        self.stop_monitors();
    }

    /// Stops and drops every attached monitor without otherwise touching the
    /// server's state, for the `stop_monitors_when_disabled` policy.
    pub fn stop_monitors(&mut self) {
        for (_, handle) in self.monitors.drain(..) {
            handle.stop();
        }
        self.monitor_health.clear();
    }

    /// AND over attached monitors' up state; requires at least one monitor.
    pub fn calc_status(&self, monitor_health: &[bool]) -> bool {
        !monitor_health.is_empty() && monitor_health.iter().all(|&up| up)
    }

    /// OR over attached monitors' up state.
    pub fn calc_partial_status(&self, monitor_health: &[bool]) -> bool {
        monitor_health.iter().any(|&up| up)
    }

    /// AND-aggregate over every monitor that has reported in at least once.
    /// A monitor that has never reported simply isn't counted yet -- this is
    /// what lets `activate`'s optimistic `up = true` stand until the first
    /// real check comes in, while still requiring every monitor that *has*
    /// reported to currently be up.
    pub fn aggregate_monitor_status(&self) -> bool {
        let health: Vec<bool> = self.monitor_health.values().copied().collect();
        self.calc_status(&health)
    }

    /// Records one monitor's latest result and returns the newly computed
    /// aggregate status across every monitor that has reported so far.
    pub fn record_monitor_result(&mut self, monitor: &'static str, up: bool) -> bool {
        self.monitor_health.insert(monitor, up);
        self.aggregate_monitor_status()
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.len()
    }

    /// Applies a whitelisted partial update and re-establishes invariants.
    pub fn merge(&mut self, partial: ServerPartial) {
        if let Some(host) = partial.host {
            self.host = host;
        }
        if let Some(weight) = partial.weight {
            self.weight = weight;
        }
        if let Some(enabled) = partial.enabled {
            self.enabled = enabled;
        }
        if let Some(fwmethod) = partial.fwmethod {
            self.fwmethod = fwmethod;
        }
        self.modified = true;
        self.enforce_invariants();
    }

    /// Re-establishes P0-P2 after any mutation: pooled servers must be
    /// enabled and ready; an up+enabled+ready server can only stay unpooled
    /// due to a safety-threshold block, which the coordinator applies
    /// separately -- this only ever clamps `pooled` downward.
    fn enforce_invariants(&mut self) {
        if self.pooled && !(self.enabled && self.ready) {
            self.pooled = false;
        }
    }
}
