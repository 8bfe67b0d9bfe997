// src/config.rs

//! Loads and validates the daemon's TOML configuration: one `[global]` table
//! plus one `[services.<name>]` table per service. A service configured with
//! a comma-separated `ip` list is expanded at load time into N sibling
//! services, each suffixed `_<index>` (0-based beyond the first).

use crate::core::kernel::{FwMethod, Protocol, Scheduler};
use crate::core::monitor::MonitorConfig;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use tracing::warn;

fn default_scheduler() -> String {
    "wrr".to_string()
}
fn default_depool_threshold() -> f64 {
    0.5
}
fn default_stop_monitors_when_disabled() -> bool {
    true
}
fn default_bgp_as_path() -> Vec<u32> {
    vec![]
}
fn default_instrumentation_bind() -> String {
    "127.0.0.1:9091".to_string()
}
fn default_fwmethod() -> String {
    "gate".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct RawGlobalConfig {
    #[serde(default)]
    kernel_tool_path: Option<String>,
    #[serde(default)]
    pid_file: Option<String>,
    #[serde(default)]
    bgp_local_asn: Option<u32>,
    #[serde(default)]
    bgp_local_bgp_id: Option<Ipv4Addr>,
    #[serde(default)]
    bgp_peer_addresses: Vec<IpAddr>,
    #[serde(default = "default_bgp_as_path")]
    bgp_as_path: Vec<u32>,
    #[serde(default)]
    bgp_nexthop_ipv4: Option<Ipv4Addr>,
    #[serde(default)]
    bgp_nexthop_ipv6: Option<Ipv6Addr>,
    #[serde(default)]
    bgp_med: Option<u32>,
    #[serde(default)]
    instrumentation_enabled: bool,
    #[serde(default = "default_instrumentation_bind")]
    instrumentation_bind: String,
}

impl Default for RawGlobalConfig {
    fn default() -> Self {
        Self {
            kernel_tool_path: None,
            pid_file: None,
            bgp_local_asn: None,
            bgp_local_bgp_id: None,
            bgp_peer_addresses: vec![],
            bgp_as_path: default_bgp_as_path(),
            bgp_nexthop_ipv4: None,
            bgp_nexthop_ipv6: None,
            bgp_med: None,
            instrumentation_enabled: false,
            instrumentation_bind: default_instrumentation_bind(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawServiceConfig {
    protocol: String,
    ip: String,
    port: u16,
    #[serde(default = "default_scheduler")]
    scheduler: String,
    config: String,
    #[serde(default)]
    monitors: Vec<String>,
    #[serde(default)]
    dryrun: bool,
    #[serde(default)]
    debug: bool,
    #[serde(default)]
    bgp: bool,
    #[serde(default = "default_depool_threshold")]
    depool_threshold: f64,
    #[serde(default)]
    persistent: bool,
    #[serde(default = "default_stop_monitors_when_disabled")]
    stop_monitors_when_disabled: bool,
    #[serde(default = "default_fwmethod")]
    fwmethod: String,
    #[serde(default)]
    weight: Option<u32>,
    /// Per-monitor option sub-tables, e.g. `[services.web.idleconnection]`.
    /// Anything not a recognized field above lands here.
    #[serde(flatten)]
    monitor_tables: HashMap<String, toml::Value>,
}

#[derive(Debug, Deserialize)]
struct RawDaemonConfig {
    #[serde(default)]
    global: RawGlobalConfig,
    #[serde(default)]
    services: HashMap<String, RawServiceConfig>,
}

/// One fully resolved service, after `ip` comma-splitting and field validation.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub protocol: Protocol,
    pub vip: IpAddr,
    pub port: u16,
    pub scheduler: Scheduler,
    pub pool_source_url: String,
    pub monitors: Vec<String>,
    pub monitor_config: MonitorConfig,
    pub dry_run: bool,
    pub debug: bool,
    pub bgp: bool,
    pub depool_threshold: f64,
    pub persistent: bool,
    pub stop_monitors_when_disabled: bool,
    pub default_fwmethod: FwMethod,
    pub default_weight: u32,
}

#[derive(Debug, Clone)]
pub struct BgpConfig {
    pub local_asn: u32,
    pub local_bgp_id: Ipv4Addr,
    pub peer_addresses: Vec<IpAddr>,
    pub as_path: Vec<u32>,
    pub nexthop_ipv4: Option<Ipv4Addr>,
    pub nexthop_ipv6: Option<Ipv6Addr>,
    pub med: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub kernel_tool_path: String,
    pub pid_file: Option<String>,
    pub bgp: Option<BgpConfig>,
    pub instrumentation_enabled: bool,
    pub instrumentation_bind: String,
    pub services: Vec<ServiceConfig>,
}

impl DaemonConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at '{path}'"))?;
        let raw: RawDaemonConfig =
            toml::from_str(&contents).with_context(|| format!("failed to parse TOML from '{path}'"))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawDaemonConfig) -> Result<Self> {
        let bgp = if raw.services.values().any(|s| s.bgp) {
            let local_asn = raw
                .global
                .bgp_local_asn
                .ok_or_else(|| anyhow!("bgp_local_asn is required when any service has bgp = true"))?;
            let local_bgp_id = raw
                .global
                .bgp_local_bgp_id
                .ok_or_else(|| anyhow!("bgp_local_bgp_id is required when any service has bgp = true"))?;
            Some(BgpConfig {
                local_asn,
                local_bgp_id,
                peer_addresses: raw.global.bgp_peer_addresses.clone(),
                as_path: raw.global.bgp_as_path.clone(),
                nexthop_ipv4: raw.global.bgp_nexthop_ipv4,
                nexthop_ipv6: raw.global.bgp_nexthop_ipv6,
                med: raw.global.bgp_med,
            })
        } else {
            None
        };

        let mut services = Vec::new();
        for (name, raw_service) in raw.services {
            services.extend(expand_service(&name, raw_service)?);
        }
        services.sort_by(|a, b| a.name.cmp(&b.name));

        let config = DaemonConfig {
            kernel_tool_path: raw.global.kernel_tool_path.unwrap_or_else(|| "ipvsadm".to_string()),
            pid_file: raw.global.pid_file,
            bgp,
            instrumentation_enabled: raw.global.instrumentation_enabled,
            instrumentation_bind: raw.global.instrumentation_bind,
            services,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.services.is_empty() {
            return Err(anyhow!("no services configured"));
        }
        for service in &self.services {
            if service.port == 0 {
                return Err(anyhow!("service '{}': port cannot be 0", service.name));
            }
            if !(0.0..=1.0).contains(&service.depool_threshold) {
                return Err(anyhow!(
                    "service '{}': depool_threshold must be between 0.0 and 1.0",
                    service.name
                ));
            }
            if service.bgp && self.bgp.is_none() {
                return Err(anyhow!("service '{}': bgp enabled but no [global] BGP config present", service.name));
            }
        }
        Ok(())
    }
}

/// Splits a comma-separated `ip` field into one `ServiceConfig` per address,
/// naming the first `<name>` and the rest `<name>_<index>` (1-based), per the
/// legacy ini loader's `ip` comma-split behavior.
fn expand_service(name: &str, raw: RawServiceConfig) -> Result<Vec<ServiceConfig>> {
    let protocol = Protocol::from_str(&raw.protocol.to_ascii_lowercase())
        .map_err(|_| anyhow!("service '{name}': invalid protocol '{}'", raw.protocol))?;
    let scheduler = Scheduler::from_str(&raw.scheduler.to_ascii_lowercase())
        .map_err(|_| anyhow!("service '{name}': invalid scheduler '{}'", raw.scheduler))?;
    let default_fwmethod = crate::core::kernel::parse_fwmethod(&raw.fwmethod);

    let ips: Vec<&str> = raw.ip.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
    if ips.is_empty() {
        return Err(anyhow!("service '{name}': ip field is empty"));
    }

    let monitor_config = build_monitor_config(&raw.monitor_tables);

    let mut services = Vec::with_capacity(ips.len());
    for (i, ip_str) in ips.iter().enumerate() {
        let vip: IpAddr = ip_str
            .parse()
            .with_context(|| format!("service '{name}': invalid ip literal '{ip_str}'"))?;
        let service_name = if i == 0 { name.to_string() } else { format!("{name}_{i}") };
        services.push(ServiceConfig {
            name: service_name,
            protocol,
            vip,
            port: raw.port,
            scheduler,
            pool_source_url: raw.config.clone(),
            monitors: raw.monitors.clone(),
            monitor_config: monitor_config.clone(),
            dry_run: raw.dryrun,
            debug: raw.debug,
            bgp: raw.bgp,
            depool_threshold: raw.depool_threshold,
            persistent: raw.persistent,
            stop_monitors_when_disabled: raw.stop_monitors_when_disabled,
            default_fwmethod,
            default_weight: raw.weight.unwrap_or(10),
        });
    }
    Ok(services)
}

/// Flattens `{monitorname: {option: value, ...}, ...}` sub-tables into the
/// `<lowercased-monitor-name>.<option>` string map `MonitorConfig` expects.
fn build_monitor_config(tables: &HashMap<String, toml::Value>) -> MonitorConfig {
    let mut flat = HashMap::new();
    for (monitor_name, value) in tables {
        let toml::Value::Table(options) = value else {
            continue;
        };
        for (option, option_value) in options {
            let key = format!("{}.{}", monitor_name.to_ascii_lowercase(), option);
            let value_str = match option_value {
                toml::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            flat.insert(key, value_str);
        }
    }
    MonitorConfig(flat)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml() -> &'static str {
        r#"
[global]
bgp_local_asn = 65000
bgp_local_bgp_id = "10.0.0.1"
bgp_peer_addresses = ["10.0.0.2"]
instrumentation_enabled = true

[services.web]
protocol = "tcp"
ip = "192.0.2.1,192.0.2.2"
port = 80
scheduler = "wrr"
config = "file:///etc/lb/web.json"
monitors = ["IdleConnection"]
bgp = true
depool_threshold = 0.6

[services.web.idleconnection]
interval = 15
active = true
"#
    }

    #[test]
    fn comma_separated_ip_expands_into_sibling_services() {
        let raw: RawDaemonConfig = toml::from_str(sample_toml()).unwrap();
        let config = DaemonConfig::from_raw(raw).unwrap();
        let names: Vec<&str> = config.services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["web", "web_1"]);
    }

    #[test]
    fn monitor_suboptions_are_flattened_with_lowercased_name() {
        let raw: RawDaemonConfig = toml::from_str(sample_toml()).unwrap();
        let config = DaemonConfig::from_raw(raw).unwrap();
        let mc = &config.services[0].monitor_config;
        assert_eq!(mc.get_int("IdleConnection", "interval", 0), 15);
        assert!(mc.get_bool("IdleConnection", "active", false));
    }

    #[test]
    fn bgp_required_fields_enforced_when_any_service_enables_bgp() {
        let mut raw: RawDaemonConfig = toml::from_str(sample_toml()).unwrap();
        raw.global.bgp_local_asn = None;
        let err = DaemonConfig::from_raw(raw).unwrap_err();
        assert!(err.to_string().contains("bgp_local_asn"));
    }

    #[test]
    fn invalid_depool_threshold_is_rejected() {
        let mut raw: RawDaemonConfig = toml::from_str(sample_toml()).unwrap();
        raw.services.get_mut("web").unwrap().depool_threshold = 1.5;
        assert!(DaemonConfig::from_raw(raw).is_err());
    }
}
