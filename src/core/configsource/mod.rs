// src/core/configsource/mod.rs

//! Configuration-event ingress (C8): three source schemes share one event
//! contract -- emit a complete desired-state map whenever the underlying
//! source changes -- so `Coordinator::on_config_update` never needs to know
//! which scheme produced it.

pub mod etcd;
pub mod file;
pub mod http;

use crate::core::coordinator::DesiredServer;
use crate::core::errors::ControlPlaneError;
use crate::core::kernel::parse_fwmethod;
use std::collections::HashMap;
use url::Url;

/// One raw entry as read off the wire, before it is turned into a
/// [`DesiredServer`]. `host` is mandatory; everything else defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawEntry {
    pub host: String,
    pub weight: Option<u32>,
    pub enabled: Option<bool>,
    pub fwmethod: Option<String>,
}

impl RawEntry {
    pub fn into_desired(self) -> DesiredServer {
        DesiredServer {
            host: self.host,
            weight: self.weight.unwrap_or(10),
            enabled: self.enabled.unwrap_or(true),
            fwmethod: self.fwmethod.as_deref().map(parse_fwmethod).unwrap_or_default(),
        }
    }
}

/// A config source delivers a full desired-state snapshot on every change;
/// the coordinator replaces its server set atomically per delivery.
#[async_trait::async_trait]
pub trait ConfigSource: Send + Sync {
    /// Blocks until the next change is available (or the source's poll/long-poll
    /// interval elapses with no change, in which case it loops internally) and
    /// returns the new full desired-state snapshot.
    async fn next(&mut self) -> Result<Vec<DesiredServer>, ControlPlaneError>;
}

/// Scheme-dispatch factory: `file://`, `http://`/`https://`, `etcd://`.
pub fn from_url(raw: &str) -> Result<Box<dyn ConfigSource>, ControlPlaneError> {
    let url = Url::parse(raw).map_err(|e| ControlPlaneError::ConfigSource(format!("invalid URL '{raw}': {e}")))?;
    match url.scheme() {
        "file" => Ok(Box::new(file::FileConfigSource::new(url.path().to_string()))),
        "http" | "https" => Ok(Box::new(http::HttpConfigSource::new(raw.to_string()))),
        "etcd" => Ok(Box::new(etcd::EtcdConfigSource::new(url)?)),
        other => Err(ControlPlaneError::ConfigSource(format!("unsupported config source scheme '{other}'"))),
    }
}

/// Parses either a `.json` array of objects or the hand-rolled mapping-literal
/// format (one `{key: value, ...}` per non-blank, non-comment line), selecting
/// by whether `is_json` is set. Invalid lines/entries are logged and skipped;
/// the caller still gets every entry that did parse.
pub fn parse_entries(body: &str, is_json: bool) -> Vec<RawEntry> {
    if is_json {
        parse_json_entries(body)
    } else {
        body.lines().filter_map(parse_mapping_line).collect()
    }
}

fn parse_json_entries(body: &str) -> Vec<RawEntry> {
    match serde_json::from_str::<Vec<HashMap<String, serde_json::Value>>>(body) {
        Ok(rows) => rows.into_iter().filter_map(raw_entry_from_map).collect(),
        Err(e) => {
            tracing::warn!(error = %e, "invalid JSON config body, skipping");
            vec![]
        }
    }
}

fn raw_entry_from_map(map: HashMap<String, serde_json::Value>) -> Option<RawEntry> {
    let host = map.get("host")?.as_str()?.to_string();
    Some(RawEntry {
        host,
        weight: map.get("weight").and_then(|v| v.as_u64()).map(|w| w as u32),
        enabled: map.get("enabled").and_then(|v| v.as_bool()),
        fwmethod: map.get("fwmethod").and_then(|v| v.as_str()).map(str::to_string),
    })
}

/// Parses one `{host: "a.example.com", weight: 10, enabled: true}`-style line.
/// This is deliberately not a general-purpose parser: only `host` (string),
/// `weight` (integer), `enabled` (bool), `fwmethod` (string) are recognized;
/// anything else in the braces is ignored, and a malformed line returns `None`
/// rather than aborting the whole batch.
fn parse_mapping_line(line: &str) -> Option<RawEntry> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let inner = line.strip_prefix('{')?.strip_suffix('}')?;

    let mut entry = RawEntry::default();
    let mut found_host = false;
    for field in split_top_level_commas(inner) {
        let Some((key, value)) = field.split_once(':') else { continue };
        let key = key.trim().trim_matches(['"', '\'']);
        let value = value.trim();
        match key {
            "host" => {
                entry.host = unquote(value);
                found_host = true;
            }
            "weight" => entry.weight = value.parse().ok(),
            "enabled" => entry.enabled = parse_bool_literal(value),
            "fwmethod" => entry.fwmethod = Some(unquote(value)),
            _ => {}
        }
    }

    if !found_host || entry.host.is_empty() {
        tracing::warn!(line, "config entry missing mandatory 'host' key, skipping");
        return None;
    }
    Some(entry)
}

fn split_top_level_commas(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    let mut in_quotes = false;
    for c in s.chars() {
        match c {
            '"' | '\'' if !in_quotes => {
                in_quotes = true;
                current.push(c);
            }
            '"' | '\'' if in_quotes => {
                in_quotes = false;
                current.push(c);
            }
            '{' | '[' if !in_quotes => {
                depth += 1;
                current.push(c);
            }
            '}' | ']' if !in_quotes => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 && !in_quotes => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts
}

fn unquote(value: &str) -> String {
    value.trim_matches(['"', '\'']).to_string()
}

fn parse_bool_literal(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" => Some(true),
        "false" | "no" => Some(false),
        _ => None,
    }
}

/// Translates an etcd `pooled` tri-state into the `enabled` flag, or `None`
/// to signal the entry should be dropped from the desired set entirely.
pub fn pooled_to_enabled(pooled: &str) -> Option<bool> {
    match pooled {
        "yes" => Some(true),
        "no" => Some(false),
        "inactive" => None,
        other => {
            tracing::warn!(pooled = other, "unrecognized 'pooled' value, dropping entry");
            None
        }
    }
}
