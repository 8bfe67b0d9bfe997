// src/core/configsource/etcd.rs

//! etcd-backed config source (`etcd://host[:port]/key`): long-polls the v2
//! keys API, tracking `waitIndex` across changes, and translates each node's
//! `pooled` field into the `enabled` flag.

use super::{pooled_to_enabled, ConfigSource};
use crate::core::coordinator::DesiredServer;
use crate::core::errors::ControlPlaneError;
use crate::core::kernel::parse_fwmethod;
use serde::Deserialize;
use std::collections::HashMap;
use url::Url;

const DEFAULT_ETCD_PORT: u16 = 2379;

#[derive(Debug, Clone, Default)]
struct EtcdEntry {
    weight: Option<u32>,
    enabled: Option<bool>,
    fwmethod: Option<String>,
}

impl EtcdEntry {
    fn into_desired(self, host: String) -> DesiredServer {
        DesiredServer {
            host,
            weight: self.weight.unwrap_or(10),
            enabled: self.enabled.unwrap_or(true),
            fwmethod: self.fwmethod.as_deref().map(parse_fwmethod).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EtcdNodeValue {
    pooled: Option<String>,
    weight: Option<u32>,
    fwmethod: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EtcdNode {
    key: String,
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
    #[serde(rename = "modifiedIndex")]
    modified_index: u64,
}

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    action: String,
    node: EtcdNode,
}

pub struct EtcdConfigSource {
    base_url: String,
    key: String,
    client: reqwest::Client,
    wait_index: Option<u64>,
    state: HashMap<String, EtcdEntry>,
}

impl EtcdConfigSource {
    pub fn new(url: Url) -> Result<Self, ControlPlaneError> {
        let host = url
            .host_str()
            .ok_or_else(|| ControlPlaneError::ConfigSource("etcd URL missing host".into()))?;
        let port = url.port().unwrap_or(DEFAULT_ETCD_PORT);
        let key = url.path().trim_start_matches('/').to_string();
        Ok(Self {
            base_url: format!("http://{host}:{port}"),
            key,
            client: reqwest::Client::new(),
            wait_index: None,
            state: HashMap::new(),
        })
    }

    fn host_from_key(&self, node_key: &str) -> String {
        node_key.rsplit('/').next().unwrap_or(node_key).to_string()
    }

    fn apply_node(&mut self, node: &EtcdNode, deleted: bool) {
        if node.dir {
            for child in &node.nodes {
                self.apply_node(child, deleted);
            }
            return;
        }
        let host = self.host_from_key(&node.key);
        if deleted {
            self.state.remove(&host);
            return;
        }
        let Some(raw_value) = node.value.as_deref() else {
            return;
        };
        let parsed: EtcdNodeValue = match serde_json::from_str(raw_value) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(host, error = %e, "invalid etcd node value, skipping");
                return;
            }
        };
        let Some(pooled) = parsed.pooled.as_deref() else {
            return;
        };
        match pooled_to_enabled(pooled) {
            Some(enabled) => {
                self.state.insert(
                    host,
                    EtcdEntry { weight: parsed.weight, enabled: Some(enabled), fwmethod: parsed.fwmethod },
                );
            }
            None => {
                self.state.remove(&host);
            }
        }
    }

    fn snapshot(&self) -> Vec<DesiredServer> {
        self.state
            .iter()
            .map(|(host, entry)| entry.clone().into_desired(host.clone()))
            .collect()
    }

    fn max_modified_index(node: &EtcdNode) -> u64 {
        let mut max = node.modified_index;
        for child in &node.nodes {
            max = max.max(Self::max_modified_index(child));
        }
        max
    }
}

#[async_trait::async_trait]
impl ConfigSource for EtcdConfigSource {
    async fn next(&mut self) -> Result<Vec<DesiredServer>, ControlPlaneError> {
        let url = match self.wait_index {
            None => format!("{}/v2/keys/{}?recursive=true", self.base_url, self.key),
            Some(idx) => format!(
                "{}/v2/keys/{}?recursive=true&wait=true&waitIndex={}",
                self.base_url,
                self.key,
                idx + 1
            ),
        };

        let response = self.client.get(&url).send().await?;
        let etcd_index = response
            .headers()
            .get("X-Etcd-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        let body: EtcdResponse = response.json().await.map_err(|e| ControlPlaneError::HttpClient(e.to_string()))?;

        let deleted = matches!(body.action.as_str(), "delete" | "expire");
        self.apply_node(&body.node, deleted);

        self.wait_index = Some(match self.wait_index {
            None => etcd_index.unwrap_or_else(|| Self::max_modified_index(&body.node)),
            Some(_) => Self::max_modified_index(&body.node),
        });

        Ok(self.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> EtcdConfigSource {
        EtcdConfigSource::new(Url::parse("etcd://localhost:2379/lbpools/web").unwrap()).unwrap()
    }

    #[test]
    fn host_derived_from_trailing_key_segment() {
        let s = source();
        assert_eq!(s.host_from_key("/lbpools/web/10.0.0.1"), "10.0.0.1");
    }

    #[test]
    fn apply_node_inserts_pooled_yes_as_enabled() {
        let mut s = source();
        let node = EtcdNode {
            key: "/lbpools/web/10.0.0.1".into(),
            value: Some(r#"{"pooled": "yes", "weight": 20}"#.into()),
            dir: false,
            nodes: vec![],
            modified_index: 7,
        };
        s.apply_node(&node, false);
        let snapshot = s.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].enabled);
        assert_eq!(snapshot[0].weight, 20);
    }

    #[test]
    fn apply_node_drops_inactive_entries() {
        let mut s = source();
        let node = EtcdNode {
            key: "/lbpools/web/10.0.0.1".into(),
            value: Some(r#"{"pooled": "inactive"}"#.into()),
            dir: false,
            nodes: vec![],
            modified_index: 7,
        };
        s.apply_node(&node, false);
        assert!(s.snapshot().is_empty());
    }

    #[test]
    fn delete_action_removes_host_from_state() {
        let mut s = source();
        s.state.insert("10.0.0.1".into(), EtcdEntry { weight: None, enabled: Some(true), fwmethod: None });
        let node = EtcdNode {
            key: "/lbpools/web/10.0.0.1".into(),
            value: None,
            dir: false,
            nodes: vec![],
            modified_index: 8,
        };
        s.apply_node(&node, true);
        assert!(s.snapshot().is_empty());
    }
}
