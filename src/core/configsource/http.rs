// src/core/configsource/http.rs

//! HTTP-backed config source (`http://`, `https://`): polls on a timer and
//! parses the response body with the same rules as the file source.

use super::{parse_entries, ConfigSource};
use crate::core::coordinator::DesiredServer;
use crate::core::errors::ControlPlaneError;
use std::time::Duration;
use tokio::time::sleep;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct HttpConfigSource {
    url: String,
    client: reqwest::Client,
}

impl HttpConfigSource {
    pub fn new(url: String) -> Self {
        Self { url, client: reqwest::Client::new() }
    }
}

#[async_trait::async_trait]
impl ConfigSource for HttpConfigSource {
    async fn next(&mut self) -> Result<Vec<DesiredServer>, ControlPlaneError> {
        loop {
            let response = self.client.get(&self.url).send().await;
            match response {
                Ok(resp) if resp.status().is_success() => {
                    let content_type = resp
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    let body = resp.text().await?;
                    let is_json = content_type.contains("json") || self.url.ends_with(".json");
                    let entries = parse_entries(&body, is_json);
                    return Ok(entries.into_iter().map(|e| e.into_desired()).collect());
                }
                Ok(resp) => {
                    tracing::warn!(url = %self.url, status = %resp.status(), "config HTTP source returned non-success, retrying");
                }
                Err(e) => {
                    tracing::warn!(url = %self.url, error = %e, "config HTTP source unreachable, retrying");
                }
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_detection_from_url_suffix() {
        let source = HttpConfigSource::new("http://example.com/pool.json".into());
        assert!(source.url.ends_with(".json"));
    }
}
