// src/core/configsource/file.rs

//! File-backed config source (`file://`): polls at a fixed cadence and only
//! re-reads when the file's stat value (mtime + size) changes.

use super::{parse_entries, ConfigSource};
use crate::core::coordinator::DesiredServer;
use crate::core::errors::ControlPlaneError;
use std::time::Duration;
use tokio::time::sleep;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct StatKey {
    mtime_secs: i64,
    mtime_nanos: u32,
    size: u64,
}

pub struct FileConfigSource {
    path: String,
    last_stat: Option<StatKey>,
}

impl FileConfigSource {
    pub fn new(path: String) -> Self {
        Self { path, last_stat: None }
    }

    fn stat_key(metadata: &std::fs::Metadata) -> StatKey {
        let mtime = metadata.modified().ok();
        let (secs, nanos) = mtime
            .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| (d.as_secs() as i64, d.subsec_nanos()))
            .unwrap_or((0, 0));
        StatKey {
            mtime_secs: secs,
            mtime_nanos: nanos,
            size: metadata.len(),
        }
    }
}

#[async_trait::async_trait]
impl ConfigSource for FileConfigSource {
    async fn next(&mut self) -> Result<Vec<DesiredServer>, ControlPlaneError> {
        loop {
            sleep(POLL_INTERVAL).await;
            let metadata = match std::fs::metadata(&self.path) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(path = %self.path, error = %e, "config file stat failed, retrying");
                    continue;
                }
            };
            let stat = Self::stat_key(&metadata);
            if self.last_stat == Some(stat) {
                continue;
            }
            self.last_stat = Some(stat);

            let body = std::fs::read_to_string(&self.path)
                .map_err(|e| ControlPlaneError::ConfigSource(format!("reading '{}': {e}", self.path)))?;
            let is_json = self.path.ends_with(".json");
            let entries = parse_entries(&body, is_json);
            return Ok(entries.into_iter().map(|e| e.into_desired()).collect());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn reads_initial_content_once_changed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{host: "a.example.com", weight: 10}}"#).unwrap();
        let mut source = FileConfigSource::new(file.path().to_str().unwrap().to_string());
        let desired = source.next().await.unwrap();
        assert_eq!(desired.len(), 1);
        assert_eq!(desired[0].host, "a.example.com");
    }

    #[tokio::test]
    async fn json_extension_selects_json_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.json");
        std::fs::write(&path, r#"[{"host": "a", "weight": 5}]"#).unwrap();
        let mut source = FileConfigSource::new(path.to_str().unwrap().to_string());
        let desired = source.next().await.unwrap();
        assert_eq!(desired[0].host, "a");
    }
}
