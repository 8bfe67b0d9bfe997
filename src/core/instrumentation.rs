// src/core/instrumentation.rs

//! Read-only HTTP instrumentation surface (C9). No authentication: the
//! caller is responsible for restricting reachability via network ACLs.

use crate::core::coordinator::{CoordinatorCommand, ServerSnapshot};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

#[derive(Clone)]
pub struct InstrumentationState {
    pub coordinators: Arc<HashMap<String, mpsc::Sender<CoordinatorCommand>>>,
}

pub fn router(state: InstrumentationState) -> Router {
    Router::new()
        .route("/pools", get(list_pools))
        .route("/pools/{pool}", get(pool_servers))
        .route("/pools/{pool}/{host}", get(pool_server))
        .route("/alerts", get(alerts))
        .with_state(state)
}

#[derive(Serialize)]
struct ServerView {
    pooled: bool,
    weight: u32,
    up: bool,
    enabled: bool,
}

impl From<&ServerSnapshot> for ServerView {
    fn from(s: &ServerSnapshot) -> Self {
        Self { pooled: s.pooled, weight: s.weight, up: s.up, enabled: s.enabled }
    }
}

async fn snapshot(tx: &mpsc::Sender<CoordinatorCommand>) -> Option<Vec<ServerSnapshot>> {
    let (reply, rx) = oneshot::channel();
    tx.send(CoordinatorCommand::Snapshot { reply }).await.ok()?;
    rx.await.ok()
}

fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/json"))
        .unwrap_or(false)
}

async fn list_pools(State(state): State<InstrumentationState>, headers: HeaderMap) -> Response {
    let mut names: Vec<&String> = state.coordinators.keys().collect();
    names.sort();
    if wants_json(&headers) {
        axum::Json(names).into_response()
    } else {
        names.iter().map(|n| n.as_str()).collect::<Vec<_>>().join("\n").into_response()
    }
}

async fn pool_servers(
    State(state): State<InstrumentationState>,
    Path(pool): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(tx) = state.coordinators.get(&pool) else {
        return (StatusCode::NOT_FOUND, format!("no such pool: {pool}")).into_response();
    };
    let Some(servers) = snapshot(tx).await else {
        return (StatusCode::SERVICE_UNAVAILABLE, "coordinator unreachable").into_response();
    };

    if wants_json(&headers) {
        let map: HashMap<String, ServerView> = servers.iter().map(|s| (s.host.clone(), s.into())).collect();
        axum::Json(map).into_response()
    } else {
        servers
            .iter()
            .map(|s| format!("{} pooled={} weight={} up={} enabled={}", s.host, s.pooled, s.weight, s.up, s.enabled))
            .collect::<Vec<_>>()
            .join("\n")
            .into_response()
    }
}

async fn pool_server(
    State(state): State<InstrumentationState>,
    Path((pool, host)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let Some(tx) = state.coordinators.get(&pool) else {
        return (StatusCode::NOT_FOUND, format!("no such pool: {pool}")).into_response();
    };
    let Some(servers) = snapshot(tx).await else {
        return (StatusCode::SERVICE_UNAVAILABLE, "coordinator unreachable").into_response();
    };
    let Some(server) = servers.iter().find(|s| s.host == host) else {
        return (StatusCode::NOT_FOUND, format!("no such server: {host}")).into_response();
    };

    if wants_json(&headers) {
        axum::Json(ServerView::from(server)).into_response()
    } else {
        format!(
            "{} pooled={} weight={} up={} enabled={}",
            server.host, server.pooled, server.weight, server.up, server.enabled
        )
        .into_response()
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum AlertLevel {
    Ok,
    Warning,
    Critical,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertLevel::Ok => write!(f, "ok"),
            AlertLevel::Warning => write!(f, "warning"),
            AlertLevel::Critical => write!(f, "critical"),
        }
    }
}

/// `critical` if any pool has a pooled-but-down server; else `warning` if any
/// pool is too small to ever satisfy a depool (every server already down and
/// none can safely leave); else `ok`.
fn rollup(servers: &[ServerSnapshot]) -> AlertLevel {
    let has_pooled_down = servers.iter().any(|s| s.pooled && !s.up);
    if has_pooled_down {
        return AlertLevel::Critical;
    }
    let has_down = servers.iter().any(|s| !s.up);
    if has_down {
        AlertLevel::Warning
    } else {
        AlertLevel::Ok
    }
}

async fn alerts(State(state): State<InstrumentationState>, headers: HeaderMap) -> Response {
    let mut overall = AlertLevel::Ok;
    let mut per_pool = HashMap::new();
    for (name, tx) in state.coordinators.iter() {
        let Some(servers) = snapshot(tx).await else { continue };
        let level = rollup(&servers);
        if level as u8 > overall as u8 {
            overall = level;
        }
        per_pool.insert(name.clone(), level.to_string());
    }

    if wants_json(&headers) {
        #[derive(Serialize)]
        struct AlertsBody {
            overall: String,
            pools: HashMap<String, String>,
        }
        axum::Json(AlertsBody { overall: overall.to_string(), pools: per_pool }).into_response()
    } else {
        overall.to_string().into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(pooled: bool, up: bool) -> ServerSnapshot {
        ServerSnapshot {
            host: "h".into(),
            ip: None,
            weight: 10,
            enabled: true,
            ready: true,
            up,
            pooled,
        }
    }

    #[test]
    fn all_up_is_ok() {
        assert_eq!(rollup(&[snapshot(true, true), snapshot(true, true)]), AlertLevel::Ok);
    }

    #[test]
    fn pooled_and_down_is_critical() {
        assert_eq!(rollup(&[snapshot(true, false)]), AlertLevel::Critical);
    }

    #[test]
    fn down_but_unpooled_is_warning() {
        assert_eq!(rollup(&[snapshot(false, false), snapshot(true, true)]), AlertLevel::Warning);
    }
}
