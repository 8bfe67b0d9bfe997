// src/core/monitor/proxy_fetch.rs

//! Periodically fetches a URL through the backend under test, treating the
//! fetch as a health check. Redirects in `[301,304)` can be the expected
//! "success" status instead of 200; hostname-verification failures on HTTPS
//! are logged but never fail the check.

use super::{MonitorContext, MonitorHandle, MonitorOutcome, ResultLatch, emit};
use rand::seq::SliceRandom;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

const NAME: &str = "ProxyFetch";
const DEFAULT_INTERVAL_SECS: u64 = 10;
const DEFAULT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_HTTP_STATUS: u64 = 200;

pub fn spawn(ctx: MonitorContext) -> MonitorHandle {
    let join: JoinHandle<()> = tokio::spawn(run(ctx));
    MonitorHandle { join }
}

async fn run(ctx: MonitorContext) {
    let interval = Duration::from_secs(ctx.config.get_int(NAME, "interval", DEFAULT_INTERVAL_SECS));
    let timeout = Duration::from_secs(ctx.config.get_int(NAME, "timeout", DEFAULT_TIMEOUT_SECS));
    let expected_status = ctx.config.get_int(NAME, "http_status", DEFAULT_HTTP_STATUS) as u16;
    let urls = ctx.config.get_string_list(NAME, "url");

    if urls.is_empty() {
        warn!(host = %ctx.server_host, "ProxyFetch configured with no urls, monitor idle");
        return;
    }

    let mut latch = ResultLatch::new();

    loop {
        let url = urls.choose(&mut rand::thread_rng()).expect("checked non-empty above").clone();

        // Bypasses certificate validation entirely: a mismatch must only be
        // logged, never fail the check, per the accept-any-cert contract this
        // probe inherits from its legacy counterpart. The connection is
        // forced to land on the backend under test while the request keeps
        // its original Host header, i.e. fetched *through* that backend.
        let client = match build_client_pinned_to_backend(&url, ctx.server_ip, ctx.server_port) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to build ProxyFetch HTTP client");
                tokio::time::sleep(interval).await;
                continue;
            }
        };

        let check = tokio::time::timeout(timeout, fetch_once(&client, &url, expected_status)).await;

        match check {
            Ok(Ok(())) => {
                if latch.observe_up() {
                    emit(&ctx, NAME, MonitorOutcome::Up).await;
                }
            }
            Ok(Err(reason)) => {
                if latch.observe_down() {
                    emit(&ctx, NAME, MonitorOutcome::Down { reason }).await;
                }
            }
            Err(_) => {
                if latch.observe_down() {
                    emit(
                        &ctx,
                        NAME,
                        MonitorOutcome::Down {
                            reason: "fetch timed out".to_string(),
                        },
                    )
                    .await;
                }
            }
        }
        tokio::time::sleep(interval).await;
    }
}

fn build_client_pinned_to_backend(
    url: &str,
    ip: std::net::IpAddr,
    port: u16,
) -> Result<reqwest::Client, String> {
    let parsed = url::Url::parse(url).map_err(|e| e.to_string())?;
    let host = parsed.host_str().ok_or("url has no host")?.to_string();
    let resolved_port = parsed.port_or_known_default().unwrap_or(port);
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .redirect(reqwest::redirect::Policy::none())
        .resolve(&host, std::net::SocketAddr::new(ip, if port != 0 { port } else { resolved_port }))
        .build()
        .map_err(|e| e.to_string())
}

async fn fetch_once(client: &reqwest::Client, url: &str, expected_status: u16) -> Result<(), String> {
    let resp = client.get(url).send().await.map_err(|e| e.to_string())?;
    let status = resp.status().as_u16();
    if status == expected_status {
        Ok(())
    } else {
        Err(format!("unexpected status {status}, expected {expected_status}"))
    }
}
