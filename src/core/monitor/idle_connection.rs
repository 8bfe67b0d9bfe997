// src/core/monitor/idle_connection.rs

//! Keeps an idle TCP connection open to a backend. A clean close (the peer's
//! idle timeout) triggers a fast reconnect; anything else means down,
//! followed by a slow, exponentially-backed-off reconnect attempt.

use super::{MonitorContext, MonitorHandle, MonitorOutcome, ResultLatch, emit};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;

const NAME: &str = "IdleConnection";
const DEFAULT_TIMEOUT_CLEAN_RECONNECT_SECS: u64 = 3;
const DEFAULT_BACKOFF_INITIAL_SECS: u64 = 1;
const DEFAULT_BACKOFF_MAX_SECS: u64 = 60;

pub fn spawn(ctx: MonitorContext) -> MonitorHandle {
    let join: JoinHandle<()> = tokio::spawn(run(ctx));
    MonitorHandle { join }
}

async fn run(ctx: MonitorContext) {
    let clean_reconnect_timeout = Duration::from_secs(
        ctx.config
            .get_int(NAME, "timeout-clean-reconnect", DEFAULT_TIMEOUT_CLEAN_RECONNECT_SECS),
    );
    let backoff_max = Duration::from_secs(
        ctx.config.get_int(NAME, "max-backoff", DEFAULT_BACKOFF_MAX_SECS),
    );

    let mut latch = ResultLatch::new();
    let mut backoff = Duration::from_secs(DEFAULT_BACKOFF_INITIAL_SECS);
    let mut fast_reconnect = false;

    loop {
        let attempt_timeout = if fast_reconnect {
            clean_reconnect_timeout
        } else {
            Duration::from_secs(30)
        };

        let connect_result =
            tokio::time::timeout(attempt_timeout, TcpStream::connect((ctx.server_ip, ctx.server_port))).await;

        match connect_result {
            Ok(Ok(stream)) => {
                if latch.observe_up() {
                    emit(&ctx, NAME, MonitorOutcome::Up).await;
                }
                backoff = Duration::from_secs(DEFAULT_BACKOFF_INITIAL_SECS);
                fast_reconnect = false;

                // Hold the connection open and watch for the peer closing it.
                // A clean close (EOF with no error) means we should try a
                // fast reconnect; any read error means an unclean close.
                let clean_close = wait_for_close(stream).await;
                if clean_close {
                    debug!(host = %ctx.server_host, "idle connection closed cleanly, fast-reconnecting");
                    fast_reconnect = true;
                    continue;
                } else {
                    if latch.observe_down() {
                        emit(
                            &ctx,
                            NAME,
                            MonitorOutcome::Down {
                                reason: "connection reset".to_string(),
                            },
                        )
                        .await;
                    }
                }
            }
            Ok(Err(e)) => {
                if latch.observe_down() {
                    emit(
                        &ctx,
                        NAME,
                        MonitorOutcome::Down {
                            reason: e.to_string(),
                        },
                    )
                    .await;
                }
                if fast_reconnect {
                    // The fast reconnect itself failed; fall back to slow backoff.
                    fast_reconnect = false;
                }
            }
            Err(_) => {
                if latch.observe_down() {
                    emit(
                        &ctx,
                        NAME,
                        MonitorOutcome::Down {
                            reason: "connect timed out".to_string(),
                        },
                    )
                    .await;
                }
                fast_reconnect = false;
            }
        }

        if !fast_reconnect {
            tokio::time::sleep(backoff).await;
            backoff = std::cmp::min(backoff * 2, backoff_max);
        }
    }
}

/// Reads from the socket until EOF or error. Returns `true` for a clean
/// close (EOF, no error), `false` for anything else (reset, etc).
async fn wait_for_close(mut stream: TcpStream) -> bool {
    use tokio::io::AsyncReadExt;
    let mut buf = [0u8; 1];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => return true,
            Ok(_) => continue, // unexpected data; server is not supposed to talk, but keep waiting.
            Err(_) => return false,
        }
    }
}
