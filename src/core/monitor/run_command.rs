// src/core/monitor/run_command.rs

//! Runs an external command as a health check: exit code 0 is up, anything
//! else is down. The child is made a session leader so it owns its own
//! process group; a timeout kills the whole group, not just the immediate
//! child, since many health-check scripts fork helpers.

use super::{MonitorContext, MonitorHandle, MonitorOutcome, ResultLatch, emit};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

const NAME: &str = "RunCommand";
const DEFAULT_INTERVAL_SECS: u64 = 60;
const DEFAULT_TIMEOUT_SECS: u64 = 10;

pub fn spawn(ctx: MonitorContext) -> MonitorHandle {
    let join: JoinHandle<()> = tokio::spawn(run(ctx));
    MonitorHandle { join }
}

async fn run(ctx: MonitorContext) {
    let interval = Duration::from_secs(ctx.config.get_int(NAME, "interval", DEFAULT_INTERVAL_SECS));
    let timeout = Duration::from_secs(ctx.config.get_int(NAME, "timeout", DEFAULT_TIMEOUT_SECS));
    let log_output = ctx.config.get_bool(NAME, "log-output", false);

    let Some(command) = ctx.config.get_string(NAME, "command") else {
        warn!(host = %ctx.server_host, "RunCommand configured with no command, monitor idle");
        return;
    };

    let mut latch = ResultLatch::new();

    loop {
        match run_once(&command, timeout, log_output).await {
            Ok(()) => {
                if latch.observe_up() {
                    emit(&ctx, NAME, MonitorOutcome::Up).await;
                }
            }
            Err(reason) => {
                if latch.observe_down() {
                    emit(&ctx, NAME, MonitorOutcome::Down { reason }).await;
                }
            }
        }
        tokio::time::sleep(interval).await;
    }
}

/// Spawns `command` through a shell, in its own session/process group, waits
/// up to `timeout` for it to exit, and SIGKILLs the whole group on timeout or
/// on early drop, so no orphaned helper processes are left behind.
async fn run_once(command: &str, timeout: Duration, log_output: bool) -> Result<(), String> {
    let mut child = spawn_in_new_session(command).map_err(|e| format!("failed to spawn: {e}"))?;
    let pid = child.id().ok_or("child exited before it could be observed")? as i32;

    let wait_result = tokio::time::timeout(timeout, child.wait_with_output()).await;

    match wait_result {
        Ok(Ok(output)) => {
            if log_output {
                trace!(
                    stdout = %escape_control_chars(&output.stdout),
                    stderr = %escape_control_chars(&output.stderr),
                    "RunCommand output"
                );
            }
            if kill_process_group(pid) {
                trace!(pid, "RunCommand reaped leftover process group members");
            }
            match output.status.code() {
                Some(0) => Ok(()),
                Some(code) => Err(format!("command exited with status {code}")),
                None => {
                    let signal = output.status.signal().unwrap_or(0);
                    Err(format!("command terminated by signal {signal}"))
                }
            }
        }
        Ok(Err(e)) => Err(format!("failed waiting for command: {e}")),
        Err(_) => {
            kill_process_group(pid);
            Err("command timed out".to_string())
        }
    }
}

fn spawn_in_new_session(command: &str) -> std::io::Result<Child> {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // SAFETY: setsid() is async-signal-safe and is the only call made in the
    // pre_exec hook, which runs between fork and exec in the child.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    cmd.kill_on_drop(true).spawn()
}

/// Sends SIGKILL to the whole process group led by `pid` (negative pid is
/// the group-kill convention), so forked helpers die along with it. Returns
/// whether anything was actually signaled, i.e. the group still existed.
fn kill_process_group(pid: i32) -> bool {
    unsafe { libc::kill(-pid, libc::SIGKILL) == 0 }
}

fn escape_control_chars(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.chars()
        .map(|c| if c.is_control() && c != '\n' && c != '\t' { '.' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn successful_command_is_up() {
        let result = run_once("true", Duration::from_secs(5), false).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn failing_command_is_down() {
        let result = run_once("false", Duration::from_secs(5), false).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn timeout_is_reported_and_kills_group() {
        let result = run_once("sleep 5", Duration::from_millis(100), false).await;
        let err = result.unwrap_err();
        assert!(err.contains("timed out"));
    }

    #[test]
    fn control_characters_are_escaped() {
        let escaped = escape_control_chars(b"hello\x01world\n\ttab");
        assert_eq!(escaped, "hello.world\n\ttab");
    }
}
