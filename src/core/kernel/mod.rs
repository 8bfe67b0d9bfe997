// src/core/kernel/mod.rs

//! Translates pool-level server/service diffs into an idempotent batch of
//! commands applied to the kernel's virtual-service table via the external
//! `ipvsadm`-compatible tool.
//!
//! Command builders are pure and side-effect-free; only [`KernelTableDriver::apply`]
//! touches the outside world, and only when not in dry-run mode.

use crate::core::errors::ControlPlaneError;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Scheduler {
    Rr,
    Wrr,
    Lc,
    Wlc,
    Lblc,
    Lblcr,
    Dh,
    Sh,
    Sed,
    Nq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString, Default)]
#[strum(serialize_all = "lowercase")]
pub enum FwMethod {
    #[default]
    Gate,
    Ipip,
    Masq,
}

/// Immutable service descriptor: one coordinator owns exactly one of these.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub protocol: Protocol,
    pub vip: IpAddr,
    pub port: u16,
    pub scheduler: Scheduler,
}

impl ServiceDescriptor {
    /// IPv6 literals must be bracketed for the `ipvsadm` CLI dialect.
    fn addr_literal(&self) -> String {
        match self.vip {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{v6}]"),
        }
    }

    fn service_flag(&self) -> char {
        match self.protocol {
            Protocol::Tcp => 't',
            Protocol::Udp => 'u',
        }
    }

    fn sub_command(&self) -> String {
        format!("-{} {}:{}", self.service_flag(), self.addr_literal(), self.port)
    }
}

/// A single backend within a service's pool, as far as the kernel table cares.
#[derive(Debug, Clone)]
pub struct ServerTarget {
    pub ip: IpAddr,
    pub port: u16,
    pub weight: u32,
    pub fwmethod: FwMethod,
}

impl ServerTarget {
    fn addr_literal(&self) -> String {
        match self.ip {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{v6}]"),
        }
    }

    fn sub_command(&self) -> String {
        format!("-r {}:{}", self.addr_literal(), self.port)
    }

    fn fwmethod_flag(&self) -> &'static str {
        match self.fwmethod {
            FwMethod::Gate => "-g",
            FwMethod::Ipip => "-i",
            FwMethod::Masq => "-m",
        }
    }
}

/// Validates a raw `fwmethod` config string, falling back to `gate` with a
/// warning for anything unrecognized, per the pool-driver contract.
pub fn parse_fwmethod(raw: &str) -> FwMethod {
    match raw.to_ascii_lowercase().as_str() {
        "gate" | "g" => FwMethod::Gate,
        "ipip" | "i" | "tunnel" => FwMethod::Ipip,
        "masq" | "m" | "nat" => FwMethod::Masq,
        other => {
            warn!(fwmethod = other, "unknown fwmethod, falling back to gate");
            FwMethod::Gate
        }
    }
}

pub fn build_add_service(svc: &ServiceDescriptor) -> String {
    let mut cmd = format!("-A {}", svc.sub_command());
    if svc.port == 0 {
        cmd.push_str(" -p");
    }
    let _ = write!(cmd, " -s {}", svc.scheduler);
    cmd
}

pub fn build_remove_service(svc: &ServiceDescriptor) -> String {
    format!("-D {}", svc.sub_command())
}

pub fn build_add_server(svc: &ServiceDescriptor, server: &ServerTarget) -> String {
    let mut cmd = format!("-a {} {}", svc.sub_command(), server.sub_command());
    cmd.push(' ');
    cmd.push_str(server.fwmethod_flag());
    if server.weight != 0 {
        let _ = write!(cmd, " -w {}", server.weight);
    }
    cmd
}

pub fn build_edit_server(svc: &ServiceDescriptor, server: &ServerTarget) -> String {
    let mut cmd = format!("-e {} {}", svc.sub_command(), server.sub_command());
    cmd.push(' ');
    cmd.push_str(server.fwmethod_flag());
    if server.weight != 0 {
        let _ = write!(cmd, " -w {}", server.weight);
    }
    cmd
}

pub fn build_remove_server(svc: &ServiceDescriptor, server: &ServerTarget) -> String {
    format!("-d {} {}", svc.sub_command(), server.sub_command())
}

/// A single reconciliation batch, applied in the fixed order `{adds, edits, removes}`.
#[derive(Debug, Default)]
pub struct ReconciliationBatch {
    pub commands: Vec<String>,
}

impl ReconciliationBatch {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Drives the external kernel-table tool. Builders are pure; only `apply`
/// is side-effecting, and only outside dry-run mode.
pub struct KernelTableDriver {
    tool_path: String,
    dry_run: bool,
}

impl KernelTableDriver {
    pub fn new(tool_path: impl Into<String>, dry_run: bool) -> Self {
        Self {
            tool_path: tool_path.into(),
            dry_run,
        }
    }

    /// Executes the tool once per apply with `-R`, writing each command
    /// followed by a newline, then closing stdin and waiting for exit.
    /// In dry-run mode this is a no-op that still reports success.
    pub async fn apply(&self, batch: &ReconciliationBatch) -> Result<(), ControlPlaneError> {
        if batch.is_empty() {
            return Ok(());
        }
        if self.dry_run {
            for cmd in &batch.commands {
                tracing::info!(command = %cmd, "dry-run: would apply kernel table command");
            }
            return Ok(());
        }

        let mut child = Command::new(&self.tool_path)
            .arg("-R")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ControlPlaneError::KernelDriver(format!("failed to spawn: {e}")))?;

        {
            let stdin = child
                .stdin
                .as_mut()
                .ok_or_else(|| ControlPlaneError::KernelDriver("no stdin handle".into()))?;
            for cmd in &batch.commands {
                stdin
                    .write_all(cmd.as_bytes())
                    .await
                    .map_err(|e| ControlPlaneError::KernelDriver(e.to_string()))?;
                stdin
                    .write_all(b"\n")
                    .await
                    .map_err(|e| ControlPlaneError::KernelDriver(e.to_string()))?;
            }
        }
        // Dropping the held stdin handle would leave it open across the await below;
        // explicitly close it so the tool sees EOF.
        drop(child.stdin.take());

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ControlPlaneError::KernelDriver(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(status = ?output.status, stderr = %stderr, "kernel table apply failed");
            return Err(ControlPlaneError::KernelDriver(format!(
                "exit status {:?}: {}",
                output.status, stderr
            )));
        }
        Ok(())
    }
}
