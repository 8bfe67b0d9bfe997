// src/core/monitor/dns_query.rs

//! A minimal stub DNS client used only to probe a backend's DNS server: it
//! sends an A or AAAA query and only cares whether *any* well-formed
//! response comes back before the deadline. NXDOMAIN counts as the server
//! being healthy -- it answered -- only transport failures, timeouts, and
//! SERVFAIL/REFUSED count as down.

use super::{MonitorContext, MonitorHandle, MonitorOutcome, ResultLatch, emit};
use rand::Rng;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::warn;

const NAME: &str = "DNSQuery";
const DEFAULT_INTERVAL_SECS: u64 = 10;
const DEFAULT_TIMEOUT_SECS: u64 = 5;

const RCODE_NOERROR: u8 = 0;
const RCODE_NXDOMAIN: u8 = 3;
const RCODE_SERVFAIL: u8 = 2;
const RCODE_REFUSED: u8 = 5;

pub fn spawn(ctx: MonitorContext) -> MonitorHandle {
    let join: JoinHandle<()> = tokio::spawn(run(ctx));
    MonitorHandle { join }
}

async fn run(ctx: MonitorContext) {
    let interval = Duration::from_secs(ctx.config.get_int(NAME, "interval", DEFAULT_INTERVAL_SECS));
    let timeout = Duration::from_secs(ctx.config.get_int(NAME, "timeout", DEFAULT_TIMEOUT_SECS));
    let hostnames = ctx.config.get_string_list(NAME, "hostnames");

    if hostnames.is_empty() {
        warn!(host = %ctx.server_host, "DNSQuery configured with no hostnames, monitor idle");
        return;
    }

    let mut latch = ResultLatch::new();

    loop {
        let (name_idx, qtype) = {
            let mut rng = rand::thread_rng();
            let name_idx = rng.gen_range(0..hostnames.len());
            let qtype = if rng.gen_bool(0.5) { QType::A } else { QType::Aaaa };
            (name_idx, qtype)
        };
        let name = &hostnames[name_idx];

        let outcome = tokio::time::timeout(timeout, query_once(ctx.server_ip, name, qtype)).await;

        match outcome {
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
                            reason: "DNS query timeout".to_string(),
                        },
                    )
                    .await;
                }
            }
        }
        tokio::time::sleep(interval).await;
    }
}

#[derive(Clone, Copy)]
enum QType {
    A,
    Aaaa,
}

impl QType {
    fn code(self) -> u16 {
        match self {
            QType::A => 1,
            QType::Aaaa => 28,
        }
    }
}

/// Builds a minimal single-question DNS query, sends it over UDP to
/// `server_ip:53`, and inspects the response code. Returns `Ok(())` for any
/// response that means "the server is alive", including NXDOMAIN.
async fn query_once(server_ip: std::net::IpAddr, name: &str, qtype: QType) -> Result<(), String> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await.map_err(|e| e.to_string())?;
    let id: u16 = rand::thread_rng().r#gen();
    let query = encode_query(id, name, qtype);

    socket
        .send_to(&query, (server_ip, 53u16))
        .await
        .map_err(|e| e.to_string())?;

    let mut buf = [0u8; 512];
    let (len, _) = socket.recv_from(&mut buf).await.map_err(|e| e.to_string())?;
    let rcode = decode_rcode(&buf[..len], id)?;

    match rcode {
        RCODE_NOERROR | RCODE_NXDOMAIN => Ok(()),
        RCODE_SERVFAIL => Err("DNS server error".to_string()),
        RCODE_REFUSED => Err("DNS query refused".to_string()),
        other => Err(format!("DNS query failed with rcode {other}")),
    }
}

/// Encodes a single-question query: 12-byte header + QNAME + QTYPE + QCLASS(IN).
fn encode_query(id: u16, name: &str, qtype: QType) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&0x0100u16.to_be_bytes()); // flags: recursion desired
    buf.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    buf.extend_from_slice(&0u16.to_be_bytes()); // ancount
    buf.extend_from_slice(&0u16.to_be_bytes()); // nscount
    buf.extend_from_slice(&0u16.to_be_bytes()); // arcount

    for label in name.trim_end_matches('.').split('.') {
        let bytes = label.as_bytes();
        buf.push(bytes.len() as u8);
        buf.extend_from_slice(bytes);
    }
    buf.push(0); // root label

    buf.extend_from_slice(&qtype.code().to_be_bytes());
    buf.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN
    buf
}

/// Pulls the 4-bit RCODE out of a response header, checking the transaction
/// ID matches so stray/late packets are ignored.
fn decode_rcode(buf: &[u8], expected_id: u16) -> Result<u8, String> {
    if buf.len() < 12 {
        return Err("DNS response too short".to_string());
    }
    let id = u16::from_be_bytes([buf[0], buf[1]]);
    if id != expected_id {
        return Err("DNS response transaction id mismatch".to_string());
    }
    let flags_lo = buf[3];
    Ok(flags_lo & 0x0F)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_a_single_label_query() {
        let buf = encode_query(0x1234, "example", QType::A);
        assert_eq!(&buf[0..2], &[0x12, 0x34]);
        assert_eq!(buf[12], 7); // label length
        assert_eq!(&buf[13..20], b"example");
        assert_eq!(buf[20], 0); // root label
        let qtype = u16::from_be_bytes([buf[21], buf[22]]);
        assert_eq!(qtype, 1);
    }

    #[test]
    fn decodes_rcode_and_checks_id() {
        let mut resp = vec![0u8; 12];
        resp[0] = 0x12;
        resp[1] = 0x34;
        resp[3] = RCODE_NXDOMAIN;
        assert_eq!(decode_rcode(&resp, 0x1234).unwrap(), RCODE_NXDOMAIN);
        assert!(decode_rcode(&resp, 0x9999).is_err());
    }
}
