// src/core/failover.rs

//! Failover manager (C7): the single point where every coordinator's VIP
//! becomes a BGP advertisement. Holds one registry of announced prefixes
//! keyed by address family and a `PeerActor` handle per configured peer;
//! whenever the prefix set changes, it recomputes the full advertisement
//! set and pushes it to every peer.

use super::bgp::{peering, AddressFamily, Advertisement, PeerCommand, PeerConfig};
use super::bgp::attribute::{AsPathSegment, AsPathSegmentType, Attribute, AttributeSet, NextHopValue, Origin};
use super::bgp::message::Prefix;
use dashmap::DashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Clone)]
pub struct FailoverConfig {
    pub local_asn: u16,
    pub local_bgp_id: Ipv4Addr,
    pub peer_addresses: Vec<IpAddr>,
    pub as_path: Vec<u32>,
    pub med: Option<u32>,
}

impl FailoverConfig {
    fn fixed_attributes(&self) -> AttributeSet {
        let as_path = if self.as_path.is_empty() {
            vec![self.local_asn as u32]
        } else {
            self.as_path.clone()
        };
        let mut attrs = vec![
            Attribute::Origin(Origin::Igp),
            Attribute::AsPath(vec![AsPathSegment {
                segment_type: AsPathSegmentType::Sequence,
                asns: as_path,
            }]),
            Attribute::NextHop(NextHopValue::Any),
        ];
        if let Some(med) = self.med {
            attrs.push(Attribute::MultiExitDisc(med));
        }
        AttributeSet::new(attrs)
    }
}

/// Registry of advertised prefixes and the set of live peer sessions. Shared
/// via `Arc` so both coordinators (who only ever call `add_prefix`) and the
/// shutdown hook can reach it without routing through a message channel.
pub struct FailoverManager {
    config: FailoverConfig,
    prefixes: DashMap<AddressFamily, std::collections::HashSet<Prefix>>,
    peers: Vec<mpsc::Sender<PeerCommand>>,
}

impl FailoverManager {
    /// Spawns one peer actor per configured peer and enables auto-start.
    /// Call this once at startup, before any coordinator registers a VIP.
    pub fn start(config: FailoverConfig) -> Arc<Self> {
        let peers = config
            .peer_addresses
            .iter()
            .map(|&addr| {
                peering::spawn(PeerConfig {
                    peer_addr: addr,
                    local_asn: config.local_asn,
                    local_bgp_id: config.local_bgp_id,
                    local_hold_time: super::bgp::timers::DEFAULT_HOLD_SECS as u16,
                })
            })
            .collect();
        Arc::new(Self {
            config,
            prefixes: DashMap::new(),
            peers,
        })
    }

    /// Registers a VIP for advertisement. Called by a coordinator when its
    /// service is created; idempotent for repeated calls with the same VIP.
    pub async fn add_prefix(&self, vip: IpAddr, prefix_len: u8) {
        let (family, prefix) = match vip {
            IpAddr::V4(v4) => (AddressFamily::IPV4_UNICAST, Prefix::from_ipv4(v4, prefix_len)),
            IpAddr::V6(v6) => {
                let byte_len = (prefix_len as usize).div_ceil(8);
                (
                    AddressFamily::IPV6_UNICAST,
                    Prefix {
                        length: prefix_len,
                        octets: v6.octets()[..byte_len].to_vec(),
                    },
                )
            }
        };
        let inserted = self.prefixes.entry(family).or_default().insert(prefix);
        if inserted {
            info!(vip = %vip, "registering VIP for BGP advertisement");
            self.push_advertisements().await;
        }
    }

    async fn push_advertisements(&self) {
        let attrs = self.config.fixed_attributes();
        let advertisements: Vec<Advertisement> = self
            .prefixes
            .iter()
            .flat_map(|entry| {
                let family = *entry.key();
                let attrs = attrs.clone();
                entry
                    .value()
                    .iter()
                    .cloned()
                    .map(move |prefix| Advertisement { family, prefix, attrs: attrs.clone() })
                    .collect::<Vec<_>>()
            })
            .collect();
        for peer in &self.peers {
            let _ = peer.send(PeerCommand::SetAdvertisements(advertisements.clone())).await;
        }
    }

    /// Withdraws every advertisement and stops all peer sessions. Intended
    /// as the failover half of the process's graceful-shutdown sequence.
    pub async fn shutdown(&self) {
        for peer in &self.peers {
            let _ = peer.send(PeerCommand::SetAdvertisements(vec![])).await;
            let _ = peer.send(PeerCommand::Shutdown).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_attributes_default_as_path_is_local_asn() {
        let config = FailoverConfig {
            local_asn: 65001,
            local_bgp_id: Ipv4Addr::new(10, 0, 0, 1),
            peer_addresses: vec![],
            as_path: vec![],
            med: None,
        };
        let attrs = config.fixed_attributes();
        let as_path = attrs.attrs().iter().find_map(|a| match a {
            Attribute::AsPath(segs) => Some(segs.clone()),
            _ => None,
        });
        assert_eq!(as_path.unwrap()[0].asns, vec![65001]);
    }

    #[test]
    fn fixed_attributes_includes_med_when_configured() {
        let config = FailoverConfig {
            local_asn: 65001,
            local_bgp_id: Ipv4Addr::new(10, 0, 0, 1),
            peer_addresses: vec![],
            as_path: vec![],
            med: Some(50),
        };
        let attrs = config.fixed_attributes();
        assert!(attrs.attrs().iter().any(|a| matches!(a, Attribute::MultiExitDisc(50))));
    }
}
