// src/core/bgp/mod.rs

//! A partial BGP-4 speaker (RFC 4271 + RFC 4760 multiprotocol extensions)
//! used to advertise and withdraw VIPs for failover. Layered bottom-up:
//! wire types and codec, timers, the pure per-connection FSM, then the
//! per-peer actor that drives real sockets and batches advertisements.

pub mod attribute;
pub mod codec;
pub mod fsm;
pub mod message;
pub mod peering;
pub mod timers;

pub use peering::{AddressFamily, Advertisement, PeerCommand, PeerConfig};
