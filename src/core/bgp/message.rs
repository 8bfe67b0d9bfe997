// src/core/bgp/message.rs

//! BGP-4 message header and top-level message types (RFC 4271 §4).

use crate::core::errors::BgpNotification;
use std::net::Ipv4Addr;

pub const HEADER_LEN: usize = 19;
pub const MARKER: [u8; 16] = [0xFF; 16];
pub const MAX_MESSAGE_LEN: usize = 4096;
pub const BGP_VERSION: u8 = 4;
pub const BGP_PORT: u16 = 179;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Open = 1,
    Update = 2,
    Notification = 3,
    Keepalive = 4,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Open),
            2 => Some(Self::Update),
            3 => Some(Self::Notification),
            4 => Some(Self::Keepalive),
            _ => None,
        }
    }
}

/// An optional BGP parameter carried in OPEN (RFC 4271 §4.2, RFC 5492).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionalParameter {
    /// Capability code 2; only Multiprotocol Extensions (code 1) is recognized.
    Capability { code: u8, value: Vec<u8> },
    Unknown { param_type: u8, value: Vec<u8> },
}

impl OptionalParameter {
    pub fn multiprotocol(afi: u16, safi: u8) -> Self {
        let mut value = Vec::with_capacity(4);
        value.extend_from_slice(&afi.to_be_bytes());
        value.push(0); // reserved
        value.push(safi);
        OptionalParameter::Capability { code: 1, value }
    }

    /// Decodes a Multiprotocol Extensions capability payload, if this is one.
    pub fn as_multiprotocol(&self) -> Option<(u16, u8)> {
        match self {
            OptionalParameter::Capability { code: 1, value } if value.len() == 4 => {
                let afi = u16::from_be_bytes([value[0], value[1]]);
                let safi = value[3];
                Some((afi, safi))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenMessage {
    pub version: u8,
    pub my_asn: u16,
    pub hold_time: u16,
    pub bgp_identifier: Ipv4Addr,
    pub optional_parameters: Vec<OptionalParameter>,
}

impl OpenMessage {
    pub fn supports_afi_safi(&self, afi: u16, safi: u8) -> bool {
        self.optional_parameters
            .iter()
            .filter_map(|p| p.as_multiprotocol())
            .any(|(a, s)| a == afi && s == safi)
    }
}

/// An IPv4 (or, carried raw, any-family) prefix as it appears on the wire:
/// a prefix length in bits and the minimal-octet address representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Prefix {
    pub length: u8,
    pub octets: Vec<u8>,
}

impl Prefix {
    pub fn from_ipv4(addr: Ipv4Addr, length: u8) -> Self {
        let byte_len = length.div_ceil(8) as usize;
        Self {
            length,
            octets: addr.octets()[..byte_len].to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateMessage {
    pub withdrawn_routes: Vec<Prefix>,
    pub path_attributes: Vec<super::attribute::Attribute>,
    pub nlri: Vec<Prefix>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationMessage {
    pub error: u8,
    pub suberror: u8,
}

impl From<BgpNotification> for NotificationMessage {
    fn from(n: BgpNotification) -> Self {
        Self {
            error: n.error,
            suberror: n.suberror,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Open(OpenMessage),
    Update(UpdateMessage),
    Notification(NotificationMessage, Vec<u8>),
    Keepalive,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Open(_) => MessageType::Open,
            Message::Update(_) => MessageType::Update,
            Message::Notification(..) => MessageType::Notification,
            Message::Keepalive => MessageType::Keepalive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiprotocol_capability_round_trips() {
        let cap = OptionalParameter::multiprotocol(2, 1); // IPv6 unicast
        assert_eq!(cap.as_multiprotocol(), Some((2, 1)));
    }

    #[test]
    fn prefix_from_ipv4_truncates_to_byte_length() {
        let p = Prefix::from_ipv4(Ipv4Addr::new(10, 0, 0, 0), 24);
        assert_eq!(p.octets, vec![10, 0, 0]);
        assert_eq!(p.length, 24);
    }
}
