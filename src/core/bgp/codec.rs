// src/core/bgp/codec.rs

//! Wire codec for BGP-4 messages, implemented as a `tokio_util::codec`
//! `Encoder`/`Decoder` pair over `BytesMut` -- the same framing discipline
//! this tree uses for its other wire protocol: `decode` returns `Ok(None)`
//! on a short buffer and only returns `Err` for data that is provably
//! malformed once a full frame is available.

use super::attribute::{
    Attribute, AttrFlags, AsPathSegment, AsPathSegmentType, NextHopValue, Origin, ATTR_TYPE_AGGREGATOR,
    ATTR_TYPE_AS_PATH, ATTR_TYPE_ATOMIC_AGGREGATE, ATTR_TYPE_COMMUNITY, ATTR_TYPE_LOCAL_PREF, ATTR_TYPE_MED,
    ATTR_TYPE_MP_REACH_NLRI, ATTR_TYPE_MP_UNREACH_NLRI, ATTR_TYPE_NEXT_HOP, ATTR_TYPE_ORIGIN,
};
use super::message::{
    Message, MessageType, NotificationMessage, OpenMessage, OptionalParameter, Prefix, UpdateMessage, BGP_VERSION,
    HEADER_LEN, MARKER, MAX_MESSAGE_LEN,
};
use crate::core::errors::{BgpNotification, ControlPlaneError};
use bytes::{Buf, BytesMut};
use std::net::Ipv4Addr;
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Default)]
pub struct BgpCodec;

impl Encoder<Message> for BgpCodec {
    type Error = ControlPlaneError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = BytesMut::new();
        match &item {
            Message::Open(open) => encode_open(open, &mut body),
            Message::Update(update) => encode_update(update, &mut body)?,
            Message::Notification(n, data) => {
                body.extend_from_slice(&[n.error, n.suberror]);
                body.extend_from_slice(data);
            }
            Message::Keepalive => {}
        }

        let total_len = HEADER_LEN + body.len();
        if total_len > MAX_MESSAGE_LEN {
            return Err(ControlPlaneError::BgpMalformed(format!(
                "encoded message length {total_len} exceeds maximum {MAX_MESSAGE_LEN}"
            )));
        }

        dst.extend_from_slice(&MARKER);
        dst.extend_from_slice(&(total_len as u16).to_be_bytes());
        dst.extend_from_slice(&[item.message_type() as u8]);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Decoder for BgpCodec {
    type Item = Message;
    type Error = ControlPlaneError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        if src[0..16] != MARKER {
            return Err(ControlPlaneError::bgp(BgpNotification::new(
                BgpNotification::MESSAGE_HEADER_ERROR,
                1, // Connection Not Synchronized
            )));
        }
        let total_len = u16::from_be_bytes([src[16], src[17]]) as usize;
        if !(HEADER_LEN..=MAX_MESSAGE_LEN).contains(&total_len) {
            return Err(ControlPlaneError::bgp(BgpNotification::new(
                BgpNotification::MESSAGE_HEADER_ERROR,
                2, // Bad Message Length
            )));
        }
        if src.len() < total_len {
            return Ok(None);
        }

        let msg_type_byte = src[18];
        let body = src[HEADER_LEN..total_len].to_vec();
        src.advance(total_len);

        let msg_type = MessageType::from_u8(msg_type_byte).ok_or_else(|| {
            ControlPlaneError::bgp(BgpNotification::new(BgpNotification::MESSAGE_HEADER_ERROR, 3))
        })?;

        let message = match msg_type {
            MessageType::Open => Message::Open(decode_open(&body)?),
            MessageType::Update => Message::Update(decode_update(&body)?),
            MessageType::Notification => decode_notification(&body)?,
            MessageType::Keepalive => Message::Keepalive,
        };
        Ok(Some(message))
    }
}

fn encode_open(open: &OpenMessage, dst: &mut BytesMut) {
    dst.extend_from_slice(&[open.version]);
    dst.extend_from_slice(&open.my_asn.to_be_bytes());
    dst.extend_from_slice(&open.hold_time.to_be_bytes());
    dst.extend_from_slice(&open.bgp_identifier.octets());

    let mut params = BytesMut::new();
    for p in &open.optional_parameters {
        match p {
            OptionalParameter::Capability { code, value } => {
                // Capability parameter (type 2): len-prefixed capability TLV
                // nested inside the len-prefixed parameter.
                let mut cap = BytesMut::new();
                cap.extend_from_slice(&[*code, value.len() as u8]);
                cap.extend_from_slice(value);
                params.extend_from_slice(&[2u8, cap.len() as u8]);
                params.extend_from_slice(&cap);
            }
            OptionalParameter::Unknown { param_type, value } => {
                params.extend_from_slice(&[*param_type, value.len() as u8]);
                params.extend_from_slice(value);
            }
        }
    }
    dst.extend_from_slice(&[params.len() as u8]);
    dst.extend_from_slice(&params);
}

fn decode_open(body: &[u8]) -> Result<OpenMessage, ControlPlaneError> {
    if body.len() < 10 {
        return Err(open_error(1)); // Unspecific
    }
    let version = body[0];
    if version != BGP_VERSION {
        return Err(open_error(1)); // Unsupported Version Number
    }
    let my_asn = u16::from_be_bytes([body[1], body[2]]);
    let hold_time = u16::from_be_bytes([body[3], body[4]]);
    if hold_time != 0 && hold_time < 3 {
        return Err(open_error(6)); // Unacceptable Hold Time
    }
    let bgp_identifier = Ipv4Addr::new(body[5], body[6], body[7], body[8]);
    let params_len = body[9] as usize;
    if body.len() < 10 + params_len {
        return Err(open_error(1));
    }

    let mut optional_parameters = Vec::new();
    let mut cursor = 10;
    let end = 10 + params_len;
    while cursor < end {
        if cursor + 2 > end {
            return Err(open_error(1));
        }
        let param_type = body[cursor];
        let param_len = body[cursor + 1] as usize;
        cursor += 2;
        if cursor + param_len > end {
            return Err(open_error(1));
        }
        let value = &body[cursor..cursor + param_len];
        if param_type == 2 && value.len() >= 2 {
            let code = value[0];
            let cap_len = value[1] as usize;
            if value.len() >= 2 + cap_len {
                optional_parameters.push(OptionalParameter::Capability {
                    code,
                    value: value[2..2 + cap_len].to_vec(),
                });
            }
        } else {
            optional_parameters.push(OptionalParameter::Unknown {
                param_type,
                value: value.to_vec(),
            });
        }
        cursor += param_len;
    }

    Ok(OpenMessage {
        version,
        my_asn,
        hold_time,
        bgp_identifier,
        optional_parameters,
    })
}

fn open_error(suberror: u8) -> ControlPlaneError {
    ControlPlaneError::bgp(BgpNotification::new(BgpNotification::OPEN_MESSAGE_ERROR, suberror))
}

fn update_error(suberror: u8) -> ControlPlaneError {
    ControlPlaneError::bgp(BgpNotification::new(BgpNotification::UPDATE_MESSAGE_ERROR, suberror))
}

fn encode_prefixes(prefixes: &[Prefix], dst: &mut BytesMut) {
    for p in prefixes {
        dst.extend_from_slice(&[p.length]);
        dst.extend_from_slice(&p.octets);
    }
}

fn decode_prefixes(buf: &[u8]) -> Result<Vec<Prefix>, ControlPlaneError> {
    let mut prefixes = Vec::new();
    let mut cursor = 0;
    while cursor < buf.len() {
        let length = buf[cursor];
        if length > 32 {
            return Err(update_error(11)); // Invalid Network Field
        }
        let byte_len = length.div_ceil(8) as usize;
        cursor += 1;
        if cursor + byte_len > buf.len() {
            return Err(update_error(11));
        }
        let octets = buf[cursor..cursor + byte_len].to_vec();
        if let Some(&last) = octets.last() {
            let used_bits = length % 8;
            if used_bits != 0 {
                let mask = 0xFFu8 << (8 - used_bits);
                if last & !mask != 0 {
                    return Err(update_error(11));
                }
            }
        }
        prefixes.push(Prefix { length, octets });
        cursor += byte_len;
    }
    Ok(prefixes)
}

fn encode_update(update: &UpdateMessage, dst: &mut BytesMut) -> Result<(), ControlPlaneError> {
    let mut withdrawn = BytesMut::new();
    encode_prefixes(&update.withdrawn_routes, &mut withdrawn);
    if withdrawn.len() > u16::MAX as usize {
        return Err(ControlPlaneError::BgpMalformed("withdrawn routes too large".into()));
    }
    dst.extend_from_slice(&(withdrawn.len() as u16).to_be_bytes());
    dst.extend_from_slice(&withdrawn);

    let mut attrs = BytesMut::new();
    for attr in &update.path_attributes {
        encode_attribute(attr, &mut attrs);
    }
    dst.extend_from_slice(&(attrs.len() as u16).to_be_bytes());
    dst.extend_from_slice(&attrs);

    encode_prefixes(&update.nlri, dst);
    Ok(())
}

fn decode_update(body: &[u8]) -> Result<UpdateMessage, ControlPlaneError> {
    if body.len() < 2 {
        return Err(update_error(1)); // Malformed Attribute List
    }
    let withdrawn_len = u16::from_be_bytes([body[0], body[1]]) as usize;
    let mut cursor = 2;
    if cursor + withdrawn_len > body.len() {
        return Err(update_error(1));
    }
    let withdrawn_routes = decode_prefixes(&body[cursor..cursor + withdrawn_len])?;
    cursor += withdrawn_len;

    if cursor + 2 > body.len() {
        return Err(update_error(1));
    }
    let attrs_len = u16::from_be_bytes([body[cursor], body[cursor + 1]]) as usize;
    cursor += 2;
    if cursor + attrs_len > body.len() {
        return Err(update_error(1));
    }
    let path_attributes = decode_attributes(&body[cursor..cursor + attrs_len])?;
    cursor += attrs_len;

    let nlri = decode_prefixes(&body[cursor..])?;

    if !nlri.is_empty() {
        let types: std::collections::HashSet<u8> = path_attributes.iter().map(|a| a.attr_type()).collect();
        for required in [ATTR_TYPE_ORIGIN, ATTR_TYPE_AS_PATH, ATTR_TYPE_NEXT_HOP] {
            if !types.contains(&required) {
                return Err(update_error(3)); // Missing Well-known Attribute
            }
        }
    }

    Ok(UpdateMessage {
        withdrawn_routes,
        path_attributes,
        nlri,
    })
}

fn encode_attribute(attr: &Attribute, dst: &mut BytesMut) {
    let (flags, value) = match attr {
        Attribute::Origin(o) => (
            AttrFlags::TRANSITIVE,
            vec![*o as u8],
        ),
        Attribute::AsPath(segments) => {
            let mut v = Vec::new();
            for seg in segments {
                v.push(seg.segment_type as u8);
                v.push(seg.asns.len() as u8);
                for asn in &seg.asns {
                    v.extend_from_slice(&(*asn as u16).to_be_bytes());
                }
            }
            (AttrFlags::TRANSITIVE, v)
        }
        Attribute::NextHop(nh) => {
            let addr = match nh {
                NextHopValue::Explicit(a) => *a,
                NextHopValue::Any => Ipv4Addr::UNSPECIFIED,
            };
            (AttrFlags::TRANSITIVE, addr.octets().to_vec())
        }
        Attribute::MultiExitDisc(med) => (AttrFlags::OPTIONAL, med.to_be_bytes().to_vec()),
        Attribute::LocalPref(pref) => (AttrFlags::TRANSITIVE, pref.to_be_bytes().to_vec()),
        Attribute::AtomicAggregate => (AttrFlags::TRANSITIVE, Vec::new()),
        Attribute::Aggregator { asn, speaker } => {
            let mut v = (*asn as u16).to_be_bytes().to_vec();
            v.extend_from_slice(&speaker.octets());
            (AttrFlags::OPTIONAL | AttrFlags::TRANSITIVE, v)
        }
        Attribute::Community(values) => {
            let mut v = Vec::new();
            for c in values {
                v.extend_from_slice(&c.to_be_bytes());
            }
            (AttrFlags::OPTIONAL | AttrFlags::TRANSITIVE, v)
        }
        Attribute::MpReachNlri { afi, safi, next_hop, nlri } => {
            let mut v = Vec::new();
            v.extend_from_slice(&afi.to_be_bytes());
            v.push(*safi);
            v.push(next_hop.len() as u8);
            v.extend_from_slice(next_hop);
            v.push(0); // reserved (SNPA count)
            for p in nlri {
                v.push(p.length);
                v.extend_from_slice(&p.octets);
            }
            (AttrFlags::OPTIONAL, v)
        }
        Attribute::MpUnreachNlri { afi, safi, withdrawn } => {
            let mut v = Vec::new();
            v.extend_from_slice(&afi.to_be_bytes());
            v.push(*safi);
            for p in withdrawn {
                v.push(p.length);
                v.extend_from_slice(&p.octets);
            }
            (AttrFlags::OPTIONAL, v)
        }
        Attribute::Unrecognized { flags, value, .. } => (*flags, value.clone()),
    };

    let attr_type = attr.attr_type();
    let extended = value.len() > 255;
    let mut effective_flags = flags;
    if extended {
        effective_flags |= AttrFlags::EXTENDED_LENGTH;
    }
    dst.extend_from_slice(&[effective_flags.bits(), attr_type]);
    if extended {
        dst.extend_from_slice(&(value.len() as u16).to_be_bytes());
    } else {
        dst.extend_from_slice(&[value.len() as u8]);
    }
    dst.extend_from_slice(&value);
}

fn decode_attributes(buf: &[u8]) -> Result<Vec<Attribute>, ControlPlaneError> {
    let mut attrs = Vec::new();
    let mut cursor = 0;
    while cursor < buf.len() {
        if cursor + 2 > buf.len() {
            return Err(update_error(1));
        }
        let flags = AttrFlags::from_bits_truncate(buf[cursor]);
        let attr_type = buf[cursor + 1];
        cursor += 2;

        let len = if flags.contains(AttrFlags::EXTENDED_LENGTH) {
            if cursor + 2 > buf.len() {
                return Err(update_error(1));
            }
            let l = u16::from_be_bytes([buf[cursor], buf[cursor + 1]]) as usize;
            cursor += 2;
            l
        } else {
            if cursor + 1 > buf.len() {
                return Err(update_error(1));
            }
            let l = buf[cursor] as usize;
            cursor += 1;
            l
        };
        if cursor + len > buf.len() {
            return Err(update_error(3)); // Attribute Length Error
        }
        let value = &buf[cursor..cursor + len];
        attrs.push(decode_attribute(flags, attr_type, value)?);
        cursor += len;
    }
    Ok(attrs)
}

fn decode_attribute(flags: AttrFlags, attr_type: u8, value: &[u8]) -> Result<Attribute, ControlPlaneError> {
    match attr_type {
        ATTR_TYPE_ORIGIN => {
            let b = value.first().copied().ok_or_else(|| update_error(6))?; // Invalid Origin Attribute
            Origin::from_u8(b).map(Attribute::Origin).ok_or_else(|| update_error(6))
        }
        ATTR_TYPE_AS_PATH => {
            let mut segments = Vec::new();
            let mut cursor = 0;
            while cursor < value.len() {
                if cursor + 2 > value.len() {
                    return Err(update_error(11)); // Malformed AS_PATH
                }
                let segment_type = match value[cursor] {
                    1 => AsPathSegmentType::Set,
                    2 => AsPathSegmentType::Sequence,
                    _ => return Err(update_error(11)),
                };
                let count = value[cursor + 1] as usize;
                cursor += 2;
                let mut asns = Vec::with_capacity(count);
                for _ in 0..count {
                    if cursor + 2 > value.len() {
                        return Err(update_error(11));
                    }
                    asns.push(u16::from_be_bytes([value[cursor], value[cursor + 1]]) as u32);
                    cursor += 2;
                }
                segments.push(AsPathSegment { segment_type, asns });
            }
            Ok(Attribute::AsPath(segments))
        }
        ATTR_TYPE_NEXT_HOP => {
            if value.len() != 4 {
                return Err(update_error(8)); // Invalid NEXT_HOP Attribute
            }
            let addr = Ipv4Addr::new(value[0], value[1], value[2], value[3]);
            if addr.is_unspecified() || addr == Ipv4Addr::BROADCAST {
                return Err(update_error(8));
            }
            Ok(Attribute::NextHop(NextHopValue::Explicit(addr)))
        }
        ATTR_TYPE_MED => {
            if value.len() != 4 {
                return Err(update_error(5)); // Attribute Length Error
            }
            Ok(Attribute::MultiExitDisc(u32::from_be_bytes(value.try_into().unwrap())))
        }
        ATTR_TYPE_LOCAL_PREF => {
            if value.len() != 4 {
                return Err(update_error(5));
            }
            Ok(Attribute::LocalPref(u32::from_be_bytes(value.try_into().unwrap())))
        }
        ATTR_TYPE_ATOMIC_AGGREGATE => Ok(Attribute::AtomicAggregate),
        ATTR_TYPE_AGGREGATOR => {
            if value.len() != 6 {
                return Err(update_error(5));
            }
            let asn = u16::from_be_bytes([value[0], value[1]]) as u32;
            let speaker = Ipv4Addr::new(value[2], value[3], value[4], value[5]);
            Ok(Attribute::Aggregator { asn, speaker })
        }
        ATTR_TYPE_COMMUNITY => {
            if value.len() % 4 != 0 {
                return Err(update_error(5));
            }
            let values = value.chunks_exact(4).map(|c| u32::from_be_bytes(c.try_into().unwrap())).collect();
            Ok(Attribute::Community(values))
        }
        ATTR_TYPE_MP_REACH_NLRI => {
            if value.len() < 4 {
                return Err(update_error(9)); // Optional Attribute Error
            }
            let afi = u16::from_be_bytes([value[0], value[1]]);
            let safi = value[2];
            let nh_len = value[3] as usize;
            if value.len() < 4 + nh_len + 1 {
                return Err(update_error(9));
            }
            let next_hop = value[4..4 + nh_len].to_vec();
            let reserved_and_nlri = 4 + nh_len + 1;
            let nlri = decode_prefixes(&value[reserved_and_nlri..])?;
            Ok(Attribute::MpReachNlri { afi, safi, next_hop, nlri })
        }
        ATTR_TYPE_MP_UNREACH_NLRI => {
            if value.len() < 3 {
                return Err(update_error(9));
            }
            let afi = u16::from_be_bytes([value[0], value[1]]);
            let safi = value[2];
            let withdrawn = decode_prefixes(&value[3..])?;
            Ok(Attribute::MpUnreachNlri { afi, safi, withdrawn })
        }
        other => {
            if !flags.contains(AttrFlags::OPTIONAL) {
                return Err(update_error(2)); // Unrecognized Well-known Attribute
            }
            Ok(Attribute::Unrecognized {
                flags,
                attr_type: other,
                value: value.to_vec(),
            })
        }
    }
}

fn decode_notification(body: &[u8]) -> Result<Message, ControlPlaneError> {
    if body.len() < 2 {
        return Err(ControlPlaneError::bgp(BgpNotification::new(
            BgpNotification::MESSAGE_HEADER_ERROR,
            1,
        )));
    }
    Ok(Message::Notification(
        NotificationMessage {
            error: body[0],
            suberror: body[1],
        },
        body[2..].to_vec(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bgp::message::OpenMessage;

    #[test]
    fn keepalive_round_trips() {
        let mut codec = BgpCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::Keepalive, &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Keepalive);
    }

    #[test]
    fn short_buffer_returns_ok_none() {
        let mut codec = BgpCodec;
        let mut buf = BytesMut::from(&MARKER[..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn bad_marker_is_header_error() {
        let mut codec = BgpCodec;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0u8; 19]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn open_round_trips_with_multiprotocol_capability() {
        let open = OpenMessage {
            version: BGP_VERSION,
            my_asn: 65000,
            hold_time: 180,
            bgp_identifier: Ipv4Addr::new(192, 0, 2, 1),
            optional_parameters: vec![OptionalParameter::multiprotocol(2, 1)],
        };
        let mut codec = BgpCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::Open(open.clone()), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Open(open));
    }

    #[test]
    fn update_round_trips_with_ipv4_nlri() {
        let update = UpdateMessage {
            withdrawn_routes: vec![],
            path_attributes: vec![
                Attribute::Origin(Origin::Igp),
                Attribute::AsPath(vec![AsPathSegment {
                    segment_type: AsPathSegmentType::Sequence,
                    asns: vec![65000],
                }]),
                Attribute::NextHop(NextHopValue::Explicit(Ipv4Addr::new(192, 0, 2, 1))),
            ],
            nlri: vec![Prefix::from_ipv4(Ipv4Addr::new(10, 0, 0, 0), 24)],
        };
        let mut codec = BgpCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::Update(update.clone()), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Update(update));
    }

    #[test]
    fn update_with_nlri_missing_well_known_attribute_is_rejected() {
        let update = UpdateMessage {
            withdrawn_routes: vec![],
            path_attributes: vec![Attribute::Origin(Origin::Igp)],
            nlri: vec![Prefix::from_ipv4(Ipv4Addr::new(10, 0, 0, 0), 24)],
        };
        let mut codec = BgpCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::Update(update), &mut buf).unwrap();
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn notification_round_trips_with_diagnostic_data() {
        let msg = Message::Notification(NotificationMessage { error: 3, suberror: 1 }, vec![0xAB, 0xCD]);
        let mut codec = BgpCodec;
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }
}
