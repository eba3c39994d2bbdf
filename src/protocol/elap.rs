//! EtherTalk framing (IEEE 802.3 + 802.2 LLC + SNAP) and AARP
//!
//! AppleTalk on Ethernet uses 802.3 length-form frames with an LLC type 1
//! header and a SNAP protocol discriminator; AARP maps AppleTalk
//! (network, node) addresses to 48-bit hardware addresses.

use super::ddp_checksum;
use super::types::MacAddr;
use super::zone::ucase;
use crate::{Error, Result};

/// 802.2 LLC type 1 header: SNAP SAPs plus unnumbered information.
pub const LLC_SNAP_HEADER: [u8; 3] = [0xAA, 0xAA, 0x03];

/// SNAP discriminator for AppleTalk (DDP) payloads.
pub const SNAP_APPLETALK: [u8; 5] = [0x08, 0x00, 0x07, 0x80, 0x9B];

/// SNAP discriminator for AARP payloads.
pub const SNAP_AARP: [u8; 5] = [0x00, 0x00, 0x00, 0x80, 0xF3];

/// Prefix of the ELAP zone multicast addresses.
pub const ELAP_MULTICAST_PREFIX: [u8; 5] = [0x09, 0x00, 0x07, 0x00, 0x00];

/// Number of distinct zone multicast addresses (last octet 0x00-0xFC).
pub const ELAP_MULTICAST_ADDR_COUNT: u16 = 0xFD;

/// Minimum 802.3 payload length; shorter payloads are zero padded.
const MIN_PAYLOAD_LENGTH: usize = 46;

/// Length of an AARP payload behind the LLC/SNAP header.
const AARP_PAYLOAD_LENGTH: usize = 28;

/// The ELAP multicast address for a zone name.
///
/// Derived from the DDP checksum of the folded zone name, as end nodes
/// and routers must agree on the mapping.
pub fn zone_multicast_address(zone_name: &[u8]) -> MacAddr {
    let index = ddp_checksum(&ucase(zone_name)) % ELAP_MULTICAST_ADDR_COUNT;
    let mut addr = [0u8; 6];
    addr[..5].copy_from_slice(&ELAP_MULTICAST_PREFIX);
    addr[5] = index as u8;
    MacAddr(addr)
}

/// AARP function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum AarpFunction {
    Request = 1,
    Response = 2,
    Probe = 3,
}

impl AarpFunction {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(AarpFunction::Request),
            2 => Some(AarpFunction::Response),
            3 => Some(AarpFunction::Probe),
            _ => None,
        }
    }
}

/// An AARP packet (Ethernet/AppleTalk flavor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AarpPacket {
    pub function: AarpFunction,
    pub source_hw: MacAddr,
    pub source_network: u16,
    pub source_node: u8,
    pub target_hw: MacAddr,
    pub target_network: u16,
    pub target_node: u8,
}

impl AarpPacket {
    /// Parse an AARP payload (the bytes following the SNAP header).
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < AARP_PAYLOAD_LENGTH {
            return Err(Error::MalformedDatagram(format!(
                "AARP payload of {} bytes is too short",
                payload.len()
            )));
        }
        // hardware type Ethernet, protocol type AppleTalk, address lengths 6/4
        if payload[0..6] != [0x00, 0x01, 0x80, 0x9B, 0x06, 0x04] {
            return Err(Error::MalformedDatagram(
                "AARP hardware/protocol types not Ethernet/AppleTalk".into(),
            ));
        }
        let function = u16::from_be_bytes([payload[6], payload[7]]);
        let function = AarpFunction::from_u16(function).ok_or_else(|| {
            Error::MalformedDatagram(format!("unknown AARP function {}", function))
        })?;
        Ok(Self {
            function,
            source_hw: MacAddr::from_slice(&payload[8..14]).unwrap(),
            source_network: u16::from_be_bytes([payload[15], payload[16]]),
            source_node: payload[17],
            target_hw: MacAddr::from_slice(&payload[18..24]).unwrap(),
            target_network: u16::from_be_bytes([payload[25], payload[26]]),
            target_node: payload[27],
        })
    }

    /// Encode this AARP packet as a SNAP payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(AARP_PAYLOAD_LENGTH);
        bytes.extend_from_slice(&[0x00, 0x01, 0x80, 0x9B, 0x06, 0x04]);
        bytes.extend_from_slice(&(self.function as u16).to_be_bytes());
        bytes.extend_from_slice(&self.source_hw.0);
        bytes.push(0);
        bytes.extend_from_slice(&self.source_network.to_be_bytes());
        bytes.push(self.source_node);
        bytes.extend_from_slice(&self.target_hw.0);
        bytes.push(0);
        bytes.extend_from_slice(&self.target_network.to_be_bytes());
        bytes.push(self.target_node);
        bytes
    }

    /// AARP request asking who holds (network, node).
    pub fn request(source_hw: MacAddr, source_network: u16, source_node: u8, network: u16, node: u8) -> Self {
        Self {
            function: AarpFunction::Request,
            source_hw,
            source_network,
            source_node,
            target_hw: MacAddr::ZERO,
            target_network: network,
            target_node: node,
        }
    }

    /// AARP response announcing our own mapping to a requester.
    pub fn response(
        source_hw: MacAddr,
        source_network: u16,
        source_node: u8,
        target_hw: MacAddr,
        target_network: u16,
        target_node: u8,
    ) -> Self {
        Self {
            function: AarpFunction::Response,
            source_hw,
            source_network,
            source_node,
            target_hw,
            target_network,
            target_node,
        }
    }

    /// AARP probe testing whether (network, node) is free to claim.
    pub fn probe(source_hw: MacAddr, network: u16, node: u8) -> Self {
        Self {
            function: AarpFunction::Probe,
            source_hw,
            source_network: network,
            source_node: node,
            target_hw: MacAddr::ZERO,
            target_network: network,
            target_node: node,
        }
    }
}

/// The interesting payload of a received EtherTalk frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElapPayload<'a> {
    /// A long-header DDP datagram (raw bytes, not yet decoded).
    Ddp(&'a [u8]),
    /// An AARP packet.
    Aarp(AarpPacket),
}

/// A parsed 802.3/802.2/SNAP EtherTalk frame.
#[derive(Debug)]
pub struct ElapFrame<'a> {
    pub destination: MacAddr,
    pub source: MacAddr,
    pub payload: ElapPayload<'a>,
}

impl<'a> ElapFrame<'a> {
    /// Parse a raw Ethernet frame; `Ok(None)` for frames that are not
    /// AppleTalk or AARP (EtherType frames, other SNAP protocols).
    pub fn parse(frame: &'a [u8]) -> Result<Option<Self>> {
        if frame.len() < 22 {
            return Err(Error::MalformedDatagram(format!(
                "Ethernet frame of {} bytes is too short",
                frame.len()
            )));
        }
        let length = u16::from_be_bytes([frame[12], frame[13]]) as usize;
        if length > 1500 || frame[14..17] != LLC_SNAP_HEADER {
            // EtherType frame or not LLC/SNAP
            return Ok(None);
        }
        if 14 + length > frame.len() {
            return Err(Error::MalformedDatagram(format!(
                "802.3 length field {} exceeds frame length {}",
                length,
                frame.len()
            )));
        }
        let destination = MacAddr::from_slice(&frame[0..6]).unwrap();
        let source = MacAddr::from_slice(&frame[6..12]).unwrap();
        let snap = &frame[17..22];
        let body = &frame[22..14 + length];
        let payload = if snap == SNAP_APPLETALK {
            ElapPayload::Ddp(body)
        } else if snap == SNAP_AARP {
            ElapPayload::Aarp(AarpPacket::parse(body)?)
        } else {
            return Ok(None);
        };
        Ok(Some(Self {
            destination,
            source,
            payload,
        }))
    }
}

/// Build an 802.3/802.2/SNAP frame, padding the payload to the Ethernet
/// minimum.
pub fn build_frame(
    destination: MacAddr,
    source: MacAddr,
    snap: &[u8; 5],
    payload: &[u8],
) -> Vec<u8> {
    let inner_length = LLC_SNAP_HEADER.len() + snap.len() + payload.len();
    let padded_length = inner_length.max(MIN_PAYLOAD_LENGTH);
    let mut frame = Vec::with_capacity(14 + padded_length);
    frame.extend_from_slice(&destination.0);
    frame.extend_from_slice(&source.0);
    frame.extend_from_slice(&(inner_length as u16).to_be_bytes());
    frame.extend_from_slice(&LLC_SNAP_HEADER);
    frame.extend_from_slice(snap);
    frame.extend_from_slice(payload);
    frame.resize(14 + padded_length, 0);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUR_MAC: MacAddr = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
    const PEER_MAC: MacAddr = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x02]);

    #[test]
    fn test_aarp_roundtrip() {
        let probe = AarpPacket::probe(OUR_MAC, 3, 42);
        let decoded = AarpPacket::parse(&probe.to_bytes()).unwrap();
        assert_eq!(decoded, probe);
        assert_eq!(decoded.function, AarpFunction::Probe);
        assert_eq!(decoded.target_network, 3);
        assert_eq!(decoded.target_node, 42);
    }

    #[test]
    fn test_aarp_frame_roundtrip() {
        let request = AarpPacket::request(OUR_MAC, 3, 10, 3, 42);
        let frame = build_frame(MacAddr::ELAP_BROADCAST, OUR_MAC, &SNAP_AARP, &request.to_bytes());
        // AARP frames are short and always padded
        assert_eq!(frame.len(), 14 + 46);
        let parsed = ElapFrame::parse(&frame).unwrap().unwrap();
        assert_eq!(parsed.destination, MacAddr::ELAP_BROADCAST);
        assert_eq!(parsed.source, OUR_MAC);
        assert_eq!(parsed.payload, ElapPayload::Aarp(request));
    }

    #[test]
    fn test_ddp_frame_roundtrip() {
        let payload = vec![0xAB; 60];
        let frame = build_frame(PEER_MAC, OUR_MAC, &SNAP_APPLETALK, &payload);
        let parsed = ElapFrame::parse(&frame).unwrap().unwrap();
        match parsed.payload {
            ElapPayload::Ddp(body) => assert_eq!(body, &payload[..]),
            other => panic!("expected DDP payload, got {:?}", other),
        }
    }

    #[test]
    fn test_ethertype_frame_ignored() {
        // IPv4 EtherType frame: type field 0x0800 > 1500
        let mut frame = vec![0u8; 60];
        frame[12] = 0x08;
        frame[13] = 0x00;
        assert!(ElapFrame::parse(&frame).unwrap().is_none());
    }

    #[test]
    fn test_other_snap_ignored() {
        let frame = build_frame(PEER_MAC, OUR_MAC, &[0x00, 0x00, 0x00, 0x08, 0x00], &[0u8; 40]);
        assert!(ElapFrame::parse(&frame).unwrap().is_none());
    }

    #[test]
    fn test_zone_multicast_stability() {
        let a = zone_multicast_address(b"Finance");
        let b = zone_multicast_address(b"FINANCE");
        assert_eq!(a, b);
        assert_eq!(&a.0[..5], &ELAP_MULTICAST_PREFIX);
        assert!(a.0[5] <= 0xFC);
    }
}
