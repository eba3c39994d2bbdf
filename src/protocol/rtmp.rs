//! RTMP (Routing Table Maintenance Protocol) packet formats

use super::ddp::MAX_DATA_LENGTH;
use super::types::NetworkRange;
use crate::{Error, Result};

/// DDP type of RTMP data and response packets.
pub const RTMP_DDP_TYPE_DATA: u8 = 1;
/// DDP type of RTMP request packets.
pub const RTMP_DDP_TYPE_REQUEST: u8 = 5;

/// RTMP version carried in extended tuples and non-extended headers.
pub const RTMP_VERSION: u8 = 0x82;

/// Request function: send an RTMP response.
pub const RTMP_FUNC_REQUEST: u8 = 1;
/// Request function: route data request honoring split horizon.
pub const RTMP_FUNC_RDR_SPLIT_HORIZON: u8 = 2;
/// Request function: route data request without split horizon.
pub const RTMP_FUNC_RDR_NO_SPLIT_HORIZON: u8 = 3;

/// Advertised distance for unreachable (dying) routes; anything past the
/// 15-hop horizon tells neighbors to mark the route bad.
pub const RTMP_DISTANCE_UNREACHABLE: u8 = 16;

const NODE_ID_LENGTH_BITS: u8 = 8;

/// One routing tuple in an RTMP data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtmpTuple {
    pub range: NetworkRange,
    pub distance: u8,
    pub extended: bool,
}

impl RtmpTuple {
    fn encoded_len(&self) -> usize {
        if self.extended {
            6
        } else {
            3
        }
    }

    fn encode_into(&self, bytes: &mut Vec<u8>) {
        bytes.extend_from_slice(&self.range.first.to_be_bytes());
        if self.extended {
            bytes.push((self.distance & 0x1F) | 0x80);
            bytes.extend_from_slice(&self.range.last.to_be_bytes());
            bytes.push(RTMP_VERSION);
        } else {
            bytes.push(self.distance & 0x1F);
        }
    }
}

/// A decoded RTMP data packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpData {
    pub sender_network: u16,
    pub sender_node: u8,
    /// The sender's own network range; what a non-seeded port adopts.
    pub sender_range: NetworkRange,
    pub tuples: Vec<RtmpTuple>,
}

impl RtmpData {
    /// Parse the payload of an RTMP data packet received on a port.
    ///
    /// On an extended port the first tuple must be the sender's own
    /// extended range tuple; on a non-extended port the header instead
    /// carries a zero word and the version.
    pub fn parse(data: &[u8], extended_port: bool) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::MalformedDatagram("RTMP data too short".into()));
        }
        let sender_network = u16::from_be_bytes([data[0], data[1]]);
        if data[2] != NODE_ID_LENGTH_BITS {
            return Err(Error::MalformedDatagram(format!(
                "RTMP node ID length {} is not 8 bits",
                data[2]
            )));
        }
        let sender_node = data[3];
        let mut rest = &data[4..];

        let sender_range;
        if extended_port {
            if rest.len() < 6 {
                return Err(Error::MalformedDatagram(
                    "RTMP data too short for an extended range tuple".into(),
                ));
            }
            if rest[2] & 0x80 == 0 {
                return Err(Error::MalformedDatagram(
                    "first RTMP tuple must be the sender's extended range".into(),
                ));
            }
            if rest[5] != RTMP_VERSION {
                return Err(Error::MalformedDatagram(format!(
                    "unrecognized RTMP version 0x{:02X}",
                    rest[5]
                )));
            }
            sender_range = NetworkRange::new(
                u16::from_be_bytes([rest[0], rest[1]]),
                u16::from_be_bytes([rest[3], rest[4]]),
            );
            // the sender's tuple is re-read below as an ordinary tuple
        } else {
            if rest.len() < 3 {
                return Err(Error::MalformedDatagram("RTMP data too short".into()));
            }
            if rest[0] != 0 || rest[1] != 0 {
                return Err(Error::MalformedDatagram(
                    "RTMP header word must be zero on a non-extended network".into(),
                ));
            }
            if rest[2] != RTMP_VERSION {
                return Err(Error::MalformedDatagram(format!(
                    "unrecognized RTMP version 0x{:02X}",
                    rest[2]
                )));
            }
            sender_range = NetworkRange::single(sender_network);
            rest = &rest[3..];
        }

        let mut tuples = Vec::new();
        let mut index = 0;
        while rest.len() - index >= 3 {
            let first = u16::from_be_bytes([rest[index], rest[index + 1]]);
            let range_distance = rest[index + 2];
            if range_distance & 0x80 != 0 {
                if rest.len() - index < 6 {
                    break;
                }
                let last = u16::from_be_bytes([rest[index + 3], rest[index + 4]]);
                tuples.push(RtmpTuple {
                    range: NetworkRange::new(first, last),
                    distance: range_distance & 0x1F,
                    extended: true,
                });
                index += 6;
            } else {
                tuples.push(RtmpTuple {
                    range: NetworkRange::single(first),
                    distance: range_distance & 0x1F,
                    extended: false,
                });
                index += 3;
            }
        }
        if index != rest.len() {
            return Err(Error::MalformedDatagram(
                "RTMP tuples did not end where expected".into(),
            ));
        }

        Ok(Self {
            sender_network,
            sender_node,
            sender_range,
            tuples,
        })
    }
}

/// Build the payloads of one or more RTMP data packets advertising the
/// given tuples from a port, splitting at the DDP payload limit.
///
/// For an extended port the tuple matching the port's own range leads
/// every packet; its absence is an error since the routing table must
/// hold the port's directly-connected entry.
pub fn build_data_packets(
    port_network: u16,
    port_node: u8,
    port_extended: bool,
    port_range: NetworkRange,
    tuples: &[RtmpTuple],
) -> Result<Vec<Vec<u8>>> {
    let mut header = Vec::with_capacity(10);
    header.extend_from_slice(&port_network.to_be_bytes());
    header.push(NODE_ID_LENGTH_BITS);
    header.push(port_node);

    let mut body_tuples: Vec<&RtmpTuple> = Vec::new();
    if port_extended {
        let this_net = tuples
            .iter()
            .find(|t| t.extended && t.range == port_range)
            .ok_or_else(|| {
                Error::Config("port's network range not present in routing table".into())
            })?;
        this_net.encode_into(&mut header);
        body_tuples.extend(tuples.iter().filter(|t| !(t.extended && t.range == port_range)));
    } else {
        header.extend_from_slice(&[0, 0]);
        header.push(RTMP_VERSION);
        body_tuples.extend(tuples.iter());
    }

    let mut packets = Vec::new();
    let mut packet = header.clone();
    for tuple in body_tuples {
        if packet.len() + tuple.encoded_len() > MAX_DATA_LENGTH {
            packets.push(std::mem::replace(&mut packet, header.clone()));
        }
        tuple.encode_into(&mut packet);
    }
    packets.push(packet);
    Ok(packets)
}

/// Build the payload of an RTMP response to an RTMP Request: the port's
/// own tuple in the short enumerating form.
pub fn build_response(
    port_network: u16,
    port_node: u8,
    port_extended: bool,
    port_range: NetworkRange,
) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(10);
    bytes.extend_from_slice(&port_network.to_be_bytes());
    bytes.push(NODE_ID_LENGTH_BITS);
    bytes.push(port_node);
    if port_extended {
        bytes.extend_from_slice(&port_range.first.to_be_bytes());
        bytes.push(0x80);
        bytes.extend_from_slice(&port_range.last.to_be_bytes());
        bytes.push(RTMP_VERSION);
    }
    bytes
}
