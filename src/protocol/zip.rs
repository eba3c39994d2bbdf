//! ZIP (Zone Information Protocol) packet formats
//!
//! Covers the router-to-router query/reply forms, GetNetInfo, and the
//! three single-packet ATP-transported user requests (GetMyZone,
//! GetZoneList, GetLocalZones).

use super::ddp::MAX_DATA_LENGTH;
use super::types::NetworkRange;
use crate::{Error, Result};

/// DDP type of ZIP packets.
pub const ZIP_DDP_TYPE: u8 = 6;
/// DDP type of ATP packets (GetMyZone and friends ride on ATP).
pub const ATP_DDP_TYPE: u8 = 3;

pub const ZIP_FUNC_QUERY: u8 = 1;
pub const ZIP_FUNC_REPLY: u8 = 2;
pub const ZIP_FUNC_GETNETINFO_REQUEST: u8 = 5;
pub const ZIP_FUNC_GETNETINFO_REPLY: u8 = 6;
pub const ZIP_FUNC_EXT_REPLY: u8 = 8;

pub const ZIP_ATP_FUNC_GETMYZONE: u8 = 7;
pub const ZIP_ATP_FUNC_GETZONELIST: u8 = 8;
pub const ZIP_ATP_FUNC_GETLOCALZONES: u8 = 9;

pub const ATP_FUNC_TREQ: u8 = 0b0100_0000;
pub const ATP_FUNC_TRESP: u8 = 0b1000_0000;
pub const ATP_EOM: u8 = 0b0001_0000;

/// GetNetInfo reply flags.
pub const GNI_FLAG_ZONE_INVALID: u8 = 0x80;
pub const GNI_FLAG_USE_BROADCAST: u8 = 0x40;
pub const GNI_FLAG_ONLY_ONE_ZONE: u8 = 0x20;

/// Parse a ZIP Query payload into the requested network numbers.
pub fn parse_query(data: &[u8]) -> Result<Vec<u16>> {
    if data.len() < 2 || data[0] != ZIP_FUNC_QUERY {
        return Err(Error::MalformedDatagram("not a ZIP query".into()));
    }
    let count = data[1] as usize;
    if data.len() != 2 + count * 2 {
        return Err(Error::MalformedDatagram(format!(
            "ZIP query count {} does not match payload length {}",
            count,
            data.len()
        )));
    }
    Ok(data[2..]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Build ZIP Query payloads for the given networks, splitting at the DDP
/// payload limit and the one-byte count field.
pub fn build_queries(networks: &[u16]) -> Vec<Vec<u8>> {
    let per_packet = ((MAX_DATA_LENGTH - 2) / 2).min(u8::MAX as usize);
    networks
        .chunks(per_packet.max(1))
        .map(|chunk| {
            let mut data = Vec::with_capacity(2 + chunk.len() * 2);
            data.push(ZIP_FUNC_QUERY);
            data.push(chunk.len() as u8);
            for network in chunk {
                data.extend_from_slice(&network.to_be_bytes());
            }
            data
        })
        .collect()
}

/// A decoded ZIP Reply or Extended Reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipReply {
    pub extended: bool,
    /// For extended replies, the total number of zones for the network.
    pub count: u8,
    /// (network, zone name) pairs; zero-length zones are dropped.
    pub zones: Vec<(u16, Vec<u8>)>,
}

/// Parse a ZIP Reply (function 2) or Extended Reply (function 8) payload.
pub fn parse_reply(data: &[u8]) -> Result<ZipReply> {
    if data.len() < 2 {
        return Err(Error::MalformedDatagram("ZIP reply too short".into()));
    }
    let extended = match data[0] {
        ZIP_FUNC_REPLY => false,
        ZIP_FUNC_EXT_REPLY => true,
        other => {
            return Err(Error::MalformedDatagram(format!(
                "unexpected ZIP reply function {}",
                other
            )))
        }
    };
    let count = data[1];
    let mut zones = Vec::new();
    let mut rest = &data[2..];
    while rest.len() >= 3 {
        let network = u16::from_be_bytes([rest[0], rest[1]]);
        let zone_length = rest[2] as usize;
        if rest.len() < 3 + zone_length {
            break;
        }
        if zone_length > 0 {
            zones.push((network, rest[3..3 + zone_length].to_vec()));
        }
        rest = &rest[3 + zone_length..];
    }
    if zones.is_empty() {
        return Err(Error::MalformedDatagram("ZIP reply names no zones".into()));
    }
    Ok(ZipReply {
        extended,
        count,
        zones,
    })
}

/// Build Extended Reply payloads listing a network's zones, splitting at
/// the DDP payload limit. Every packet repeats the network's total zone
/// count so the querier can recognize completeness.
pub fn build_extended_replies(network: u16, zone_names: &[&[u8]]) -> Vec<Vec<u8>> {
    let total = zone_names.len().min(u8::MAX as usize) as u8;
    let mut packets = Vec::new();
    let mut body: Vec<u8> = Vec::new();
    for zone_name in zone_names {
        let item_length = 3 + zone_name.len();
        if !body.is_empty() && 2 + body.len() + item_length > MAX_DATA_LENGTH {
            packets.push(finish_extended_reply(total, std::mem::take(&mut body)));
        }
        body.extend_from_slice(&network.to_be_bytes());
        body.push(zone_name.len() as u8);
        body.extend_from_slice(zone_name);
    }
    if !body.is_empty() {
        packets.push(finish_extended_reply(total, body));
    }
    packets
}

fn finish_extended_reply(count: u8, body: Vec<u8>) -> Vec<u8> {
    let mut data = Vec::with_capacity(2 + body.len());
    data.push(ZIP_FUNC_EXT_REPLY);
    data.push(count);
    data.extend_from_slice(&body);
    data
}

/// Parse a GetNetInfo request payload, yielding the requested zone name
/// (possibly empty).
pub fn parse_get_net_info(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 7 || data[0] != ZIP_FUNC_GETNETINFO_REQUEST {
        return Err(Error::MalformedDatagram("not a GetNetInfo request".into()));
    }
    if data[1..6] != [0, 0, 0, 0, 0] {
        return Err(Error::MalformedDatagram(
            "GetNetInfo request reserved bytes must be zero".into(),
        ));
    }
    let zone_length = data[6] as usize;
    if data.len() < 7 + zone_length {
        return Err(Error::MalformedDatagram(
            "GetNetInfo request zone name truncated".into(),
        ));
    }
    Ok(data[7..7 + zone_length].to_vec())
}

/// Build a GetNetInfo request payload for the given zone name.
pub fn build_get_net_info(zone_name: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(7 + zone_name.len());
    data.push(ZIP_FUNC_GETNETINFO_REQUEST);
    data.extend_from_slice(&[0, 0, 0, 0, 0]);
    data.push(zone_name.len() as u8);
    data.extend_from_slice(zone_name);
    data
}

/// The pieces of a GetNetInfo reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetNetInfoReply {
    pub flags: u8,
    pub range: NetworkRange,
    pub requested_zone: Vec<u8>,
    pub multicast_address: Vec<u8>,
    /// Present only when the requested zone was invalid.
    pub default_zone: Option<Vec<u8>>,
}

impl GetNetInfoReply {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.push(ZIP_FUNC_GETNETINFO_REPLY);
        data.push(self.flags);
        data.extend_from_slice(&self.range.first.to_be_bytes());
        data.extend_from_slice(&self.range.last.to_be_bytes());
        data.push(self.requested_zone.len() as u8);
        data.extend_from_slice(&self.requested_zone);
        data.push(self.multicast_address.len() as u8);
        data.extend_from_slice(&self.multicast_address);
        if let Some(ref default_zone) = self.default_zone {
            data.push(default_zone.len() as u8);
            data.extend_from_slice(default_zone);
        }
        data
    }

    /// Parse a GetNetInfo reply payload. Ports still acquiring their
    /// network range adopt the range carried here.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 8 || data[0] != ZIP_FUNC_GETNETINFO_REPLY {
            return Err(Error::MalformedDatagram("not a GetNetInfo reply".into()));
        }
        let flags = data[1];
        let range = NetworkRange::new(
            u16::from_be_bytes([data[2], data[3]]),
            u16::from_be_bytes([data[4], data[5]]),
        );
        let zone_length = data[6] as usize;
        if data.len() < 7 + zone_length + 1 {
            return Err(Error::MalformedDatagram("GetNetInfo reply truncated".into()));
        }
        let requested_zone = data[7..7 + zone_length].to_vec();
        let mut rest = &data[7 + zone_length..];
        let multicast_length = rest[0] as usize;
        if rest.len() < 1 + multicast_length {
            return Err(Error::MalformedDatagram("GetNetInfo reply truncated".into()));
        }
        let multicast_address = rest[1..1 + multicast_length].to_vec();
        rest = &rest[1 + multicast_length..];
        let default_zone = if flags & GNI_FLAG_ZONE_INVALID != 0 && !rest.is_empty() {
            let default_length = rest[0] as usize;
            if rest.len() < 1 + default_length {
                return Err(Error::MalformedDatagram("GetNetInfo reply truncated".into()));
            }
            Some(rest[1..1 + default_length].to_vec())
        } else {
            None
        };
        Ok(Self {
            flags,
            range,
            requested_zone,
            multicast_address,
            default_zone,
        })
    }
}

/// A single-packet ATP transaction request carrying a ZIP user function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtpZipRequest {
    pub transaction_id: u16,
    pub function: u8,
    /// 1-relative index of the first zone wanted (GetZoneList forms).
    pub start_index: u16,
}

/// Parse an ATP TReq carrying a ZIP user request, or `None` when the
/// payload is not such a request.
pub fn parse_atp_request(data: &[u8]) -> Option<AtpZipRequest> {
    if data.len() != 8 {
        return None;
    }
    let control = data[0];
    let bitmap = data[1];
    let transaction_id = u16::from_be_bytes([data[2], data[3]]);
    let function = data[4];
    let zero = data[5];
    let start_index = u16::from_be_bytes([data[6], data[7]]);
    if control != ATP_FUNC_TREQ || bitmap != 1 || zero != 0 {
        return None;
    }
    Some(AtpZipRequest {
        transaction_id,
        function,
        start_index,
    })
}

/// Build an ATP TResp payload answering a ZIP user request.
pub fn build_atp_reply(
    transaction_id: u16,
    last_flag: bool,
    zone_count: u16,
    zones_payload: &[u8],
) -> Vec<u8> {
    let mut data = Vec::with_capacity(8 + zones_payload.len());
    data.push(ATP_FUNC_TRESP | ATP_EOM);
    data.push(0);
    data.extend_from_slice(&transaction_id.to_be_bytes());
    data.push(last_flag as u8);
    data.push(0);
    data.extend_from_slice(&zone_count.to_be_bytes());
    data.extend_from_slice(zones_payload);
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_roundtrip() {
        let networks = vec![10, 20, 0xFE00];
        let packets = build_queries(&networks);
        assert_eq!(packets.len(), 1);
        assert_eq!(parse_query(&packets[0]).unwrap(), networks);
    }

    #[test]
    fn test_query_splitting() {
        let networks: Vec<u16> = (1..=600).collect();
        let packets = build_queries(&networks);
        assert!(packets.len() > 1);
        let mut all = Vec::new();
        for packet in &packets {
            assert!(packet.len() <= MAX_DATA_LENGTH);
            all.extend(parse_query(packet).unwrap());
        }
        assert_eq!(all, networks);
    }

    #[test]
    fn test_query_count_mismatch_rejected() {
        assert!(parse_query(&[ZIP_FUNC_QUERY, 2, 0, 10]).is_err());
    }

    #[test]
    fn test_extended_reply_roundtrip() {
        let zones: Vec<&[u8]> = vec![b"Finance", b"Marketing"];
        let packets = build_extended_replies(10, &zones);
        assert_eq!(packets.len(), 1);
        let reply = parse_reply(&packets[0]).unwrap();
        assert!(reply.extended);
        assert_eq!(reply.count, 2);
        assert_eq!(
            reply.zones,
            vec![(10, b"Finance".to_vec()), (10, b"Marketing".to_vec())]
        );
    }

    #[test]
    fn test_extended_reply_splitting() {
        let names: Vec<Vec<u8>> = (0..40)
            .map(|i| format!("Zone Number {:02} With Padding", i).into_bytes())
            .collect();
        let zones: Vec<&[u8]> = names.iter().map(|n| n.as_slice()).collect();
        let packets = build_extended_replies(10, &zones);
        assert!(packets.len() > 1);
        let mut seen = 0;
        for packet in &packets {
            assert!(packet.len() <= MAX_DATA_LENGTH);
            let reply = parse_reply(packet).unwrap();
            assert_eq!(reply.count, 40);
            seen += reply.zones.len();
        }
        assert_eq!(seen, 40);
    }

    #[test]
    fn test_get_net_info_roundtrip() {
        let request = build_get_net_info(b"Finance");
        assert_eq!(parse_get_net_info(&request).unwrap(), b"Finance");
        let empty = build_get_net_info(b"");
        assert_eq!(parse_get_net_info(&empty).unwrap(), b"");
    }

    #[test]
    fn test_get_net_info_reply_roundtrip() {
        let reply = GetNetInfoReply {
            flags: GNI_FLAG_ZONE_INVALID,
            range: NetworkRange::new(3, 5),
            requested_zone: b"Nowhere".to_vec(),
            multicast_address: vec![0x09, 0x00, 0x07, 0x00, 0x00, 0x1A],
            default_zone: Some(b"Finance".to_vec()),
        };
        let parsed = GetNetInfoReply::parse(&reply.to_bytes()).unwrap();
        assert_eq!(parsed, reply);
    }

    #[test]
    fn test_get_net_info_reply_valid_zone_omits_default() {
        let reply = GetNetInfoReply {
            flags: GNI_FLAG_ONLY_ONE_ZONE,
            range: NetworkRange::single(1),
            requested_zone: b"Finance".to_vec(),
            multicast_address: Vec::new(),
            default_zone: None,
        };
        let parsed = GetNetInfoReply::parse(&reply.to_bytes()).unwrap();
        assert_eq!(parsed.default_zone, None);
        assert_eq!(parsed.range, NetworkRange::single(1));
    }

    #[test]
    fn test_atp_request_roundtrip() {
        let data = [ATP_FUNC_TREQ, 1, 0x12, 0x34, ZIP_ATP_FUNC_GETZONELIST, 0, 0, 5];
        let request = parse_atp_request(&data).unwrap();
        assert_eq!(request.transaction_id, 0x1234);
        assert_eq!(request.function, ZIP_ATP_FUNC_GETZONELIST);
        assert_eq!(request.start_index, 5);
    }

    #[test]
    fn test_atp_request_rejects_non_treq() {
        let data = [ATP_FUNC_TRESP, 1, 0, 1, ZIP_ATP_FUNC_GETMYZONE, 0, 0, 1];
        assert!(parse_atp_request(&data).is_none());
    }

    #[test]
    fn test_atp_reply_layout() {
        let reply = build_atp_reply(0x1234, true, 1, &[7, b'F', b'i', b'n', b'a', b'n', b'c', b'e']);
        assert_eq!(reply[0], ATP_FUNC_TRESP | ATP_EOM);
        assert_eq!(u16::from_be_bytes([reply[2], reply[3]]), 0x1234);
        assert_eq!(reply[4], 1); // last flag
        assert_eq!(u16::from_be_bytes([reply[6], reply[7]]), 1);
        assert_eq!(&reply[8..], &[7, b'F', b'i', b'n', b'a', b'n', b'c', b'e']);
    }
}
