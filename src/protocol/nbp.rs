//! NBP (Name Binding Protocol) packet format
//!
//! The router only ever handles single-tuple BrRq and FwdReq packets;
//! LkUp and LkUp-Reply transit it as ordinary datagrams. The `=`
//! wildcard inside entity fields is matched by end nodes, not here.

use crate::{Error, Result};

/// DDP type of NBP packets.
pub const NBP_DDP_TYPE: u8 = 2;

pub const NBP_FUNC_BRRQ: u8 = 1;
pub const NBP_FUNC_LKUP: u8 = 2;
pub const NBP_FUNC_LKUP_REPLY: u8 = 3;
pub const NBP_FUNC_FWDREQ: u8 = 4;

/// Maximum length of an entity name field.
pub const MAX_FIELD_LENGTH: usize = 32;

/// A single-tuple NBP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NbpPacket {
    pub function: u8,
    pub nbp_id: u8,
    /// Address of the original requester, to which replies go directly.
    pub network: u16,
    pub node: u8,
    pub socket: u8,
    pub enumerator: u8,
    pub object: Vec<u8>,
    pub entity_type: Vec<u8>,
    /// Zone field; empty means `*` (the requester's own zone).
    pub zone: Vec<u8>,
}

impl NbpPacket {
    /// Parse an NBP payload carrying exactly one tuple.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 12 {
            return Err(Error::MalformedDatagram("NBP packet too short".into()));
        }
        let function = data[0] >> 4;
        let tuple_count = data[0] & 0xF;
        if tuple_count != 1 {
            return Err(Error::MalformedDatagram(format!(
                "NBP packet carries {} tuples, expected 1",
                tuple_count
            )));
        }
        let nbp_id = data[1];
        let network = u16::from_be_bytes([data[2], data[3]]);
        let node = data[4];
        let socket = data[5];
        let enumerator = data[6];

        let object_length = data[7] as usize;
        if object_length < 1 || object_length > MAX_FIELD_LENGTH {
            return Err(Error::MalformedDatagram(format!(
                "NBP object field length {} out of range",
                object_length
            )));
        }
        if data.len() < 9 + object_length {
            return Err(Error::MalformedDatagram("NBP object field truncated".into()));
        }
        let object = data[8..8 + object_length].to_vec();

        let type_length = data[8 + object_length] as usize;
        if type_length < 1 || type_length > MAX_FIELD_LENGTH {
            return Err(Error::MalformedDatagram(format!(
                "NBP type field length {} out of range",
                type_length
            )));
        }
        if data.len() < 10 + object_length + type_length {
            return Err(Error::MalformedDatagram("NBP type field truncated".into()));
        }
        let entity_type = data[9 + object_length..9 + object_length + type_length].to_vec();

        let zone_offset = 9 + object_length + type_length;
        let zone_length = data[zone_offset] as usize;
        if zone_length > MAX_FIELD_LENGTH {
            return Err(Error::MalformedDatagram(format!(
                "NBP zone field length {} out of range",
                zone_length
            )));
        }
        if data.len() < zone_offset + 1 + zone_length {
            return Err(Error::MalformedDatagram("NBP zone field truncated".into()));
        }
        let zone = data[zone_offset + 1..zone_offset + 1 + zone_length].to_vec();

        Ok(Self {
            function,
            nbp_id,
            network,
            node,
            socket,
            enumerator,
            object,
            entity_type,
            zone,
        })
    }

    /// Encode this tuple under a different function code; used to turn a
    /// BrRq into the LkUp and FwdReq packets the router fans out.
    pub fn with_function(&self, function: u8) -> Vec<u8> {
        let mut data = Vec::with_capacity(
            11 + self.object.len() + self.entity_type.len() + self.zone.len(),
        );
        data.push((function << 4) | 1);
        data.push(self.nbp_id);
        data.extend_from_slice(&self.network.to_be_bytes());
        data.push(self.node);
        data.push(self.socket);
        data.push(self.enumerator);
        data.push(self.object.len() as u8);
        data.extend_from_slice(&self.object);
        data.push(self.entity_type.len() as u8);
        data.extend_from_slice(&self.entity_type);
        data.push(self.zone.len() as u8);
        data.extend_from_slice(&self.zone);
        data
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.with_function(self.function)
    }
}
