use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("malformed datagram: {0}")]
    MalformedDatagram(String),

    #[error("DDP checksum is 0x{found:04X} but should be 0x{computed:04X}")]
    ChecksumMismatch { found: u16, computed: u16 },

    #[error("no route to network {0}")]
    NoRoute(u16),

    #[error("hop count limit exceeded")]
    HopLimitExceeded,

    #[error("link transmit failed: {0}")]
    LinkTransmitFailed(String),

    #[error("all probed addresses on {port} are in use")]
    AddressInUse { port: String },

    #[error("{port} could not discover its network range within {seconds} seconds")]
    PortStartupTimeout { port: String, seconds: u64 },

    #[error("invalid zone name: {0}")]
    InvalidZoneName(String),

    #[error("zone table holds range {existing} which conflicts with {given}")]
    ZoneRangeConflict {
        existing: crate::protocol::NetworkRange,
        given: crate::protocol::NetworkRange,
    },

    #[error("port {0} has no network or node address yet")]
    PortNotReady(String),
}

pub type Result<T> = std::result::Result<T, Error>;
