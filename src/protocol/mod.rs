//! AppleTalk protocol codecs
//!
//! Wire formats are implemented from scratch: DDP, LLAP, ELAP (802.2/SNAP),
//! AARP, RTMP, ZIP, and NBP.

pub mod ddp;
pub mod elap;
pub mod llap;
pub mod nbp;
pub mod rtmp;
pub mod types;
pub mod zip;
pub mod zone;

pub use ddp::{ddp_checksum, Datagram};
pub use types::*;
pub use zone::ZoneName;
