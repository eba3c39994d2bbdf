//! atrouter - AppleTalk Internet Router
//!
//! A userspace AppleTalk Phase 2 router that forwards DDP datagrams
//! between LocalTalk-over-UDP, TashTalk serial LocalTalk, and EtherTalk
//! ports while speaking RTMP, ZIP, NBP, and AEP.

pub mod config;
pub mod dataplane;
pub mod error;
pub mod port;
pub mod protocol;
pub mod service;
pub mod telemetry;

pub use error::{Error, Result};
