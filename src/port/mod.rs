//! Router ports: connections to physical AppleTalk networks
//!
//! Each port owns a link driver and the address-acquisition state
//! machine for its network. Ports deliver inbound datagrams to
//! `Router::inbound` and accept outbound datagrams through `unicast`,
//! `broadcast`, and `multicast`; the outbound path hands frames to a
//! bounded driver queue and never blocks.

mod ethertalk;
mod localtalk;
mod ltoudp;
mod tashtalk;
pub mod testing;

pub use ethertalk::{EtherTalkPort, EtherTalkSeed};
pub use localtalk::LocalTalkSeed;
pub use ltoudp::LtoudpPort;
pub use tashtalk::TashTalkPort;

use crate::dataplane::Router;
use crate::protocol::{Datagram, NetworkRange, ZoneName};
use crate::telemetry::PortStats;
use crate::Result;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Life stages of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Unstarted,
    AcquiringNetworkRange,
    AcquiringNodeAddress,
    Online,
    Stopped,
}

/// A connection to a single AppleTalk network.
///
/// Outbound operations are non-blocking; frames that cannot be queued
/// for the link are dropped and counted. A port only hands the router
/// datagrams addressed to it or broadcast.
pub trait Port: Send + Sync {
    /// Short name for logs and metrics.
    fn short_str(&self) -> String;

    /// Whether this port is on an extended network.
    fn extended_network(&self) -> bool;

    /// Our network number on this port, 0 while unknown.
    fn network(&self) -> u16;

    /// Our node number on this port, 0 while unknown.
    fn node(&self) -> u8;

    /// The port's network range; first == last == 0 while unknown.
    fn network_range(&self) -> NetworkRange;

    fn state(&self) -> PortState;

    /// Start the port. `handle` is this port as shared by the router and
    /// is what the port passes back on inbound dispatch.
    fn start(&self, router: Arc<Router>, handle: Arc<dyn Port>) -> Result<()>;

    /// Signal the port to stop; tasks wind down asynchronously.
    fn stop(&self);

    /// Hand over the port's task handles so the router can await them.
    fn take_tasks(&self) -> Vec<JoinHandle<()>>;

    /// Send a datagram to a specific node over this port.
    fn unicast(&self, network: u16, node: u8, datagram: Datagram);

    /// Broadcast a datagram on this port's network.
    fn broadcast(&self, datagram: Datagram);

    /// Multicast a datagram to a zone on this port's network.
    fn multicast(&self, zone_name: &ZoneName, datagram: Datagram);

    /// The link multicast address for a zone; empty when the link has no
    /// multicast (LocalTalk), telling GetNetInfo clients to broadcast.
    fn multicast_address(&self, zone_name: &[u8]) -> Vec<u8>;

    /// Adopt a network range learned from a peer router. Fails when a
    /// range is already set.
    fn set_network_range(&self, range: NetworkRange) -> Result<()>;

    /// Per-port packet counters.
    fn stats(&self) -> Arc<PortStats>;
}

/// Identity comparison for ports held behind trait objects.
pub fn same_port(a: &Arc<dyn Port>, b: &Arc<dyn Port>) -> bool {
    Arc::ptr_eq(a, b)
}
