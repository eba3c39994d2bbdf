//! Test support: an in-memory port that records what it sends
//!
//! Stands in for a link during table and scenario tests; datagrams
//! handed to it are captured instead of framed onto a wire.

use crate::dataplane::Router;
use crate::port::{Port, PortState};
use crate::protocol::{Datagram, NetworkRange, ZoneName};
use crate::telemetry::PortStats;
use crate::Result;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::task::JoinHandle;

/// A datagram captured on its way out of a [`TestPort`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentDatagram {
    Unicast {
        network: u16,
        node: u8,
        datagram: Datagram,
    },
    Broadcast(Datagram),
    Multicast {
        zone_name: Vec<u8>,
        datagram: Datagram,
    },
}

struct TestState {
    network: u16,
    node: u8,
    range: NetworkRange,
    port_state: PortState,
}

/// An in-memory port.
pub struct TestPort {
    label: String,
    extended: bool,
    state: Mutex<TestState>,
    sent: Mutex<Vec<SentDatagram>>,
    router: OnceLock<Arc<Router>>,
    handle: OnceLock<Arc<dyn Port>>,
    stats: Arc<PortStats>,
}

impl TestPort {
    fn build(network: u16, node: u8, range: NetworkRange, extended: bool) -> Arc<Self> {
        Arc::new(Self {
            label: format!("test{}", network),
            extended,
            state: Mutex::new(TestState {
                network,
                node,
                range,
                port_state: PortState::Online,
            }),
            sent: Mutex::new(Vec::new()),
            router: OnceLock::new(),
            handle: OnceLock::new(),
            stats: Arc::new(PortStats::new()),
        })
    }

    /// A non-extended port that is already Online.
    pub fn online(network: u16, node: u8, range: NetworkRange) -> Arc<Self> {
        Self::build(network, node, range, false)
    }

    /// An extended port that is already Online.
    pub fn extended_online(network: u16, node: u8, range: NetworkRange) -> Arc<Self> {
        Self::build(network, node, range, true)
    }

    /// A port that has not discovered its network range yet.
    pub fn acquiring(label: impl Into<String>, extended: bool) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            extended,
            state: Mutex::new(TestState {
                network: 0,
                node: 0,
                range: NetworkRange::new(0, 0),
                port_state: PortState::AcquiringNetworkRange,
            }),
            sent: Mutex::new(Vec::new()),
            router: OnceLock::new(),
            handle: OnceLock::new(),
            stats: Arc::new(PortStats::new()),
        })
    }

    /// Take everything sent through this port so far.
    pub fn drain(&self) -> Vec<SentDatagram> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl Port for TestPort {
    fn short_str(&self) -> String {
        self.label.clone()
    }

    fn extended_network(&self) -> bool {
        self.extended
    }

    fn network(&self) -> u16 {
        self.state.lock().unwrap().network
    }

    fn node(&self) -> u8 {
        self.state.lock().unwrap().node
    }

    fn network_range(&self) -> NetworkRange {
        self.state.lock().unwrap().range
    }

    fn state(&self) -> PortState {
        self.state.lock().unwrap().port_state
    }

    fn start(&self, router: Arc<Router>, handle: Arc<dyn Port>) -> Result<()> {
        let range = {
            let state = self.state.lock().unwrap();
            state.range
        };
        if !range.is_unknown() {
            for removed in router.routing_table.set_port_range(&handle, range) {
                router.zone_table.remove_networks(removed);
            }
        }
        let _ = self.router.set(router);
        let _ = self.handle.set(handle);
        Ok(())
    }

    fn stop(&self) {
        self.state.lock().unwrap().port_state = PortState::Stopped;
    }

    fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        Vec::new()
    }

    fn unicast(&self, network: u16, node: u8, datagram: Datagram) {
        self.sent.lock().unwrap().push(SentDatagram::Unicast {
            network,
            node,
            datagram,
        });
    }

    fn broadcast(&self, datagram: Datagram) {
        self.sent
            .lock()
            .unwrap()
            .push(SentDatagram::Broadcast(datagram));
    }

    fn multicast(&self, zone_name: &ZoneName, datagram: Datagram) {
        self.sent.lock().unwrap().push(SentDatagram::Multicast {
            zone_name: zone_name.as_bytes().to_vec(),
            datagram,
        });
    }

    fn multicast_address(&self, _zone_name: &[u8]) -> Vec<u8> {
        Vec::new()
    }

    fn set_network_range(&self, range: NetworkRange) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.range = range;
            if !self.extended {
                state.network = range.first;
            }
            if state.port_state == PortState::AcquiringNetworkRange {
                state.port_state = PortState::AcquiringNodeAddress;
            }
        }
        if let (Some(router), Some(handle)) = (self.router.get(), self.handle.get()) {
            for removed in router.routing_table.set_port_range(handle, range) {
                router.zone_table.remove_networks(removed);
            }
        }
        Ok(())
    }

    fn stats(&self) -> Arc<PortStats> {
        Arc::clone(&self.stats)
    }
}
