//! Shared engine for LocalTalk ports
//!
//! Both the LToUDP and TashTalk drivers speak LLAP over a non-extended
//! network. This engine owns the address-acquisition state machine
//! (network discovery through ZIP GetNetInfo plus RTMP evidence, then
//! node claiming through ENQ probes), the short/long DDP header choice,
//! and the inbound frame dispatch. Drivers move raw LLAP frames.

use crate::dataplane::Router;
use crate::port::{Port, PortState};
use crate::protocol::llap::{
    build_ack, build_enq, build_frame, LlapFrame, LLAP_TYPE_ACK, LLAP_TYPE_DDP_LONG,
    LLAP_TYPE_DDP_SHORT, LLAP_TYPE_ENQ,
};
use crate::protocol::zip::{build_get_net_info, ZIP_DDP_TYPE};
use crate::protocol::{
    Datagram, NetworkRange, ZoneName, NODE_BROADCAST, STARTUP_NETWORK_MAX, STARTUP_NETWORK_MIN,
    ZIP_SOCKET,
};
use crate::telemetry::PortStats;
use crate::{Error, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Interval between ENQ probes for a node address.
const ENQ_INTERVAL: Duration = Duration::from_millis(250);
/// Clear probes before a node address is considered ours.
const ENQ_ATTEMPTS: u32 = 8;
/// Interval between GetNetInfo probes while discovering the network.
const GET_NET_INFO_INTERVAL: Duration = Duration::from_secs(2);
/// How long a non-seeded port gets to discover its network.
const STARTUP_DEADLINE_SECS: u64 = 60;
/// Highest node number a LocalTalk node may claim.
const NODE_MAX: u8 = 0xFE;

/// Seed configuration for a LocalTalk port.
#[derive(Debug, Clone)]
pub struct LocalTalkSeed {
    pub network: u16,
    pub zone_name: ZoneName,
}

struct LinkState {
    network: u16,
    node: u8,
    port_state: PortState,
    desired_node: u8,
    node_attempts: u32,
    candidates: Vec<u8>,
    candidates_exhausted: bool,
    startup_network: u16,
    startup_node: u8,
}

/// The driver-independent half of a LocalTalk port.
pub(crate) struct LocalTalkLink {
    label: String,
    seed: Option<LocalTalkSeed>,
    respond_to_enq: bool,
    state: Mutex<LinkState>,
    frame_tx: mpsc::Sender<Vec<u8>>,
    router: OnceLock<Arc<Router>>,
    handle: OnceLock<Arc<dyn Port>>,
    stats: OnceLock<Arc<PortStats>>,
    stop: watch::Sender<bool>,
    /// Publishes the node number once claimed; the TashTalk driver
    /// watches this to program the modem's node bitmap.
    node_claimed: watch::Sender<u8>,
}

impl LocalTalkLink {
    pub(crate) fn new(
        label: String,
        seed: Option<LocalTalkSeed>,
        desired_node: u8,
        respond_to_enq: bool,
        frame_tx: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        let mut rng = rand::thread_rng();
        let mut candidates: Vec<u8> = (1..=NODE_MAX).filter(|&n| n != desired_node).collect();
        candidates.shuffle(&mut rng);
        if (1..=NODE_MAX).contains(&desired_node) {
            candidates.push(desired_node); // tried first
        }
        let first_candidate = candidates.pop().unwrap_or(desired_node);
        let (stop, _) = watch::channel(false);
        let (node_claimed, _) = watch::channel(0);
        Self {
            label,
            seed,
            respond_to_enq,
            state: Mutex::new(LinkState {
                network: 0,
                node: 0,
                port_state: PortState::Unstarted,
                desired_node: first_candidate,
                node_attempts: 0,
                candidates,
                candidates_exhausted: false,
                startup_network: rng.gen_range(STARTUP_NETWORK_MIN..=STARTUP_NETWORK_MAX),
                startup_node: rng.gen_range(1..=NODE_MAX),
            }),
            frame_tx,
            router: OnceLock::new(),
            handle: OnceLock::new(),
            stats: OnceLock::new(),
            stop,
            node_claimed,
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn attach(
        &self,
        router: Arc<Router>,
        handle: Arc<dyn Port>,
    ) -> Arc<PortStats> {
        let stats = router.metrics().register_port(&self.label);
        let _ = self.stats.set(Arc::clone(&stats));
        let _ = self.router.set(router);
        let _ = self.handle.set(handle);
        self.state.lock().unwrap().port_state = PortState::AcquiringNetworkRange;
        stats
    }

    pub(crate) fn stop_signal(&self) -> &watch::Sender<bool> {
        &self.stop
    }

    pub(crate) fn node_claimed_rx(&self) -> watch::Receiver<u8> {
        self.node_claimed.subscribe()
    }

    pub(crate) fn signal_stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.port_state = PortState::Stopped;
        }
        self.stop.send_replace(true);
        if let (Some(router), Some(handle)) = (self.router.get(), self.handle.get()) {
            for range in router.routing_table.remove_port_routes(handle) {
                router.zone_table.remove_networks(range);
            }
        }
    }

    pub(crate) fn network(&self) -> u16 {
        self.state.lock().unwrap().network
    }

    pub(crate) fn node(&self) -> u8 {
        self.state.lock().unwrap().node
    }

    pub(crate) fn network_range(&self) -> NetworkRange {
        let state = self.state.lock().unwrap();
        NetworkRange::single(state.network)
    }

    pub(crate) fn port_state(&self) -> PortState {
        self.state.lock().unwrap().port_state
    }

    /// Whether a node number is one this port currently answers for,
    /// including the candidate being probed. The LToUDP driver uses this
    /// to filter its own transmissions out of the multicast group.
    pub(crate) fn is_own_node(&self, node: u8) -> bool {
        if node == 0 {
            return false;
        }
        let state = self.state.lock().unwrap();
        node == state.node || (state.node == 0 && node == state.desired_node)
    }

    fn stats_ref(&self) -> Option<&Arc<PortStats>> {
        self.stats.get()
    }

    /// Queue an LLAP frame for the driver; full queues drop the frame.
    pub(crate) fn send_frame(&self, frame: Vec<u8>) {
        if let Some(stats) = self.stats_ref() {
            stats.record_tx(frame.len());
        }
        if self.frame_tx.try_send(frame).is_err() {
            if let Some(stats) = self.stats_ref() {
                stats.tx_drops.inc();
            }
            debug!("{} link queue full, dropping frame", self.label);
        }
    }

    /// Called by the driver with each received LLAP frame.
    pub(crate) fn inbound_frame(&self, frame_data: &[u8]) {
        if let Some(stats) = self.stats_ref() {
            stats.record_rx(frame_data.len());
        }
        let frame = match LlapFrame::parse(frame_data) {
            Ok(frame) => frame,
            Err(_) => {
                if let Some(stats) = self.stats_ref() {
                    stats.malformed_datagrams.inc();
                }
                return;
            }
        };
        match frame.llap_type {
            LLAP_TYPE_DDP_SHORT => {
                match Datagram::from_short_header_bytes(
                    frame.destination_node,
                    frame.source_node,
                    frame.payload,
                ) {
                    Ok(datagram) => self.dispatch(datagram),
                    Err(e) => self.count_decode_error(e),
                }
            }
            LLAP_TYPE_DDP_LONG => match Datagram::from_long_header_bytes(frame.payload, true) {
                Ok(datagram) => self.dispatch(datagram),
                Err(e) => self.count_decode_error(e),
            },
            LLAP_TYPE_ENQ | LLAP_TYPE_ACK => {
                self.handle_control_frame(frame.llap_type, frame.destination_node)
            }
            _ => {}
        }
    }

    fn count_decode_error(&self, error: Error) {
        if let Some(stats) = self.stats_ref() {
            match error {
                Error::ChecksumMismatch { .. } => stats.checksum_mismatches.inc(),
                _ => stats.malformed_datagrams.inc(),
            }
        }
        debug!("{} dropping undecodable datagram", self.label);
    }

    fn dispatch(&self, datagram: Datagram) {
        if let (Some(router), Some(handle)) = (self.router.get(), self.handle.get()) {
            router.inbound(datagram, handle);
        }
    }

    fn handle_control_frame(&self, llap_type: u8, destination_node: u8) {
        let mut state = self.state.lock().unwrap();
        // we own this address and someone is asking whether they can
        // have it; they cannot
        if llap_type == LLAP_TYPE_ENQ
            && self.respond_to_enq
            && state.node != 0
            && state.node == destination_node
        {
            drop(state);
            self.send_frame(build_ack(destination_node));
            return;
        }
        // someone else answered for (or is also probing) the address we
        // want, so want another
        if state.node == 0 && state.desired_node == destination_node {
            state.node_attempts = 0;
            match state.candidates.pop() {
                Some(next) => state.desired_node = next,
                None => state.candidates_exhausted = true,
            }
        }
    }

    /// Adopt a network number for this port, install its
    /// directly-connected route, and move the state machine forward.
    pub(crate) fn set_network_range(&self, range: NetworkRange) -> Result<()> {
        if range.first != range.last {
            return Err(Error::Config(format!(
                "{} is non-extended and cannot take network range {}",
                self.label, range
            )));
        }
        {
            let mut state = self.state.lock().unwrap();
            if state.network != 0 {
                return Err(Error::Config(format!(
                    "{} assigned network {} but already has {}",
                    self.label, range.first, state.network
                )));
            }
            state.network = range.first;
            if state.port_state == PortState::AcquiringNetworkRange {
                state.port_state = PortState::AcquiringNodeAddress;
            }
        }
        info!("{} assigned network number {}", self.label, range.first);
        if let (Some(router), Some(handle)) = (self.router.get(), self.handle.get()) {
            for removed in router.routing_table.set_port_range(handle, range) {
                router.zone_table.remove_networks(removed);
            }
        }
        Ok(())
    }

    pub(crate) fn unicast(&self, network: u16, node: u8, datagram: Datagram) {
        let (our_network, our_node) = {
            let state = self.state.lock().unwrap();
            (state.network, state.node)
        };
        if network != 0 && network != our_network {
            return;
        }
        if our_node == 0 {
            return;
        }
        let same_network = datagram.destination_network == datagram.source_network
            && (datagram.destination_network == 0 || datagram.destination_network == our_network);
        let encoded = if same_network && datagram.hop_count == 0 {
            datagram
                .as_short_header_bytes()
                .map(|payload| build_frame(node, our_node, LLAP_TYPE_DDP_SHORT, &payload))
        } else {
            datagram
                .as_long_header_bytes(true)
                .map(|payload| build_frame(node, our_node, LLAP_TYPE_DDP_LONG, &payload))
        };
        match encoded {
            Ok(frame) => self.send_frame(frame),
            Err(e) => debug!("{} cannot encode datagram: {}", self.label, e),
        }
    }

    pub(crate) fn broadcast(&self, datagram: Datagram) {
        let our_node = self.node();
        if our_node == 0 {
            return;
        }
        let encoded = if datagram.hop_count == 0 {
            datagram
                .as_short_header_bytes()
                .map(|payload| build_frame(NODE_BROADCAST, our_node, LLAP_TYPE_DDP_SHORT, &payload))
        } else {
            datagram
                .as_long_header_bytes(true)
                .map(|payload| build_frame(NODE_BROADCAST, our_node, LLAP_TYPE_DDP_LONG, &payload))
        };
        match encoded {
            Ok(frame) => self.send_frame(frame),
            Err(e) => debug!("{} cannot encode datagram: {}", self.label, e),
        }
    }

    fn send_get_net_info_probe(&self) {
        let (startup_network, startup_node) = {
            let state = self.state.lock().unwrap();
            (state.startup_network, state.startup_node)
        };
        let datagram = Datagram {
            hop_count: 0,
            destination_network: 0,
            source_network: startup_network,
            destination_node: NODE_BROADCAST,
            source_node: startup_node,
            destination_socket: ZIP_SOCKET,
            source_socket: ZIP_SOCKET,
            ddp_type: ZIP_DDP_TYPE,
            data: build_get_net_info(b""),
        };
        match datagram.as_short_header_bytes() {
            Ok(payload) => self.send_frame(build_frame(
                NODE_BROADCAST,
                startup_node,
                LLAP_TYPE_DDP_SHORT,
                &payload,
            )),
            Err(e) => debug!("{} cannot encode GetNetInfo probe: {}", self.label, e),
        }
    }

    /// The address-acquisition state machine. Discovers the network
    /// (seeded or learned), then claims a node address by ENQ probing.
    pub(crate) async fn run_acquisition(self: Arc<Self>) {
        let mut stop = self.stop.subscribe();

        // network range first
        if let Some(seed) = self.seed.clone() {
            if let Err(e) = self.set_network_range(NetworkRange::single(seed.network)) {
                warn!("{} {}", self.label, e);
            }
            if let Some(router) = self.router.get() {
                if let Err(e) = router
                    .zone_table
                    .add_zone(seed.zone_name.clone(), NetworkRange::single(seed.network))
                {
                    warn!("{} cannot seed zone: {}", self.label, e);
                }
            }
        } else {
            let deadline = Instant::now() + Duration::from_secs(STARTUP_DEADLINE_SECS);
            loop {
                if self.network() != 0 {
                    let mut state = self.state.lock().unwrap();
                    if state.port_state == PortState::AcquiringNetworkRange {
                        state.port_state = PortState::AcquiringNodeAddress;
                    }
                    break;
                }
                if Instant::now() >= deadline {
                    let error = Error::PortStartupTimeout {
                        port: self.label.clone(),
                        seconds: STARTUP_DEADLINE_SECS,
                    };
                    warn!("{} fatal: {}", self.label, error);
                    self.signal_stop();
                    return;
                }
                self.send_get_net_info_probe();
                tokio::select! {
                    _ = tokio::time::sleep(GET_NET_INFO_INTERVAL) => {}
                    _ = stop.changed() => return,
                }
            }
        }

        // then a node address
        loop {
            tokio::select! {
                _ = tokio::time::sleep(ENQ_INTERVAL) => {}
                _ = stop.changed() => return,
            }
            let send_enq = {
                let mut state = self.state.lock().unwrap();
                if state.candidates_exhausted {
                    let error = Error::AddressInUse {
                        port: self.label.clone(),
                    };
                    warn!("{} fatal: {}", self.label, error);
                    drop(state);
                    self.signal_stop();
                    return;
                }
                if state.node_attempts >= ENQ_ATTEMPTS {
                    state.node = state.desired_node;
                    state.port_state = PortState::Online;
                    info!("{} claiming node address {}", self.label, state.node);
                    self.node_claimed.send_replace(state.node);
                    return;
                }
                state.node_attempts += 1;
                state.desired_node
            };
            self.send_frame(build_enq(send_enq));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn link() -> (LocalTalkLink, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(16);
        let link = LocalTalkLink::new("lt-test".into(), None, 0xFE, true, tx);
        (link, rx)
    }

    #[test]
    fn test_candidate_reroll_on_collision() {
        let (link, _rx) = link();
        let desired = link.state.lock().unwrap().desired_node;
        link.handle_control_frame(LLAP_TYPE_ACK, desired);
        let state = link.state.lock().unwrap();
        assert_ne!(state.desired_node, desired);
        assert_eq!(state.node_attempts, 0);
    }

    #[test]
    fn test_candidate_exhaustion_flags_address_in_use() {
        let (link, _rx) = link();
        for _ in 0..=NODE_MAX as usize + 1 {
            let desired = link.state.lock().unwrap().desired_node;
            link.handle_control_frame(LLAP_TYPE_ENQ, desired);
        }
        assert!(link.state.lock().unwrap().candidates_exhausted);
    }

    #[test]
    fn test_own_node_filter_covers_probe_candidate() {
        let (link, _rx) = link();
        let desired = link.state.lock().unwrap().desired_node;
        assert!(link.is_own_node(desired));
        assert!(!link.is_own_node(0));
        // once a node is claimed only that node matches
        link.state.lock().unwrap().node = 42;
        assert!(link.is_own_node(42));
        assert!(!link.is_own_node(desired) || desired == 42);
    }

    #[test]
    fn test_enq_for_owned_node_is_acked() {
        let (link, mut rx) = link();
        link.state.lock().unwrap().node = 42;
        link.handle_control_frame(LLAP_TYPE_ENQ, 42);
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame, build_ack(42));
    }

    #[test]
    fn test_unicast_header_choice() {
        let (link, mut rx) = link();
        {
            let mut state = link.state.lock().unwrap();
            state.network = 1;
            state.node = 10;
        }
        let datagram = Datagram {
            hop_count: 0,
            destination_network: 1,
            source_network: 1,
            destination_node: 42,
            source_node: 10,
            destination_socket: 4,
            source_socket: 4,
            ddp_type: 4,
            data: vec![1],
        };

        // intra-network traffic goes short form
        link.unicast(1, 42, datagram.clone());
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame[..3], [42, 10, LLAP_TYPE_DDP_SHORT]);
        let decoded = Datagram::from_short_header_bytes(42, 10, &frame[3..]).unwrap();
        assert_eq!(decoded.data, vec![1]);

        // routed traffic keeps its network numbers in a long header
        let routed = Datagram {
            source_network: 2,
            source_node: 7,
            hop_count: 1,
            ..datagram
        };
        link.unicast(1, 42, routed.clone());
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame[..3], [42, 10, LLAP_TYPE_DDP_LONG]);
        let decoded = Datagram::from_long_header_bytes(&frame[3..], true).unwrap();
        assert_eq!(decoded, routed);
    }

    #[test]
    fn test_unicast_refuses_foreign_network() {
        let (link, mut rx) = link();
        {
            let mut state = link.state.lock().unwrap();
            state.network = 1;
            state.node = 10;
        }
        let datagram = Datagram {
            hop_count: 0,
            destination_network: 9,
            source_network: 9,
            destination_node: 42,
            source_node: 10,
            destination_socket: 4,
            source_socket: 4,
            ddp_type: 4,
            data: vec![1],
        };
        link.unicast(9, 42, datagram);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_set_network_range_rejects_ranges_and_reassignment() {
        let (link, _rx) = link();
        assert!(link.set_network_range(NetworkRange::new(3, 5)).is_err());
        link.set_network_range(NetworkRange::single(7)).unwrap();
        assert_eq!(link.network(), 7);
        assert!(link.set_network_range(NetworkRange::single(8)).is_err());
    }
}
