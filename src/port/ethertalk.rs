//! EtherTalk port over a raw Ethernet interface
//!
//! Speaks 802.3/802.2/SNAP framing on an AF_PACKET socket, resolves
//! AppleTalk addresses to hardware addresses with AARP, and acquires its
//! own address by AARP probing. Datagrams bound for unresolved addresses
//! are held briefly while AARP requests go out.

use crate::dataplane::Router;
use crate::port::{Port, PortState};
use crate::protocol::elap::{
    build_frame, zone_multicast_address, AarpFunction, AarpPacket, ElapFrame, ElapPayload,
    SNAP_AARP, SNAP_APPLETALK,
};
use crate::protocol::zip::{build_get_net_info, ZIP_DDP_TYPE};
use crate::protocol::{
    Datagram, MacAddr, NetworkRange, ZoneName, NODE_BROADCAST, STARTUP_NETWORK_MAX,
    STARTUP_NETWORK_MIN, ZIP_SOCKET,
};
use crate::telemetry::PortStats;
use crate::{Error, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Interval between AARP probes while claiming an address.
const AARP_PROBE_INTERVAL: Duration = Duration::from_millis(200);
/// Clear probes before an address is considered ours.
const AARP_PROBE_ATTEMPTS: u32 = 10;
/// Address mappings unused for this long are dropped.
const AMT_MAX_AGE: Duration = Duration::from_secs(30);
/// How often the mapping table is swept.
const AMT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
/// Datagrams held waiting for AARP are dropped after this long.
const HELD_MAX_AGE: Duration = Duration::from_secs(10);
/// How often held datagrams are swept.
const HELD_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
/// Interval between AARP requests for held datagrams.
const AARP_REQUEST_INTERVAL: Duration = Duration::from_millis(250);
/// Interval between GetNetInfo probes while discovering the network.
const GET_NET_INFO_INTERVAL: Duration = Duration::from_secs(2);
/// How long a non-seeded port gets to discover its network.
const STARTUP_DEADLINE_SECS: u64 = 60;
/// Highest node number claimable on an extended network.
const NODE_MAX: u8 = 0xFD;

const LINK_QUEUE_DEPTH: usize = 64;
const RECV_BUFFER_SIZE: usize = 2048;

/// Seed configuration for an EtherTalk port; the first zone is the
/// network's default zone.
#[derive(Debug, Clone)]
pub struct EtherTalkSeed {
    pub range: NetworkRange,
    pub zone_names: Vec<ZoneName>,
}

struct EthState {
    range: NetworkRange,
    network: u16,
    node: u8,
    port_state: PortState,
    desired_network: u16,
    desired_node: u8,
    probe_attempts: u32,
    network_candidates: Vec<u16>,
    node_candidates: Vec<u8>,
    candidates_exhausted: bool,
    startup_network: u16,
    startup_node: u8,
}

impl EthState {
    /// Pick the next (network, node) candidate to probe for.
    fn reroll(&mut self) {
        if self.node_candidates.is_empty() {
            let Some(network) = self.network_candidates.pop() else {
                self.candidates_exhausted = true;
                return;
            };
            self.desired_network = network;
            let mut nodes: Vec<u8> = (1..=NODE_MAX).collect();
            nodes.shuffle(&mut rand::thread_rng());
            self.node_candidates = nodes;
        }
        // the node list cannot be empty here
        self.desired_node = self.node_candidates.pop().unwrap();
        self.probe_attempts = 0;
    }

    fn seed_candidates(&mut self) {
        let mut networks: Vec<u16> = self.range.networks().collect();
        networks.shuffle(&mut rand::thread_rng());
        self.network_candidates = networks;
        self.node_candidates = Vec::new();
        self.candidates_exhausted = false;
        self.reroll();
    }
}

/// Shared core of an EtherTalk port; tasks hold it behind an `Arc`.
struct EthLink {
    interface: String,
    hw_addr: OnceLock<MacAddr>,
    seed: Option<EtherTalkSeed>,
    verify_checksums: bool,
    calculate_checksums: bool,
    state: Mutex<EthState>,
    address_mappings: Mutex<HashMap<(u16, u8), (MacAddr, Instant)>>,
    held_datagrams: Mutex<HashMap<(u16, u8), VecDeque<(Datagram, Instant)>>>,
    frame_tx: mpsc::Sender<Vec<u8>>,
    router: OnceLock<Arc<Router>>,
    handle: OnceLock<Arc<dyn Port>>,
    stats: OnceLock<Arc<PortStats>>,
    stop: watch::Sender<bool>,
}

impl EthLink {
    fn hw(&self) -> MacAddr {
        self.hw_addr.get().copied().unwrap_or(MacAddr::ZERO)
    }

    fn address(&self) -> (u16, u8) {
        let state = self.state.lock().unwrap();
        (state.network, state.node)
    }

    fn send_raw_frame(&self, frame: Vec<u8>) {
        if let Some(stats) = self.stats.get() {
            stats.record_tx(frame.len());
        }
        if self.frame_tx.try_send(frame).is_err() {
            if let Some(stats) = self.stats.get() {
                stats.tx_drops.inc();
            }
            debug!("{} link queue full, dropping frame", self.interface);
        }
    }

    fn send_datagram_frame(&self, destination: MacAddr, datagram: &Datagram) {
        match datagram.as_long_header_bytes(self.calculate_checksums) {
            Ok(payload) => {
                self.send_raw_frame(build_frame(destination, self.hw(), &SNAP_APPLETALK, &payload))
            }
            Err(e) => debug!("{} cannot encode datagram: {}", self.interface, e),
        }
    }

    fn send_aarp(&self, destination: MacAddr, packet: &AarpPacket) {
        self.send_raw_frame(build_frame(destination, self.hw(), &SNAP_AARP, &packet.to_bytes()));
    }

    fn send_aarp_request(&self, network: u16, node: u8) {
        let (our_network, our_node) = self.address();
        if our_network == 0 || our_node == 0 || node == NODE_BROADCAST {
            return;
        }
        self.send_aarp(
            MacAddr::ELAP_BROADCAST,
            &AarpPacket::request(self.hw(), our_network, our_node, network, node),
        );
    }

    /// Record a mapping and release any datagrams held for it.
    fn add_address_mapping(&self, network: u16, node: u8, hw_addr: MacAddr) {
        let released = {
            let mut mappings = self.address_mappings.lock().unwrap();
            mappings.insert((network, node), (hw_addr, Instant::now()));
            let mut held = self.held_datagrams.lock().unwrap();
            held.remove(&(network, node))
        };
        if let Some(datagrams) = released {
            for (datagram, _) in datagrams {
                self.send_datagram_frame(hw_addr, &datagram);
            }
        }
    }

    fn handle_aarp(&self, packet: &AarpPacket) {
        match packet.function {
            AarpFunction::Request | AarpFunction::Probe => {
                let (our_network, our_node) = self.address();
                if our_network == 0 || our_node == 0 {
                    return;
                }
                if packet.target_network != our_network || packet.target_node != our_node {
                    return;
                }
                if let Some(router) = self.router.get() {
                    router.metrics().aarp_replies_sent.inc();
                }
                self.send_aarp(
                    packet.source_hw,
                    &AarpPacket::response(
                        self.hw(),
                        our_network,
                        our_node,
                        packet.source_hw,
                        packet.source_network,
                        packet.source_node,
                    ),
                );
            }
            AarpFunction::Response => {
                self.add_address_mapping(
                    packet.source_network,
                    packet.source_node,
                    packet.source_hw,
                );
                // someone answered for the address we are probing
                let mut state = self.state.lock().unwrap();
                if state.node == 0
                    && packet.source_network == state.desired_network
                    && packet.source_node == state.desired_node
                {
                    state.reroll();
                }
            }
        }
    }

    /// Called by the read loop with each raw Ethernet frame.
    fn inbound_frame(&self, frame_data: &[u8]) {
        let stats = self.stats.get();
        let frame = match ElapFrame::parse(frame_data) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(_) => {
                if let Some(stats) = stats {
                    stats.malformed_datagrams.inc();
                }
                return;
            }
        };

        // only frames for us, the AppleTalk broadcast, or a zone
        // multicast are interesting
        let for_us = frame.destination == self.hw()
            || frame.destination == MacAddr::ELAP_BROADCAST
            || (frame.destination.0[..5] == [0x09, 0x00, 0x07, 0x00, 0x00]
                && frame.destination.0[5] <= 0xFC);
        if !for_us {
            return;
        }
        if let Some(stats) = stats {
            stats.record_rx(frame_data.len());
        }

        match frame.payload {
            ElapPayload::Aarp(packet) => self.handle_aarp(&packet),
            ElapPayload::Ddp(body) => {
                let datagram = match Datagram::from_long_header_bytes(body, self.verify_checksums) {
                    Ok(datagram) => datagram,
                    Err(Error::ChecksumMismatch { .. }) => {
                        if let Some(stats) = stats {
                            stats.checksum_mismatches.inc();
                        }
                        return;
                    }
                    Err(_) => {
                        if let Some(stats) = stats {
                            stats.malformed_datagrams.inc();
                        }
                        return;
                    }
                };
                // glean a fresh mapping from first-hop traffic
                if datagram.hop_count == 0 {
                    let mut mappings = self.address_mappings.lock().unwrap();
                    mappings.insert(
                        (datagram.source_network, datagram.source_node),
                        (frame.source, Instant::now()),
                    );
                }
                if let (Some(router), Some(handle)) = (self.router.get(), self.handle.get()) {
                    router.inbound(datagram, handle);
                }
            }
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
        self.send_datagram_frame(MacAddr::ELAP_BROADCAST, &datagram);
    }

    fn network_range(&self) -> NetworkRange {
        self.state.lock().unwrap().range
    }

    fn set_network_range(&self, range: NetworkRange) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.range.is_unknown() {
                return Err(Error::Config(format!(
                    "{} assigned network range {} but already has {}",
                    self.interface, range, state.range
                )));
            }
            state.range = range;
            state.network = 0;
            state.node = 0;
            if state.port_state == PortState::AcquiringNetworkRange {
                state.port_state = PortState::AcquiringNodeAddress;
            }
            state.seed_candidates();
        }
        info!("{} assigned network range {}", self.interface, range);
        if let (Some(router), Some(handle)) = (self.router.get(), self.handle.get()) {
            for removed in router.routing_table.set_port_range(handle, range) {
                router.zone_table.remove_networks(removed);
            }
        }
        Ok(())
    }

    fn signal_stop(&self) {
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

    fn fail_fatally(&self, error: Error) {
        warn!("{} fatal: {}", self.interface, error);
        self.signal_stop();
    }

    /// The address-acquisition state machine: network range (seeded or
    /// discovered), then AARP probing for a (network, node) pair.
    async fn run_acquisition(self: Arc<Self>) {
        let mut stop = self.stop.subscribe();

        if let Some(seed) = self.seed.clone() {
            if let Err(e) = self.set_network_range(seed.range) {
                warn!("{} {}", self.interface, e);
            }
            if let Some(router) = self.router.get() {
                for zone_name in &seed.zone_names {
                    if let Err(e) = router.zone_table.add_zone(zone_name.clone(), seed.range) {
                        warn!("{} cannot seed zone: {}", self.interface, e);
                    }
                }
            }
        } else {
            let deadline = Instant::now() + Duration::from_secs(STARTUP_DEADLINE_SECS);
            loop {
                if !self.network_range().is_unknown() {
                    break;
                }
                if Instant::now() >= deadline {
                    self.fail_fatally(Error::PortStartupTimeout {
                        port: self.interface.clone(),
                        seconds: STARTUP_DEADLINE_SECS,
                    });
                    return;
                }
                self.send_get_net_info_probe();
                tokio::select! {
                    _ = tokio::time::sleep(GET_NET_INFO_INTERVAL) => {}
                    _ = stop.changed() => return,
                }
            }
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(AARP_PROBE_INTERVAL) => {}
                _ = stop.changed() => return,
            }
            let probe = {
                let mut state = self.state.lock().unwrap();
                if state.candidates_exhausted {
                    drop(state);
                    self.fail_fatally(Error::AddressInUse {
                        port: self.interface.clone(),
                    });
                    return;
                }
                if state.probe_attempts >= AARP_PROBE_ATTEMPTS {
                    state.network = state.desired_network;
                    state.node = state.desired_node;
                    state.port_state = PortState::Online;
                    info!(
                        "{} claiming address {}.{}",
                        self.interface, state.network, state.node
                    );
                    return;
                }
                state.probe_attempts += 1;
                (state.desired_network, state.desired_node)
            };
            if let Some(router) = self.router.get() {
                router.metrics().aarp_probes_sent.inc();
            }
            self.send_aarp(
                MacAddr::ELAP_BROADCAST,
                &AarpPacket::probe(self.hw(), probe.0, probe.1),
            );
        }
    }
}

/// An EtherTalk port on a named Ethernet interface.
pub struct EtherTalkPort {
    link: Arc<EthLink>,
    frame_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EtherTalkPort {
    pub fn new(interface: impl Into<String>, seed: Option<EtherTalkSeed>) -> Arc<Self> {
        Self::with_checksum_options(interface, seed, true, true)
    }

    pub fn with_checksum_options(
        interface: impl Into<String>,
        seed: Option<EtherTalkSeed>,
        verify_checksums: bool,
        calculate_checksums: bool,
    ) -> Arc<Self> {
        let mut rng = rand::thread_rng();
        let (stop, _) = watch::channel(false);
        let (frame_tx, frame_rx) = mpsc::channel(LINK_QUEUE_DEPTH);
        Arc::new(Self {
            link: Arc::new(EthLink {
                interface: interface.into(),
                hw_addr: OnceLock::new(),
                seed,
                verify_checksums,
                calculate_checksums,
                state: Mutex::new(EthState {
                    range: NetworkRange::new(0, 0),
                    network: 0,
                    node: 0,
                    port_state: PortState::Unstarted,
                    desired_network: 0,
                    desired_node: 0,
                    probe_attempts: 0,
                    network_candidates: Vec::new(),
                    node_candidates: Vec::new(),
                    candidates_exhausted: false,
                    startup_network: rng.gen_range(STARTUP_NETWORK_MIN..=STARTUP_NETWORK_MAX),
                    startup_node: rng.gen_range(1..=NODE_MAX),
                }),
                address_mappings: Mutex::new(HashMap::new()),
                held_datagrams: Mutex::new(HashMap::new()),
                frame_tx,
                router: OnceLock::new(),
                handle: OnceLock::new(),
                stats: OnceLock::new(),
                stop,
            }),
            frame_rx: Mutex::new(Some(frame_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

impl Port for EtherTalkPort {
    fn short_str(&self) -> String {
        self.link.interface.clone()
    }

    fn extended_network(&self) -> bool {
        true
    }

    fn network(&self) -> u16 {
        self.link.address().0
    }

    fn node(&self) -> u8 {
        self.link.address().1
    }

    fn network_range(&self) -> NetworkRange {
        self.link.network_range()
    }

    fn state(&self) -> PortState {
        self.link.state.lock().unwrap().port_state
    }

    fn start(&self, router: Arc<Router>, handle: Arc<dyn Port>) -> Result<()> {
        let socket = AfPacketSocket::bind(&self.link.interface)?;
        let _ = self.link.hw_addr.set(socket.hw_addr());
        let stats = router.metrics().register_port(&self.link.interface);
        let _ = self.link.stats.set(stats);
        let _ = self.link.router.set(router);
        let _ = self.link.handle.set(handle);
        self.link.state.lock().unwrap().port_state = PortState::AcquiringNetworkRange;

        let socket = Arc::new(socket);
        let mut tasks = self.tasks.lock().unwrap();

        // read loop
        let link = Arc::clone(&self.link);
        let read_socket = Arc::clone(&socket);
        let mut stop = self.link.stop.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
            loop {
                tokio::select! {
                    received = read_socket.recv(&mut buffer) => {
                        match received {
                            Ok(length) => link.inbound_frame(&buffer[..length]),
                            Err(e) => {
                                error!("{} receive error: {}", link.interface, e);
                                break;
                            }
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        }));

        // write loop
        let link = Arc::clone(&self.link);
        let write_socket = socket;
        let mut frame_rx = self
            .frame_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Config(format!("{} started twice", self.link.interface)))?;
        let mut stop = self.link.stop.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = frame_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if let Err(e) = write_socket.send(&frame).await {
                            debug!("{} transmit failed: {}", link.interface, e);
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        }));

        // address mapping table ageing
        let link = Arc::clone(&self.link);
        let mut stop = self.link.stop.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(AMT_SWEEP_INTERVAL) => {
                        let now = Instant::now();
                        link.address_mappings
                            .lock()
                            .unwrap()
                            .retain(|_, (_, last_used)| now.duration_since(*last_used) < AMT_MAX_AGE);
                    }
                    _ = stop.changed() => break,
                }
            }
        }));

        // held datagram ageing
        let link = Arc::clone(&self.link);
        let mut stop = self.link.stop.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(HELD_SWEEP_INTERVAL) => {
                        let now = Instant::now();
                        let mut held = link.held_datagrams.lock().unwrap();
                        for queue in held.values_mut() {
                            queue.retain(|(_, since)| now.duration_since(*since) < HELD_MAX_AGE);
                        }
                        held.retain(|_, queue| !queue.is_empty());
                    }
                    _ = stop.changed() => break,
                }
            }
        }));

        // AARP requests for held datagrams
        let link = Arc::clone(&self.link);
        let mut stop = self.link.stop.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(AARP_REQUEST_INTERVAL) => {
                        let waiting: Vec<(u16, u8)> =
                            link.held_datagrams.lock().unwrap().keys().copied().collect();
                        for (network, node) in waiting {
                            link.send_aarp_request(network, node);
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        }));

        // address acquisition
        tasks.push(tokio::spawn(Arc::clone(&self.link).run_acquisition()));

        Ok(())
    }

    fn stop(&self) {
        self.link.signal_stop();
    }

    fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        self.tasks.lock().unwrap().drain(..).collect()
    }

    fn unicast(&self, network: u16, node: u8, datagram: Datagram) {
        let resolved = {
            let mut mappings = self.link.address_mappings.lock().unwrap();
            match mappings.get_mut(&(network, node)) {
                Some((hw_addr, last_used)) => {
                    *last_used = Instant::now();
                    Some(*hw_addr)
                }
                None => None,
            }
        };
        match resolved {
            Some(hw_addr) => self.link.send_datagram_frame(hw_addr, &datagram),
            None => {
                // hold the datagram and start resolving
                let first_for_address = {
                    let mut held = self.link.held_datagrams.lock().unwrap();
                    let queue = held.entry((network, node)).or_default();
                    queue.push_back((datagram, Instant::now()));
                    queue.len() == 1
                };
                if first_for_address {
                    self.link.send_aarp_request(network, node);
                }
            }
        }
    }

    fn broadcast(&self, mut datagram: Datagram) {
        if (datagram.destination_network, datagram.destination_node) != (0, NODE_BROADCAST) {
            datagram.destination_network = 0;
            datagram.destination_node = NODE_BROADCAST;
        }
        self.link
            .send_datagram_frame(MacAddr::ELAP_BROADCAST, &datagram);
    }

    fn multicast(&self, zone_name: &ZoneName, datagram: Datagram) {
        self.link
            .send_datagram_frame(zone_multicast_address(zone_name.as_bytes()), &datagram);
    }

    fn multicast_address(&self, zone_name: &[u8]) -> Vec<u8> {
        zone_multicast_address(zone_name).0.to_vec()
    }

    fn set_network_range(&self, range: NetworkRange) -> Result<()> {
        self.link.set_network_range(range)
    }

    fn stats(&self) -> Arc<PortStats> {
        self.link
            .stats
            .get()
            .cloned()
            .unwrap_or_else(|| Arc::new(PortStats::new()))
    }
}

/// AF_PACKET socket bound to one interface, driven through the tokio
/// reactor.
struct AfPacketSocket {
    async_fd: AsyncFd<RawFd>,
    hw_addr: MacAddr,
}

impl AfPacketSocket {
    fn bind(interface: &str) -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                (libc::ETH_P_ALL as u16).to_be() as i32,
            )
        };
        if fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        let ifindex = match Self::ifindex(fd, interface) {
            Ok(ifindex) => ifindex,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };
        let hw_addr = match Self::interface_hw_addr(fd, interface) {
            Ok(hw_addr) => hw_addr,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };

        let sockaddr = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: (libc::ETH_P_ALL as u16).to_be(),
            sll_ifindex: ifindex,
            sll_hatype: 0,
            sll_pkttype: 0,
            sll_halen: 0,
            sll_addr: [0; 8],
        };
        let bound = unsafe {
            libc::bind(
                fd,
                &sockaddr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as u32,
            )
        };
        if bound < 0 {
            let e = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Io(e));
        }

        // the AppleTalk group addresses only arrive in promiscuous mode
        let mreq = libc::packet_mreq {
            mr_ifindex: ifindex,
            mr_type: libc::PACKET_MR_PROMISC as u16,
            mr_alen: 0,
            mr_address: [0; 8],
        };
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_PACKET,
                libc::PACKET_ADD_MEMBERSHIP,
                &mreq as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::packet_mreq>() as u32,
            );
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }

        Ok(Self {
            async_fd: AsyncFd::new(fd)?,
            hw_addr,
        })
    }

    fn ifreq_for(interface: &str) -> Result<libc::ifreq> {
        let name = CString::new(interface)
            .map_err(|_| Error::Config(format!("bad interface name {}", interface)))?;
        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        let bytes = name.as_bytes_with_nul();
        if bytes.len() > ifr.ifr_name.len() {
            return Err(Error::Config(format!("interface name {} too long", interface)));
        }
        for (i, &b) in bytes.iter().enumerate() {
            ifr.ifr_name[i] = b as libc::c_char;
        }
        Ok(ifr)
    }

    fn ifindex(fd: RawFd, interface: &str) -> Result<i32> {
        let mut ifr = Self::ifreq_for(interface)?;
        if unsafe { libc::ioctl(fd, libc::SIOCGIFINDEX, &mut ifr) } < 0 {
            return Err(Error::Config(format!("interface {} not found", interface)));
        }
        Ok(unsafe { ifr.ifr_ifru.ifru_ifindex })
    }

    fn interface_hw_addr(fd: RawFd, interface: &str) -> Result<MacAddr> {
        let mut ifr = Self::ifreq_for(interface)?;
        if unsafe { libc::ioctl(fd, libc::SIOCGIFHWADDR, &mut ifr) } < 0 {
            return Err(Error::Config(format!(
                "cannot read hardware address of {}",
                interface
            )));
        }
        let mut hw_addr = [0u8; 6];
        unsafe {
            for (i, byte) in hw_addr.iter_mut().enumerate() {
                *byte = ifr.ifr_ifru.ifru_hwaddr.sa_data[i] as u8;
            }
        }
        Ok(MacAddr(hw_addr))
    }

    fn hw_addr(&self) -> MacAddr {
        self.hw_addr
    }

    async fn recv(&self, buffer: &mut [u8]) -> Result<usize> {
        loop {
            let mut guard = self.async_fd.readable().await.map_err(Error::Io)?;
            match guard.try_io(|inner| {
                let fd = *inner.get_ref();
                let n = unsafe { libc::recv(fd, buffer.as_mut_ptr() as *mut _, buffer.len(), 0) };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => return result.map_err(Error::Io),
                Err(_would_block) => continue,
            }
        }
    }

    async fn send(&self, buffer: &[u8]) -> Result<usize> {
        loop {
            let mut guard = self.async_fd.writable().await.map_err(Error::Io)?;
            match guard.try_io(|inner| {
                let fd = *inner.get_ref();
                let n = unsafe { libc::send(fd, buffer.as_ptr() as *const _, buffer.len(), 0) };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => return result.map_err(Error::Io),
                Err(_would_block) => continue,
            }
        }
    }
}

impl Drop for AfPacketSocket {
    fn drop(&mut self) {
        unsafe { libc::close(*self.async_fd.get_ref()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_range(range: NetworkRange) -> EthState {
        let mut state = EthState {
            range,
            network: 0,
            node: 0,
            port_state: PortState::AcquiringNodeAddress,
            desired_network: 0,
            desired_node: 0,
            probe_attempts: 0,
            network_candidates: Vec::new(),
            node_candidates: Vec::new(),
            candidates_exhausted: false,
            startup_network: STARTUP_NETWORK_MIN,
            startup_node: 1,
        };
        state.seed_candidates();
        state
    }

    #[test]
    fn test_candidates_stay_in_range() {
        let mut state = state_with_range(NetworkRange::new(3, 5));
        for _ in 0..100 {
            assert!((3..=5).contains(&state.desired_network));
            assert!((1..=NODE_MAX).contains(&state.desired_node));
            state.reroll();
            if state.candidates_exhausted {
                break;
            }
        }
    }

    #[test]
    fn test_candidate_exhaustion() {
        let mut state = state_with_range(NetworkRange::single(3));
        let mut count = 1; // seed_candidates picked the first
        while !state.candidates_exhausted {
            state.reroll();
            count += 1;
        }
        // one candidate per node number in the single network
        assert_eq!(count - 1, NODE_MAX as usize);
    }

    #[test]
    fn test_reroll_resets_probe_attempts() {
        let mut state = state_with_range(NetworkRange::new(3, 5));
        state.probe_attempts = 7;
        state.reroll();
        assert_eq!(state.probe_attempts, 0);
    }

    const PEER_MAC: MacAddr = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x07]);

    fn online_port() -> Arc<EtherTalkPort> {
        let port = EtherTalkPort::new("test-eth", None);
        {
            let mut state = port.link.state.lock().unwrap();
            state.range = NetworkRange::new(3, 5);
            state.network = 3;
            state.node = 10;
            state.port_state = PortState::Online;
        }
        port
    }

    fn ping(destination_node: u8) -> Datagram {
        Datagram {
            hop_count: 0,
            destination_network: 3,
            source_network: 3,
            destination_node,
            source_node: 10,
            destination_socket: 4,
            source_socket: 4,
            ddp_type: 4,
            data: vec![1],
        }
    }

    #[test]
    fn test_unresolved_unicast_holds_and_requests() {
        let port = online_port();
        let mut frames = port.frame_rx.lock().unwrap().take().unwrap();

        port.unicast(3, 42, ping(42));

        // the datagram is held while an AARP request goes out
        let frame = frames.try_recv().unwrap();
        let parsed = ElapFrame::parse(&frame).unwrap().unwrap();
        assert_eq!(parsed.destination, MacAddr::ELAP_BROADCAST);
        let ElapPayload::Aarp(request) = parsed.payload else {
            panic!("expected an AARP request");
        };
        assert_eq!(request.function, AarpFunction::Request);
        assert_eq!((request.target_network, request.target_node), (3, 42));
        assert!(frames.try_recv().is_err());

        // the response releases the held datagram toward the mapped MAC
        port.link
            .handle_aarp(&AarpPacket::response(PEER_MAC, 3, 42, port.link.hw(), 3, 10));
        let frame = frames.try_recv().unwrap();
        let parsed = ElapFrame::parse(&frame).unwrap().unwrap();
        assert_eq!(parsed.destination, PEER_MAC);
        let ElapPayload::Ddp(body) = parsed.payload else {
            panic!("expected the released datagram");
        };
        assert_eq!(
            Datagram::from_long_header_bytes(body, true).unwrap(),
            ping(42)
        );

        // and the mapping now answers directly
        port.unicast(3, 42, ping(42));
        let frame = frames.try_recv().unwrap();
        let parsed = ElapFrame::parse(&frame).unwrap().unwrap();
        assert_eq!(parsed.destination, PEER_MAC);
    }

    #[test]
    fn test_aarp_probe_for_our_address_is_answered() {
        let port = online_port();
        let mut frames = port.frame_rx.lock().unwrap().take().unwrap();

        port.link
            .handle_aarp(&AarpPacket::probe(PEER_MAC, 3, 10));

        let frame = frames.try_recv().unwrap();
        let parsed = ElapFrame::parse(&frame).unwrap().unwrap();
        assert_eq!(parsed.destination, PEER_MAC);
        let ElapPayload::Aarp(response) = parsed.payload else {
            panic!("expected an AARP response");
        };
        assert_eq!(response.function, AarpFunction::Response);
        assert_eq!((response.source_network, response.source_node), (3, 10));
    }

    #[test]
    fn test_aarp_probe_for_other_address_is_ignored() {
        let port = online_port();
        let mut frames = port.frame_rx.lock().unwrap().take().unwrap();

        port.link.handle_aarp(&AarpPacket::probe(PEER_MAC, 3, 99));
        assert!(frames.try_recv().is_err());
    }

    #[test]
    fn test_probe_collision_rerolls_candidate() {
        let port = EtherTalkPort::new("test-eth", None);
        {
            let mut state = port.link.state.lock().unwrap();
            state.range = NetworkRange::new(3, 5);
            state.port_state = PortState::AcquiringNodeAddress;
            state.seed_candidates();
        }
        let (network, node) = {
            let state = port.link.state.lock().unwrap();
            (state.desired_network, state.desired_node)
        };
        port.link
            .handle_aarp(&AarpPacket::response(PEER_MAC, network, node, MacAddr::ZERO, 0, 0));
        let state = port.link.state.lock().unwrap();
        assert_ne!((state.desired_network, state.desired_node), (network, node));
        assert_eq!(state.probe_attempts, 0);
    }
}
