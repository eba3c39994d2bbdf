//! ZIP services: zone information responder and query sender

use crate::dataplane::Router;
use crate::port::Port;
use crate::protocol::zip::{
    build_atp_reply, build_extended_replies, build_queries, parse_atp_request, parse_get_net_info,
    parse_query, parse_reply, GetNetInfoReply, ATP_DDP_TYPE, GNI_FLAG_ONLY_ONE_ZONE,
    GNI_FLAG_USE_BROADCAST, GNI_FLAG_ZONE_INVALID, ZIP_ATP_FUNC_GETLOCALZONES,
    ZIP_ATP_FUNC_GETMYZONE, ZIP_ATP_FUNC_GETZONELIST, ZIP_DDP_TYPE, ZIP_FUNC_EXT_REPLY,
    ZIP_FUNC_GETNETINFO_REPLY, ZIP_FUNC_GETNETINFO_REQUEST, ZIP_FUNC_QUERY, ZIP_FUNC_REPLY,
};
use crate::protocol::zone::ucase;
use crate::protocol::{
    ddp::MAX_DATA_LENGTH, Datagram, NetworkRange, ZoneName, NODE_BROADCAST, ZIP_SOCKET,
};
use crate::service::Service;
use crate::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Seconds between query rounds; also the per-query timeout before a
/// still-unanswered query may be repeated.
const QUERY_INTERVAL_SECS: u64 = 10;

/// Handles ZIP queries, replies, GetNetInfo, and the ATP-transported
/// zone list requests, on socket 6.
#[derive(Default)]
pub struct ZipRespondingService {
    router: OnceLock<Arc<Router>>,
    /// Zones collected from extended replies, per network, until the
    /// advertised count arrives.
    pending_zones: Mutex<HashMap<u16, Vec<Vec<u8>>>>,
}

impl ZipRespondingService {
    pub fn new() -> Self {
        Self::default()
    }

    fn range_by_first(router: &Router, first: u16) -> Option<NetworkRange> {
        router
            .routing_table
            .entries()
            .into_iter()
            .map(|(entry, _)| entry.range)
            .find(|range| range.first == first)
    }

    fn add_zone(router: &Router, network: u16, zone_name: &[u8]) {
        let Some(range) = Self::range_by_first(router, network) else {
            warn!(
                "{} ZIP reply names network {} which no route covers",
                router.short_str(),
                network
            );
            return;
        };
        let zone_name = match ZoneName::new(zone_name) {
            Ok(zone_name) => zone_name,
            Err(e) => {
                warn!("{} ZIP reply carries bad zone: {}", router.short_str(), e);
                return;
            }
        };
        if let Err(e) = router.zone_table.add_zone(zone_name, range) {
            warn!("{} {}", router.short_str(), e);
        }
    }

    fn handle_reply(&self, router: &Router, datagram: &Datagram) {
        let reply = match parse_reply(&datagram.data) {
            Ok(reply) => reply,
            Err(e) => {
                debug!("{} ignoring ZIP reply: {}", router.short_str(), e);
                return;
            }
        };

        if !reply.extended {
            for (network, zone_name) in &reply.zones {
                Self::add_zone(router, *network, zone_name);
            }
            return;
        }

        // extended replies accumulate until the advertised zone count
        // for the network has been seen
        let mut complete = Vec::new();
        {
            let mut pending = self.pending_zones.lock().unwrap();
            for (network, zone_name) in &reply.zones {
                let zones = pending.entry(*network).or_default();
                if !zones.iter().any(|z| ucase(z) == ucase(zone_name)) {
                    zones.push(zone_name.clone());
                }
            }
            let networks: Vec<u16> = reply.zones.iter().map(|(network, _)| *network).collect();
            for network in networks {
                if let Some(zones) = pending.get(&network) {
                    if reply.count >= 1 && zones.len() >= reply.count as usize {
                        complete.push((network, pending.remove(&network).unwrap()));
                    }
                }
            }
        }
        for (network, zones) in complete {
            for zone_name in zones {
                Self::add_zone(router, network, &zone_name);
            }
        }
    }

    fn handle_query(&self, router: &Router, datagram: &Datagram, rx_port: &Arc<dyn Port>) {
        let networks = match parse_query(&datagram.data) {
            Ok(networks) => networks,
            Err(e) => {
                debug!("{} ignoring ZIP query: {}", router.short_str(), e);
                return;
            }
        };
        // one list per requested network, even when several requested
        // networks share a range
        for network in networks {
            let Some((entry, _)) = router.routing_table.lookup(network) else {
                continue;
            };
            let zones = router.zone_table.zones_in_range(entry.range);
            if zones.is_empty() {
                continue;
            }
            let zone_bytes: Vec<&[u8]> = zones.iter().map(|zone| zone.as_bytes()).collect();
            for packet in build_extended_replies(entry.range.first, &zone_bytes) {
                router.reply(datagram, rx_port, ZIP_DDP_TYPE, packet);
            }
        }
    }

    fn handle_get_net_info(&self, router: &Router, datagram: &Datagram, rx_port: &Arc<dyn Port>) {
        let range = rx_port.network_range();
        if rx_port.network() == 0 || range.is_unknown() {
            return;
        }
        let requested_zone = match parse_get_net_info(&datagram.data) {
            Ok(zone) => zone,
            Err(e) => {
                debug!("{} ignoring GetNetInfo: {}", router.short_str(), e);
                return;
            }
        };

        let zones = router.zone_table.zones_in_range(range);
        let Some(default_zone) = zones.first() else {
            return;
        };

        let mut flags = GNI_FLAG_ZONE_INVALID;
        if zones.len() == 1 {
            flags |= GNI_FLAG_ONLY_ONE_ZONE;
        }
        let requested_ucase = ucase(&requested_zone);
        let mut multicast_zone = default_zone;
        for zone in &zones {
            if ucase(zone.as_bytes()) == requested_ucase {
                flags &= !GNI_FLAG_ZONE_INVALID;
                multicast_zone = zone;
                break;
            }
        }
        let multicast_address = rx_port.multicast_address(multicast_zone.as_bytes());
        if multicast_address.is_empty() {
            flags |= GNI_FLAG_USE_BROADCAST;
        }
        let reply = GetNetInfoReply {
            flags,
            range,
            requested_zone,
            multicast_address,
            default_zone: if flags & GNI_FLAG_ZONE_INVALID != 0 {
                Some(default_zone.as_bytes().to_vec())
            } else {
                None
            },
        };
        router.reply(datagram, rx_port, ZIP_DDP_TYPE, reply.to_bytes());
    }

    /// A GetNetInfo reply seen on a port still acquiring its range tells
    /// us what that range is.
    fn handle_get_net_info_reply(&self, router: &Router, datagram: &Datagram, rx_port: &Arc<dyn Port>) {
        if !rx_port.network_range().is_unknown() {
            return;
        }
        let Ok(reply) = GetNetInfoReply::parse(&datagram.data) else {
            return;
        };
        if reply.range.is_unknown() {
            return;
        }
        if let Err(e) = rx_port.set_network_range(reply.range) {
            warn!("{} {}", router.short_str(), e);
        }
    }

    fn handle_get_my_zone(&self, router: &Router, datagram: &Datagram, rx_port: &Arc<dyn Port>) {
        let Some(request) = parse_atp_request(&datagram.data) else {
            return;
        };
        let Some((entry, _)) = router.routing_table.lookup(datagram.source_network) else {
            return;
        };
        let zones = router.zone_table.zones_in_range(entry.range);
        let Some(zone) = zones.first() else {
            return;
        };
        let mut payload = Vec::with_capacity(1 + zone.len());
        payload.push(zone.len() as u8);
        payload.extend_from_slice(zone.as_bytes());
        router.reply(
            datagram,
            rx_port,
            ATP_DDP_TYPE,
            build_atp_reply(request.transaction_id, false, 1, &payload),
        );
    }

    fn handle_get_zone_list(
        &self,
        router: &Router,
        datagram: &Datagram,
        rx_port: &Arc<dyn Port>,
        local: bool,
    ) {
        let Some(request) = parse_atp_request(&datagram.data) else {
            return;
        };
        let zones = if local {
            router.zone_table.zones_in_range(rx_port.network_range())
        } else {
            router.zone_table.zones()
        };

        // start_index is 1-relative
        let skip = (request.start_index as usize).saturating_sub(1);
        let mut payload = Vec::new();
        let mut count: u16 = 0;
        let mut exhausted = true;
        for zone in zones.iter().skip(skip) {
            if 8 + payload.len() + 1 + zone.len() > MAX_DATA_LENGTH {
                exhausted = false;
                break;
            }
            payload.push(zone.len() as u8);
            payload.extend_from_slice(zone.as_bytes());
            count += 1;
        }
        router.reply(
            datagram,
            rx_port,
            ATP_DDP_TYPE,
            build_atp_reply(request.transaction_id, exhausted, count, &payload),
        );
    }
}

impl Service for ZipRespondingService {
    fn name(&self) -> &'static str {
        "ZIP responding service"
    }

    fn start(&self, router: Arc<Router>) -> Result<()> {
        let _ = self.router.set(router);
        Ok(())
    }

    fn stop(&self) {}

    fn inbound(&self, datagram: Datagram, rx_port: &Arc<dyn Port>) {
        let Some(router) = self.router.get() else {
            return;
        };
        match datagram.ddp_type {
            ZIP_DDP_TYPE => match datagram.data.first() {
                Some(&ZIP_FUNC_REPLY) | Some(&ZIP_FUNC_EXT_REPLY) => {
                    self.handle_reply(router, &datagram)
                }
                Some(&ZIP_FUNC_QUERY) => self.handle_query(router, &datagram, rx_port),
                Some(&ZIP_FUNC_GETNETINFO_REQUEST) => {
                    self.handle_get_net_info(router, &datagram, rx_port)
                }
                Some(&ZIP_FUNC_GETNETINFO_REPLY) => {
                    self.handle_get_net_info_reply(router, &datagram, rx_port)
                }
                _ => {}
            },
            ATP_DDP_TYPE => {
                let Some(request) = parse_atp_request(&datagram.data) else {
                    return;
                };
                match request.function {
                    ZIP_ATP_FUNC_GETMYZONE => self.handle_get_my_zone(router, &datagram, rx_port),
                    ZIP_ATP_FUNC_GETZONELIST => {
                        self.handle_get_zone_list(router, &datagram, rx_port, false)
                    }
                    ZIP_ATP_FUNC_GETLOCALZONES => {
                        self.handle_get_zone_list(router, &datagram, rx_port, true)
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }
}

/// Queries next hops for the zones of ranges that have none yet.
pub struct ZipSendingService {
    interval: Duration,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Next-hop identity for outstanding-query bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    port: String,
    next_network: u16,
    next_node: u8,
}

impl ZipSendingService {
    pub fn new() -> Self {
        Self::with_interval(Duration::from_secs(QUERY_INTERVAL_SECS))
    }

    pub fn with_interval(interval: Duration) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            interval,
            stop,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// One query round: ask each next hop about its zoneless ranges.
    /// `outstanding` tracks (next hop, range) pairs already queried so
    /// none is repeated within the timeout.
    pub fn send_queries(
        router: &Router,
        outstanding: &mut HashMap<(QueryKey, u16), Instant>,
        timeout: Duration,
    ) {
        let now = Instant::now();
        outstanding.retain(|_, sent| now.duration_since(*sent) < timeout);

        let mut queries: HashMap<QueryKey, (Arc<dyn Port>, Vec<u16>)> = HashMap::new();
        for (entry, _) in router.routing_table.entries() {
            if router.zone_table.has_zones_for(entry.range) {
                continue;
            }
            let key = if entry.is_direct() {
                QueryKey {
                    port: entry.port.short_str(),
                    next_network: 0,
                    next_node: NODE_BROADCAST,
                }
            } else {
                QueryKey {
                    port: entry.port.short_str(),
                    next_network: entry.next_network,
                    next_node: entry.next_node,
                }
            };
            if outstanding.contains_key(&(key.clone(), entry.range.first)) {
                continue;
            }
            outstanding.insert((key.clone(), entry.range.first), now);
            queries
                .entry(key)
                .or_insert_with(|| (Arc::clone(&entry.port), Vec::new()))
                .1
                .push(entry.range.first);
        }

        for (key, (port, networks)) in queries {
            if port.network() == 0 || port.node() == 0 {
                continue;
            }
            for packet in build_queries(&networks) {
                let datagram = Datagram {
                    hop_count: 0,
                    destination_network: key.next_network,
                    source_network: port.network(),
                    destination_node: key.next_node,
                    source_node: port.node(),
                    destination_socket: ZIP_SOCKET,
                    source_socket: ZIP_SOCKET,
                    ddp_type: ZIP_DDP_TYPE,
                    data: packet,
                };
                if key.next_node == NODE_BROADCAST {
                    port.broadcast(datagram);
                } else {
                    port.unicast(key.next_network, key.next_node, datagram);
                }
                router.metrics().zip_queries_sent.inc();
            }
        }
    }
}

impl Default for ZipSendingService {
    fn default() -> Self {
        Self::new()
    }
}

impl Service for ZipSendingService {
    fn name(&self) -> &'static str {
        "ZIP sending service"
    }

    fn start(&self, router: Arc<Router>) -> Result<()> {
        let mut stop = self.stop.subscribe();
        let interval = self.interval;
        let task = tokio::spawn(async move {
            let mut outstanding = HashMap::new();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        Self::send_queries(&router, &mut outstanding, interval);
                    }
                    _ = stop.changed() => break,
                }
            }
        });
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }

    fn stop(&self) {
        self.stop.send_replace(true);
    }

    fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        self.tasks.lock().unwrap().drain(..).collect()
    }

    fn inbound(&self, _datagram: Datagram, _rx_port: &Arc<dyn Port>) {}
}
