//! RTMP services: routing table maintenance and periodic advertisement

use crate::dataplane::{RouteEntry, Router};
use crate::port::{same_port, Port};
use crate::protocol::rtmp::{
    build_data_packets, build_response, RtmpData, RtmpTuple, RTMP_DDP_TYPE_DATA,
    RTMP_DDP_TYPE_REQUEST, RTMP_DISTANCE_UNREACHABLE, RTMP_FUNC_RDR_NO_SPLIT_HORIZON,
    RTMP_FUNC_RDR_SPLIT_HORIZON, RTMP_FUNC_REQUEST,
};
use crate::protocol::{Datagram, NODE_BROADCAST, RTMP_SOCKET};
use crate::service::Service;
use crate::Result;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Seconds between outbound RTMP data packets.
const SEND_INTERVAL_SECS: u64 = 10;

/// Routes a neighbor advertises at this distance or further are
/// unreachable for us.
const DISTANCE_HORIZON: u8 = 15;

/// Collect the routing tuples a port should advertise.
///
/// With split horizon, routes whose egress is the advertisement port are
/// withheld, except the port's own directly-connected range. Bad routes
/// advertise an unreachable distance so neighbors hear of the loss.
fn routing_tuples(router: &Router, port: &Arc<dyn Port>, split_horizon: bool) -> Vec<RtmpTuple> {
    let port_range = port.network_range();
    router
        .routing_table
        .entries()
        .into_iter()
        .filter_map(|(entry, state)| {
            let own_range =
                entry.is_direct() && same_port(&entry.port, port) && entry.range == port_range;
            if split_horizon && same_port(&entry.port, port) && !own_range {
                return None;
            }
            let distance = if state.is_bad() {
                RTMP_DISTANCE_UNREACHABLE
            } else {
                entry.distance
            };
            Some(RtmpTuple {
                range: entry.range,
                distance,
                extended: entry.extended,
            })
        })
        .collect()
}

/// Build the RTMP data packet payloads a port should send.
fn data_packets_for_port(
    router: &Router,
    port: &Arc<dyn Port>,
    split_horizon: bool,
) -> Result<Vec<Vec<u8>>> {
    let tuples = routing_tuples(router, port, split_horizon);
    build_data_packets(
        port.network(),
        port.node(),
        port.extended_network(),
        port.network_range(),
        &tuples,
    )
}

/// Maintains the routing table from neighbors' RTMP data packets and
/// answers RTMP requests, on socket 1.
#[derive(Default)]
pub struct RtmpRespondingService {
    router: OnceLock<Arc<Router>>,
}

impl RtmpRespondingService {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle_data(&self, router: &Router, datagram: &Datagram, rx_port: &Arc<dyn Port>) {
        let data = match RtmpData::parse(&datagram.data, rx_port.extended_network()) {
            Ok(data) => data,
            Err(e) => {
                debug!(
                    "{} ignoring RTMP data from {}.{}: {}",
                    router.short_str(),
                    datagram.source_network,
                    datagram.source_node,
                    e
                );
                return;
            }
        };

        // a port that does not know its network range yet takes the
        // sender for its network's seed router
        if rx_port.network_range().is_unknown() {
            if let Err(e) = rx_port.set_network_range(data.sender_range) {
                warn!("{} {}", router.short_str(), e);
            }
        }

        for tuple in &data.tuples {
            if tuple.distance >= DISTANCE_HORIZON {
                router.routing_table.mark_bad(tuple.range);
            } else {
                let accepted = router.routing_table.consider(RouteEntry {
                    extended: tuple.extended,
                    range: tuple.range,
                    distance: tuple.distance + 1,
                    port: Arc::clone(rx_port),
                    next_network: data.sender_network,
                    next_node: data.sender_node,
                });
                if accepted {
                    router.metrics().rtmp_updates.inc();
                }
            }
        }
    }

    fn handle_request(&self, router: &Router, datagram: &Datagram, rx_port: &Arc<dyn Port>) {
        match datagram.data.first() {
            Some(&RTMP_FUNC_REQUEST) => {
                if rx_port.network_range().is_unknown() || rx_port.node() == 0 {
                    return;
                }
                // responses go out the port the request came in on, so a
                // routed request cannot be answered
                if datagram.hop_count != 0 {
                    return;
                }
                let response = build_response(
                    rx_port.network(),
                    rx_port.node(),
                    rx_port.extended_network(),
                    rx_port.network_range(),
                );
                rx_port.unicast(
                    datagram.source_network,
                    datagram.source_node,
                    Datagram {
                        hop_count: 0,
                        destination_network: datagram.source_network,
                        source_network: rx_port.network(),
                        destination_node: datagram.source_node,
                        source_node: rx_port.node(),
                        destination_socket: datagram.source_socket,
                        source_socket: datagram.destination_socket,
                        ddp_type: RTMP_DDP_TYPE_DATA,
                        data: response,
                    },
                );
            }
            Some(&func)
                if func == RTMP_FUNC_RDR_SPLIT_HORIZON
                    || func == RTMP_FUNC_RDR_NO_SPLIT_HORIZON =>
            {
                let split_horizon = func == RTMP_FUNC_RDR_SPLIT_HORIZON;
                let packets = match data_packets_for_port(router, rx_port, split_horizon) {
                    Ok(packets) => packets,
                    Err(_) => return,
                };
                for packet in packets {
                    router.route_out(Datagram {
                        hop_count: 0,
                        destination_network: datagram.source_network,
                        source_network: 0,
                        destination_node: datagram.source_node,
                        source_node: 0,
                        destination_socket: datagram.source_socket,
                        source_socket: datagram.destination_socket,
                        ddp_type: RTMP_DDP_TYPE_DATA,
                        data: packet,
                    });
                }
            }
            _ => {}
        }
    }
}

impl Service for RtmpRespondingService {
    fn name(&self) -> &'static str {
        "RTMP responding service"
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
            RTMP_DDP_TYPE_DATA => self.handle_data(router, &datagram, rx_port),
            RTMP_DDP_TYPE_REQUEST => self.handle_request(router, &datagram, rx_port),
            _ => {}
        }
    }
}

/// Broadcasts the routing table out every ready port on a fixed period.
pub struct RtmpSendingService {
    interval: Duration,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RtmpSendingService {
    pub fn new() -> Self {
        Self::with_interval(Duration::from_secs(SEND_INTERVAL_SECS))
    }

    pub fn with_interval(interval: Duration) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            interval,
            stop,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// One advertisement round over every port with an address.
    pub fn send_advertisements(router: &Router) {
        for port in router.ports() {
            if port.network() == 0 || port.node() == 0 {
                continue;
            }
            let packets = match data_packets_for_port(router, port, true) {
                Ok(packets) => packets,
                Err(e) => {
                    warn!("{} {}: {}", router.short_str(), port.short_str(), e);
                    continue;
                }
            };
            for packet in packets {
                port.broadcast(Datagram {
                    hop_count: 0,
                    destination_network: 0,
                    source_network: port.network(),
                    destination_node: NODE_BROADCAST,
                    source_node: port.node(),
                    destination_socket: RTMP_SOCKET,
                    source_socket: RTMP_SOCKET,
                    ddp_type: RTMP_DDP_TYPE_DATA,
                    data: packet,
                });
            }
        }
    }
}

impl Default for RtmpSendingService {
    fn default() -> Self {
        Self::new()
    }
}

impl Service for RtmpSendingService {
    fn name(&self) -> &'static str {
        "RTMP sending service"
    }

    fn start(&self, router: Arc<Router>) -> Result<()> {
        let mut stop = self.stop.subscribe();
        let interval = self.interval;
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        Self::send_advertisements(&router);
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
