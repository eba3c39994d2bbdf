//! NBP (Name Binding Protocol) service
//!
//! Fans broadcast requests out as lookups on the zones they name and
//! converts between BrRq, LkUp, and FwdReq as the packets cross network
//! boundaries. Replies go straight from the answering node to the
//! requester and never pass through here.

use crate::dataplane::Router;
use crate::port::Port;
use crate::protocol::nbp::{NbpPacket, NBP_DDP_TYPE, NBP_FUNC_BRRQ, NBP_FUNC_FWDREQ, NBP_FUNC_LKUP};
use crate::protocol::{Datagram, ZoneName, NBP_SOCKET, NODE_ANY_ROUTER, NODE_BROADCAST};
use crate::service::Service;
use crate::Result;
use std::sync::{Arc, OnceLock};
use tracing::debug;

const WILDCARD_ZONE: &[u8] = b"*";

/// Handles BrRq and FwdReq packets on socket 2.
#[derive(Default)]
pub struct NameInformationService {
    router: OnceLock<Arc<Router>>,
}

impl NameInformationService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Multicast a LkUp for `packet` on the directly-connected network
    /// of `entry`.
    fn multicast_lookup(entry: &crate::dataplane::RouteEntry, zone_name: &ZoneName, lkup_data: &[u8]) {
        let port = &entry.port;
        if port.network() == 0 || port.node() == 0 {
            return;
        }
        // extended networks hear lookups on the zone multicast with a
        // "this network" destination
        let target_network = if entry.extended { 0 } else { port.network() };
        port.multicast(
            zone_name,
            Datagram {
                hop_count: 0,
                destination_network: target_network,
                source_network: port.network(),
                destination_node: NODE_BROADCAST,
                source_node: port.node(),
                destination_socket: NBP_SOCKET,
                source_socket: NBP_SOCKET,
                ddp_type: NBP_DDP_TYPE,
                data: lkup_data.to_vec(),
            },
        );
    }

    fn handle_broadcast_request(
        &self,
        router: &Router,
        packet: &NbpPacket,
        rx_port: &Arc<dyn Port>,
    ) {
        let lkup_data = packet.with_function(NBP_FUNC_LKUP);
        let fwdreq_data = packet.with_function(NBP_FUNC_FWDREQ);

        // a wildcard zone on a non-extended network means the network's
        // own zone; extended-network requesters must name their zone
        let mut zone_field = packet.zone.clone();
        if zone_field.is_empty() || zone_field == WILDCARD_ZONE {
            if rx_port.extended_network() {
                return;
            }
            zone_field = WILDCARD_ZONE.to_vec();
            if rx_port.network() != 0 {
                if let Some((entry, _)) = router.routing_table.lookup(rx_port.network()) {
                    let zones = router.zone_table.zones_in_range(entry.range);
                    if let [only_zone] = zones.as_slice() {
                        zone_field = only_zone.as_bytes().to_vec();
                    }
                }
            }
        }

        // still unresolved: look up on the requesting network alone
        if zone_field == WILDCARD_ZONE {
            rx_port.broadcast(Datagram {
                hop_count: 0,
                destination_network: 0,
                source_network: rx_port.network(),
                destination_node: NODE_BROADCAST,
                source_node: rx_port.node(),
                destination_socket: NBP_SOCKET,
                source_socket: NBP_SOCKET,
                ddp_type: NBP_DDP_TYPE,
                data: lkup_data,
            });
            return;
        }

        let Ok(zone_name) = ZoneName::new(zone_field) else {
            return;
        };
        for range in router.zone_table.ranges_in_zone(&zone_name) {
            let Some((entry, _)) = router.routing_table.lookup(range.first) else {
                continue;
            };
            if entry.is_direct() {
                Self::multicast_lookup(&entry, &zone_name, &lkup_data);
            } else {
                // a router on that network fans the request out locally
                router.route_out(Datagram {
                    hop_count: 0,
                    destination_network: entry.range.first,
                    source_network: 0,
                    destination_node: NODE_ANY_ROUTER,
                    source_node: 0,
                    destination_socket: NBP_SOCKET,
                    source_socket: NBP_SOCKET,
                    ddp_type: NBP_DDP_TYPE,
                    data: fwdreq_data.clone(),
                });
            }
        }
    }

    fn handle_forward_request(&self, router: &Router, packet: &NbpPacket, datagram: &Datagram) {
        let Some((entry, _)) = router.routing_table.lookup(datagram.destination_network) else {
            return;
        };
        // a FwdReq that lands on a router not directly connected to the
        // target network went astray
        if !entry.is_direct() {
            debug!(
                "{} FwdReq for network {} but we are not directly connected",
                router.short_str(),
                datagram.destination_network
            );
            return;
        }
        let zone_bytes = if packet.zone.is_empty() {
            WILDCARD_ZONE.to_vec()
        } else {
            packet.zone.clone()
        };
        let Ok(zone_name) = ZoneName::new(zone_bytes) else {
            return;
        };
        let lkup_data = packet.with_function(NBP_FUNC_LKUP);
        Self::multicast_lookup(&entry, &zone_name, &lkup_data);
    }
}

impl Service for NameInformationService {
    fn name(&self) -> &'static str {
        "name information service"
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
        if datagram.ddp_type != NBP_DDP_TYPE {
            return;
        }
        let packet = match NbpPacket::parse(&datagram.data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("{} ignoring NBP packet: {}", router.short_str(), e);
                return;
            }
        };
        match packet.function {
            NBP_FUNC_BRRQ => self.handle_broadcast_request(router, &packet, rx_port),
            NBP_FUNC_FWDREQ => self.handle_forward_request(router, &packet, &datagram),
            _ => {}
        }
    }
}
