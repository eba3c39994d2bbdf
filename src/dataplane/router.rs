//! The router coordinator
//!
//! Owns the ports, the services, the routing table, and the zone table.
//! Ports call `inbound` with decoded datagrams; services originate
//! traffic through `route_out` and answer requests through `reply`.

use crate::dataplane::{RoutingTable, ZoneTable};
use crate::port::Port;
use crate::protocol::ddp::MAX_HOP_COUNT;
use crate::protocol::zip::ZIP_DDP_TYPE;
use crate::protocol::{
    Datagram, ECHO_SOCKET, NBP_SOCKET, NODE_ANY_ROUTER, NODE_BROADCAST, RTMP_SOCKET,
    STARTUP_NETWORK_MIN, STARTUP_NETWORK_MAX, ZIP_SOCKET,
};
use crate::service::{
    EchoService, NameInformationService, RoutingTableAgingService, RtmpRespondingService,
    RtmpSendingService, Service, ZipRespondingService, ZipSendingService,
};
use crate::telemetry::MetricsRegistry;
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, trace, warn};

/// How long each port or service gets to wind down after stop().
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// The router: sends datagrams to ports, runs services.
pub struct Router {
    name: String,
    ports: Vec<Arc<dyn Port>>,
    services: Vec<(Option<u8>, Arc<dyn Service>)>,
    services_by_socket: HashMap<u8, Arc<dyn Service>>,
    pub routing_table: RoutingTable,
    pub zone_table: ZoneTable,
    metrics: Arc<MetricsRegistry>,
}

impl Router {
    /// Build a router with the standard service set.
    pub fn new(
        name: impl Into<String>,
        ports: Vec<Arc<dyn Port>>,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        let services: Vec<(Option<u8>, Arc<dyn Service>)> = vec![
            (Some(ECHO_SOCKET), Arc::new(EchoService::new())),
            (Some(NBP_SOCKET), Arc::new(NameInformationService::new())),
            (None, Arc::new(RoutingTableAgingService::new())),
            (Some(RTMP_SOCKET), Arc::new(RtmpRespondingService::new())),
            (None, Arc::new(RtmpSendingService::new())),
            (Some(ZIP_SOCKET), Arc::new(ZipRespondingService::new())),
            (None, Arc::new(ZipSendingService::new())),
        ];
        let mut services_by_socket = HashMap::new();
        for (socket, service) in &services {
            if let Some(socket) = socket {
                services_by_socket.insert(*socket, Arc::clone(service));
            }
        }
        Arc::new(Self {
            name: name.into(),
            ports,
            services,
            services_by_socket,
            routing_table: RoutingTable::new(),
            zone_table: ZoneTable::new(),
            metrics,
        })
    }

    pub fn short_str(&self) -> &str {
        &self.name
    }

    pub fn ports(&self) -> &[Arc<dyn Port>] {
        &self.ports
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Start every port, then every service. Ports install their seed
    /// routing and zone entries as they start.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        for port in &self.ports {
            info!("{} starting port {}...", self.name, port.short_str());
            port.start(Arc::clone(self), Arc::clone(port))?;
        }
        info!("{} all ports started", self.name);
        for (_, service) in &self.services {
            info!("{} starting {}...", self.name, service.name());
            service.start(Arc::clone(self))?;
        }
        info!("{} all services started", self.name);
        Ok(())
    }

    /// Stop services and ports, waiting for their tasks to settle.
    pub async fn stop(&self) {
        for (_, service) in &self.services {
            service.stop();
        }
        for (_, service) in &self.services {
            for mut task in service.take_tasks() {
                if timeout(STOP_TIMEOUT, &mut task).await.is_err() {
                    warn!("{} task did not stop in time, aborting", self.name);
                    task.abort();
                }
            }
        }
        info!("{} all services stopped", self.name);
        for port in &self.ports {
            port.stop();
        }
        for port in &self.ports {
            for mut task in port.take_tasks() {
                if timeout(STOP_TIMEOUT, &mut task).await.is_err() {
                    warn!("{} task did not stop in time, aborting", self.name);
                    task.abort();
                }
            }
        }
        info!("{} all ports stopped", self.name);
    }

    /// Deliver a datagram to the service bound to its destination socket.
    fn deliver(&self, datagram: Datagram, rx_port: &Arc<dyn Port>) {
        self.metrics.packets_delivered.inc();
        if let Some(service) = self.services_by_socket.get(&datagram.destination_socket) {
            service.inbound(datagram, rx_port);
        }
    }

    /// Called by a port with a datagram received on it. The datagram may
    /// be delivered, forwarded, both, or neither.
    pub fn inbound(&self, mut datagram: Datagram, rx_port: &Arc<dyn Port>) {
        let port_network = rx_port.network();

        // a network number of zero means "this network"; the ingress
        // port knows which network that is
        if port_network != 0 {
            if datagram.destination_network == 0 {
                datagram.destination_network = port_network;
            }
            if datagram.source_network == 0 {
                datagram.source_network = port_network;
            }
        }

        // destined for the ingress network: deliver if ours, never route
        if datagram.destination_network == 0 || datagram.destination_network == port_network {
            if datagram.destination_node == NODE_ANY_ROUTER
                || datagram.destination_node == rx_port.node()
                || datagram.destination_node == NODE_BROADCAST
            {
                self.deliver(datagram, rx_port);
            }
            return;
        }

        // destined for another directly-connected network: we may have
        // to deliver instead of (or in addition to) forwarding
        if let Some((entry, _)) = self.routing_table.lookup(datagram.destination_network) {
            if entry.is_direct() {
                if datagram.destination_network == entry.port.network()
                    && datagram.destination_node == entry.port.node()
                {
                    self.deliver(datagram, rx_port);
                    return;
                } else if datagram.destination_node == NODE_ANY_ROUTER {
                    self.deliver(datagram, rx_port);
                    return;
                } else if datagram.destination_node == NODE_BROADCAST {
                    self.deliver(datagram.clone(), rx_port);
                }
            }
        }

        self.route(datagram, false);
    }

    /// Route a datagram originated by one of this router's services.
    pub fn route_out(&self, datagram: Datagram) {
        self.route(datagram, true);
    }

    /// Route a datagram to or toward its destination.
    pub fn route(&self, mut datagram: Datagram, originating: bool) {
        if originating {
            if datagram.hop_count != 0 {
                warn!("{} originated datagram has nonzero hop count", self.name);
                return;
            }
            if datagram.destination_network == 0 {
                warn!("{} originated datagram has no destination network", self.name);
                return;
            }
        }

        // without a destination network there is nowhere to go
        if datagram.destination_network == 0 {
            return;
        }

        let Some((entry, _)) = self.routing_table.lookup(datagram.destination_network) else {
            self.metrics.route_misses.inc();
            trace!(
                "{} no route to network {}",
                self.name,
                datagram.destination_network
            );
            return;
        };

        if originating {
            let network = entry.port.network();
            let node = entry.port.node();
            // the egress port may not have finished acquiring an address
            if network == 0 || node == 0 {
                return;
            }
            datagram.source_network = network;
            datagram.source_node = node;
        }

        if !entry.is_direct() {
            if datagram.hop_count >= MAX_HOP_COUNT {
                self.metrics.hop_limit_drops.inc();
                return;
            }
            entry
                .port
                .unicast(entry.next_network, entry.next_node, datagram.hopped());
            self.metrics.packets_forwarded.inc();
        } else if datagram.destination_node == NODE_ANY_ROUTER {
            // the any-router address is the control plane's business
        } else if datagram.destination_network == entry.port.network()
            && datagram.destination_node == entry.port.node()
        {
            // addressed to another of this router's ports, also the
            // control plane's business
        } else if datagram.destination_node == NODE_BROADCAST {
            if originating {
                entry.port.broadcast(datagram);
            } else if datagram.hop_count >= MAX_HOP_COUNT {
                self.metrics.hop_limit_drops.inc();
            } else {
                entry.port.broadcast(datagram.hopped());
                self.metrics.packets_forwarded.inc();
            }
        } else if originating {
            entry
                .port
                .unicast(datagram.destination_network, datagram.destination_node, datagram);
        } else if datagram.hop_count >= MAX_HOP_COUNT {
            self.metrics.hop_limit_drops.inc();
        } else {
            entry.port.unicast(
                datagram.destination_network,
                datagram.destination_node,
                datagram.hopped(),
            );
            self.metrics.packets_forwarded.inc();
        }
    }

    /// Build and send a reply to a request datagram.
    ///
    /// Requests from nodes still in the startup range (or with a zero
    /// source network) are answered directly out the ingress port, as
    /// are broadcast GetNetInfo requests from clients holding a stale
    /// address outside the port's range. Everything else goes through
    /// normal routing.
    pub fn reply(&self, request: &Datagram, rx_port: &Arc<dyn Port>, ddp_type: u8, data: Vec<u8>) {
        if request.source_node == NODE_ANY_ROUTER || request.source_node == NODE_BROADCAST {
            // invalid as a source, do not reply
            return;
        }
        let port_node = rx_port.node();
        let source_in_startup = request.source_network == 0
            || (STARTUP_NETWORK_MIN..=STARTUP_NETWORK_MAX).contains(&request.source_network);
        let stale_get_net_info = !rx_port.network_range().contains(request.source_network)
            && request.destination_node == NODE_BROADCAST
            && ddp_type == ZIP_DDP_TYPE;
        if (source_in_startup || stale_get_net_info) && port_node != 0 {
            rx_port.unicast(
                request.source_network,
                request.source_node,
                Datagram {
                    hop_count: 0,
                    destination_network: request.source_network,
                    source_network: rx_port.network(),
                    destination_node: request.source_node,
                    source_node: port_node,
                    destination_socket: request.source_socket,
                    source_socket: request.destination_socket,
                    ddp_type,
                    data,
                },
            );
        } else {
            self.route(
                Datagram {
                    hop_count: 0,
                    destination_network: request.source_network,
                    source_network: 0, // filled in by route
                    destination_node: request.source_node,
                    source_node: 0, // filled in by route
                    destination_socket: request.source_socket,
                    source_socket: request.destination_socket,
                    ddp_type,
                    data,
                },
                true,
            );
        }
    }

    /// Refresh the table size gauges.
    pub fn update_table_gauges(&self) {
        self.metrics.set_route_count(self.routing_table.len());
        self.metrics.set_zone_count(self.zone_table.len());
    }
}
