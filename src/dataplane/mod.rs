//! Data plane components
//!
//! The routing table, the zone table, and the router coordinator that
//! dispatches datagrams between them and the ports.

mod router;
mod routing_table;
mod zone_table;

pub use router::Router;
pub use routing_table::{RouteEntry, RouteState, RoutingTable};
pub use zone_table::ZoneTable;
