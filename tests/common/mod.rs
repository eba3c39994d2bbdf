//! Shared fixtures: a router over in-memory ports

use atrouter::dataplane::Router;
use atrouter::port::testing::TestPort;
use atrouter::port::Port;
use atrouter::protocol::NetworkRange;
use atrouter::telemetry::MetricsRegistry;
use std::sync::Arc;

/// A router with two Online non-extended ports: network 1 (node 220)
/// and network 2 (node 221).
pub fn two_port_router() -> (Arc<Router>, Arc<TestPort>, Arc<TestPort>) {
    let port_a = TestPort::online(1, 220, NetworkRange::single(1));
    let port_b = TestPort::online(2, 221, NetworkRange::single(2));
    let router = Router::new(
        "test router",
        vec![
            Arc::clone(&port_a) as Arc<dyn Port>,
            Arc::clone(&port_b) as Arc<dyn Port>,
        ],
        Arc::new(MetricsRegistry::new()),
    );
    router.start().expect("router start");
    (router, port_a, port_b)
}

/// The ports as trait objects, for calls that want `&Arc<dyn Port>`.
pub fn as_dyn(port: &Arc<TestPort>) -> Arc<dyn Port> {
    Arc::clone(port) as Arc<dyn Port>
}
