//! In-router services
//!
//! Reactive services are bound to a well-known static socket and handle
//! datagrams synchronously on the inbound dispatch path; their handlers
//! compute a response and hand it to the outbound path without blocking.
//! Periodic services (RTMP sending, ZIP sending, route ageing) run on
//! their own timer tasks.

mod aging;
mod echo;
mod nbp;
mod rtmp;
mod zip;

pub use aging::RoutingTableAgingService;
pub use echo::EchoService;
pub use nbp::NameInformationService;
pub use rtmp::{RtmpRespondingService, RtmpSendingService};
pub use zip::{QueryKey, ZipRespondingService, ZipSendingService};

use crate::dataplane::Router;
use crate::port::Port;
use crate::protocol::Datagram;
use crate::Result;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// An agent living on the router, reachable on a static socket and/or
/// running on its own timer.
pub trait Service: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &'static str;

    /// Start the service attached to the given router.
    fn start(&self, router: Arc<Router>) -> Result<()>;

    /// Signal the service to stop; tasks wind down asynchronously.
    fn stop(&self);

    /// Hand over the service's task handles so the router can await them.
    fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        Vec::new()
    }

    /// Called with datagrams addressed to the service's socket.
    fn inbound(&self, datagram: Datagram, rx_port: &Arc<dyn Port>);
}
