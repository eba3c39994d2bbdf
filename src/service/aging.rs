//! Routing table ageing service

use crate::dataplane::Router;
use crate::port::Port;
use crate::protocol::Datagram;
use crate::service::Service;
use crate::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Seconds between ageing passes.
const AGING_INTERVAL_SECS: u64 = 20;

/// Walks the routing table through its ageing states on a fixed period,
/// dropping zone bindings together with removed routes.
pub struct RoutingTableAgingService {
    interval: Duration,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RoutingTableAgingService {
    pub fn new() -> Self {
        Self::with_interval(Duration::from_secs(AGING_INTERVAL_SECS))
    }

    pub fn with_interval(interval: Duration) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            interval,
            stop,
            tasks: Mutex::new(Vec::new()),
        }
    }
}

impl Default for RoutingTableAgingService {
    fn default() -> Self {
        Self::new()
    }
}

impl Service for RoutingTableAgingService {
    fn name(&self) -> &'static str {
        "routing table aging service"
    }

    fn start(&self, router: Arc<Router>) -> Result<()> {
        let mut stop = self.stop.subscribe();
        let interval = self.interval;
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let removed = router.routing_table.age();
                        for range in removed {
                            debug!("{} dropping zones for aged-out range {}",
                                router.short_str(), range);
                            router.zone_table.remove_networks(range);
                        }
                        router.update_table_gauges();
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
