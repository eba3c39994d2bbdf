//! Metrics collection for datagram statistics.
//!
//! Thread-safe counters at the global and per-port level. Dropped and
//! malformed traffic is counted here rather than propagated as errors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Atomic counter for thread-safe increment operations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-port statistics.
#[derive(Debug, Default)]
pub struct PortStats {
    /// Frames received from the link.
    pub rx_frames: Counter,
    /// Bytes received from the link.
    pub rx_bytes: Counter,
    /// Frames handed to the link.
    pub tx_frames: Counter,
    /// Bytes handed to the link.
    pub tx_bytes: Counter,
    /// Datagrams that failed to parse.
    pub malformed_datagrams: Counter,
    /// Datagrams with a bad DDP checksum.
    pub checksum_mismatches: Counter,
    /// Outbound frames dropped because the link queue was full.
    pub tx_drops: Counter,
}

impl PortStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_rx(&self, bytes: usize) {
        self.rx_frames.inc();
        self.rx_bytes.add(bytes as u64);
    }

    pub fn record_tx(&self, bytes: usize) {
        self.tx_frames.inc();
        self.tx_bytes.add(bytes as u64);
    }
}

/// Global metrics registry for the router.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    /// Per-port statistics.
    ports: RwLock<HashMap<String, Arc<PortStats>>>,

    // Forwarding metrics
    /// Datagrams forwarded toward another network.
    pub packets_forwarded: Counter,
    /// Datagrams delivered to a router-local service.
    pub packets_delivered: Counter,
    /// Datagrams dropped because no route matched.
    pub route_misses: Counter,
    /// Datagrams dropped at the hop count limit.
    pub hop_limit_drops: Counter,

    // Protocol metrics
    /// Routing table updates applied from RTMP data packets.
    pub rtmp_updates: Counter,
    /// ZIP queries sent toward next hops.
    pub zip_queries_sent: Counter,
    /// AARP probes sent while acquiring an address.
    pub aarp_probes_sent: Counter,
    /// AARP responses sent defending our addresses.
    pub aarp_replies_sent: Counter,

    // Table size gauges
    /// Current number of routing table entries.
    pub route_count: AtomicU64,
    /// Current number of zone table entries.
    pub zone_count: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a port for statistics tracking, returning its stats.
    pub fn register_port(&self, name: &str) -> Arc<PortStats> {
        let mut ports = self.ports.write().unwrap();
        Arc::clone(ports.entry(name.to_string()).or_default())
    }

    pub fn set_route_count(&self, count: usize) {
        self.route_count.store(count as u64, Ordering::Relaxed);
    }

    pub fn set_zone_count(&self, count: usize) {
        self.zone_count.store(count as u64, Ordering::Relaxed);
    }

    /// Exports all metrics as key-value pairs.
    pub fn export(&self) -> Vec<(String, u64)> {
        let mut result = vec![
            ("packets_forwarded".into(), self.packets_forwarded.get()),
            ("packets_delivered".into(), self.packets_delivered.get()),
            ("route_misses".into(), self.route_misses.get()),
            ("hop_limit_drops".into(), self.hop_limit_drops.get()),
            ("rtmp_updates".into(), self.rtmp_updates.get()),
            ("zip_queries_sent".into(), self.zip_queries_sent.get()),
            ("aarp_probes_sent".into(), self.aarp_probes_sent.get()),
            ("aarp_replies_sent".into(), self.aarp_replies_sent.get()),
            ("route_count".into(), self.route_count.load(Ordering::Relaxed)),
            ("zone_count".into(), self.zone_count.load(Ordering::Relaxed)),
        ];

        let ports = self.ports.read().unwrap();
        for (name, stats) in ports.iter() {
            result.extend([
                (format!("{}_rx_frames", name), stats.rx_frames.get()),
                (format!("{}_rx_bytes", name), stats.rx_bytes.get()),
                (format!("{}_tx_frames", name), stats.tx_frames.get()),
                (format!("{}_tx_bytes", name), stats.tx_bytes.get()),
                (
                    format!("{}_malformed_datagrams", name),
                    stats.malformed_datagrams.get(),
                ),
                (
                    format!("{}_checksum_mismatches", name),
                    stats.checksum_mismatches.get(),
                ),
                (format!("{}_tx_drops", name), stats.tx_drops.get()),
            ]);
        }

        result
    }
}
