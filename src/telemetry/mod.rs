//! Logging and metrics
//!
//! Observability plumbing for the router: tracing setup and
//! packet-statistics counters.

mod logging;
mod metrics;

pub use logging::{init_logging, LogConfig};
pub use metrics::{Counter, MetricsRegistry, PortStats};
