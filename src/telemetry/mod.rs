//! Telemetry module for logging and metrics.
//!
//! Provides:
//! - Logging configuration and initialization
//! - NAT counters and live-mapping gauges

mod logging;
mod metrics;

pub(crate) use logging::is_known_level;
pub use logging::{init_logging, LogConfig};
pub use metrics::{Counter, Gauge, NatMetrics};
