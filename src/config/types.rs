//! Configuration types

use crate::nat::NatTimeouts;
use crate::telemetry::LogConfig;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

/// Interface facing the private network unless configured otherwise
pub const DEFAULT_INTERNAL_INTERFACE: &str = "eth1";

/// User-defined configuration (nat.toml)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    pub nat: NatConfig,
    #[serde(default)]
    pub logging: LogConfig,
}

/// `[nat]` table. Timeouts are in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NatConfig {
    #[serde(default = "default_internal_interface")]
    pub internal_interface: String,
    pub external_ip: Ipv4Addr,
    #[serde(default = "default_icmp_query_timeout")]
    pub icmp_query_timeout: u64,
    #[serde(default = "default_tcp_established_timeout")]
    pub tcp_established_timeout: u64,
    #[serde(default = "default_tcp_transitory_timeout")]
    pub tcp_transitory_timeout: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_syn_grace_period")]
    pub syn_grace_period: u64,
}

fn default_internal_interface() -> String {
    DEFAULT_INTERNAL_INTERFACE.to_string()
}

fn default_icmp_query_timeout() -> u64 {
    60
}

fn default_tcp_established_timeout() -> u64 {
    7440
}

fn default_tcp_transitory_timeout() -> u64 {
    300
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_syn_grace_period() -> u64 {
    6
}

impl NatConfig {
    /// All defaults, with the given public address
    pub fn new(external_ip: Ipv4Addr) -> Self {
        Self {
            internal_interface: default_internal_interface(),
            external_ip,
            icmp_query_timeout: default_icmp_query_timeout(),
            tcp_established_timeout: default_tcp_established_timeout(),
            tcp_transitory_timeout: default_tcp_transitory_timeout(),
            sweep_interval_ms: default_sweep_interval_ms(),
            syn_grace_period: default_syn_grace_period(),
        }
    }

    pub fn timeouts(&self) -> NatTimeouts {
        NatTimeouts {
            icmp_query: Duration::from_secs(self.icmp_query_timeout),
            tcp_established: Duration::from_secs(self.tcp_established_timeout),
            tcp_transitory: Duration::from_secs(self.tcp_transitory_timeout),
            unsolicited_syn: Duration::from_secs(self.syn_grace_period),
        }
    }

    /// Sweeper tick, never shorter than one millisecond
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

// ============================================================================
// Resolved config (all defaults filled in), printed by `natbox config show`
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    pub generated_at: String,
    pub nat: NatConfig,
    pub logging: LogConfig,
}

impl ResolvedConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            generated_at: chrono::Utc::now().to_rfc3339(),
            nat: config.nat.clone(),
            logging: config.logging.clone(),
        }
    }
}
