//! Configuration validation

use super::Config;
use crate::telemetry::is_known_level;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            println!("[WARN] {}", warning);
        }
        for error in &self.errors {
            println!("[ERROR] {}", error);
        }
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate configuration and return warnings/errors
pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_addressing(config, &mut result);
    validate_timeouts(config, &mut result);
    validate_logging(config, &mut result);

    result
}

fn validate_addressing(config: &Config, result: &mut ValidationResult) {
    let nat = &config.nat;

    if nat.internal_interface.trim().is_empty() {
        result.error("nat.internal_interface: must name an interface");
    }

    let ip = nat.external_ip;
    if ip.is_unspecified() || ip.is_broadcast() || ip.is_multicast() {
        result.error(format!("nat.external_ip: {} is not a unicast address", ip));
    } else if ip.is_loopback() {
        result.error(format!("nat.external_ip: {} is a loopback address", ip));
    } else if ip.is_private() {
        result.warn(format!(
            "nat.external_ip: {} is a private address (double NAT?)",
            ip
        ));
    }
}

fn validate_timeouts(config: &Config, result: &mut ValidationResult) {
    let nat = &config.nat;

    for (name, value) in [
        ("icmp_query_timeout", nat.icmp_query_timeout),
        ("tcp_established_timeout", nat.tcp_established_timeout),
        ("tcp_transitory_timeout", nat.tcp_transitory_timeout),
        ("syn_grace_period", nat.syn_grace_period),
    ] {
        if value == 0 {
            result.error(format!("nat.{}: must be greater than zero", name));
        }
    }

    if nat.sweep_interval_ms == 0 {
        result.error("nat.sweep_interval_ms: must be greater than zero");
    }

    if nat.tcp_established_timeout < nat.tcp_transitory_timeout {
        result.warn(format!(
            "nat.tcp_established_timeout ({}s) is shorter than tcp_transitory_timeout ({}s)",
            nat.tcp_established_timeout, nat.tcp_transitory_timeout
        ));
    }

    // RFC 5382 REQ-5: established idle timeout no less than 2h4m
    if nat.tcp_established_timeout < 7440 {
        result.warn(format!(
            "nat.tcp_established_timeout: {}s is below the RFC 5382 minimum of 7440s",
            nat.tcp_established_timeout
        ));
    }

    if nat.syn_grace_period >= nat.tcp_transitory_timeout && nat.tcp_transitory_timeout > 0 {
        result.warn(format!(
            "nat.syn_grace_period ({}s) is not shorter than tcp_transitory_timeout ({}s)",
            nat.syn_grace_period, nat.tcp_transitory_timeout
        ));
    }

    if nat.sweep_interval_ms > nat.icmp_query_timeout.saturating_mul(1000) {
        result.warn(format!(
            "nat.sweep_interval_ms ({}ms) exceeds icmp_query_timeout ({}s)",
            nat.sweep_interval_ms, nat.icmp_query_timeout
        ));
    }
}

fn validate_logging(config: &Config, result: &mut ValidationResult) {
    if !is_known_level(&config.logging.level) {
        result.warn(format!(
            "logging.level: unknown level {:?}, using info",
            config.logging.level
        ));
    }
    if !matches!(config.logging.format.as_str(), "pretty" | "compact" | "json") {
        result.warn(format!(
            "logging.format: unknown format {:?}, using pretty",
            config.logging.format
        ));
    }
}
