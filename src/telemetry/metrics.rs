//! NAT counters and gauges.
//!
//! Lock-free atomics shared through an `Arc`, so the forwarding path and the
//! sweeper can record without touching the table lock.

use crate::nat::MappingKind;
use std::sync::atomic::{AtomicU64, Ordering};

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

/// Up/down gauge; never goes below zero.
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Metrics for one NAT instance.
#[derive(Debug, Default)]
pub struct NatMetrics {
    // Mapping lifecycle
    /// Mappings created on an outbound miss.
    pub mappings_created: Counter,
    /// Mappings removed by the sweeper or at shutdown.
    pub mappings_evicted: Counter,
    /// Outbound flows refused because no identifier was free.
    pub pool_exhausted: Counter,

    // Connection tracking
    /// TCP connection records opened.
    pub connections_opened: Counter,
    /// TCP connection records expired.
    pub connections_evicted: Counter,

    // Unsolicited inbound SYNs
    /// SYNs queued with no mapping.
    pub unsolicited_syns_queued: Counter,
    /// Queued SYNs claimed by an outbound SYN.
    pub unsolicited_syns_absorbed: Counter,
    /// Queued SYNs whose grace period ran out with no internal traffic.
    pub unsolicited_syns_expired: Counter,
    /// SYNs discarded because the pending or expired list was full.
    pub unsolicited_syns_dropped: Counter,

    /// Completed sweep passes.
    pub sweep_ticks: Counter,

    /// Live TCP mappings.
    pub tcp_mappings: Gauge,
    /// Live ICMP mappings.
    pub icmp_mappings: Gauge,
}

impl NatMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live-mapping gauge for a kind
    pub fn mapping_gauge(&self, kind: MappingKind) -> &Gauge {
        match kind {
            MappingKind::Tcp => &self.tcp_mappings,
            MappingKind::Icmp => &self.icmp_mappings,
        }
    }

    /// Exports all metrics as key-value pairs.
    pub fn export(&self) -> Vec<(String, u64)> {
        vec![
            ("nat_mappings_created".into(), self.mappings_created.get()),
            ("nat_mappings_evicted".into(), self.mappings_evicted.get()),
            ("nat_pool_exhausted".into(), self.pool_exhausted.get()),
            ("nat_connections_opened".into(), self.connections_opened.get()),
            (
                "nat_connections_evicted".into(),
                self.connections_evicted.get(),
            ),
            (
                "nat_unsolicited_syns_queued".into(),
                self.unsolicited_syns_queued.get(),
            ),
            (
                "nat_unsolicited_syns_absorbed".into(),
                self.unsolicited_syns_absorbed.get(),
            ),
            (
                "nat_unsolicited_syns_expired".into(),
                self.unsolicited_syns_expired.get(),
            ),
            (
                "nat_unsolicited_syns_dropped".into(),
                self.unsolicited_syns_dropped.get(),
            ),
            ("nat_sweep_ticks".into(), self.sweep_ticks.get()),
            ("nat_tcp_mappings".into(), self.tcp_mappings.get()),
            ("nat_icmp_mappings".into(), self.icmp_mappings.get()),
        ]
    }
}
