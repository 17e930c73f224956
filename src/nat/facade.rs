//! NAT facade
//!
//! [`Nat`] is the only entry point the forwarding path uses. It owns the
//! mapping table behind a single mutex shared with the sweeper thread. Each
//! call is one short critical section: in-memory lookups and timestamp
//! comparisons, no I/O. Mappings leave the lock only as copies.
//!
//! Helpers that need the table while it is locked receive `&mut MappingTable`
//! from the caller instead of locking again, so the mutex never has to be
//! re-entrant.

use super::conntrack::TcpSegment;
use super::pool::{IdentifierPool, MappingKind};
use super::sweeper::Sweeper;
use super::table::{Mapping, MappingTable, PendingSyn, SweepReport, Translation};
use crate::config::NatConfig;
use crate::telemetry::NatMetrics;
use crate::{Error, Result};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info};

/// State shared between the facade and the sweeper thread
struct Shared {
    table: Mutex<MappingTable>,
    shut_down: AtomicBool,
}

impl Shared {
    /// Run `f` under the table lock.
    ///
    /// A poisoned lock means a thread panicked mid-update and the table may be
    /// inconsistent: the instance is marked shut down and stays that way.
    fn with_table<T>(&self, f: impl FnOnce(&mut MappingTable) -> T) -> Result<T> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::ShutDown);
        }

        let mut table = match self.table.lock() {
            Ok(table) => table,
            Err(_) => {
                if !self.shut_down.swap(true, Ordering::AcqRel) {
                    error!("NAT: table lock poisoned, shutting down NAT instance");
                }
                return Err(Error::LockPoisoned);
            }
        };
        Ok(f(&mut table))
    }

    fn sweep(&self) -> Result<SweepReport> {
        let report = self.with_table(|table| table.sweep_at(Instant::now()))?;
        if report != SweepReport::default() {
            debug!(
                "NAT sweep: {} mappings, {} connections, {} unsolicited SYNs expired",
                report.mappings_evicted, report.connections_evicted, report.syns_expired
            );
        }
        Ok(report)
    }
}

/// A NAT instance
pub struct Nat {
    shared: Arc<Shared>,
    sweeper: Mutex<Option<Sweeper>>,
    internal_interface: String,
    external_addr: Ipv4Addr,
    metrics: Arc<NatMetrics>,
}

impl Nat {
    /// Create a NAT over the full identifier ranges and start its sweeper
    pub fn new(config: &NatConfig) -> Result<Self> {
        Self::with_pool(config, IdentifierPool::new())
    }

    /// Create a NAT over a custom identifier pool and start its sweeper
    pub fn with_pool(config: &NatConfig, pool: IdentifierPool) -> Result<Self> {
        let nat = Self::without_sweeper(config, pool);

        let shared = nat.shared.clone();
        let sweeper = Sweeper::spawn(config.sweep_interval(), move || {
            shared.sweep().is_ok()
        })?;
        if let Ok(mut slot) = nat.sweeper.lock() {
            *slot = Some(sweeper);
        }

        Ok(nat)
    }

    /// Create a NAT with no background thread; the owner calls
    /// [`Nat::sweep`] on its own schedule (e.g. from an event-loop timer).
    pub fn without_sweeper(config: &NatConfig, pool: IdentifierPool) -> Self {
        let metrics = Arc::new(NatMetrics::new());
        let table = MappingTable::with_pool(
            config.external_ip,
            config.timeouts(),
            pool,
            metrics.clone(),
        );

        info!(
            "NAT up: external {} internal interface {}",
            config.external_ip, config.internal_interface
        );

        Self {
            shared: Arc::new(Shared {
                table: Mutex::new(table),
                shut_down: AtomicBool::new(false),
            }),
            sweeper: Mutex::new(None),
            internal_interface: config.internal_interface.clone(),
            external_addr: config.external_ip,
            metrics,
        }
    }

    /// Translate a packet leaving the internal network.
    ///
    /// Reuses the internal endpoint's mapping or creates one. For TCP pass
    /// the segment so its connection is tracked. Fails with
    /// [`Error::PoolExhausted`] when a new mapping is needed and none is free.
    pub fn translate_outbound(
        &self,
        kind: MappingKind,
        internal_addr: Ipv4Addr,
        internal_id: u16,
        segment: Option<&TcpSegment>,
    ) -> Result<Translation> {
        self.shared.with_table(|table| {
            table.outbound_at(kind, internal_addr, internal_id, segment, Instant::now())
        })?
    }

    /// Translate a packet arriving on the external side.
    ///
    /// Returns a copy of the mapping to rewrite towards, or `None` when no
    /// mapping exists (or a TCP segment fails handshake validation or
    /// exceeds the mapping's peer limit). The forwarding path decides whether
    /// to drop or deliver locally.
    pub fn translate_inbound(
        &self,
        kind: MappingKind,
        external_id: u16,
        segment: Option<&TcpSegment>,
    ) -> Result<Option<Mapping>> {
        self.shared
            .with_table(|table| table.inbound_at(kind, external_id, segment, Instant::now()))
    }

    /// Copy of the mapping for an internal endpoint, without refreshing it
    pub fn lookup_internal(
        &self,
        kind: MappingKind,
        internal_addr: Ipv4Addr,
        internal_id: u16,
    ) -> Result<Option<Mapping>> {
        self.shared.with_table(|table| {
            table
                .lookup_internal(kind, internal_addr, internal_id)
                .cloned()
        })
    }

    /// Copy of the mapping holding an external identifier, without refreshing it
    pub fn lookup_external(&self, kind: MappingKind, external_id: u16) -> Result<Option<Mapping>> {
        self.shared
            .with_table(|table| table.lookup_external(kind, external_id).cloned())
    }

    /// Remove a mapping now, releasing its identifier
    pub fn remove(&self, kind: MappingKind, external_id: u16) -> Result<Option<Mapping>> {
        self.shared
            .with_table(|table| table.remove(kind, external_id))
    }

    /// Run one expiry pass immediately
    pub fn sweep(&self) -> Result<SweepReport> {
        self.shared.sweep()
    }

    /// Unsolicited SYNs that went unanswered; reply to each with ICMP port unreachable
    pub fn drain_expired_syns(&self) -> Result<Vec<PendingSyn>> {
        self.shared.with_table(|table| table.drain_expired_syns())
    }

    /// Copies of all mappings, most recently created first
    pub fn snapshot(&self) -> Result<Vec<Mapping>> {
        self.shared.with_table(|table| table.snapshot())
    }

    /// Write every mapping to the debug log
    pub fn log_table(&self) -> Result<()> {
        let mappings = self.snapshot()?;
        debug!("NAT table: {} mappings", mappings.len());
        for mapping in &mappings {
            debug!("  {}", mapping);
        }
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        self.shared.with_table(|table| table.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.shared.with_table(|table| table.is_empty())
    }

    /// True for the interface facing the private network
    pub fn is_internal_interface(&self, name: &str) -> bool {
        name == self.internal_interface
    }

    pub fn external_addr(&self) -> Ipv4Addr {
        self.external_addr
    }

    pub fn metrics(&self) -> &Arc<NatMetrics> {
        &self.metrics
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }

    /// Stop the sweeper and release every mapping. Idempotent; later calls
    /// on the instance return [`Error::ShutDown`].
    pub fn shutdown(&self) {
        let sweeper = match self.sweeper.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sweeper) = sweeper {
            sweeper.stop();
        }

        let was_shut_down = self.shared.shut_down.swap(true, Ordering::AcqRel);

        // After poisoning the table is still cleared so identifiers and
        // gauges are released
        let mut table = match self.shared.table.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        };
        let released = table.len();
        table.clear();
        if !was_shut_down || released > 0 {
            info!("NAT shut down, released {} mappings", released);
        }
    }
}

impl Drop for Nat {
    fn drop(&mut self) {
        self.shutdown();
    }
}
