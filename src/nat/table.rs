//! NAT mapping table
//!
//! Owns every [`Mapping`], the identifier pool and the queue of unsolicited
//! inbound SYNs. Mappings are indexed by their internal triple with a second
//! index by external identifier, so both lookups are O(1) hash probes. Every
//! operation takes the current time explicitly; the facade passes
//! `Instant::now()` and holds the lock around each call.

use super::conntrack::{ConnectionSet, Direction, TcpSegment, TcpState, TrackOutcome};
use super::pool::{IdentifierPool, MappingKind};
use crate::telemetry::NatMetrics;
use crate::Result;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Upper bound on queued unsolicited SYNs; the oldest is dropped beyond it
pub const MAX_PENDING_SYNS: usize = 1024;

/// Idle timeouts per mapping / connection class (RFC 5382, RFC 5508)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatTimeouts {
    /// ICMP query mapping (default: 60 seconds)
    pub icmp_query: Duration,
    /// TCP established connection (default: 2 hours 4 minutes)
    pub tcp_established: Duration,
    /// TCP handshake / closing connection and connection-less TCP mapping (default: 5 minutes)
    pub tcp_transitory: Duration,
    /// How long an unsolicited inbound SYN is held (default: 6 seconds)
    pub unsolicited_syn: Duration,
}

impl Default for NatTimeouts {
    fn default() -> Self {
        Self {
            icmp_query: Duration::from_secs(60),
            tcp_established: Duration::from_secs(7440),
            tcp_transitory: Duration::from_secs(300),
            unsolicited_syn: Duration::from_secs(6),
        }
    }
}

/// A translation record, handed out by value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub kind: MappingKind,
    pub internal_addr: Ipv4Addr,
    /// Internal port or ICMP identifier
    pub internal_id: u16,
    pub external_addr: Ipv4Addr,
    /// External port or ICMP identifier
    pub external_id: u16,
    pub last_activity: Instant,
    /// Always empty for ICMP
    pub connections: ConnectionSet,
    /// Insertion sequence, newest highest
    seq: u64,
}

impl Mapping {
    fn idle_timeout(&self, timeouts: &NatTimeouts) -> Duration {
        match self.kind {
            MappingKind::Icmp => timeouts.icmp_query,
            MappingKind::Tcp => timeouts.tcp_transitory,
        }
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} <-> {}:{}",
            self.kind, self.internal_addr, self.internal_id, self.external_addr, self.external_id
        )?;
        for conn in self.connections.iter() {
            write!(f, " [{} {}]", conn.peer, conn.state)?;
        }
        Ok(())
    }
}

/// What the forwarding path writes into an outbound packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub kind: MappingKind,
    pub external_addr: Ipv4Addr,
    pub external_id: u16,
    /// The mapping was created by this packet
    pub created: bool,
    /// Connection state after the segment, if one is tracked
    pub connection: Option<TcpState>,
}

/// Unsolicited inbound SYN waiting for internal traffic to claim it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingSyn {
    pub external_port: u16,
    pub peer: SocketAddrV4,
    pub received_at: Instant,
}

/// Counts of what one sweep pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub mappings_evicted: usize,
    pub connections_evicted: usize,
    pub syns_expired: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct InternalKey {
    kind: MappingKind,
    addr: Ipv4Addr,
    id: u16,
}

/// Directory of internal <-> external translations
pub struct MappingTable {
    /// Internal triple -> mapping
    by_internal: HashMap<InternalKey, Mapping>,
    /// (kind, external id) -> internal triple
    by_external: HashMap<(MappingKind, u16), InternalKey>,
    pool: IdentifierPool,
    external_addr: Ipv4Addr,
    timeouts: NatTimeouts,
    pending_syns: VecDeque<PendingSyn>,
    /// Expired SYNs owed a port unreachable, bounded like `pending_syns`
    expired_syns: VecDeque<PendingSyn>,
    next_seq: u64,
    metrics: Arc<NatMetrics>,
}

impl MappingTable {
    pub fn new(external_addr: Ipv4Addr, timeouts: NatTimeouts) -> Self {
        Self::with_pool(
            external_addr,
            timeouts,
            IdentifierPool::new(),
            Arc::new(NatMetrics::new()),
        )
    }

    pub fn with_pool(
        external_addr: Ipv4Addr,
        timeouts: NatTimeouts,
        pool: IdentifierPool,
        metrics: Arc<NatMetrics>,
    ) -> Self {
        Self {
            by_internal: HashMap::new(),
            by_external: HashMap::new(),
            pool,
            external_addr,
            timeouts,
            pending_syns: VecDeque::new(),
            expired_syns: VecDeque::new(),
            next_seq: 0,
            metrics,
        }
    }

    /// Public address every mapping translates to
    pub fn external_addr(&self) -> Ipv4Addr {
        self.external_addr
    }

    /// Idle timeouts the sweep pass applies
    pub fn timeouts(&self) -> &NatTimeouts {
        &self.timeouts
    }

    /// Identifier pool, for inspecting allocation state
    pub fn pool(&self) -> &IdentifierPool {
        &self.pool
    }

    /// Exact match on the internal triple
    pub fn lookup_internal(
        &self,
        kind: MappingKind,
        internal_addr: Ipv4Addr,
        internal_id: u16,
    ) -> Option<&Mapping> {
        self.by_internal.get(&InternalKey {
            kind,
            addr: internal_addr,
            id: internal_id,
        })
    }

    /// Exact match on kind + external identifier
    pub fn lookup_external(&self, kind: MappingKind, external_id: u16) -> Option<&Mapping> {
        self.by_external
            .get(&(kind, external_id))
            .and_then(|key| self.by_internal.get(key))
    }

    fn lookup_external_mut(&mut self, kind: MappingKind, external_id: u16) -> Option<&mut Mapping> {
        let key = self.by_external.get(&(kind, external_id))?;
        self.by_internal.get_mut(key)
    }

    /// Create a mapping for an internal endpoint with a freshly allocated
    /// external identifier. An existing mapping for the same triple is
    /// returned unchanged instead.
    pub fn insert_at(
        &mut self,
        kind: MappingKind,
        internal_addr: Ipv4Addr,
        internal_id: u16,
        now: Instant,
    ) -> Result<&Mapping> {
        let key = InternalKey {
            kind,
            addr: internal_addr,
            id: internal_id,
        };
        if self.by_internal.contains_key(&key) {
            return Ok(&self.by_internal[&key]);
        }

        let external_id = match self.pool.allocate(kind) {
            Ok(id) => id,
            Err(e) => {
                self.metrics.pool_exhausted.inc();
                warn!(
                    "NAT: {} pool exhausted, cannot map {}:{}",
                    kind, internal_addr, internal_id
                );
                return Err(e);
            }
        };

        debug_assert!(
            !self.by_external.contains_key(&(kind, external_id)),
            "duplicate mapping for {} external id {}",
            kind,
            external_id
        );

        let mapping = Mapping {
            kind,
            internal_addr,
            internal_id,
            external_addr: self.external_addr,
            external_id,
            last_activity: now,
            connections: ConnectionSet::new(),
            seq: self.next_seq,
        };
        self.next_seq += 1;

        debug!("NAT: created mapping {}", mapping);
        self.metrics.mappings_created.inc();
        self.metrics.mapping_gauge(kind).inc();

        self.by_external.insert((kind, external_id), key);
        Ok(&*self.by_internal.entry(key).or_insert(mapping))
    }

    /// Unlink a mapping, dropping its connections and releasing its
    /// external identifier. Returns the removed record, if it was live.
    pub fn remove(&mut self, kind: MappingKind, external_id: u16) -> Option<Mapping> {
        let key = self.by_external.remove(&(kind, external_id))?;
        let mapping = self.by_internal.remove(&key)?;

        self.pool.release(kind, external_id);
        self.metrics.mappings_evicted.inc();
        self.metrics.mapping_gauge(kind).dec();
        debug!("NAT: removed mapping {}", mapping);
        Some(mapping)
    }

    /// Outbound packet from an internal host: look up or create its mapping,
    /// refresh it and track the TCP segment if one is given.
    pub fn outbound_at(
        &mut self,
        kind: MappingKind,
        internal_addr: Ipv4Addr,
        internal_id: u16,
        segment: Option<&TcpSegment>,
        now: Instant,
    ) -> Result<Translation> {
        let created = self
            .lookup_internal(kind, internal_addr, internal_id)
            .is_none();
        let external_id = self
            .insert_at(kind, internal_addr, internal_id, now)?
            .external_id;

        let key = InternalKey {
            kind,
            addr: internal_addr,
            id: internal_id,
        };
        let mut connection = None;
        let mut absorb = None;
        if let Some(mapping) = self.by_internal.get_mut(&key) {
            mapping.last_activity = now;

            if let (MappingKind::Tcp, Some(segment)) = (kind, segment) {
                let outcome = mapping
                    .connections
                    .track(Direction::Outbound, segment, now);
                connection = self.record_outcome(outcome);
                if segment.flags.is_syn_only() {
                    absorb = Some(segment.peer);
                }
            }
        }

        if let Some(peer) = absorb {
            self.absorb_pending_syn(external_id, peer);
        }

        Ok(Translation {
            kind,
            external_addr: self.external_addr,
            external_id,
            created,
            connection,
        })
    }

    /// Inbound packet addressed to an external identifier.
    ///
    /// Returns a copy of the mapping the packet belongs to, or `None` when it
    /// must not be delivered. An unsolicited SYN with no mapping is queued
    /// until internal traffic claims it or its grace period runs out.
    pub fn inbound_at(
        &mut self,
        kind: MappingKind,
        external_id: u16,
        segment: Option<&TcpSegment>,
        now: Instant,
    ) -> Option<Mapping> {
        if self.lookup_external(kind, external_id).is_none() {
            if let (MappingKind::Tcp, Some(segment)) = (kind, segment) {
                if segment.flags.is_syn_only() {
                    self.queue_unsolicited_syn(external_id, segment.peer, now);
                }
            }
            return None;
        }

        let mapping = self.lookup_external_mut(kind, external_id)?;

        let outcome = match (kind, segment) {
            (MappingKind::Tcp, Some(segment)) => {
                Some(mapping.connections.track(Direction::Inbound, segment, now))
            }
            _ => None,
        };

        // Refused segments must not keep the mapping alive
        if let Some(refused @ (TrackOutcome::Rejected | TrackOutcome::Full)) = outcome {
            debug!(
                "NAT: dropping segment from {} on {} ({:?})",
                segment.map(|s| s.peer.to_string()).unwrap_or_default(),
                external_id,
                refused
            );
            return None;
        }

        mapping.last_activity = now;
        let copy = mapping.clone();
        if let Some(outcome) = outcome {
            self.record_outcome(outcome);
        }
        Some(copy)
    }

    fn record_outcome(&self, outcome: TrackOutcome) -> Option<TcpState> {
        match outcome {
            TrackOutcome::Opened(state) => {
                self.metrics.connections_opened.inc();
                Some(state)
            }
            TrackOutcome::Updated(state) => Some(state),
            TrackOutcome::Rejected | TrackOutcome::Untracked | TrackOutcome::Full => None,
        }
    }

    /// Hold an inbound SYN that matched no mapping. Duplicates (retransmits)
    /// keep their original arrival time.
    fn queue_unsolicited_syn(&mut self, external_port: u16, peer: SocketAddrV4, now: Instant) {
        if self
            .pending_syns
            .iter()
            .any(|p| p.external_port == external_port && p.peer == peer)
        {
            return;
        }

        if self.pending_syns.len() >= MAX_PENDING_SYNS {
            if let Some(oldest) = self.pending_syns.pop_front() {
                warn!(
                    "NAT: unsolicited SYN queue full, dropping SYN from {} to port {}",
                    oldest.peer, oldest.external_port
                );
                self.metrics.unsolicited_syns_dropped.inc();
            }
        }

        debug!(
            "NAT: queued unsolicited SYN from {} to port {}",
            peer, external_port
        );
        self.metrics.unsolicited_syns_queued.inc();
        self.pending_syns.push_back(PendingSyn {
            external_port,
            peer,
            received_at: now,
        });
    }

    /// Discard a queued SYN now that internal traffic opened the same
    /// connection; the handshake proceeds without an ICMP error.
    fn absorb_pending_syn(&mut self, external_port: u16, peer: SocketAddrV4) {
        let before = self.pending_syns.len();
        self.pending_syns
            .retain(|p| !(p.external_port == external_port && p.peer == peer));
        let absorbed = before - self.pending_syns.len();
        if absorbed > 0 {
            debug!(
                "NAT: outbound SYN to {} claimed queued SYN on port {}",
                peer, external_port
            );
            self.metrics.unsolicited_syns_absorbed.add(absorbed as u64);
        }
    }

    /// Unsolicited SYNs still inside their grace period, oldest first
    pub fn pending_syns(&self) -> impl Iterator<Item = &PendingSyn> {
        self.pending_syns.iter()
    }

    /// Unsolicited SYNs whose grace period ran out since the last call; the
    /// forwarding path answers each with ICMP port unreachable.
    ///
    /// At most [`MAX_PENDING_SYNS`] are held between calls; older ones are
    /// discarded without a reply.
    pub fn drain_expired_syns(&mut self) -> Vec<PendingSyn> {
        self.expired_syns.drain(..).collect()
    }

    /// One expiry pass over the table.
    ///
    /// ICMP mappings go once idle beyond the query timeout. TCP connections go
    /// once idle beyond their state timeout, and a TCP mapping goes once it
    /// has no connections left and has itself been idle beyond the transitory
    /// timeout.
    pub fn sweep_at(&mut self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let timeouts = self.timeouts.clone();

        let mut expired = Vec::new();
        for mapping in self.by_internal.values_mut() {
            if mapping.kind == MappingKind::Tcp {
                let gone = mapping.connections.expire(now, &timeouts);
                report.connections_evicted += gone;
                if !mapping.connections.is_empty() {
                    continue;
                }
            }

            if now.saturating_duration_since(mapping.last_activity) > mapping.idle_timeout(&timeouts)
            {
                expired.push((mapping.kind, mapping.external_id));
            }
        }

        for (kind, external_id) in expired {
            if self.remove(kind, external_id).is_some() {
                report.mappings_evicted += 1;
            }
        }

        let mut overflowed = 0usize;
        while let Some(pending) = self.pending_syns.front() {
            if now.saturating_duration_since(pending.received_at) <= timeouts.unsolicited_syn {
                break;
            }
            if let Some(pending) = self.pending_syns.pop_front() {
                debug!(
                    "NAT: no internal traffic for SYN from {} to port {}",
                    pending.peer, pending.external_port
                );
                if self.expired_syns.len() >= MAX_PENDING_SYNS {
                    self.expired_syns.pop_front();
                    overflowed += 1;
                }
                self.expired_syns.push_back(pending);
                report.syns_expired += 1;
            }
        }
        if overflowed > 0 {
            warn!(
                "NAT: expired SYN list full, discarded {} undrained SYNs",
                overflowed
            );
        }

        self.metrics
            .connections_evicted
            .add(report.connections_evicted as u64);
        self.metrics
            .unsolicited_syns_expired
            .add(report.syns_expired as u64);
        self.metrics
            .unsolicited_syns_dropped
            .add(overflowed as u64);
        self.metrics.sweep_ticks.inc();
        report
    }

    /// Copies of every mapping, most recently created first
    pub fn snapshot(&self) -> Vec<Mapping> {
        let mut mappings: Vec<Mapping> = self.by_internal.values().cloned().collect();
        mappings.sort_by(|a, b| b.seq.cmp(&a.seq));
        mappings
    }

    /// Drop every mapping and queued SYN, returning all identifiers
    pub fn clear(&mut self) {
        let live: Vec<(MappingKind, u16)> = self.by_external.keys().copied().collect();
        for (kind, external_id) in live {
            self.remove(kind, external_id);
        }
        self.pending_syns.clear();
        self.expired_syns.clear();
    }

    pub fn len(&self) -> usize {
        self.by_internal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_internal.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::conntrack::MAX_CONNECTIONS_PER_MAPPING;
    use crate::protocol::tcp::TcpFlags;

    const WAN_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 1);

    fn host(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    fn server() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 80)
    }

    fn table() -> MappingTable {
        MappingTable::new(WAN_IP, NatTimeouts::default())
    }

    #[test]
    fn test_insert_allocates_lowest_ports() {
        let mut table = table();
        let now = Instant::now();

        let first = table.insert_at(MappingKind::Tcp, host(5), 5000, now).unwrap();
        assert_eq!(first.external_id, 1024);
        assert_eq!(first.external_addr, WAN_IP);
        assert!(first.connections.is_empty());

        let second = table.insert_at(MappingKind::Tcp, host(6), 5001, now).unwrap();
        assert_eq!(second.external_id, 1025);

        let icmp = table.insert_at(MappingKind::Icmp, host(5), 5000, now).unwrap();
        assert_eq!(icmp.external_id, 1);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_insert_existing_triple_returns_same_mapping() {
        let mut table = table();
        let now = Instant::now();

        let id = table.insert_at(MappingKind::Tcp, host(5), 5000, now).unwrap().external_id;
        let again = table.insert_at(MappingKind::Tcp, host(5), 5000, now).unwrap().external_id;
        assert_eq!(id, again);
        assert_eq!(table.len(), 1);
        assert_eq!(table.pool().in_use(MappingKind::Tcp), 1);
    }

    #[test]
    fn test_lookup_round_trip() {
        let mut table = table();
        let inserted = table
            .insert_at(MappingKind::Tcp, host(5), 5000, Instant::now())
            .unwrap()
            .clone();

        let by_internal = table.lookup_internal(MappingKind::Tcp, host(5), 5000).unwrap();
        assert_eq!(by_internal, &inserted);

        let by_external = table.lookup_external(MappingKind::Tcp, inserted.external_id).unwrap();
        assert_eq!(by_external, &inserted);

        // Kind is part of the key
        assert!(table.lookup_internal(MappingKind::Icmp, host(5), 5000).is_none());
        assert!(table.lookup_external(MappingKind::Icmp, inserted.external_id).is_none());
    }

    #[test]
    fn test_lookup_external_unknown_has_no_side_effects() {
        let mut table = table();
        table.insert_at(MappingKind::Tcp, host(5), 5000, Instant::now()).unwrap();
        let before = table.snapshot();

        assert!(table.lookup_external(MappingKind::Tcp, 4242).is_none());
        assert_eq!(table.snapshot(), before);
        assert!(!table.pool().is_allocated(MappingKind::Tcp, 4242));
    }

    #[test]
    fn test_remove_releases_identifier() {
        let mut table = table();
        let id = table
            .insert_at(MappingKind::Icmp, host(5), 77, Instant::now())
            .unwrap()
            .external_id;

        let removed = table.remove(MappingKind::Icmp, id).unwrap();
        assert_eq!(removed.internal_id, 77);
        assert!(table.is_empty());
        assert!(!table.pool().is_allocated(MappingKind::Icmp, id));

        // Second removal is a no-op
        assert!(table.remove(MappingKind::Icmp, id).is_none());
    }

    #[test]
    fn test_external_ids_unique_per_kind() {
        let mut table = table();
        let now = Instant::now();
        for port in 0..200u16 {
            table.insert_at(MappingKind::Tcp, host((port % 7) as u8), port, now).unwrap();
        }
        // Churn: remove every third mapping, then add more
        for id in (1024..1224u16).step_by(3) {
            table.remove(MappingKind::Tcp, id);
        }
        for port in 200..260u16 {
            table.insert_at(MappingKind::Tcp, host(9), port, now).unwrap();
        }

        let snapshot = table.snapshot();
        let mut ids: Vec<u16> = snapshot.iter().map(|m| m.external_id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), snapshot.len());
        assert_eq!(table.pool().in_use(MappingKind::Tcp), snapshot.len());
    }

    #[test]
    fn test_snapshot_most_recent_first() {
        let mut table = table();
        let now = Instant::now();
        table.insert_at(MappingKind::Tcp, host(1), 1, now).unwrap();
        table.insert_at(MappingKind::Icmp, host(2), 2, now).unwrap();
        table.insert_at(MappingKind::Tcp, host(3), 3, now).unwrap();

        let order: Vec<u16> = table.snapshot().iter().map(|m| m.internal_id).collect();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[test]
    fn test_sweep_evicts_idle_mapping_and_reuses_port() {
        let mut table = table();
        let transitory = table.timeouts().tcp_transitory;
        let start = Instant::now();

        table.insert_at(MappingKind::Tcp, host(5), 5000, start).unwrap();
        // Second mapping is active one second before the sweep
        let second_seen = start + transitory;
        table.insert_at(MappingKind::Tcp, host(6), 5001, second_seen).unwrap();

        let report = table.sweep_at(start + transitory + Duration::from_secs(1));
        assert_eq!(report.mappings_evicted, 1);
        assert!(table.lookup_internal(MappingKind::Tcp, host(5), 5000).is_none());
        assert!(table.lookup_internal(MappingKind::Tcp, host(6), 5001).is_some());
        assert!(!table.pool().is_allocated(MappingKind::Tcp, 1024));

        let reused = table.insert_at(MappingKind::Tcp, host(7), 5002, second_seen).unwrap();
        assert_eq!(reused.external_id, 1024);
    }

    #[test]
    fn test_sweep_icmp_timeout() {
        let mut table = table();
        let icmp = table.timeouts().icmp_query;
        let start = Instant::now();
        table.insert_at(MappingKind::Icmp, host(5), 1, start).unwrap();

        assert_eq!(table.sweep_at(start + icmp).mappings_evicted, 0);
        assert_eq!(table.len(), 1);
        assert_eq!(table.sweep_at(start + icmp + Duration::from_millis(1)).mappings_evicted, 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_established_connection_keeps_mapping_alive() {
        let mut table = table();
        let timeouts = table.timeouts().clone();
        let start = Instant::now();
        let peer = server();

        let syn = TcpSegment::new(peer, TcpFlags::SYN).with_seq(100, 0);
        let out = table
            .outbound_at(MappingKind::Tcp, host(5), 5000, Some(&syn), start)
            .unwrap();
        assert_eq!(out.connection, Some(TcpState::SynSent));

        let syn_ack = TcpSegment::new(peer, TcpFlags::SYN_ACK).with_seq(900, 101);
        let mapping = table
            .inbound_at(MappingKind::Tcp, out.external_id, Some(&syn_ack), start)
            .unwrap();
        assert_eq!(mapping.connections.get(peer).unwrap().state, TcpState::SynRcvd);

        let ack = TcpSegment::new(peer, TcpFlags::ACK).with_seq(101, 901);
        let out = table
            .outbound_at(MappingKind::Tcp, host(5), 5000, Some(&ack), start)
            .unwrap();
        assert_eq!(out.connection, Some(TcpState::Established));

        // Well past the transitory timeout the connection, and so the mapping, survive
        let later = start + timeouts.tcp_transitory * 2;
        assert_eq!(table.sweep_at(later), SweepReport::default());
        assert_eq!(table.len(), 1);

        // Connection idles out, then the empty mapping goes in the same pass
        let report = table.sweep_at(start + timeouts.tcp_established + Duration::from_secs(1));
        assert_eq!(report.connections_evicted, 1);
        assert_eq!(report.mappings_evicted, 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_time_wait_uses_short_timeout() {
        let mut table = table();
        let timeouts = table.timeouts().clone();
        let start = Instant::now();
        let peer = server();

        let steps = [
            (Direction::Outbound, TcpFlags::SYN, 1, 0),
            (Direction::Inbound, TcpFlags::SYN_ACK, 50, 2),
            (Direction::Outbound, TcpFlags::ACK, 2, 51),
            (Direction::Inbound, TcpFlags::FIN_ACK, 51, 2),
        ];
        let mut external_id = 0;
        let mut last = None;
        for (direction, flags, seq, ack) in steps {
            let seg = TcpSegment::new(peer, flags).with_seq(seq, ack);
            match direction {
                Direction::Outbound => {
                    let t = table
                        .outbound_at(MappingKind::Tcp, host(5), 5000, Some(&seg), start)
                        .unwrap();
                    external_id = t.external_id;
                    last = t.connection;
                }
                Direction::Inbound => {
                    let m = table
                        .inbound_at(MappingKind::Tcp, external_id, Some(&seg), start)
                        .unwrap();
                    last = Some(m.connections.get(peer).unwrap().state);
                }
            }
        }
        assert_eq!(last, Some(TcpState::TimeWait));

        let report = table.sweep_at(start + timeouts.tcp_transitory + Duration::from_secs(1));
        assert_eq!(report.connections_evicted, 1);
        assert_eq!(report.mappings_evicted, 1);
    }

    #[test]
    fn test_inbound_without_mapping() {
        let mut table = table();
        let now = Instant::now();

        assert!(table.inbound_at(MappingKind::Icmp, 9, None, now).is_none());

        let ack = TcpSegment::new(server(), TcpFlags::ACK);
        assert!(table.inbound_at(MappingKind::Tcp, 2000, Some(&ack), now).is_none());
        assert_eq!(table.pending_syns().count(), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn test_unsolicited_syn_expires_after_grace_period() {
        let mut table = table();
        let grace = table.timeouts().unsolicited_syn;
        let start = Instant::now();
        let syn = TcpSegment::new(server(), TcpFlags::SYN);

        assert!(table.inbound_at(MappingKind::Tcp, 3000, Some(&syn), start).is_none());
        // Retransmission does not queue twice
        table.inbound_at(MappingKind::Tcp, 3000, Some(&syn), start + Duration::from_secs(1));
        assert_eq!(table.pending_syns().count(), 1);
        assert!(table.is_empty());

        assert_eq!(table.sweep_at(start + grace).syns_expired, 0);
        assert!(table.drain_expired_syns().is_empty());

        let report = table.sweep_at(start + grace + Duration::from_secs(1));
        assert_eq!(report.syns_expired, 1);
        let expired = table.drain_expired_syns();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].external_port, 3000);
        assert_eq!(expired[0].peer, server());
        assert!(table.drain_expired_syns().is_empty());
    }

    #[test]
    fn test_outbound_syn_absorbs_queued_syn() {
        let mut table = table();
        let start = Instant::now();
        let peer = server();

        // Peer SYNs port 1024 before the internal host has a mapping there
        let syn_in = TcpSegment::new(peer, TcpFlags::SYN).with_seq(7, 0);
        assert!(table.inbound_at(MappingKind::Tcp, 1024, Some(&syn_in), start).is_none());

        let syn_out = TcpSegment::new(peer, TcpFlags::SYN).with_seq(40, 0);
        let out = table
            .outbound_at(MappingKind::Tcp, host(5), 5000, Some(&syn_out), start)
            .unwrap();
        assert_eq!(out.external_id, 1024);
        assert_eq!(table.pending_syns().count(), 0);

        let report = table.sweep_at(start + Duration::from_secs(60));
        assert_eq!(report.syns_expired, 0);
        assert!(table.drain_expired_syns().is_empty());
    }

    #[test]
    fn test_inbound_syn_on_existing_mapping_opens_connection() {
        let mut table = table();
        let now = Instant::now();
        let id = table
            .outbound_at(MappingKind::Tcp, host(5), 5000, None, now)
            .unwrap()
            .external_id;

        let other = SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 9), 40000);
        let syn = TcpSegment::new(other, TcpFlags::SYN).with_seq(3, 0);
        let mapping = table.inbound_at(MappingKind::Tcp, id, Some(&syn), now).unwrap();
        assert_eq!(mapping.connections.get(other).unwrap().state, TcpState::SynRcvd);
        assert_eq!(table.pending_syns().count(), 0);
    }

    #[test]
    fn test_bad_syn_ack_is_not_delivered() {
        let mut table = table();
        let now = Instant::now();
        let peer = server();
        let syn = TcpSegment::new(peer, TcpFlags::SYN).with_seq(100, 0);
        let id = table
            .outbound_at(MappingKind::Tcp, host(5), 5000, Some(&syn), now)
            .unwrap()
            .external_id;

        let forged = TcpSegment::new(peer, TcpFlags::SYN_ACK).with_seq(1, 12345);
        assert!(table.inbound_at(MappingKind::Tcp, id, Some(&forged), now).is_none());
        let state = table
            .lookup_external(MappingKind::Tcp, id)
            .and_then(|m| m.connections.get(peer))
            .map(|c| c.state);
        assert_eq!(state, Some(TcpState::SynSent));
    }

    #[test]
    fn test_rejected_segment_does_not_refresh_mapping() {
        let mut table = table();
        let transitory = table.timeouts().tcp_transitory;
        let start = Instant::now();
        let peer = server();
        let syn = TcpSegment::new(peer, TcpFlags::SYN).with_seq(100, 0);
        let id = table
            .outbound_at(MappingKind::Tcp, host(5), 5000, Some(&syn), start)
            .unwrap()
            .external_id;

        let forged = TcpSegment::new(peer, TcpFlags::SYN_ACK).with_seq(1, 12345);
        let later = start + Duration::from_secs(100);
        assert!(table.inbound_at(MappingKind::Tcp, id, Some(&forged), later).is_none());
        let mapping = table.lookup_external(MappingKind::Tcp, id).unwrap();
        assert_eq!(mapping.last_activity, start);

        let report = table.sweep_at(start + transitory + Duration::from_secs(1));
        assert_eq!(report.mappings_evicted, 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_inbound_syn_refused_when_mapping_tracks_too_many_peers() {
        let mut table = table();
        let now = Instant::now();
        let id = table
            .outbound_at(MappingKind::Tcp, host(5), 5000, None, now)
            .unwrap()
            .external_id;

        for i in 0..MAX_CONNECTIONS_PER_MAPPING {
            let peer = SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 1), 10000 + i as u16);
            let syn = TcpSegment::new(peer, TcpFlags::SYN).with_seq(1, 0);
            assert!(table.inbound_at(MappingKind::Tcp, id, Some(&syn), now).is_some());
        }

        let extra = SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 2), 443);
        let syn = TcpSegment::new(extra, TcpFlags::SYN).with_seq(1, 0);
        assert!(table.inbound_at(MappingKind::Tcp, id, Some(&syn), now).is_none());
        let mapping = table.lookup_external(MappingKind::Tcp, id).unwrap();
        assert_eq!(mapping.connections.len(), MAX_CONNECTIONS_PER_MAPPING);
    }

    #[test]
    fn test_pending_syn_queue_drops_oldest_when_full() {
        let metrics = Arc::new(NatMetrics::new());
        let mut table = MappingTable::with_pool(
            WAN_IP,
            NatTimeouts::default(),
            IdentifierPool::new(),
            metrics.clone(),
        );
        let now = Instant::now();

        for i in 0..(MAX_PENDING_SYNS + 5) {
            let syn = TcpSegment::new(server(), TcpFlags::SYN).with_seq(1, 0);
            let port = 2000 + i as u16;
            assert!(table.inbound_at(MappingKind::Tcp, port, Some(&syn), now).is_none());
        }

        assert_eq!(table.pending_syns().count(), MAX_PENDING_SYNS);
        assert_eq!(table.pending_syns().next().unwrap().external_port, 2005);
        assert_eq!(metrics.unsolicited_syns_queued.get(), MAX_PENDING_SYNS as u64 + 5);
        assert_eq!(metrics.unsolicited_syns_dropped.get(), 5);
    }

    #[test]
    fn test_undrained_expired_syns_stay_bounded() {
        let metrics = Arc::new(NatMetrics::new());
        let mut table = MappingTable::with_pool(
            WAN_IP,
            NatTimeouts::default(),
            IdentifierPool::new(),
            metrics.clone(),
        );
        let start = Instant::now();

        // Three bursts of unsolicited SYNs, each swept but never drained
        for round in 0..3u16 {
            let burst_at = start + Duration::from_secs(10 * round as u64);
            let peer = SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 7), 10000 + round);
            for i in 0..1000u16 {
                let syn = TcpSegment::new(peer, TcpFlags::SYN).with_seq(1, 0);
                table.inbound_at(MappingKind::Tcp, 2000 + i, Some(&syn), burst_at);
            }
            let report = table.sweep_at(burst_at + Duration::from_secs(7));
            assert_eq!(report.syns_expired, 1000);
        }

        assert_eq!(metrics.unsolicited_syns_expired.get(), 3000);
        assert_eq!(metrics.unsolicited_syns_dropped.get(), 3000 - MAX_PENDING_SYNS as u64);

        let expired = table.drain_expired_syns();
        assert_eq!(expired.len(), MAX_PENDING_SYNS);
        // Oldest discarded first: the newest burst survives whole
        assert_eq!(expired[0].peer.port(), 10001);
        assert_eq!(expired[0].external_port, 2976);
        let last = expired[expired.len() - 1];
        assert_eq!(last.peer.port(), 10002);
        assert_eq!(last.external_port, 2999);
        assert!(table.drain_expired_syns().is_empty());
    }

    #[test]
    fn test_pool_exhaustion_propagates() {
        let metrics = Arc::new(NatMetrics::new());
        let mut table = MappingTable::with_pool(
            WAN_IP,
            NatTimeouts::default(),
            IdentifierPool::with_ranges(1024..=1024, 1..=1),
            metrics.clone(),
        );
        let now = Instant::now();

        table.outbound_at(MappingKind::Tcp, host(5), 5000, None, now).unwrap();
        let err = table.outbound_at(MappingKind::Tcp, host(6), 5000, None, now);
        assert!(matches!(
            err,
            Err(crate::Error::PoolExhausted {
                kind: MappingKind::Tcp
            })
        ));
        assert_eq!(table.len(), 1);
        assert_eq!(metrics.pool_exhausted.get(), 1);

        // The existing mapping still translates
        let again = table.outbound_at(MappingKind::Tcp, host(5), 5000, None, now).unwrap();
        assert_eq!(again.external_id, 1024);
        assert!(!again.created);
    }

    #[test]
    fn test_clear_releases_everything() {
        let mut table = table();
        let now = Instant::now();
        table.insert_at(MappingKind::Tcp, host(1), 1, now).unwrap();
        table.insert_at(MappingKind::Icmp, host(1), 1, now).unwrap();
        table.inbound_at(
            MappingKind::Tcp,
            5000,
            Some(&TcpSegment::new(server(), TcpFlags::SYN)),
            now,
        );

        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.pool().in_use(MappingKind::Tcp), 0);
        assert_eq!(table.pool().in_use(MappingKind::Icmp), 0);
        assert_eq!(table.pending_syns().count(), 0);
    }

    #[test]
    fn test_mapping_display() {
        let mut table = table();
        let now = Instant::now();
        let syn = TcpSegment::new(server(), TcpFlags::SYN);
        table.outbound_at(MappingKind::Tcp, host(5), 5000, Some(&syn), now).unwrap();

        let text = table.snapshot()[0].to_string();
        assert_eq!(
            text,
            "tcp 10.0.0.5:5000 <-> 203.0.113.1:1024 [93.184.216.34:80 SYN_SENT]"
        );
    }
}
