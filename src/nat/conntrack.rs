//! Per-mapping TCP connection tracking (RFC 5382)
//!
//! Each TCP mapping keeps one [`Connection`] per external peer endpoint. The
//! state machine is reduced to what the NAT needs to pick an idle timeout:
//! handshake in progress, established, or closing.

use super::table::NatTimeouts;
use crate::protocol::tcp::{TcpFlags, TcpHeader};
use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

/// Upper bound on tracked peers per mapping; SYNs from further peers are refused
pub const MAX_CONNECTIONS_PER_MAPPING: usize = 256;

/// Which way a segment crossed the NAT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Internal host -> external peer
    Outbound,
    /// External peer -> internal host
    Inbound,
}

/// Reduced TCP connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// Internal host sent SYN, nothing back yet
    SynSent,
    /// Both sides have sent SYN, waiting for the initiator's final ACK
    SynRcvd,
    Established,
    /// FIN or RST seen from either side
    TimeWait,
}

impl TcpState {
    pub fn is_established(self) -> bool {
        self == TcpState::Established
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynRcvd => "SYN_RCVD",
            TcpState::Established => "ESTABLISHED",
            TcpState::TimeWait => "TIME_WAIT",
        };
        f.write_str(name)
    }
}

/// The parts of a TCP segment the tracker looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSegment {
    /// External endpoint on the far side of the NAT
    pub peer: SocketAddrV4,
    pub flags: TcpFlags,
    pub seq: u32,
    pub ack: u32,
}

impl TcpSegment {
    pub fn new(peer: SocketAddrV4, flags: TcpFlags) -> Self {
        Self {
            peer,
            flags,
            seq: 0,
            ack: 0,
        }
    }

    pub fn with_seq(mut self, seq: u32, ack: u32) -> Self {
        self.seq = seq;
        self.ack = ack;
        self
    }

    /// Segment leaving the internal network towards `dst_ip`
    pub fn outbound(dst_ip: Ipv4Addr, header: &TcpHeader<'_>) -> Self {
        Self::new(SocketAddrV4::new(dst_ip, header.dst_port()), header.flags())
            .with_seq(header.seq_num(), header.ack_num())
    }

    /// Segment arriving from `src_ip` on the external side
    pub fn inbound(src_ip: Ipv4Addr, header: &TcpHeader<'_>) -> Self {
        Self::new(SocketAddrV4::new(src_ip, header.src_port()), header.flags())
            .with_seq(header.seq_num(), header.ack_num())
    }
}

/// State of one external peer talking to a TCP mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub peer: SocketAddrV4,
    pub state: TcpState,
    pub last_activity: Instant,
    /// Side that sent the opening SYN
    pub initiator: Direction,
    /// Initial sequence number of the initiator
    pub client_isn: u32,
    /// Initial sequence number of the responder, once its SYN is seen
    pub server_isn: Option<u32>,
}

impl Connection {
    /// Start tracking on an opening SYN; any other segment opens nothing
    pub fn open(direction: Direction, segment: &TcpSegment, now: Instant) -> Option<Self> {
        if !segment.flags.is_syn_only() {
            return None;
        }

        let state = match direction {
            Direction::Outbound => TcpState::SynSent,
            Direction::Inbound => TcpState::SynRcvd,
        };

        Some(Self {
            peer: segment.peer,
            state,
            last_activity: now,
            initiator: direction,
            client_isn: segment.seq,
            server_isn: None,
        })
    }

    /// Advance the state machine with an observed segment.
    ///
    /// Returns false when the segment was rejected (a SYN+ACK that does not
    /// acknowledge the recorded SYN); the connection is then left untouched.
    pub fn observe(&mut self, direction: Direction, segment: &TcpSegment, now: Instant) -> bool {
        let flags = segment.flags;
        let from_initiator = direction == self.initiator;

        let next = if flags.is_teardown() {
            TcpState::TimeWait
        } else {
            match self.state {
                TcpState::SynSent if !from_initiator && flags.is_syn_ack() => {
                    if segment.ack != self.client_isn.wrapping_add(1) {
                        return false;
                    }
                    self.server_isn = Some(segment.seq);
                    TcpState::SynRcvd
                }
                // Simultaneous open
                TcpState::SynSent if !from_initiator && flags.is_syn_only() => {
                    self.server_isn = Some(segment.seq);
                    TcpState::SynRcvd
                }
                // Retransmitted SYN
                TcpState::SynSent if from_initiator && flags.is_syn_only() => {
                    self.client_isn = segment.seq;
                    TcpState::SynSent
                }
                TcpState::SynRcvd if !from_initiator && flags.is_syn_ack() => {
                    self.server_isn = Some(segment.seq);
                    TcpState::SynRcvd
                }
                TcpState::SynRcvd if from_initiator && flags.is_ack_only() => {
                    TcpState::Established
                }
                // Port reuse after close: a fresh SYN restarts the handshake
                TcpState::TimeWait if flags.is_syn_only() => {
                    self.initiator = direction;
                    self.client_isn = segment.seq;
                    self.server_isn = None;
                    match direction {
                        Direction::Outbound => TcpState::SynSent,
                        Direction::Inbound => TcpState::SynRcvd,
                    }
                }
                current => current,
            }
        };

        self.state = next;
        self.last_activity = now;
        true
    }

    /// Idle budget for the current state
    pub fn timeout(&self, timeouts: &NatTimeouts) -> Duration {
        if self.state.is_established() {
            timeouts.tcp_established
        } else {
            timeouts.tcp_transitory
        }
    }

    pub fn is_expired(&self, now: Instant, timeouts: &NatTimeouts) -> bool {
        now.saturating_duration_since(self.last_activity) > self.timeout(timeouts)
    }
}

/// Outcome of feeding a segment to a [`ConnectionSet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    /// A new connection record was created
    Opened(TcpState),
    /// An existing record moved (or stayed) in this state
    Updated(TcpState),
    /// Segment rejected by handshake validation
    Rejected,
    /// No record and the segment cannot open one
    Untracked,
    /// Opening SYN refused because the mapping tracks too many peers
    Full,
}

/// Connections of one mapping, at most one per peer endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionSet {
    conns: HashMap<SocketAddrV4, Connection>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record for a peer endpoint
    pub fn get(&self, peer: SocketAddrV4) -> Option<&Connection> {
        self.conns.get(&peer)
    }

    /// Update the peer's record, or create one if the segment is an opening
    /// SYN and the set has room
    pub fn track(
        &mut self,
        direction: Direction,
        segment: &TcpSegment,
        now: Instant,
    ) -> TrackOutcome {
        if let Some(conn) = self.conns.get_mut(&segment.peer) {
            return if conn.observe(direction, segment, now) {
                TrackOutcome::Updated(conn.state)
            } else {
                TrackOutcome::Rejected
            };
        }

        if !segment.flags.is_syn_only() {
            return TrackOutcome::Untracked;
        }
        if self.conns.len() >= MAX_CONNECTIONS_PER_MAPPING {
            return TrackOutcome::Full;
        }

        match Connection::open(direction, segment, now) {
            Some(conn) => {
                let state = conn.state;
                self.conns.insert(conn.peer, conn);
                TrackOutcome::Opened(state)
            }
            None => TrackOutcome::Untracked,
        }
    }

    /// Drop connections idle beyond their state timeout; returns how many went
    pub fn expire(&mut self, now: Instant, timeouts: &NatTimeouts) -> usize {
        let before = self.conns.len();
        self.conns.retain(|_, c| !c.is_expired(now, timeouts));
        before - self.conns.len()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Records in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.conns.values()
    }
}
