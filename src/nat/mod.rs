//! Network address translation
//!
//! Maps (internal address, internal port or ICMP identifier) onto an
//! identifier of the single external address, tracks TCP connections per
//! mapping and expires idle state in the background.
//!
//! - `pool`: lowest-first external identifier allocation
//! - `conntrack`: per-peer TCP connection tracking
//! - `table`: the mapping table and its expiry rules
//! - `sweeper`: background expiry thread
//! - `facade`: the locked, thread-safe [`Nat`] entry point

mod conntrack;
mod facade;
mod pool;
mod sweeper;
mod table;

pub use conntrack::{
    Connection, ConnectionSet, Direction, TcpSegment, TcpState, TrackOutcome,
    MAX_CONNECTIONS_PER_MAPPING,
};
pub use facade::Nat;
pub use pool::{IdentifierPool, MappingKind, MIN_ICMP_IDENTIFIER, MIN_TCP_PORT};
pub use sweeper::Sweeper;
pub use table::{
    Mapping, MappingTable, NatTimeouts, PendingSyn, SweepReport, Translation, MAX_PENDING_SYNS,
};
