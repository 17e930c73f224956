//! Header views and checksum helpers consumed by the NAT core
//!
//! Parsing is limited to what translation needs: ports, identifiers and TCP flags.

pub mod checksum;
pub mod icmp;
pub mod tcp;

pub use checksum::{icmp_checksum, internet_checksum, ipv4_header_checksum, tcp_checksum};
pub use icmp::{IcmpHeader, IcmpType};
pub use tcp::{TcpFlags, TcpHeader};
