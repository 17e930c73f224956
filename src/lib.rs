//! natbox - NAT subsystem of a software router
//!
//! Maintains internal <-> external address/port translations, tracks TCP
//! connections per mapping and allocates external ports and ICMP identifiers.
//! The packet forwarding path drives it through [`nat::Nat`].

pub mod config;
pub mod error;
pub mod nat;
pub mod protocol;
pub mod telemetry;

pub use error::{Error, Result};
