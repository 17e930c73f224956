use crate::nat::MappingKind;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("no free external {kind} identifier")]
    PoolExhausted { kind: MappingKind },

    #[error("NAT state lock poisoned, instance shut down")]
    LockPoisoned,

    #[error("NAT instance is shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, Error>;
