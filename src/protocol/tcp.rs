//! TCP header view - RFC 793
//!
//! Only the fields the NAT needs: ports, sequence/acknowledgment numbers and flags.

use crate::{Error, Result};

/// Minimum TCP header size (without options)
pub const MIN_HEADER_SIZE: usize = 20;

/// TCP flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    pub const SYN: Self = Self {
        fin: false,
        syn: true,
        rst: false,
        psh: false,
        ack: false,
        urg: false,
    };

    pub const SYN_ACK: Self = Self {
        ack: true,
        ..Self::SYN
    };

    pub const ACK: Self = Self {
        syn: false,
        ..Self::SYN_ACK
    };

    pub const FIN_ACK: Self = Self {
        fin: true,
        ..Self::ACK
    };

    pub const RST: Self = Self {
        rst: true,
        syn: false,
        ..Self::SYN
    };

    /// Parse flags from the 13th byte of TCP header
    pub fn from_byte(byte: u8) -> Self {
        Self {
            fin: (byte & 0x01) != 0,
            syn: (byte & 0x02) != 0,
            rst: (byte & 0x04) != 0,
            psh: (byte & 0x08) != 0,
            ack: (byte & 0x10) != 0,
            urg: (byte & 0x20) != 0,
        }
    }

    pub fn to_byte(&self) -> u8 {
        let mut byte = 0u8;
        if self.fin {
            byte |= 0x01;
        }
        if self.syn {
            byte |= 0x02;
        }
        if self.rst {
            byte |= 0x04;
        }
        if self.psh {
            byte |= 0x08;
        }
        if self.ack {
            byte |= 0x10;
        }
        if self.urg {
            byte |= 0x20;
        }
        byte
    }

    /// Connection open request (SYN without ACK)
    pub fn is_syn_only(&self) -> bool {
        self.syn && !self.ack
    }

    pub fn is_syn_ack(&self) -> bool {
        self.syn && self.ack
    }

    /// Pure ACK of a handshake (ACK without SYN)
    pub fn is_ack_only(&self) -> bool {
        self.ack && !self.syn
    }

    /// FIN or RST: either side is tearing the connection down
    pub fn is_teardown(&self) -> bool {
        self.fin || self.rst
    }
}

/// Parsed TCP header (zero-copy reference)
#[derive(Debug)]
pub struct TcpHeader<'a> {
    buffer: &'a [u8],
    header_len: usize,
}

impl<'a> TcpHeader<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < MIN_HEADER_SIZE {
            return Err(Error::Parse("TCP header too short".into()));
        }

        let header_len = (buffer[12] >> 4) as usize * 4;
        if header_len < MIN_HEADER_SIZE {
            return Err(Error::Parse("TCP data offset too small".into()));
        }
        if buffer.len() < header_len {
            return Err(Error::Parse("TCP header truncated".into()));
        }

        Ok(Self { buffer, header_len })
    }

    /// Source port (offset 0-1)
    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[0], self.buffer[1]])
    }

    /// Destination port (offset 2-3)
    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[2], self.buffer[3]])
    }

    /// Sequence number (offset 4-7)
    pub fn seq_num(&self) -> u32 {
        u32::from_be_bytes([
            self.buffer[4],
            self.buffer[5],
            self.buffer[6],
            self.buffer[7],
        ])
    }

    /// Acknowledgment number (offset 8-11)
    pub fn ack_num(&self) -> u32 {
        u32::from_be_bytes([
            self.buffer[8],
            self.buffer[9],
            self.buffer[10],
            self.buffer[11],
        ])
    }

    /// Control flags (offset 13)
    pub fn flags(&self) -> TcpFlags {
        TcpFlags::from_byte(self.buffer[13])
    }

    /// Header length in bytes, from the data offset nibble
    pub fn header_len(&self) -> usize {
        self.header_len
    }
}
