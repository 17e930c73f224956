//! ICMP header view - RFC 792

use crate::{Error, Result};

/// ICMP header size (minimum)
pub const ICMP_HEADER_SIZE: usize = 8;

/// Destination Unreachable code sent for a dropped unsolicited SYN
pub const PORT_UNREACHABLE: u8 = 3;

/// ICMP message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IcmpType {
    EchoReply = 0,
    DestinationUnreachable = 3,
    EchoRequest = 8,
    TimeExceeded = 11,
    Timestamp = 13,
    TimestampReply = 14,
}

impl IcmpType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(IcmpType::EchoReply),
            3 => Some(IcmpType::DestinationUnreachable),
            8 => Some(IcmpType::EchoRequest),
            11 => Some(IcmpType::TimeExceeded),
            13 => Some(IcmpType::Timestamp),
            14 => Some(IcmpType::TimestampReply),
            _ => None,
        }
    }

    /// Query messages carry an identifier the NAT can translate
    pub fn is_query(self) -> bool {
        matches!(
            self,
            IcmpType::EchoReply
                | IcmpType::EchoRequest
                | IcmpType::Timestamp
                | IcmpType::TimestampReply
        )
    }
}

/// Parsed ICMP message
#[derive(Debug)]
pub struct IcmpHeader<'a> {
    buffer: &'a [u8],
}

impl<'a> IcmpHeader<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < ICMP_HEADER_SIZE {
            return Err(Error::Parse("ICMP packet too short".into()));
        }

        Ok(Self { buffer })
    }

    pub fn icmp_type(&self) -> u8 {
        self.buffer[0]
    }

    pub fn code(&self) -> u8 {
        self.buffer[1]
    }

    pub fn message_type(&self) -> Option<IcmpType> {
        IcmpType::from_u8(self.icmp_type())
    }

    /// Query identifier (echo / timestamp)
    pub fn identifier(&self) -> u16 {
        u16::from_be_bytes([self.buffer[4], self.buffer[5]])
    }

    pub fn sequence(&self) -> u16 {
        u16::from_be_bytes([self.buffer[6], self.buffer[7]])
    }

    /// True when the message is a query the NAT maps by identifier
    pub fn is_query(&self) -> bool {
        self.message_type().is_some_and(IcmpType::is_query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_echo_request() {
        let msg = [8, 0, 0, 0, 0x12, 0x34, 0x00, 0x01];
        let hdr = IcmpHeader::parse(&msg).unwrap();

        assert_eq!(hdr.message_type(), Some(IcmpType::EchoRequest));
        assert_eq!(hdr.code(), 0);
        assert_eq!(hdr.identifier(), 0x1234);
        assert_eq!(hdr.sequence(), 1);
        assert!(hdr.is_query());
    }

    #[test]
    fn test_error_messages_are_not_queries() {
        let msg = [3, PORT_UNREACHABLE, 0, 0, 0, 0, 0, 0];
        let hdr = IcmpHeader::parse(&msg).unwrap();
        assert!(!hdr.is_query());

        let msg = [42, 0, 0, 0, 0, 0, 0, 0];
        assert!(!IcmpHeader::parse(&msg).unwrap().is_query());
    }

    #[test]
    fn test_parse_too_short() {
        assert!(IcmpHeader::parse(&[8, 0, 0]).is_err());
    }
}
