//! Internet checksum (RFC 1071)
//!
//! The NAT core never validates checksums itself; the forwarding path calls
//! these after it rewrites addresses, ports or ICMP identifiers.

use std::net::Ipv4Addr;

/// IP protocol number of TCP, used in the pseudo-header
const TCP_PROTOCOL: u8 = 6;

/// Sum 16-bit big-endian words into a 32-bit accumulator, zero padding an odd tail
fn sum_words(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u16::from_be_bytes([*last, 0]) as u32);
    }
    sum
}

/// Fold a 32-bit sum to 16 bits and take the one's complement
fn finish(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// One's-complement 16-bit Internet checksum over `data`.
///
/// Computing it over a buffer that already carries a correct checksum yields 0.
pub fn internet_checksum(data: &[u8]) -> u16 {
    finish(sum_words(0, data))
}

/// IPv4 header checksum; the checksum field (bytes 10-11) is treated as zero
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    if header.len() < 12 {
        return internet_checksum(header);
    }
    let sum = sum_words(0, &header[..10]);
    finish(sum_words(sum, &header[12..]))
}

/// ICMP checksum over the whole message, checksum field (bytes 2-3) treated as zero
pub fn icmp_checksum(message: &[u8]) -> u16 {
    if message.len() < 4 {
        return internet_checksum(message);
    }
    let sum = sum_words(0, &message[..2]);
    finish(sum_words(sum, &message[4..]))
}

/// TCP checksum with pseudo-header (RFC 793)
///
/// ```text
/// +--------+--------+--------+--------+
/// |          Source Address           |
/// +--------+--------+--------+--------+
/// |        Destination Address        |
/// +--------+--------+--------+--------+
/// |  Zero  |Protocol|   TCP Length    |
/// +--------+--------+--------+--------+
/// ```
///
/// The checksum field of `segment` (bytes 16-17) is treated as zero.
pub fn tcp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut sum = sum_words(0, &src_ip.octets());
    sum = sum_words(sum, &dst_ip.octets());
    sum = sum.wrapping_add(TCP_PROTOCOL as u32);
    sum = sum.wrapping_add(segment.len() as u32);

    if segment.len() < 18 {
        return finish(sum_words(sum, segment));
    }
    sum = sum_words(sum, &segment[..16]);
    finish(sum_words(sum, &segment[18..]))
}
